//! Configuration loading and root folder resolution
//!
//! Resolution priority for every setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file (`~/.config/fsr/<module>.toml`)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable TOML file is never fatal; the module logs a
//! warning and starts with defaults.

use crate::retry::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Database file name inside the root folder (server side)
pub const DATABASE_FILE: &str = "fsr.db";
/// Sync queue database file name inside the root folder (client side)
pub const SYNC_DATABASE_FILE: &str = "sync.db";
/// Object storage directory inside the root folder
pub const OBJECTS_DIR: &str = "objects";

/// Compiled defaults for the current platform
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        let root_folder = if cfg!(target_os = "linux") {
            // ~/.local/share/fsr (or /var/lib/fsr for system-wide)
            dirs::data_local_dir()
                .map(|d| d.join("fsr"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/fsr"))
        } else if cfg!(target_os = "macos") {
            dirs::data_dir()
                .map(|d| d.join("fsr"))
                .unwrap_or_else(|| PathBuf::from("/Library/Application Support/fsr"))
        } else if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .map(|d| d.join("fsr"))
                .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\fsr"))
        } else {
            PathBuf::from("./fsr_data")
        };

        Self {
            root_folder,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive, overridden by RUST_LOG
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Upper bound on a single phase-2 audio body
    pub max_audio_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 5780,
            max_audio_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// How often the sweeper looks for batches whose samples are decided
    pub sweep_interval_secs: u64,
    /// Attempts per remainder record when its write hits a version conflict
    pub max_write_attempts: u32,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            max_write_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: String,
    /// Identity forwarded as X-Actor-Id
    pub actor_id: Option<String>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            server_url: "http://127.0.0.1:5780".to_string(),
            actor_id: None,
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff_ms,
            max_backoff_ms: policy.max_backoff_ms,
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms.max(self.initial_backoff_ms),
            multiplier: 2.0,
        }
    }
}

/// Module TOML configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub qc: QcConfig,
    pub sync: SyncConfig,
}

/// Path of the TOML file for a module (`~/.config/fsr/<module>.toml`)
pub fn config_file_path(module_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("fsr").join(format!("{}.toml", module_name)))
}

/// Load a TOML config, falling back to defaults when absent or malformed
pub fn load_toml_config(path: &Path) -> TomlConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str::<TomlConfig>(&content) {
            Ok(config) => {
                debug!("Loaded config file: {}", path.display());
                config
            }
            Err(e) => {
                warn!("Ignoring malformed config file {}: {}", path.display(), e);
                TomlConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config file at {}, using defaults", path.display());
            TomlConfig::default()
        }
        Err(e) => {
            warn!("Could not read config file {}: {}", path.display(), e);
            TomlConfig::default()
        }
    }
}

/// Load the TOML config for a module from its standard location
pub fn load_module_config(module_name: &str) -> TomlConfig {
    match config_file_path(module_name) {
        Some(path) => load_toml_config(&path),
        None => {
            warn!("Could not determine config directory, using defaults");
            TomlConfig::default()
        }
    }
}

/// Write TOML config atomically (temp file + rename), 0600 on Unix
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Root folder resolution following CLI > ENV > TOML > default
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
        }
    }

    pub fn with_cli_arg(mut self, cli_arg: Option<PathBuf>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        // Priority 2: Environment variables (FSR_ROOT_FOLDER wins over FSR_ROOT)
        for var in ["FSR_ROOT_FOLDER", "FSR_ROOT"] {
            if let Ok(path) = std::env::var(var) {
                if !path.trim().is_empty() {
                    return PathBuf::from(path);
                }
            }
        }

        // Priority 3: TOML config file
        if let Some(root) = load_module_config(&self.module_name).root_folder {
            return root;
        }

        // Priority 4: OS-dependent compiled default
        CompiledDefaults::for_current_platform().root_folder
    }
}

/// Creates the root folder layout on first run
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder).map_err(|e| {
            Error::Config(format!(
                "Failed to create root folder {}: {}",
                self.root_folder.display(),
                e
            ))
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }

    pub fn sync_database_path(&self) -> PathBuf {
        self.root_folder.join(SYNC_DATABASE_FILE)
    }

    pub fn objects_path(&self) -> PathBuf {
        self.root_folder.join(OBJECTS_DIR)
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }
}
