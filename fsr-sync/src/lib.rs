//! # fsr-sync
//!
//! Device-side half of two-phase sync. Interviews wait in a local SQLite
//! queue until the server has acknowledged them and, when audio was
//! recorded, until the audio has been uploaded and read back. Only then
//! may the local copies be deleted.

pub mod agent;
pub mod store;
pub mod transport;

pub use agent::{SyncAgent, SyncReport};
pub use store::{AudioPhase, EntryState, LocalAudio, SyncEntry, SyncStore};
pub use transport::{HttpTransport, SyncTransport};
