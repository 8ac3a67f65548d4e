//! # FSR Common Library
//!
//! Shared code for the field-survey response services:
//! - Response record model and lifecycle status types
//! - Error taxonomy shared by server and sync client
//! - API request/response types
//! - Configuration loading and root folder resolution
//! - Database schema initialization
//! - Lifecycle event bus
//! - Retry/backoff policy

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ids;
pub mod retry;
pub mod time;

pub use db::models::{
    is_valid_abandonment_reason, normalize_abandonment_reason, Answer, AudioAttachment,
    AudioUploadStatus, DecisionKind, ResponseRecord, ResponseStatus, SyncMetadata, Verification,
};
pub use error::{Error, Result};
