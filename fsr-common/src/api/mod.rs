//! API module for shared HTTP API types
//!
//! Contains ONLY framework-free types: the server wraps them in axum
//! extractors and responses, the sync client sends and decodes them with
//! reqwest.

pub mod types;

pub use types::*;

/// Header carrying the authenticated actor, set by the external auth layer
pub const ACTOR_HEADER: &str = "x-actor-id";
