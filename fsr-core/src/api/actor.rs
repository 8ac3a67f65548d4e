//! Actor identity extractor
//!
//! The identity layer has already authenticated the caller; this service
//! only requires that it said who the caller is.

use crate::ApiError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use fsr_common::api::ACTOR_HEADER;

/// Verified actor id taken from the `X-Actor-Id` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

impl Actor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(ACTOR_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", ACTOR_HEADER)))?;

        let actor = value
            .to_str()
            .map_err(|_| ApiError::Unauthorized(format!("Invalid {} header", ACTOR_HEADER)))?
            .trim();

        if actor.is_empty() {
            return Err(ApiError::Unauthorized(format!("Empty {} header", ACTOR_HEADER)));
        }

        Ok(Actor(actor.to_string()))
    }
}
