//! HTTP API handlers for fsr-core
//!
//! JSON over HTTP plus an SSE stream of lifecycle events. Mutating routes
//! require the `X-Actor-Id` header supplied by the identity layer in
//! front of this service.

pub mod actor;
pub mod health;
pub mod operator;
pub mod qc;
pub mod responses;
pub mod review;
pub mod sse;

pub use actor::Actor;
pub use health::health_routes;
pub use operator::operator_routes;
pub use qc::qc_routes;
pub use responses::response_routes;
pub use review::review_routes;
pub use sse::event_stream;
