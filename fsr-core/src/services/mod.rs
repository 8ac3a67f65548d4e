//! Service modules for the response lifecycle

pub mod attachment_verifier;
pub mod idempotency;
pub mod lifecycle;
pub mod object_store;
pub mod qc_batch;
pub mod reconciler;
pub mod review;
pub mod status_machine;
pub mod survey_catalog;

pub use attachment_verifier::AttachmentVerifier;
pub use idempotency::IdempotencyGuard;
pub use lifecycle::LifecycleGate;
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use qc_batch::QcBatchProcessor;
pub use reconciler::SyncReconciler;
pub use review::ReviewService;
pub use survey_catalog::{PermissiveCatalog, StaticCatalog, SurveyCatalog};
