//! Identifier generation
//!
//! Response ids are assigned by the server on first successful submit;
//! local keys are assigned by the sync client before the server is reached.

use uuid::Uuid;

/// New server-side response id
pub fn new_response_id() -> String {
    Uuid::new_v4().to_string()
}

/// New QC batch id
pub fn new_batch_id() -> String {
    format!("qc-{}", Uuid::new_v4())
}

/// New operator queue item id
pub fn new_item_id() -> String {
    Uuid::new_v4().to_string()
}

/// New client-local sync queue key
pub fn new_local_key() -> String {
    Uuid::new_v4().to_string()
}
