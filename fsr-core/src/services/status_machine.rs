//! Response lifecycle status machine
//!
//! Pure decision logic: given the record as read, a target status and the
//! cause of the change, either produce a `StatusTransition` or refuse with
//! `IllegalTransition`. Nothing here touches storage. The record store only
//! accepts a status change in the form of a `StatusTransition`, and the
//! fields of that type are private to this module, so every status write
//! has passed through `transition`.
//!
//! Rules, in order:
//! 1. A record carrying a valid abandonment reason may only become `Abandoned`.
//! 2. `Abandoned` and `Terminated` never change again.
//! 3. `Approved` and `Rejected` may only go back to `Pending_Approval`, and
//!    only through an explicit revert.
//! 4. From `Pending_Approval` any final status is reachable, subject to the
//!    cause: QC batches decide Approved/Rejected only, and `Abandoned`
//!    requires a valid reason on the record.

use fsr_common::{Error, ResponseRecord, ResponseStatus, Result};
use std::fmt;

/// Why a status change is being attempted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionCause {
    /// Record creation or re-submission of an existing fingerprint
    Submission,
    /// A reviewer deciding by hand
    ManualReview,
    /// Remainder decision derived from a QC batch sample
    QcBatch { batch_id: String },
    /// Explicit reversion of an Approved/Rejected decision
    RevertToPending,
    /// Interview abandoned with a reason
    Abandonment,
}

impl TransitionCause {
    /// Stable label stored in the audit trail and events
    pub fn label(&self) -> String {
        match self {
            TransitionCause::Submission => "submission".to_string(),
            TransitionCause::ManualReview => "manual_review".to_string(),
            TransitionCause::QcBatch { batch_id } => format!("qc_batch:{}", batch_id),
            TransitionCause::RevertToPending => "revert_to_pending".to_string(),
            TransitionCause::Abandonment => "abandonment".to_string(),
        }
    }
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// An approved status change, bound to the record version it was decided on
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    response_id: String,
    from: ResponseStatus,
    to: ResponseStatus,
    read_version: i64,
    actor: String,
    cause: TransitionCause,
}

impl StatusTransition {
    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn from(&self) -> ResponseStatus {
        self.from
    }

    pub fn to(&self) -> ResponseStatus {
        self.to
    }

    /// Version of the record the decision was made against
    pub fn read_version(&self) -> i64 {
        self.read_version
    }

    /// Version the record will carry once the write lands
    pub fn new_version(&self) -> i64 {
        self.read_version + 1
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn cause(&self) -> &TransitionCause {
        &self.cause
    }

    /// Reversions return the record to the QC-eligible pool
    pub fn releases_batch(&self) -> bool {
        self.cause == TransitionCause::RevertToPending
    }
}

/// Status a brand-new record starts in
pub fn initial_status(abandonment_reason: Option<&str>) -> ResponseStatus {
    match abandonment_reason {
        Some(reason) if fsr_common::is_valid_abandonment_reason(reason) => ResponseStatus::Abandoned,
        _ => ResponseStatus::PendingApproval,
    }
}

/// Decide whether `record` may move to `target`
pub fn transition(
    record: &ResponseRecord,
    target: ResponseStatus,
    actor: &str,
    cause: TransitionCause,
) -> Result<StatusTransition> {
    if let Err(reason) = check(record, target, &cause) {
        return Err(Error::IllegalTransition {
            response_id: record.id.clone(),
            from: record.status,
            to: target,
            reason,
        });
    }

    Ok(StatusTransition {
        response_id: record.id.clone(),
        from: record.status,
        to: target,
        read_version: record.version,
        actor: actor.to_string(),
        cause,
    })
}

fn check(
    record: &ResponseRecord,
    target: ResponseStatus,
    cause: &TransitionCause,
) -> std::result::Result<(), String> {
    use ResponseStatus::*;

    if record.has_valid_abandonment() && target != Abandoned {
        return Err("record carries an abandonment reason".to_string());
    }

    match (cause, target) {
        (TransitionCause::RevertToPending, PendingApproval) => {}
        (TransitionCause::RevertToPending, _) => {
            return Err("revert can only target Pending_Approval".to_string())
        }
        (TransitionCause::QcBatch { .. }, Approved | Rejected) => {}
        (TransitionCause::QcBatch { .. }, _) => {
            return Err("QC batches only decide Approved or Rejected".to_string())
        }
        (TransitionCause::Abandonment, Abandoned) => {}
        (TransitionCause::Abandonment, _) => {
            return Err("abandonment can only target Abandoned".to_string())
        }
        _ => {}
    }

    match record.status {
        Abandoned | Terminated => Err(format!("{} is irreversible", record.status)),
        Approved | Rejected => {
            if target == PendingApproval && *cause == TransitionCause::RevertToPending {
                Ok(())
            } else {
                Err(format!(
                    "{} is final; only an explicit revert may change it",
                    record.status
                ))
            }
        }
        PendingApproval => match target {
            PendingApproval => Err("record is already Pending_Approval".to_string()),
            Abandoned if !record.has_valid_abandonment() => {
                Err("Abandoned requires a valid abandonment reason".to_string())
            }
            _ => Ok(()),
        },
    }
}
