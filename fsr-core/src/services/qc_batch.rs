//! QC batch processor
//!
//! A batch claims every eligible record of a survey, marks a random sample
//! for human review, and once the sample has been decided applies the
//! derived decision to the rest. Eligibility (Pending_Approval, no valid
//! abandonment reason, still in this batch) is re-checked on a fresh read
//! right before each write; anything that changed is skipped, never
//! forced. Members that settled stay settled: re-applying a batch only
//! retries the ones that failed, and two applies running at once split the
//! members between them through the ledger instead of deciding any twice.

use crate::db::batches::{self, BatchRow, BatchState, MemberOutcome};
use crate::db::responses;
use crate::services::lifecycle::LifecycleGate;
use crate::services::status_machine::TransitionCause;
use async_trait::async_trait;
use fsr_common::api::{
    ApplyQcBatchResponse, ClearQcBatchResponse, QcBatchView, RemainingDecision,
    RunQcBatchResponse,
};
use fsr_common::events::{EventBus, FsrEvent};
use fsr_common::ids::new_batch_id;
use fsr_common::time::now;
use fsr_common::{DecisionKind, Error, ResponseRecord, ResponseStatus, Result, Verification};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reviewer id recorded on verifications written by a batch
pub const QC_REVIEWER_ID: &str = "system:qc-batch";
/// Actor used by the background sweeper
pub const QC_SWEEPER_ACTOR: &str = "system:qc-sweeper";

/// Runs between a member's eligibility read and its gated status write
///
/// Lets operators trace batch writes and lets tests land a competing
/// change inside that window.
#[async_trait]
pub trait MemberWriteHook: Send + Sync {
    async fn before_write(&self, batch_id: &str, response_id: &str);
}

/// Where a batch's sample stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleVerdict {
    /// Sample members still awaiting a human decision
    Pending(usize),
    Decided(RemainingDecision),
}

/// Derive the remainder decision from the current state of the sample
///
/// Strict majority of Approved over Rejected approves, the reverse
/// rejects, a tie (including no decisions at all) queues everything for
/// individual review. Abandoned and Terminated samples carry no vote.
pub fn derive_decision(sample: &[ResponseRecord]) -> SampleVerdict {
    let pending = sample
        .iter()
        .filter(|r| r.status == ResponseStatus::PendingApproval)
        .count();
    if pending > 0 {
        return SampleVerdict::Pending(pending);
    }

    let approved = sample
        .iter()
        .filter(|r| r.status == ResponseStatus::Approved)
        .count();
    let rejected = sample
        .iter()
        .filter(|r| r.status == ResponseStatus::Rejected)
        .count();

    SampleVerdict::Decided(match approved.cmp(&rejected) {
        std::cmp::Ordering::Greater => RemainingDecision::AutoApprove,
        std::cmp::Ordering::Less => RemainingDecision::AutoReject,
        std::cmp::Ordering::Equal => RemainingDecision::QueueForReview,
    })
}

pub struct QcBatchProcessor {
    db: SqlitePool,
    gate: LifecycleGate,
    events: EventBus,
    max_write_attempts: u32,
    write_hook: Option<Arc<dyn MemberWriteHook>>,
}

impl QcBatchProcessor {
    pub fn new(db: SqlitePool, gate: LifecycleGate, events: EventBus, max_write_attempts: u32) -> Self {
        Self {
            db,
            gate,
            events,
            max_write_attempts: max_write_attempts.max(1),
            write_hook: None,
        }
    }

    pub fn with_write_hook(mut self, hook: Arc<dyn MemberWriteHook>) -> Self {
        self.write_hook = Some(hook);
        self
    }

    /// Create a batch over every eligible record of `survey_id`
    pub async fn run_batch(
        &self,
        survey_id: &str,
        sample_size: usize,
        actor: &str,
    ) -> Result<RunQcBatchResponse> {
        let mut rng = StdRng::from_entropy();
        self.run_batch_with_rng(survey_id, sample_size, actor, &mut rng)
            .await
    }

    pub async fn run_batch_with_rng(
        &self,
        survey_id: &str,
        sample_size: usize,
        actor: &str,
        rng: &mut StdRng,
    ) -> Result<RunQcBatchResponse> {
        if survey_id.trim().is_empty() {
            return Err(Error::Validation("survey_id must not be empty".into()));
        }

        let candidates = responses::list_qc_candidates(&self.db, survey_id).await?;
        if candidates.is_empty() {
            return Err(Error::Validation(format!(
                "No eligible responses for survey {}",
                survey_id
            )));
        }

        let amount = sample_size.min(candidates.len());
        let sample_idx: HashSet<usize> =
            rand::seq::index::sample(rng, candidates.len(), amount).into_iter().collect();

        let batch_id = new_batch_id();
        batches::insert_batch(
            &self.db,
            &BatchRow {
                batch_id: batch_id.clone(),
                survey_id: survey_id.to_string(),
                sample_size: amount as i64,
                state: BatchState::Sampling,
                remaining_decision: None,
                created_by: actor.to_string(),
                created_at: now(),
                applied_at: None,
            },
        )
        .await?;

        let mut sampled = Vec::new();
        let mut remainder = Vec::new();
        for (idx, record) in candidates.iter().enumerate() {
            let is_sample = sample_idx.contains(&idx);
            // A record that changed since the candidate read is left out
            if !batches::claim_member(&self.db, &batch_id, record, is_sample).await? {
                tracing::info!(
                    batch_id = %batch_id,
                    response_id = %record.id,
                    "Record changed before it could join the batch, left out"
                );
                continue;
            }
            if is_sample {
                sampled.push(record.id.clone());
            } else {
                remainder.push(record.id.clone());
            }
        }

        tracing::info!(
            batch_id = %batch_id,
            survey_id,
            actor,
            sampled = sampled.len(),
            remainder = remainder.len(),
            "QC batch created"
        );
        self.events.emit_lossy(FsrEvent::QcBatchCreated {
            batch_id: batch_id.clone(),
            survey_id: survey_id.to_string(),
            sampled: sampled.len(),
            remainder: remainder.len(),
            timestamp: now(),
        });

        // Nothing to wait for: decide the remainder now
        let decided_remainder = if sampled.is_empty() {
            self.apply_batch(&batch_id, actor).await?.decided_remainder
        } else {
            Vec::new()
        };

        Ok(RunQcBatchResponse {
            batch_id,
            sampled,
            remainder,
            decided_remainder,
        })
    }

    /// Current verdict of a batch's sample
    pub async fn sample_verdict(&self, batch_id: &str) -> Result<SampleVerdict> {
        let members = batches::list_members(&self.db, batch_id).await?;
        let mut sample = Vec::new();
        for member in members.iter().filter(|m| m.is_sample) {
            let Some(record) = responses::load_response(&self.db, &member.response_id).await?
            else {
                continue;
            };
            // A sample reverted out of the batch no longer votes
            if record.status == ResponseStatus::PendingApproval
                && record.qc_batch_ref.as_deref() != Some(batch_id)
            {
                continue;
            }
            sample.push(record);
        }
        Ok(derive_decision(&sample))
    }

    /// Apply the derived decision to every unsettled remainder member
    pub async fn apply_batch(&self, batch_id: &str, actor: &str) -> Result<ApplyQcBatchResponse> {
        let batch = batches::require_batch(&self.db, batch_id).await?;
        if batch.state == BatchState::Cleared {
            return Err(Error::Validation(format!("QC batch {} was cleared", batch_id)));
        }

        let decision = match batch.remaining_decision {
            Some(decision) => decision,
            None => match self.sample_verdict(batch_id).await? {
                SampleVerdict::Pending(n) => {
                    return Err(Error::NotReady(format!(
                        "QC batch {} has {} sample responses awaiting review",
                        batch_id, n
                    )))
                }
                SampleVerdict::Decided(decision) => {
                    batches::record_decision(&self.db, batch_id, decision).await?
                }
            },
        };

        let members = batches::list_members(&self.db, batch_id).await?;
        for member in members.iter().filter(|m| !m.is_sample && !m.is_settled()) {
            // Another run may hold or have settled it since the list
            if !batches::begin_member_apply(&self.db, batch_id, &member.response_id).await? {
                tracing::debug!(
                    batch_id,
                    response_id = %member.response_id,
                    "Member taken by another apply run"
                );
                continue;
            }
            let (outcome, detail) = self
                .apply_to_member(batch_id, &member.response_id, decision, actor)
                .await;
            let recorded = batches::finish_member_apply(
                &self.db,
                batch_id,
                &member.response_id,
                outcome,
                detail.as_deref(),
            )
            .await?;
            if !recorded {
                tracing::warn!(
                    batch_id,
                    response_id = %member.response_id,
                    outcome = outcome.as_str(),
                    "Member lease lost before its outcome was recorded"
                );
            }
        }

        let members = batches::list_members(&self.db, batch_id).await?;
        let ids_with = |wanted: &[MemberOutcome]| -> Vec<String> {
            members
                .iter()
                .filter(|m| !m.is_sample && m.outcome.map(|o| wanted.contains(&o)).unwrap_or(false))
                .map(|m| m.response_id.clone())
                .collect()
        };
        let decided = ids_with(&[MemberOutcome::Applied, MemberOutcome::Queued]);
        let skipped = ids_with(&[MemberOutcome::Skipped]);
        let failed = ids_with(&[MemberOutcome::Failed]);
        let in_progress = ids_with(&[MemberOutcome::InProgress]);

        // The run that finishes last sees every member settled and sets the state
        if in_progress.is_empty() {
            let state = if failed.is_empty() {
                BatchState::Applied
            } else {
                BatchState::PartiallyApplied
            };
            if !batches::set_batch_state(&self.db, batch_id, state, Some(now())).await? {
                tracing::warn!(batch_id, "QC batch was cleared while it was being applied");
            }
        } else {
            tracing::debug!(
                batch_id,
                in_progress = in_progress.len(),
                "Other apply run still deciding members"
            );
        }

        if failed.is_empty() {
            tracing::info!(
                batch_id,
                decision = decision.as_str(),
                decided = decided.len(),
                skipped = skipped.len(),
                "QC batch applied"
            );
        } else {
            tracing::warn!(
                batch_id,
                decision = decision.as_str(),
                decided = decided.len(),
                skipped = skipped.len(),
                failed = failed.len(),
                "QC batch partially applied; failed members will be retried"
            );
        }

        self.events.emit_lossy(FsrEvent::QcBatchApplied {
            batch_id: batch_id.to_string(),
            decision: decision.as_str().to_string(),
            decided: decided.len(),
            skipped: skipped.len(),
            failed: failed.len(),
            timestamp: now(),
        });

        Ok(ApplyQcBatchResponse {
            batch_id: batch_id.to_string(),
            decision,
            decided_remainder: decided,
            skipped,
            failed,
        })
    }

    async fn apply_to_member(
        &self,
        batch_id: &str,
        response_id: &str,
        decision: RemainingDecision,
        actor: &str,
    ) -> (MemberOutcome, Option<String>) {
        let target = match decision {
            RemainingDecision::QueueForReview => None,
            RemainingDecision::AutoApprove => {
                Some((ResponseStatus::Approved, DecisionKind::AutoApproved))
            }
            RemainingDecision::AutoReject => {
                Some((ResponseStatus::Rejected, DecisionKind::AutoRejected))
            }
        };

        for attempt in 1..=self.max_write_attempts {
            let record = match responses::load_response(&self.db, response_id).await {
                Ok(Some(record)) => record,
                Ok(None) => return (MemberOutcome::Skipped, Some("record not found".into())),
                Err(e) => return (MemberOutcome::Failed, Some(e.to_string())),
            };

            // Written by this batch in a run that died before recording it
            if let Some((status, kind)) = target {
                let decided_here = record.qc_batch_ref.as_deref() == Some(batch_id)
                    && record.status == status
                    && record.verification.as_ref().map(|v| v.decision_kind) == Some(kind);
                if decided_here {
                    return (MemberOutcome::Applied, Some("already decided by this batch".into()));
                }
            }

            if !record.is_qc_eligible() || record.qc_batch_ref.as_deref() != Some(batch_id) {
                let detail = format!(
                    "no longer eligible (status {}, abandoned {}, batch {:?})",
                    record.status,
                    record.has_valid_abandonment(),
                    record.qc_batch_ref
                );
                tracing::info!(batch_id, response_id, "Skipping batch member: {}", detail);
                return (MemberOutcome::Skipped, Some(detail));
            }

            let Some((status, kind)) = target else {
                return (MemberOutcome::Queued, None);
            };

            let mut decided = record;
            decided.verification = Some(Verification {
                reviewer_id: QC_REVIEWER_ID.to_string(),
                reviewed_at: now(),
                decision_kind: kind,
                feedback: Some(format!("Derived from QC batch {} sample", batch_id)),
            });

            if let Some(hook) = &self.write_hook {
                hook.before_write(batch_id, response_id).await;
            }

            let cause = TransitionCause::QcBatch {
                batch_id: batch_id.to_string(),
            };
            match self.gate.apply(decided, status, actor, cause).await {
                Ok(_) => return (MemberOutcome::Applied, None),
                Err(Error::IllegalTransition { reason, .. }) => {
                    return (MemberOutcome::Skipped, Some(reason))
                }
                Err(Error::ConcurrentModification { .. }) => {
                    tracing::debug!(batch_id, response_id, attempt, "Version conflict, re-reading");
                }
                Err(e) => {
                    tracing::error!(batch_id, response_id, "Batch write failed: {}", e);
                    return (MemberOutcome::Failed, Some(e.to_string()));
                }
            }
        }

        (
            MemberOutcome::Failed,
            Some(format!(
                "version conflict persisted after {} attempts",
                self.max_write_attempts
            )),
        )
    }

    /// Release every still-eligible record from a batch
    pub async fn clear_batch(&self, batch_id: &str, actor: &str) -> Result<ClearQcBatchResponse> {
        batches::require_batch(&self.db, batch_id).await?;
        batches::mark_batch_cleared(&self.db, batch_id).await?;
        let released = batches::release_batch(&self.db, batch_id).await?;

        tracing::info!(batch_id, actor, released = released.len(), "QC batch cleared");
        Ok(ClearQcBatchResponse {
            batch_id: batch_id.to_string(),
            released,
        })
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<QcBatchView> {
        batches::batch_view(&self.db, batch_id).await
    }

    /// Apply every open batch whose sample is fully decided
    pub async fn sweep(&self) -> Result<Vec<ApplyQcBatchResponse>> {
        let mut applied = Vec::new();
        for batch_id in batches::list_open_batches(&self.db).await? {
            match self.apply_batch(&batch_id, QC_SWEEPER_ACTOR).await {
                Ok(result) => applied.push(result),
                Err(Error::NotReady(msg)) => tracing::debug!(batch_id = %batch_id, "{}", msg),
                Err(e) => tracing::warn!(batch_id = %batch_id, "Sweep could not apply batch: {}", e),
            }
        }
        Ok(applied)
    }

    /// Background task running `sweep` every `interval` until cancelled
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("QC sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::warn!("QC sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
