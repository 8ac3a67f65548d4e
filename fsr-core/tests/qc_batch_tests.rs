//! QC batch sampling and remainder decisions

mod helpers;

use async_trait::async_trait;
use fsr_common::api::RemainingDecision;
use fsr_common::{DecisionKind, Error, ResponseStatus};
use fsr_core::services::qc_batch::{MemberWriteHook, QC_REVIEWER_ID, QC_SWEEPER_ACTOR};
use fsr_core::services::{LifecycleGate, QcBatchProcessor, ReviewService};
use helpers::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Submit `n` pending interviews for survey `s1`
async fn seed(app: &TestApp, n: i64) -> Vec<String> {
    let mut ids = Vec::new();
    for minute in 0..n {
        ids.push(app.submit(&interview("s1", "int-1", minute * 30)).await);
    }
    ids
}

async fn decide(app: &TestApp, ids: &[String], target: ResponseStatus) {
    for id in ids {
        app.state
            .review
            .set_status(id, target, REVIEWER, None, None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_abandoned_record_is_never_batched() {
    let app = memory_app().await;
    let pending = seed(&app, 3).await;
    let refused = app
        .submit(&abandoned(interview("s1", "int-2", 0), "Respondent refused"))
        .await;

    let mut rng = StdRng::seed_from_u64(11);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();

    let mut members: Vec<_> = batch.sampled.iter().chain(&batch.remainder).cloned().collect();
    members.sort();
    let mut expected = pending.clone();
    expected.sort();
    assert_eq!(members, expected);
    assert!(!members.contains(&refused));

    let record = app.record(&refused).await;
    assert_eq!(record.status, ResponseStatus::Abandoned);
    assert!(record.qc_batch_ref.is_none());
}

#[tokio::test]
async fn test_remainder_waits_for_sample_review() {
    let app = memory_app().await;
    seed(&app, 5).await;
    let mut rng = StdRng::seed_from_u64(3);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 2, REVIEWER, &mut rng)
        .await
        .unwrap();
    assert_eq!(batch.sampled.len(), 2);
    assert_eq!(batch.remainder.len(), 3);
    assert!(batch.decided_remainder.is_empty());

    for id in &batch.sampled {
        let record = app.record(id).await;
        assert!(record.is_sample_response);
        assert_eq!(record.qc_batch_ref.as_deref(), Some(batch.batch_id.as_str()));
    }

    let err = app
        .state
        .qc
        .apply_batch(&batch.batch_id, REVIEWER)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));

    // Half-reviewed is still not ready
    decide(&app, &batch.sampled[..1], ResponseStatus::Approved).await;
    assert!(matches!(
        app.state.qc.apply_batch(&batch.batch_id, REVIEWER).await,
        Err(Error::NotReady(_))
    ));
    for id in &batch.remainder {
        assert_eq!(app.record(id).await.status, ResponseStatus::PendingApproval);
    }
}

#[tokio::test]
async fn test_approved_sample_auto_approves_remainder() {
    let app = memory_app().await;
    seed(&app, 6).await;
    let mut rng = StdRng::seed_from_u64(5);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 2, REVIEWER, &mut rng)
        .await
        .unwrap();
    decide(&app, &batch.sampled, ResponseStatus::Approved).await;

    let applied = app
        .state
        .qc
        .apply_batch(&batch.batch_id, REVIEWER)
        .await
        .unwrap();
    assert_eq!(applied.decision, RemainingDecision::AutoApprove);
    assert_eq!(applied.decided_remainder.len(), 4);
    assert!(applied.skipped.is_empty());
    assert!(applied.failed.is_empty());

    for id in &batch.remainder {
        let record = app.record(id).await;
        assert_eq!(record.status, ResponseStatus::Approved);
        let verification = record.verification.clone().unwrap();
        assert_eq!(verification.decision_kind, DecisionKind::AutoApproved);
        assert_eq!(verification.reviewer_id, QC_REVIEWER_ID);
        assert_record_invariants(&app, id).await;
    }
    // Samples keep their manual decision
    for id in &batch.sampled {
        let verification = app.record(id).await.verification.unwrap();
        assert_eq!(verification.decision_kind, DecisionKind::Manual);
    }

    let view = app.state.qc.get_batch(&batch.batch_id).await.unwrap();
    assert_eq!(view.state, "applied");
    assert_eq!(view.remaining_decision, Some(RemainingDecision::AutoApprove));
}

#[tokio::test]
async fn test_members_abandoned_or_decided_after_sampling_are_skipped() {
    let app = memory_app().await;
    seed(&app, 5).await;
    let mut rng = StdRng::seed_from_u64(9);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();
    assert_eq!(batch.remainder.len(), 4);

    let gone = batch.remainder[0].clone();
    let rejected = batch.remainder[1].clone();
    app.state
        .review
        .mark_abandoned(&gone, REVIEWER, "Respondent withdrew consent", None)
        .await
        .unwrap();
    decide(&app, &[rejected.clone()], ResponseStatus::Rejected).await;
    decide(&app, &batch.sampled, ResponseStatus::Approved).await;

    let applied = app
        .state
        .qc
        .apply_batch(&batch.batch_id, REVIEWER)
        .await
        .unwrap();
    assert_eq!(applied.decided_remainder.len(), 2);
    let mut skipped = applied.skipped.clone();
    skipped.sort();
    let mut expected = vec![gone.clone(), rejected.clone()];
    expected.sort();
    assert_eq!(skipped, expected);

    assert_eq!(app.record(&gone).await.status, ResponseStatus::Abandoned);
    let rejected_record = app.record(&rejected).await;
    assert_eq!(rejected_record.status, ResponseStatus::Rejected);
    assert_eq!(
        rejected_record.verification.unwrap().decision_kind,
        DecisionKind::Manual
    );
    assert_record_invariants(&app, &gone).await;
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let app = memory_app().await;
    seed(&app, 4).await;
    let mut rng = StdRng::seed_from_u64(1);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();
    decide(&app, &batch.sampled, ResponseStatus::Approved).await;

    let first = app.state.qc.apply_batch(&batch.batch_id, REVIEWER).await.unwrap();
    let versions: Vec<i64> = {
        let mut v = Vec::new();
        for id in &batch.remainder {
            v.push(app.record(id).await.version);
        }
        v
    };

    let second = app.state.qc.apply_batch(&batch.batch_id, REVIEWER).await.unwrap();
    assert_eq!(second.decision, first.decision);
    assert_eq!(second.decided_remainder.len(), first.decided_remainder.len());
    for (id, version) in batch.remainder.iter().zip(versions) {
        assert_eq!(app.record(id).await.version, version, "{} rewritten", id);
    }
}

#[tokio::test]
async fn test_stored_decision_survives_sample_revert() {
    let app = memory_app().await;
    seed(&app, 4).await;
    let mut rng = StdRng::seed_from_u64(21);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();
    decide(&app, &batch.sampled, ResponseStatus::Rejected).await;
    let first = app.state.qc.apply_batch(&batch.batch_id, REVIEWER).await.unwrap();
    assert_eq!(first.decision, RemainingDecision::AutoReject);

    app.state
        .review
        .revert_to_pending(&batch.sampled[0], REVIEWER, "wrong sample verdict", None)
        .await
        .unwrap();
    let record = app.record(&batch.sampled[0]).await;
    assert!(record.qc_batch_ref.is_none());
    assert!(!record.is_sample_response);

    let again = app.state.qc.apply_batch(&batch.batch_id, REVIEWER).await.unwrap();
    assert_eq!(again.decision, RemainingDecision::AutoReject);
    for id in &batch.remainder {
        let record = app.record(id).await;
        assert_eq!(record.status, ResponseStatus::Rejected);
        assert_eq!(
            record.verification.unwrap().decision_kind,
            DecisionKind::AutoRejected
        );
    }
}

#[tokio::test]
async fn test_split_sample_queues_remainder_for_review() {
    let app = memory_app().await;
    seed(&app, 6).await;
    let mut rng = StdRng::seed_from_u64(13);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 2, REVIEWER, &mut rng)
        .await
        .unwrap();
    decide(&app, &batch.sampled[..1], ResponseStatus::Approved).await;
    decide(&app, &batch.sampled[1..], ResponseStatus::Rejected).await;

    let applied = app.state.qc.apply_batch(&batch.batch_id, REVIEWER).await.unwrap();
    assert_eq!(applied.decision, RemainingDecision::QueueForReview);
    assert_eq!(applied.decided_remainder.len(), 4);
    for id in &batch.remainder {
        let record = app.record(id).await;
        assert_eq!(record.status, ResponseStatus::PendingApproval);
        assert!(record.verification.is_none());
    }
}

#[tokio::test]
async fn test_clear_releases_pending_members() {
    let app = memory_app().await;
    seed(&app, 4).await;
    let mut rng = StdRng::seed_from_u64(17);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();

    let cleared = app.state.qc.clear_batch(&batch.batch_id, REVIEWER).await.unwrap();
    assert_eq!(cleared.released.len(), 4);
    for id in batch.sampled.iter().chain(&batch.remainder) {
        let record = app.record(id).await;
        assert!(record.qc_batch_ref.is_none());
        assert!(!record.is_sample_response);
    }

    assert!(matches!(
        app.state.qc.apply_batch(&batch.batch_id, REVIEWER).await,
        Err(Error::Validation(_))
    ));

    // Released records are eligible for a new batch
    let next = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();
    assert_eq!(next.sampled.len() + next.remainder.len(), 4);
}

#[tokio::test]
async fn test_batched_records_are_not_batched_twice() {
    let app = memory_app().await;
    seed(&app, 3).await;
    app.state.qc.run_batch("s1", 1, REVIEWER).await.unwrap();
    assert!(matches!(
        app.state.qc.run_batch("s1", 1, REVIEWER).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_oversize_sample_takes_everything() {
    let app = memory_app().await;
    seed(&app, 3).await;
    let batch = app.state.qc.run_batch("s1", 10, REVIEWER).await.unwrap();
    assert_eq!(batch.sampled.len(), 3);
    assert!(batch.remainder.is_empty());
}

#[tokio::test]
async fn test_empty_sample_queues_immediately() {
    let app = memory_app().await;
    seed(&app, 3).await;
    let batch = app.state.qc.run_batch("s1", 0, REVIEWER).await.unwrap();
    assert!(batch.sampled.is_empty());
    assert_eq!(batch.decided_remainder.len(), 3);
    for id in &batch.remainder {
        assert_eq!(app.record(id).await.status, ResponseStatus::PendingApproval);
    }
}

#[tokio::test]
async fn test_unknown_survey_or_batch() {
    let app = memory_app().await;
    assert!(matches!(
        app.state.qc.run_batch("nobody", 2, REVIEWER).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        app.state.qc.apply_batch("qc-missing", REVIEWER).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_sweep_applies_only_decided_batches() {
    let app = memory_app().await;
    seed(&app, 4).await;
    let mut rng = StdRng::seed_from_u64(2);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();

    assert!(app.state.qc.sweep().await.unwrap().is_empty());

    decide(&app, &batch.sampled, ResponseStatus::Approved).await;
    let swept = app.state.qc.sweep().await.unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].batch_id, batch.batch_id);

    // Applied batches drop out of later sweeps
    assert!(app.state.qc.sweep().await.unwrap().is_empty());
}

/// Approvals of `id` written through the gate
async fn accepted_approvals(app: &TestApp, id: &str) -> usize {
    app.state
        .review
        .audit_trail(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.accepted && e.to_status == ResponseStatus::Approved)
        .count()
}

#[tokio::test]
async fn test_overlapping_applies_decide_each_member_once() {
    let app = file_app().await;
    seed(&app, 8).await;
    let mut rng = StdRng::seed_from_u64(5);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();
    assert_eq!(batch.remainder.len(), 7);
    decide(&app, &batch.sampled, ResponseStatus::Approved).await;

    // Operator and sweeper apply the same batch at once
    let (manual, sweeper) = tokio::join!(
        app.state.qc.apply_batch(&batch.batch_id, REVIEWER),
        app.state.qc.apply_batch(&batch.batch_id, QC_SWEEPER_ACTOR),
    );
    let manual = manual.unwrap();
    let sweeper = sweeper.unwrap();
    assert!(manual.skipped.is_empty(), "{:?}", manual.skipped);
    assert!(sweeper.skipped.is_empty(), "{:?}", sweeper.skipped);
    assert!(manual.failed.is_empty() && sweeper.failed.is_empty());

    let view = app.state.qc.get_batch(&batch.batch_id).await.unwrap();
    assert_eq!(view.state, "applied");
    let remainder: Vec<_> = view.members.iter().filter(|m| !m.is_sample).collect();
    assert_eq!(remainder.len(), 7);
    for member in remainder {
        assert_eq!(member.outcome.as_deref(), Some("applied"), "{:?}", member);
        assert_eq!(
            app.record(&member.response_id).await.status,
            ResponseStatus::Approved
        );
        assert_eq!(accepted_approvals(&app, &member.response_id).await, 1);
    }
}

#[tokio::test]
async fn test_cleared_batch_state_is_not_overwritten() {
    let app = memory_app().await;
    seed(&app, 3).await;
    let mut rng = StdRng::seed_from_u64(2);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();
    app.state.qc.clear_batch(&batch.batch_id, REVIEWER).await.unwrap();

    // A late apply finishing after the clear must not reopen the batch
    let moved = fsr_core::db::batches::set_batch_state(
        app.db(),
        &batch.batch_id,
        fsr_core::db::batches::BatchState::Applied,
        Some(chrono::Utc::now()),
    )
    .await
    .unwrap();
    assert!(!moved);
    let view = app.state.qc.get_batch(&batch.batch_id).await.unwrap();
    assert_eq!(view.state, "cleared");
}

/// Abandons one record right before the batch writes its decision
struct AbandonBeforeWrite {
    review: Arc<ReviewService>,
    target: String,
    fired: AtomicBool,
}

#[async_trait]
impl MemberWriteHook for AbandonBeforeWrite {
    async fn before_write(&self, _batch_id: &str, response_id: &str) {
        if response_id == self.target && !self.fired.swap(true, Ordering::SeqCst) {
            self.review
                .mark_abandoned(response_id, ACTOR, "Respondent refused", None)
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn test_member_abandoned_during_apply_is_skipped() {
    let app = file_app().await;
    seed(&app, 5).await;
    let mut rng = StdRng::seed_from_u64(17);
    let batch = app
        .state
        .qc
        .run_batch_with_rng("s1", 1, REVIEWER, &mut rng)
        .await
        .unwrap();
    decide(&app, &batch.sampled, ResponseStatus::Approved).await;
    let refused = batch.remainder[0].clone();

    let hook = Arc::new(AbandonBeforeWrite {
        review: app.state.review.clone(),
        target: refused.clone(),
        fired: AtomicBool::new(false),
    });
    let processor = QcBatchProcessor::new(
        app.db().clone(),
        LifecycleGate::new(app.db().clone(), app.events.clone()),
        app.events.clone(),
        3,
    )
    .with_write_hook(hook.clone());

    let applied = processor
        .apply_batch(&batch.batch_id, REVIEWER)
        .await
        .unwrap();
    assert!(hook.fired.load(Ordering::SeqCst));
    assert_eq!(applied.skipped, vec![refused.clone()]);
    assert_eq!(applied.decided_remainder.len(), batch.remainder.len() - 1);
    assert!(!applied.decided_remainder.contains(&refused));

    let record = app.record(&refused).await;
    assert_eq!(record.status, ResponseStatus::Abandoned);
    assert_eq!(record.abandonment_reason.as_deref(), Some("Respondent refused"));
    assert_eq!(accepted_approvals(&app, &refused).await, 0);

    let view = app.state.qc.get_batch(&batch.batch_id).await.unwrap();
    let member = view
        .members
        .iter()
        .find(|m| m.response_id == refused)
        .unwrap();
    assert_eq!(member.outcome.as_deref(), Some("skipped"));

    for id in batch.remainder.iter().chain(&batch.sampled) {
        assert_record_invariants(&app, id).await;
    }
}
