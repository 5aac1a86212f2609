//! DLQ replay policy scenarios, including dry-run isolation.

use std::time::Duration;

use sonia_core::LetterId;
use sonia_dlq::{
    DlqReplayPolicyEngine, EvaluationInput, RejectReason, ReplayDecision, NON_RETRYABLE_CLASSES,
};

fn input(letter: &str, dry_run: bool) -> EvaluationInput {
    EvaluationInput {
        letter_id: LetterId::from(letter),
        already_replayed: false,
        failure_class: "execution_error".to_string(),
        error_code: "E500".to_string(),
        correlation_id: format!("corr_{letter}"),
        session_id: None,
        breaker_state: sonia_dlq::BreakerState::Closed,
        dry_run,
    }
}

#[test]
fn dry_run_isolation_then_real_consumes_cooldown() {
    // Cooldown 0 for the dry-run phase, budget 2
    let engine = DlqReplayPolicyEngine::with_policy(Duration::ZERO, 2, Duration::from_secs(300));

    // Five dry-run evaluations of L all approve
    for _ in 0..5 {
        let trace = engine.evaluate(&input("dl_L", true));
        assert_eq!(trace.decision, ReplayDecision::Approve);
    }

    // A following real evaluation also approves: the dry runs consumed
    // no budget
    let real = engine.evaluate(&input("dl_L", false));
    assert_eq!(real.decision, ReplayDecision::Approve);

    // With a cooldown in force, the real evaluation immediately after
    // defers on cooldown
    let engine = DlqReplayPolicyEngine::with_policy(
        Duration::from_secs(60),
        10,
        Duration::from_secs(300),
    );
    engine.evaluate(&input("dl_M", false));
    let after = engine.evaluate(&input("dl_M", false));
    assert_eq!(after.decision, ReplayDecision::Defer);
    assert_eq!(after.reject_reason, Some(RejectReason::CooldownActive));
}

#[test]
fn non_retryable_classes_reject_regardless_of_budget() {
    let engine = DlqReplayPolicyEngine::with_policy(Duration::ZERO, 100, Duration::from_secs(300));
    for class in NON_RETRYABLE_CLASSES {
        let trace = engine.evaluate(&EvaluationInput {
            failure_class: class.to_string(),
            ..input("dl_nr", false)
        });
        assert_eq!(trace.decision, ReplayDecision::Reject, "{class}");
        assert_eq!(
            trace.reject_reason,
            Some(RejectReason::FailureClassNonRetryable)
        );
    }
}

#[test]
fn lineage_tracks_original_to_replay_chain() {
    let engine = DlqReplayPolicyEngine::new();
    let lineage = engine.record_lineage("corr_orig", "act_orig", None, None);
    assert_eq!(lineage.status, "pending");

    let lineage = engine.record_lineage("corr_orig", "act_orig", Some("corr_r1"), Some("act_r1"));
    assert_eq!(lineage.status, "replayed");
    assert_eq!(lineage.replay_action_ids, vec!["act_r1".to_string()]);

    let fetched = engine.get_lineage("act_orig").unwrap();
    assert_eq!(fetched["replay_count"], 1);
}
