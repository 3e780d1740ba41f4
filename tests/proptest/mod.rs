// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for the lifecycle state machine, validation and
//! backup cadence parsing
//!
//! 1. The state machine never panics on any phase, event and observation
//! 2. The event chosen for an observation never trips its own guard
//! 3. Validation is deterministic and matches the replica rules
//! 4. Cadence parsing rejects garbage with errors, not panics

use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use proptest::prelude::*;

use mysql_operator::controller::scheduler::{Cadence, parse_duration};
use mysql_operator::controller::state_machine::{
    DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult, determine_event,
};
use mysql_operator::controller::validation::{
    GROUP_MAX_REPLICAS, GROUP_MIN_REPLICAS, validate_mysql, validate_storage_size,
};
use mysql_operator::crd::{DatabasePhase, DormantPhase, TerminationPolicy};

#[path = "../common/mod.rs"]
mod common;

use common::MySQLBuilder;

// =============================================================================
// Strategies
// =============================================================================

fn arb_phase() -> impl Strategy<Value = DatabasePhase> {
    prop_oneof![
        Just(DatabasePhase::Provisioning),
        Just(DatabasePhase::Initializing),
        Just(DatabasePhase::Running),
        Just(DatabasePhase::Resuming),
        Just(DatabasePhase::Pausing),
        Just(DatabasePhase::Paused),
        Just(DatabasePhase::Terminating),
        Just(DatabasePhase::Failed),
    ]
}

fn arb_event() -> impl Strategy<Value = DatabaseEvent> {
    prop_oneof![
        Just(DatabaseEvent::ResourcesApplied),
        Just(DatabaseEvent::WorkloadReady),
        Just(DatabaseEvent::InitStarted),
        Just(DatabaseEvent::InitCompleted),
        Just(DatabaseEvent::InitFailed),
        Just(DatabaseEvent::ResumeRequested),
        Just(DatabaseEvent::PauseRequested),
        Just(DatabaseEvent::PauseCompleted),
        Just(DatabaseEvent::TerminationRequested),
        Just(DatabaseEvent::ValidationFailed),
        Just(DatabaseEvent::RetriesExhausted),
        Just(DatabaseEvent::ReadinessTimeout),
        Just(DatabaseEvent::SpecChanged),
    ]
}

fn arb_context() -> impl Strategy<Value = TransitionContext> {
    (0..12i32, 0..12i32, any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(ready, desired, pending, failed, changed)| {
            TransitionContext::new(ready, desired)
                .with_init_pending(pending)
                .with_init_failed(failed)
                .with_spec_changed(changed)
        },
    )
}

fn arb_dormant_phase() -> impl Strategy<Value = DormantPhase> {
    prop_oneof![
        Just(DormantPhase::Pausing),
        Just(DormantPhase::Paused),
        Just(DormantPhase::Resuming),
        Just(DormantPhase::WipedOut),
    ]
}

fn arb_policy() -> impl Strategy<Value = TerminationPolicy> {
    prop_oneof![
        Just(TerminationPolicy::DoNotTerminate),
        Just(TerminationPolicy::Pause),
        Just(TerminationPolicy::Delete),
        Just(TerminationPolicy::WipeOut),
    ]
}

// =============================================================================
// State machine
// =============================================================================

proptest! {
    #[test]
    fn transition_never_panics(
        phase in arb_phase(),
        events in prop::collection::vec(arb_event(), 0..20),
        ctx in arb_context(),
    ) {
        let sm = DatabaseStateMachine::new();
        let mut current = phase;
        for event in events {
            current = sm.transition(&current, event, &ctx).resulting_phase();
        }
    }

    #[test]
    fn rejected_transitions_keep_phase(
        phase in arb_phase(),
        event in arb_event(),
        ctx in arb_context(),
    ) {
        let sm = DatabaseStateMachine::new();
        let result = sm.transition(&phase, event.clone(), &ctx);
        if !sm.can_transition(&phase, &event) {
            let is_invalid = matches!(result, TransitionResult::InvalidTransition { .. });
            prop_assert!(is_invalid);
            prop_assert_eq!(result.resulting_phase(), phase);
        }
        if let TransitionResult::GuardFailed { .. } = result {
            prop_assert_eq!(result.resulting_phase(), phase);
        }
    }

    #[test]
    fn determined_event_passes_its_guard(phase in arb_phase(), ctx in arb_context()) {
        let sm = DatabaseStateMachine::new();
        let event = determine_event(&phase, &ctx);
        let result = sm.transition(&phase, event, &ctx);
        let guard_failed = matches!(result, TransitionResult::GuardFailed { .. });
        prop_assert!(!guard_failed);
    }

    #[test]
    fn failed_waits_for_spec_change(ctx in arb_context()) {
        let sm = DatabaseStateMachine::new();
        let event = determine_event(&DatabasePhase::Failed, &ctx);
        let next = sm.transition(&DatabasePhase::Failed, event, &ctx).resulting_phase();
        if ctx.spec_changed {
            prop_assert_eq!(next, DatabasePhase::Provisioning);
        } else {
            prop_assert_eq!(next, DatabasePhase::Failed);
        }
    }

    #[test]
    fn running_requires_all_replicas(phase in arb_phase(), ctx in arb_context()) {
        let sm = DatabaseStateMachine::new();
        let event = determine_event(&phase, &ctx);
        let next = sm.transition(&phase, event, &ctx).resulting_phase();
        if next == DatabasePhase::Running && phase != DatabasePhase::Running {
            prop_assert!(ctx.all_replicas_ready());
            prop_assert!(!ctx.init_pending);
        }
    }

    #[test]
    fn archived_phases_are_terminal(phase in prop_oneof![
        Just(DatabasePhase::Paused),
        Just(DatabasePhase::Terminating),
    ]) {
        let sm = DatabaseStateMachine::new();
        prop_assert!(sm.valid_events(&phase).is_empty());
    }

    #[test]
    fn wiped_out_dormant_is_terminal(to in arb_dormant_phase()) {
        prop_assert!(!DormantPhase::WipedOut.can_transition_to(to));
    }

    #[test]
    fn dormant_never_transitions_to_itself(phase in arb_dormant_phase()) {
        prop_assert!(!phase.can_transition_to(phase));
    }
}

// =============================================================================
// Validation
// =============================================================================

proptest! {
    #[test]
    fn validation_is_deterministic(
        replicas in -2..20i32,
        group in any::<bool>(),
        ephemeral in any::<bool>(),
        policy in arb_policy(),
    ) {
        let mut builder = if group {
            MySQLBuilder::group("db", "demo", replicas)
        } else {
            MySQLBuilder::new("db", "demo").with_replicas(replicas)
        };
        if ephemeral {
            builder = builder.ephemeral();
        }
        let mysql = builder.with_termination_policy(policy).build();
        let first = validate_mysql(&mysql).is_ok();
        let second = validate_mysql(&mysql).is_ok();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn standalone_accepts_only_one_replica(replicas in -2..20i32) {
        let mysql = MySQLBuilder::new("db", "demo").with_replicas(replicas).build();
        prop_assert_eq!(validate_mysql(&mysql).is_ok(), replicas == 1);
    }

    #[test]
    fn group_replication_bounds(replicas in -2..20i32) {
        let mysql = MySQLBuilder::group("db", "demo", replicas).build();
        let expected = (GROUP_MIN_REPLICAS..=GROUP_MAX_REPLICAS).contains(&replicas);
        prop_assert_eq!(validate_mysql(&mysql).is_ok(), expected);
    }

    #[test]
    fn ephemeral_pause_always_rejected(group in any::<bool>()) {
        let builder = if group {
            MySQLBuilder::group("db", "demo", 3)
        } else {
            MySQLBuilder::new("db", "demo")
        };
        let mysql = builder
            .ephemeral()
            .with_termination_policy(TerminationPolicy::Pause)
            .build();
        prop_assert!(validate_mysql(&mysql).is_err());
    }

    #[test]
    fn storage_size_never_panics(size in "\\PC{0,12}") {
        let _ = validate_storage_size(&size);
    }

    #[test]
    fn positive_sizes_accepted(n in 1u32..100_000, suffix in prop_oneof![
        Just("Ki"), Just("Mi"), Just("Gi"), Just("Ti"), Just("M"), Just("G"), Just(""),
    ]) {
        let size = format!("{n}{suffix}");
        prop_assert!(validate_storage_size(&size).is_ok());
    }
}

// =============================================================================
// Backup cadence
// =============================================================================

proptest! {
    #[test]
    fn cadence_parse_never_panics(expression in "[0-9*,\\- a-zA-Z@]{0,40}") {
        let _ = Cadence::parse(&expression);
    }

    #[test]
    fn duration_parse_never_panics(input in "[0-9smhd]{0,12}") {
        let _ = parse_duration(&input);
    }

    #[test]
    fn every_fires_after_interval(hours in 1u64..48, minutes in 0u64..60) {
        let expression = format!("@every {hours}h{minutes}m");
        let cadence = Cadence::parse(&expression).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = cadence.next_after(now).unwrap();
        let expected = Duration::from_secs(hours * 3600 + minutes * 60);
        prop_assert_eq!((next - now).to_std().unwrap(), expected);
    }

    #[test]
    fn cron_fires_strictly_later(minute in 0u32..60, hour in 0u32..24) {
        let cadence = Cadence::parse(&format!("{minute} {hour} * * *")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 30, 0).unwrap();
        let next = cadence.next_after(now).unwrap();
        prop_assert!(next > now);
        prop_assert!(next - now <= chrono::Duration::days(1));
    }

    #[test]
    fn cron_weekday_counts_from_sunday(day in 0u32..=7, offset in 0i64..7) {
        let cadence = Cadence::parse(&format!("0 0 * * {day}")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + chrono::Duration::days(offset);
        let next = cadence.next_after(now).unwrap();
        prop_assert_eq!(next.weekday().num_days_from_sunday(), day % 7);
        prop_assert!(next - now <= chrono::Duration::days(7));
    }
}
