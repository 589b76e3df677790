//! Additional unit tests for state machine transitions

use postgres_access_operator::controller::state_machine::outcome_event;
use postgres_access_operator::controller::{
    Error, ResourceEvent, ResourceStateMachine, TransitionContext, TransitionResult,
};
use postgres_access_operator::crd::ResourcePhase;

mod transition_context_tests {
    use super::*;

    #[test]
    fn test_default_context_is_not_terminal() {
        assert!(!TransitionContext::default().is_terminal_failure());
    }

    #[test]
    fn test_same_generation_is_terminal() {
        assert!(TransitionContext::new(Some(2), Some(2)).is_terminal_failure());
    }

    #[test]
    fn test_newer_generation_is_not_terminal() {
        assert!(!TransitionContext::new(Some(3), Some(2)).is_terminal_failure());
    }

    #[test]
    fn test_missing_generation_is_not_terminal() {
        assert!(!TransitionContext::new(None, Some(2)).is_terminal_failure());
        assert!(!TransitionContext::new(Some(2), None).is_terminal_failure());
    }
}

mod transition_tests {
    use super::*;

    fn sm() -> ResourceStateMachine {
        ResourceStateMachine::new()
    }

    #[test]
    fn test_reconcile_started_from_live_phases() {
        let ctx = TransitionContext::default();
        for phase in [ResourcePhase::Pending, ResourcePhase::Ready, ResourcePhase::Error] {
            let result = sm().transition(phase, ResourceEvent::ReconcileStarted, &ctx);
            assert_eq!(
                result.target(),
                Some(ResourcePhase::Reconciling),
                "from {}",
                phase
            );
        }
    }

    #[test]
    fn test_reconciling_outcomes() {
        let ctx = TransitionContext::default();
        let cases = [
            (ResourceEvent::Converged, ResourcePhase::Ready),
            (ResourceEvent::ReconcileFailed, ResourcePhase::Error),
            (ResourceEvent::DependencyUnresolved, ResourcePhase::Pending),
            (ResourceEvent::DeletionRequested, ResourcePhase::Terminating),
        ];
        for (event, expected) in cases {
            let result = sm().transition(ResourcePhase::Reconciling, event, &ctx);
            assert_eq!(result.target(), Some(expected), "event {}", event);
        }
    }

    #[test]
    fn test_success_carries_description() {
        let result = sm().transition(
            ResourcePhase::Pending,
            ResourceEvent::ReconcileStarted,
            &TransitionContext::default(),
        );
        match result {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                assert_eq!(from, ResourcePhase::Pending);
                assert_eq!(to, ResourcePhase::Reconciling);
                assert!(!description.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outcome_requires_reconciling() {
        let ctx = TransitionContext::default();
        for phase in [ResourcePhase::Pending, ResourcePhase::Ready, ResourcePhase::Error] {
            assert!(matches!(
                sm().transition(phase, ResourceEvent::Converged, &ctx),
                TransitionResult::InvalidTransition { .. }
            ));
        }
    }

    #[test]
    fn test_nothing_leaves_terminating() {
        let ctx = TransitionContext::default();
        for event in [
            ResourceEvent::ReconcileStarted,
            ResourceEvent::Converged,
            ResourceEvent::DependencyUnresolved,
            ResourceEvent::ReconcileFailed,
            ResourceEvent::DeletionRequested,
        ] {
            assert!(!sm().can_transition(ResourcePhase::Terminating, event));
            assert!(sm().transition(ResourcePhase::Terminating, event, &ctx).target().is_none());
        }
    }

    #[test]
    fn test_guard_blocks_terminal_retry() {
        let ctx = TransitionContext::new(Some(5), Some(5));
        let result = sm().transition(ResourcePhase::Error, ResourceEvent::ReconcileStarted, &ctx);
        match result {
            TransitionResult::GuardFailed { reason, .. } => assert!(reason.contains("5")),
            other => panic!("unexpected {:?}", other),
        }
        // The guard only covers Error
        let result = sm().transition(ResourcePhase::Ready, ResourceEvent::ReconcileStarted, &ctx);
        assert_eq!(result.target(), Some(ResourcePhase::Reconciling));
    }

    #[test]
    fn test_valid_events() {
        let events = sm().valid_events(ResourcePhase::Reconciling);
        assert_eq!(events.len(), 4);
        assert!(!events.contains(&ResourceEvent::ReconcileStarted));

        let events = sm().valid_events(ResourcePhase::Ready);
        assert_eq!(
            events,
            vec![ResourceEvent::ReconcileStarted, ResourceEvent::DeletionRequested]
        );
    }
}

mod settle_tests {
    use super::*;

    fn settle(from: ResourcePhase, outcome: ResourceEvent, ctx: &TransitionContext) -> ResourcePhase {
        ResourceStateMachine::new().settle(from, outcome, ctx)
    }

    #[test]
    fn test_full_walks() {
        let ctx = TransitionContext::new(Some(1), None);
        assert_eq!(
            settle(ResourcePhase::Error, ResourceEvent::Converged, &ctx),
            ResourcePhase::Ready
        );
        assert_eq!(
            settle(ResourcePhase::Ready, ResourceEvent::ReconcileFailed, &ctx),
            ResourcePhase::Error
        );
        assert_eq!(
            settle(ResourcePhase::Pending, ResourceEvent::DependencyUnresolved, &ctx),
            ResourcePhase::Pending
        );
        assert_eq!(
            settle(ResourcePhase::Reconciling, ResourceEvent::Converged, &ctx),
            ResourcePhase::Ready
        );
    }

    #[test]
    fn test_terminal_failure_stays_in_error() {
        let ctx = TransitionContext::new(Some(4), Some(4));
        assert_eq!(
            settle(ResourcePhase::Error, ResourceEvent::Converged, &ctx),
            ResourcePhase::Error
        );
    }

    #[test]
    fn test_deletion_skips_reconciling() {
        let ctx = TransitionContext::default();
        for phase in [
            ResourcePhase::Pending,
            ResourcePhase::Reconciling,
            ResourcePhase::Ready,
            ResourcePhase::Error,
        ] {
            assert_eq!(
                settle(phase, ResourceEvent::DeletionRequested, &ctx),
                ResourcePhase::Terminating
            );
        }
        assert_eq!(
            settle(ResourcePhase::Terminating, ResourceEvent::DeletionRequested, &ctx),
            ResourcePhase::Terminating
        );
    }

    #[test]
    fn test_settle_never_lands_in_reconciling() {
        let sm = ResourceStateMachine::new();
        let contexts = [
            TransitionContext::default(),
            TransitionContext::new(Some(2), Some(2)),
            TransitionContext::new(Some(3), Some(2)),
        ];
        for ctx in &contexts {
            for phase in ResourcePhase::ALL {
                for event in [
                    ResourceEvent::Converged,
                    ResourceEvent::DependencyUnresolved,
                    ResourceEvent::ReconcileFailed,
                    ResourceEvent::DeletionRequested,
                ] {
                    let settled = sm.settle(phase, event, ctx);
                    if phase != ResourcePhase::Reconciling {
                        assert_ne!(settled, ResourcePhase::Reconciling, "{} + {}", phase, event);
                    }
                }
            }
        }
    }
}

mod outcome_tests {
    use super::*;
    use postgres_access_operator::postgres::ExecError;
    use std::time::Duration;

    #[test]
    fn test_failure_kinds() {
        let timeout = Error::SqlApplyError(ExecError::Timeout {
            timeout: Duration::from_secs(30),
            applied: 2,
        });
        assert_eq!(outcome_event(Some(&timeout)), ResourceEvent::ReconcileFailed);

        let conflict = Error::OwnershipConflict {
            object: "role:app".into(),
            owner: "PostgresRole apps/first".into(),
        };
        assert_eq!(outcome_event(Some(&conflict)), ResourceEvent::ReconcileFailed);

        let missing = Error::UnresolvedDependency {
            missing_ref: "schema orders.public".into(),
        };
        assert_eq!(outcome_event(Some(&missing)), ResourceEvent::DependencyUnresolved);
    }

    #[test]
    fn test_event_display() {
        assert_eq!(ResourceEvent::DependencyUnresolved.to_string(), "DependencyUnresolved");
        assert_eq!(ResourceEvent::DeletionRequested.to_string(), "DeletionRequested");
    }
}
