//! Unit tests for status management

use chrono::{DateTime, TimeZone, Utc};
use postgres_access_operator::controller::status::{condition_status, condition_types};
use postgres_access_operator::controller::{
    BackoffConfig, ConditionBuilder, Error, StatusUpdate, next_status, spec_changed,
};
use postgres_access_operator::crd::{CredentialStatus, ResourcePhase, ResourceStatus};
use std::time::Duration;

use crate::common::*;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
}

fn condition<'a>(status: &'a ResourceStatus, type_: &str) -> Option<&'a str> {
    status
        .conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status.as_str())
}

fn converged(prev: Option<&ResourceStatus>, generation: i64, applied: usize, now: DateTime<Utc>) -> ResourceStatus {
    next_status(
        prev,
        ResourcePhase::Ready,
        Some(generation),
        StatusUpdate::Converged {
            owned_objects: vec!["role:app".into()],
            applied,
            credential: None,
        },
        now,
    )
}

fn failed(prev: Option<&ResourceStatus>, phase: ResourcePhase, error: &Error, now: DateTime<Utc>) -> ResourceStatus {
    next_status(
        prev,
        phase,
        Some(1),
        StatusUpdate::Failed {
            error,
            owned_objects: None,
            credential: None,
        },
        now,
    )
}

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_new_builder_is_empty() {
        assert!(ConditionBuilder::new(Some(1), at(0)).build().is_empty());
    }

    #[test]
    fn test_ready_synced_error() {
        let conditions = ConditionBuilder::new(Some(3), at(0))
            .ready(false, "SqlApplyError", "boom")
            .synced("Synced", "ok")
            .error("SqlApplyError", "boom")
            .build();
        assert_eq!(conditions.len(), 3);
        assert_eq!(conditions[0].type_, condition_types::READY);
        assert_eq!(conditions[0].status, condition_status::FALSE);
        assert_eq!(conditions[1].status, condition_status::TRUE);
        assert_eq!(conditions[2].type_, condition_types::ERROR);
        assert!(conditions.iter().all(|c| c.observed_generation == Some(3)));
    }

    #[test]
    fn test_update_in_place() {
        let first = ConditionBuilder::new(Some(1), at(0))
            .ready(false, "Pending", "waiting")
            .build();
        let second = ConditionBuilder::from_existing(first, Some(1), at(5))
            .ready(true, "Reconciled", "done")
            .build();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].reason, "Reconciled");
        assert_eq!(second[0].last_transition_time, at(5).to_rfc3339());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let conditions = ConditionBuilder::new(Some(1), at(0))
            .ready(true, "Reconciled", "")
            .remove(condition_types::ERROR)
            .build();
        assert_eq!(conditions.len(), 1);
    }
}

mod next_status_tests {
    use super::*;

    #[test]
    fn test_first_convergence() {
        let status = converged(None, 1, 3, at(0));
        assert_eq!(status.phase, ResourcePhase::Ready);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.owned_objects, vec!["role:app".to_string()]);
        assert_eq!(status.last_synced, Some(at(0).to_rfc3339()));
        assert_eq!(condition(&status, "Ready"), Some("True"));
        assert_eq!(condition(&status, "Synced"), Some("True"));
        assert_eq!(condition(&status, "Error"), None);
    }

    #[test]
    fn test_applied_changes_move_last_synced() {
        let first = converged(None, 1, 0, at(0));
        let second = converged(Some(&first), 1, 2, at(10));
        assert_eq!(second.last_synced, Some(at(10).to_rfc3339()));
    }

    #[test]
    fn test_quiet_resync_moves_last_synced() {
        let first = converged(None, 1, 0, at(0));
        let resync = converged(Some(&first), 1, 0, at(300));
        assert_eq!(resync.last_synced, Some(at(300).to_rfc3339()));
        // Our own status write echoes back right away and is absorbed
        let echo = converged(Some(&resync), 1, 0, at(301));
        assert_eq!(echo, resync);
    }

    #[test]
    fn test_new_generation_moves_last_synced() {
        let first = converged(None, 1, 0, at(0));
        let second = converged(Some(&first), 2, 0, at(10));
        assert_eq!(second.last_synced, Some(at(10).to_rfc3339()));
        assert_eq!(second.observed_generation, Some(2));
    }

    #[test]
    fn test_retry_count_accumulates() {
        let error = Error::UnresolvedDependency {
            missing_ref: "role readers".into(),
        };
        let first = failed(None, ResourcePhase::Pending, &error, at(0));
        let second = failed(Some(&first), ResourcePhase::Pending, &error, at(1));
        let third = failed(Some(&second), ResourcePhase::Pending, &error, at(2));
        assert_eq!(third.retry_count, 3);
        assert_eq!(third.phase, ResourcePhase::Pending);
        assert_eq!(third.failed_generation, None);
        assert_eq!(
            third.last_error.as_deref(),
            Some("Unresolved dependency: role readers")
        );
        assert_eq!(condition(&third, "Ready"), Some("False"));
    }

    #[test]
    fn test_failure_keeps_previous_state() {
        let ok = next_status(
            None,
            ResourcePhase::Ready,
            Some(1),
            StatusUpdate::Converged {
                owned_objects: vec!["role:app".into()],
                applied: 1,
                credential: Some(CredentialStatus {
                    secret_name: "app-credentials".into(),
                    last_rotated: Some(at(0).to_rfc3339()),
                }),
            },
            at(0),
        );
        let error = Error::InvalidSpec("setting name is invalid".into());
        let status = failed(Some(&ok), ResourcePhase::Error, &error, at(5));
        assert_eq!(status.owned_objects, ok.owned_objects);
        assert_eq!(status.last_synced, ok.last_synced);
        assert_eq!(status.credential, ok.credential);
        assert_eq!(status.failed_generation, Some(1));
        assert_eq!(condition(&status, "Synced"), Some("True"));
        assert_eq!(condition(&status, "Error"), Some("True"));
    }

    #[test]
    fn test_partial_apply_updates_ownership() {
        let error = Error::UnresolvedDependency {
            missing_ref: "role readers".into(),
        };
        let status = next_status(
            None,
            ResourcePhase::Error,
            Some(1),
            StatusUpdate::Failed {
                error: &error,
                owned_objects: Some(vec!["role:app".into()]),
                credential: None,
            },
            at(0),
        );
        assert_eq!(status.owned_objects, vec!["role:app".to_string()]);
    }

    #[test]
    fn test_terminating_without_deferral() {
        let ok = converged(None, 1, 1, at(0));
        let status = next_status(
            Some(&ok),
            ResourcePhase::Terminating,
            Some(1),
            StatusUpdate::Terminating { deferred: None },
            at(5),
        );
        assert_eq!(status.phase, ResourcePhase::Terminating);
        assert_eq!(status.owned_objects, ok.owned_objects);
        assert_eq!(status.retry_count, 0);
        assert_eq!(condition(&status, "Ready"), Some("False"));
    }
}

mod spec_changed_tests {
    use super::*;

    #[test]
    fn test_no_status_means_changed() {
        let world = World::new().role(RoleBuilder::new("app", "apps").build());
        assert!(spec_changed(&world.managed("PostgresRole", "app")));
    }

    #[test]
    fn test_observed_generation_matches() {
        let status = converged(None, 4, 0, at(0));
        let world = World::new().role(RoleBuilder::new("app", "apps").generation(4).status(status).build());
        assert!(!spec_changed(&world.managed("PostgresRole", "app")));
    }

    #[test]
    fn test_generation_bumped() {
        let status = converged(None, 4, 0, at(0));
        let world = World::new().role(RoleBuilder::new("app", "apps").generation(5).status(status).build());
        assert!(spec_changed(&world.managed("PostgresRole", "app")));
    }
}

mod error_reporting_tests {
    use super::*;

    #[test]
    fn test_reasons() {
        let cases: Vec<(Error, &str, bool)> = vec![
            (Error::InvalidSpec("x".into()), "InvalidSpec", false),
            (Error::MissingObjectKey(".metadata.name"), "MissingObjectKey", false),
            (
                Error::UnresolvedDependency {
                    missing_ref: "database orders".into(),
                },
                "UnresolvedDependency",
                true,
            ),
            (
                Error::CredentialApplyError {
                    rotated_at: None,
                    message: "x".into(),
                },
                "CredentialApplyError",
                true,
            ),
            (
                Error::DeletionDeferred {
                    reason: "DatabaseStillReferenced",
                    message: "x".into(),
                },
                "DatabaseStillReferenced",
                true,
            ),
        ];
        for (error, reason, retryable) in cases {
            assert_eq!(error.reason(), reason);
            assert_eq!(error.is_retryable(), retryable, "{}", reason);
        }
    }

    #[test]
    fn test_pending_backoff_starts_slower() {
        let pending = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::pending()
        };
        let default = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(pending.delay_for_attempt(0), Duration::from_secs(10));
        assert!(pending.delay_for_attempt(0) > default.delay_for_attempt(0));
        assert_eq!(pending.delay_for_attempt(20), Duration::from_secs(300));
    }
}
