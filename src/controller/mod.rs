pub mod context;
pub mod cycle;
pub mod error;
pub mod reconciler;
pub mod state_machine;
pub mod status;

pub use context::{Context, RetryGate};
pub use cycle::{
    CycleFailure, CycleReport, CycleServices, PlannedCycle, plan_cycle, run_cycle, run_resolved,
    run_teardown,
};
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{
    FINALIZER, READY_REQUEUE, error_policy, reconcile_database, reconcile_grant, reconcile_role,
};
pub use state_machine::{ResourceEvent, ResourceStateMachine, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, StatusUpdate, next_status, spec_changed};
