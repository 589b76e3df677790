//! Finite state machine for managed resource lifecycle
//!
//! Every reconciliation is a short walk through this table: the resource
//! enters `Reconciling` when work starts and leaves it with the outcome of
//! the cycle. Only the final phase of a walk is written to status.

use std::fmt;

use crate::controller::error::Error;
use crate::crd::ResourcePhase;

/// Events that trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceEvent {
    /// A reconciliation cycle started
    ReconcileStarted,
    /// PostgreSQL matches the declared state
    Converged,
    /// A referenced role, database or object does not exist yet
    DependencyUnresolved,
    /// The cycle failed
    ReconcileFailed,
    /// Deletion timestamp has been set on the resource
    DeletionRequested,
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceEvent::ReconcileStarted => write!(f, "ReconcileStarted"),
            ResourceEvent::Converged => write!(f, "Converged"),
            ResourceEvent::DependencyUnresolved => write!(f, "DependencyUnresolved"),
            ResourceEvent::ReconcileFailed => write!(f, "ReconcileFailed"),
            ResourceEvent::DeletionRequested => write!(f, "DeletionRequested"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Current `metadata.generation`
    pub generation: Option<i64>,
    /// Generation that last failed with a non-retryable error
    pub failed_generation: Option<i64>,
}

impl TransitionContext {
    pub fn new(generation: Option<i64>, failed_generation: Option<i64>) -> Self {
        Self {
            generation,
            failed_generation,
        }
    }

    /// Whether the current spec already failed terminally
    pub fn is_terminal_failure(&self) -> bool {
        self.failed_generation.is_some() && self.failed_generation == self.generation
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ResourcePhase,
    pub to: ResourcePhase,
    pub event: ResourceEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ResourcePhase,
        to: ResourcePhase,
        event: ResourceEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: ResourcePhase,
        to: ResourcePhase,
        event: ResourceEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ResourcePhase,
        event: ResourceEvent,
    },
    GuardFailed {
        from: ResourcePhase,
        to: ResourcePhase,
        event: ResourceEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase, if the transition happened
    pub fn target(&self) -> Option<ResourcePhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// State machine shared by PostgresRole, PostgresDatabase and PostgresGrant
pub struct ResourceStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ResourceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStateMachine {
    pub fn new() -> Self {
        use ResourceEvent as E;
        use ResourcePhase as P;

        Self {
            transitions: vec![
                // === Entering a cycle ===
                Transition::new(P::Pending, P::Reconciling, E::ReconcileStarted, "First reconciliation"),
                Transition::new(P::Ready, P::Reconciling, E::ReconcileStarted, "Resync or spec change"),
                Transition::new(P::Error, P::Reconciling, E::ReconcileStarted, "Retrying after error"),
                // === Leaving a cycle ===
                Transition::new(P::Reconciling, P::Ready, E::Converged, "PostgreSQL matches the spec"),
                Transition::new(P::Reconciling, P::Error, E::ReconcileFailed, "Reconciliation failed"),
                Transition::new(
                    P::Reconciling,
                    P::Pending,
                    E::DependencyUnresolved,
                    "Waiting for a referenced object",
                ),
                // === Deletion ===
                Transition::new(P::Pending, P::Terminating, E::DeletionRequested, "Deleted before apply"),
                Transition::new(P::Reconciling, P::Terminating, E::DeletionRequested, "Deleted mid-cycle"),
                Transition::new(P::Ready, P::Terminating, E::DeletionRequested, "Deletion requested"),
                Transition::new(P::Error, P::Terminating, E::DeletionRequested, "Deleted while failing"),
                // Terminating is terminal: the resource disappears once its finalizer is removed
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: ResourcePhase,
        event: ResourceEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let Some(t) = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        else {
            return TransitionResult::InvalidTransition { current, event };
        };

        match self.check_guard(t, ctx) {
            Some(reason) => TransitionResult::GuardFailed {
                from: t.from,
                to: t.to,
                event,
                reason,
            },
            None => TransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            },
        }
    }

    pub fn can_transition(&self, from: ResourcePhase, event: ResourceEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    pub fn valid_events(&self, state: ResourcePhase) -> Vec<ResourceEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    /// Phase after a full cycle that started in `current` and ended with `outcome`
    ///
    /// Falls back to `current` when the walk is not allowed, e.g. a retry of a
    /// spec that already failed terminally.
    pub fn settle(
        &self,
        current: ResourcePhase,
        outcome: ResourceEvent,
        ctx: &TransitionContext,
    ) -> ResourcePhase {
        if outcome == ResourceEvent::DeletionRequested {
            return self
                .transition(current, outcome, ctx)
                .target()
                .unwrap_or(current);
        }
        let started = match current {
            ResourcePhase::Reconciling => Some(current),
            _ => self
                .transition(current, ResourceEvent::ReconcileStarted, ctx)
                .target(),
        };
        started
            .and_then(|phase| self.transition(phase, outcome, ctx).target())
            .unwrap_or(current)
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (transition.from, transition.event) {
            // A terminally failed spec is retried only after it changes
            (ResourcePhase::Error, ResourceEvent::ReconcileStarted) if ctx.is_terminal_failure() => {
                Some(format!(
                    "Generation {:?} failed terminally; waiting for a spec change",
                    ctx.generation
                ))
            }
            _ => None,
        }
    }
}

/// Event produced by a cycle that ended with `error` (or succeeded)
pub fn outcome_event(error: Option<&Error>) -> ResourceEvent {
    match error {
        None => ResourceEvent::Converged,
        Some(e) if e.is_pending() => ResourceEvent::DependencyUnresolved,
        Some(_) => ResourceEvent::ReconcileFailed,
    }
}
