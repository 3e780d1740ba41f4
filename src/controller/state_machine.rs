//! Formal finite state machine for the MySQL database lifecycle
//!
//! Only transitions listed in the table can happen. Guards check the observed
//! workload and initialization state before a transition is taken, so a
//! reconcile pass can never skip a step (e.g. go Running while a restore is
//! still in progress).

use std::fmt;

use crate::crd::DatabasePhase;

/// Events that trigger state transitions in the database lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatabaseEvent {
    /// Child objects were created or already match; nothing else observed yet
    ResourcesApplied,
    /// The workload is ready and no initialization is outstanding
    WorkloadReady,
    /// The workload is ready and an init source has to be applied
    InitStarted,
    /// The init source was applied
    InitCompleted,
    /// The init source failed permanently
    InitFailed,
    /// A DormantDatabase with the same name exists
    ResumeRequested,
    /// Deleted under the Pause termination policy
    PauseRequested,
    /// The DormantDatabase is recorded; the object is about to disappear
    PauseCompleted,
    /// Deleted under the Delete or WipeOut termination policy
    TerminationRequested,
    /// The object's spec is invalid
    ValidationFailed,
    /// Consecutive failures reached the retry ceiling
    RetriesExhausted,
    /// The workload did not become ready in time
    ReadinessTimeout,
    /// The generation moved on since the object failed
    SpecChanged,
}

impl fmt::Display for DatabaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseEvent::ResourcesApplied => write!(f, "ResourcesApplied"),
            DatabaseEvent::WorkloadReady => write!(f, "WorkloadReady"),
            DatabaseEvent::InitStarted => write!(f, "InitStarted"),
            DatabaseEvent::InitCompleted => write!(f, "InitCompleted"),
            DatabaseEvent::InitFailed => write!(f, "InitFailed"),
            DatabaseEvent::ResumeRequested => write!(f, "ResumeRequested"),
            DatabaseEvent::PauseRequested => write!(f, "PauseRequested"),
            DatabaseEvent::PauseCompleted => write!(f, "PauseCompleted"),
            DatabaseEvent::TerminationRequested => write!(f, "TerminationRequested"),
            DatabaseEvent::ValidationFailed => write!(f, "ValidationFailed"),
            DatabaseEvent::RetriesExhausted => write!(f, "RetriesExhausted"),
            DatabaseEvent::ReadinessTimeout => write!(f, "ReadinessTimeout"),
            DatabaseEvent::SpecChanged => write!(f, "SpecChanged"),
        }
    }
}

/// Observations available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub ready_replicas: i32,
    pub desired_replicas: i32,
    /// An init source exists and has not completed
    pub init_pending: bool,
    /// The init source reported a permanent failure
    pub init_failed: bool,
    /// Generation differs from the observed generation
    pub spec_changed: bool,
}

impl TransitionContext {
    pub fn new(ready_replicas: i32, desired_replicas: i32) -> Self {
        Self {
            ready_replicas,
            desired_replicas,
            ..Default::default()
        }
    }

    pub fn with_init_pending(mut self, pending: bool) -> Self {
        self.init_pending = pending;
        self
    }

    pub fn with_init_failed(mut self, failed: bool) -> Self {
        self.init_failed = failed;
        self
    }

    pub fn with_spec_changed(mut self, changed: bool) -> Self {
        self.spec_changed = changed;
        self
    }

    pub fn all_replicas_ready(&self) -> bool {
        self.desired_replicas > 0 && self.ready_replicas >= self.desired_replicas
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: DatabasePhase,
    pub to: DatabasePhase,
    pub event: DatabaseEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
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
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: DatabasePhase,
        event: DatabaseEvent,
    },
    GuardFailed {
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase to record: the target on success, otherwise the current phase
    pub fn resulting_phase(&self) -> DatabasePhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            TransitionResult::InvalidTransition { current, .. } => *current,
            TransitionResult::GuardFailed { from, .. } => *from,
        }
    }
}

/// Formal state machine for the database lifecycle
pub struct DatabaseStateMachine {
    transitions: Vec<Transition>,
}

impl Default for DatabaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        use DatabaseEvent as E;
        use DatabasePhase as P;

        let mut transitions = vec![
            // === Provisioning ===
            Transition::new(
                P::Provisioning,
                P::Running,
                E::WorkloadReady,
                "Workload ready, database is running",
            ),
            Transition::new(
                P::Provisioning,
                P::Initializing,
                E::InitStarted,
                "Workload ready, applying init source",
            ),
            Transition::new(
                P::Provisioning,
                P::Resuming,
                E::ResumeRequested,
                "Dormant database found, resuming",
            ),
            Transition::new(
                P::Provisioning,
                P::Failed,
                E::ReadinessTimeout,
                "Workload never became ready",
            ),
            // === Initializing ===
            Transition::new(
                P::Initializing,
                P::Running,
                E::InitCompleted,
                "Init source applied, database is running",
            ),
            Transition::new(
                P::Initializing,
                P::Failed,
                E::InitFailed,
                "Init source failed",
            ),
            // === Resuming ===
            Transition::new(
                P::Resuming,
                P::Running,
                E::WorkloadReady,
                "Resumed workload ready",
            ),
            Transition::new(
                P::Resuming,
                P::Initializing,
                E::InitStarted,
                "Resumed workload ready, applying init source",
            ),
            Transition::new(
                P::Resuming,
                P::Failed,
                E::ReadinessTimeout,
                "Resumed workload never became ready",
            ),
            // === Running ===
            Transition::new(
                P::Running,
                P::Running,
                E::WorkloadReady,
                "Database remains running",
            ),
            // === Pausing ===
            Transition::new(
                P::Pausing,
                P::Paused,
                E::PauseCompleted,
                "Dormant database recorded",
            ),
            // === Failed ===
            Transition::new(
                P::Failed,
                P::Provisioning,
                E::SpecChanged,
                "Spec changed, retrying from provisioning",
            ),
        ];

        // Events accepted from every live phase
        let live = [
            P::Provisioning,
            P::Initializing,
            P::Running,
            P::Resuming,
            P::Failed,
        ];
        for from in live {
            transitions.push(Transition::new(
                from,
                P::Pausing,
                E::PauseRequested,
                "Deletion under Pause policy, archiving",
            ));
            transitions.push(Transition::new(
                from,
                P::Terminating,
                E::TerminationRequested,
                "Deletion under Delete/WipeOut policy",
            ));
            if from != P::Failed {
                transitions.push(Transition::new(
                    from,
                    P::Failed,
                    E::ValidationFailed,
                    "Spec failed validation",
                ));
                transitions.push(Transition::new(
                    from,
                    P::Failed,
                    E::RetriesExhausted,
                    "Retry ceiling reached",
                ));
            }
        }

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &DatabasePhase,
        event: DatabaseEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &DatabasePhase, event: &DatabaseEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &DatabasePhase) -> Vec<&DatabaseEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            DatabaseEvent::WorkloadReady | DatabaseEvent::InitStarted
                if !ctx.all_replicas_ready() =>
            {
                Some(format!(
                    "{}/{} replicas ready",
                    ctx.ready_replicas, ctx.desired_replicas
                ))
            }
            DatabaseEvent::WorkloadReady if ctx.init_pending => {
                Some("initialization still pending".to_string())
            }
            DatabaseEvent::InitStarted if !ctx.init_pending => {
                Some("no initialization pending".to_string())
            }
            DatabaseEvent::InitCompleted if ctx.init_pending => {
                Some("initialization still pending".to_string())
            }
            _ => None,
        }
    }
}

/// Determine the event describing what a reconcile pass observed
pub fn determine_event(current: &DatabasePhase, ctx: &TransitionContext) -> DatabaseEvent {
    if *current == DatabasePhase::Failed {
        return if ctx.spec_changed {
            DatabaseEvent::SpecChanged
        } else {
            DatabaseEvent::ResourcesApplied
        };
    }

    if !ctx.all_replicas_ready() {
        return DatabaseEvent::ResourcesApplied;
    }

    if ctx.init_failed {
        return DatabaseEvent::InitFailed;
    }

    match current {
        DatabasePhase::Initializing if ctx.init_pending => DatabaseEvent::ResourcesApplied,
        DatabasePhase::Initializing => DatabaseEvent::InitCompleted,
        _ if ctx.init_pending => DatabaseEvent::InitStarted,
        _ => DatabaseEvent::WorkloadReady,
    }
}
