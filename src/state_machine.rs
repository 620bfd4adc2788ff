//! Pipeline and phase state machines.
//!
//! Two automata share one validator: the pipeline automaton tracks a whole
//! run, the phase automaton tracks one phase inside it. The machine only
//! holds the static adjacency tables, so a single instance is shared by all
//! concurrent runs.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Idle,
    Initializing,
    Decomposing,
    Enriching,
    GeneratingPrompts,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl PipelineState {
    /// Every pipeline state, in declaration order.
    pub const ALL: [PipelineState; 9] = [
        PipelineState::Idle,
        PipelineState::Initializing,
        PipelineState::Decomposing,
        PipelineState::Enriching,
        PipelineState::GeneratingPrompts,
        PipelineState::Paused,
        PipelineState::Completed,
        PipelineState::Failed,
        PipelineState::RolledBack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "IDLE",
            PipelineState::Initializing => "INITIALIZING",
            PipelineState::Decomposing => "DECOMPOSING",
            PipelineState::Enriching => "ENRICHING",
            PipelineState::GeneratingPrompts => "GENERATING_PROMPTS",
            PipelineState::Paused => "PAUSED",
            PipelineState::Completed => "COMPLETED",
            PipelineState::Failed => "FAILED",
            PipelineState::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
}

impl PhaseState {
    /// Every phase state, in declaration order.
    pub const ALL: [PhaseState; 6] = [
        PhaseState::Pending,
        PhaseState::Running,
        PhaseState::Completed,
        PhaseState::Failed,
        PhaseState::Retrying,
        PhaseState::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Pending => "PENDING",
            PhaseState::Running => "RUNNING",
            PhaseState::Completed => "COMPLETED",
            PhaseState::Failed => "FAILED",
            PhaseState::Retrying => "RETRYING",
            PhaseState::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which automaton a transition request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateDomain {
    Pipeline,
    Phase,
}

impl fmt::Display for StateDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateDomain::Pipeline => write!(f, "pipeline"),
            StateDomain::Phase => write!(f, "phase"),
        }
    }
}

/// A state from either automaton, used by the domain-generic entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    Pipeline(PipelineState),
    Phase(PhaseState),
}

impl MachineState {
    pub fn domain(&self) -> StateDomain {
        match self {
            MachineState::Pipeline(_) => StateDomain::Pipeline,
            MachineState::Phase(_) => StateDomain::Phase,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Pipeline(s) => s.fmt(f),
            MachineState::Phase(s) => s.fmt(f),
        }
    }
}

impl From<PipelineState> for MachineState {
    fn from(state: PipelineState) -> Self {
        MachineState::Pipeline(state)
    }
}

impl From<PhaseState> for MachineState {
    fn from(state: PhaseState) -> Self {
        MachineState::Phase(state)
    }
}

/// Outcome of a transition check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCheck {
    pub valid: bool,
    pub reason: Option<String>,
}

impl TransitionCheck {
    fn allowed() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// A transition the state machine refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {domain} transition for '{id}' from {from} to {to}: {reason}")]
pub struct IllegalTransitionError {
    pub domain: StateDomain,
    pub id: String,
    pub from: String,
    pub to: String,
    pub reason: String,
}

/// Validates pipeline and phase transitions against static adjacency tables.
#[derive(Debug, Clone)]
pub struct StateMachine {
    pipeline_transitions: HashMap<PipelineState, Vec<PipelineState>>,
    phase_transitions: HashMap<PhaseState, Vec<PhaseState>>,
}

impl StateMachine {
    /// Create a state machine with the standard transition rules.
    pub fn new() -> Self {
        use PipelineState as P;

        let mut pipeline_transitions = HashMap::new();
        pipeline_transitions.insert(P::Idle, vec![P::Initializing, P::Failed]);
        pipeline_transitions.insert(P::Initializing, vec![P::Decomposing, P::Failed, P::Paused]);
        pipeline_transitions.insert(P::Decomposing, vec![P::Enriching, P::Failed, P::Paused]);
        pipeline_transitions.insert(
            P::Enriching,
            vec![P::GeneratingPrompts, P::Failed, P::Paused],
        );
        pipeline_transitions.insert(
            P::GeneratingPrompts,
            vec![P::Completed, P::Failed, P::Paused],
        );
        pipeline_transitions.insert(
            P::Paused,
            vec![
                P::Decomposing,
                P::Enriching,
                P::GeneratingPrompts,
                P::Failed,
                P::RolledBack,
            ],
        );
        pipeline_transitions.insert(P::Failed, vec![P::RolledBack, P::Idle]);
        pipeline_transitions.insert(P::Completed, vec![P::Idle]);
        pipeline_transitions.insert(P::RolledBack, vec![P::Idle]);

        let mut phase_transitions = HashMap::new();
        phase_transitions.insert(
            PhaseState::Pending,
            vec![PhaseState::Running, PhaseState::Skipped],
        );
        phase_transitions.insert(
            PhaseState::Running,
            vec![
                PhaseState::Completed,
                PhaseState::Failed,
                PhaseState::Retrying,
            ],
        );
        phase_transitions.insert(
            PhaseState::Retrying,
            vec![PhaseState::Running, PhaseState::Failed],
        );
        phase_transitions.insert(
            PhaseState::Failed,
            vec![PhaseState::Retrying, PhaseState::Pending],
        );
        phase_transitions.insert(PhaseState::Completed, vec![]);
        phase_transitions.insert(PhaseState::Skipped, vec![]);

        Self {
            pipeline_transitions,
            phase_transitions,
        }
    }

    /// Check whether `from -> to` is allowed in `domain`.
    ///
    /// A state that does not belong to `domain` is reported as unknown.
    pub fn can_transition(
        &self,
        domain: StateDomain,
        from: MachineState,
        to: MachineState,
    ) -> TransitionCheck {
        if from.domain() != domain {
            return TransitionCheck::rejected(format!("Unknown state: {}", from));
        }
        if to.domain() != domain {
            return TransitionCheck::rejected(format!("Unknown target state: {}", to));
        }

        let permitted = match (from, to) {
            (MachineState::Pipeline(f), MachineState::Pipeline(t)) => self
                .pipeline_transitions
                .get(&f)
                .map(|targets| targets.contains(&t)),
            (MachineState::Phase(f), MachineState::Phase(t)) => self
                .phase_transitions
                .get(&f)
                .map(|targets| targets.contains(&t)),
            _ => None,
        };

        match permitted {
            Some(true) => TransitionCheck::allowed(),
            Some(false) => TransitionCheck::rejected(format!(
                "Transition from {} to {} is not allowed",
                from, to
            )),
            None => TransitionCheck::rejected(format!("Unknown state: {}", from)),
        }
    }

    /// Validate `from -> to` and return the new state.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransitionError` when the transition is not in the
    /// adjacency table for `domain`.
    pub fn transition(
        &self,
        domain: StateDomain,
        from: MachineState,
        to: MachineState,
        id: &str,
    ) -> Result<MachineState, IllegalTransitionError> {
        let check = self.can_transition(domain, from, to);
        if check.valid {
            return Ok(to);
        }

        Err(IllegalTransitionError {
            domain,
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            reason: check.reason.unwrap_or_default(),
        })
    }

    /// Typed pipeline transition.
    pub fn transition_pipeline(
        &self,
        from: PipelineState,
        to: PipelineState,
        id: &str,
    ) -> Result<PipelineState, IllegalTransitionError> {
        self.transition(StateDomain::Pipeline, from.into(), to.into(), id)
            .map(|_| to)
    }

    /// Typed phase transition.
    pub fn transition_phase(
        &self,
        from: PhaseState,
        to: PhaseState,
        id: &str,
    ) -> Result<PhaseState, IllegalTransitionError> {
        self.transition(StateDomain::Phase, from.into(), to.into(), id)
            .map(|_| to)
    }

    /// Whether `state` ends the active lifecycle in `domain`.
    pub fn is_terminal(&self, domain: StateDomain, state: MachineState) -> bool {
        match (domain, state) {
            (StateDomain::Pipeline, MachineState::Pipeline(s)) => matches!(
                s,
                PipelineState::Completed | PipelineState::Failed | PipelineState::RolledBack
            ),
            (StateDomain::Phase, MachineState::Phase(s)) => {
                matches!(s, PhaseState::Completed | PhaseState::Skipped)
            }
            _ => false,
        }
    }

    pub fn allowed_pipeline_targets(&self, from: PipelineState) -> &[PipelineState] {
        self.pipeline_transitions
            .get(&from)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn allowed_phase_targets(&self, from: PhaseState) -> &[PhaseState] {
        self.phase_transitions
            .get(&from)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState as P;

    fn expected_pipeline_edges() -> Vec<(PipelineState, PipelineState)> {
        vec![
            (P::Idle, P::Initializing),
            (P::Idle, P::Failed),
            (P::Initializing, P::Decomposing),
            (P::Initializing, P::Failed),
            (P::Initializing, P::Paused),
            (P::Decomposing, P::Enriching),
            (P::Decomposing, P::Failed),
            (P::Decomposing, P::Paused),
            (P::Enriching, P::GeneratingPrompts),
            (P::Enriching, P::Failed),
            (P::Enriching, P::Paused),
            (P::GeneratingPrompts, P::Completed),
            (P::GeneratingPrompts, P::Failed),
            (P::GeneratingPrompts, P::Paused),
            (P::Paused, P::Decomposing),
            (P::Paused, P::Enriching),
            (P::Paused, P::GeneratingPrompts),
            (P::Paused, P::Failed),
            (P::Paused, P::RolledBack),
            (P::Failed, P::RolledBack),
            (P::Failed, P::Idle),
            (P::Completed, P::Idle),
            (P::RolledBack, P::Idle),
        ]
    }

    #[test]
    fn test_every_pipeline_pair_matches_table() {
        let machine = StateMachine::new();
        let edges = expected_pipeline_edges();

        for from in PipelineState::ALL {
            for to in PipelineState::ALL {
                let result = machine.transition_pipeline(from, to, "pipe-1");
                if edges.contains(&(from, to)) {
                    assert_eq!(result, Ok(to), "{from} -> {to} should be allowed");
                } else {
                    let err = result.expect_err("transition should be rejected");
                    assert_eq!(err.domain, StateDomain::Pipeline);
                    assert_eq!(err.id, "pipe-1");
                    assert_eq!(err.from, from.to_string());
                    assert_eq!(err.to, to.to_string());
                }
            }
        }
    }

    #[test]
    fn test_pipeline_terminal_states() {
        let machine = StateMachine::new();
        for state in PipelineState::ALL {
            let expected = matches!(state, P::Completed | P::Failed | P::RolledBack);
            assert_eq!(
                machine.is_terminal(StateDomain::Pipeline, state.into()),
                expected,
                "{state}"
            );
        }
    }

    #[test]
    fn test_phase_terminal_states() {
        let machine = StateMachine::new();
        for state in PhaseState::ALL {
            let expected = matches!(state, PhaseState::Completed | PhaseState::Skipped);
            assert_eq!(machine.is_terminal(StateDomain::Phase, state.into()), expected);
        }
    }

    #[test]
    fn test_phase_transitions() {
        let machine = StateMachine::new();
        assert!(machine
            .transition_phase(PhaseState::Pending, PhaseState::Running, "decomposition")
            .is_ok());
        assert!(machine
            .transition_phase(PhaseState::Running, PhaseState::Completed, "decomposition")
            .is_ok());
        assert!(machine
            .transition_phase(PhaseState::Running, PhaseState::Retrying, "decomposition")
            .is_ok());
        assert!(machine
            .transition_phase(PhaseState::Completed, PhaseState::Running, "decomposition")
            .is_err());
        assert!(machine
            .transition_phase(PhaseState::Pending, PhaseState::Completed, "decomposition")
            .is_err());
    }

    #[test]
    fn test_cross_domain_state_is_unknown() {
        let machine = StateMachine::new();
        let check = machine.can_transition(
            StateDomain::Pipeline,
            PhaseState::Running.into(),
            P::Decomposing.into(),
        );
        assert!(!check.valid);
        assert!(check.reason.unwrap_or_default().contains("Unknown state"));

        let err = machine
            .transition(
                StateDomain::Phase,
                P::Idle.into(),
                PhaseState::Running.into(),
                "x",
            )
            .unwrap_err();
        assert!(err.reason.contains("Unknown state"));
    }

    #[test]
    fn test_rejection_reason_names_both_states() {
        let machine = StateMachine::new();
        let check = machine.can_transition(
            StateDomain::Pipeline,
            P::Completed.into(),
            P::Decomposing.into(),
        );
        assert!(!check.valid);
        let reason = check.reason.unwrap_or_default();
        assert!(reason.contains("COMPLETED"));
        assert!(reason.contains("DECOMPOSING"));
    }

    #[test]
    fn test_allowed_targets() {
        let machine = StateMachine::new();
        assert_eq!(
            machine.allowed_pipeline_targets(P::Idle),
            &[P::Initializing, P::Failed]
        );
        assert!(machine.allowed_phase_targets(PhaseState::Skipped).is_empty());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&P::GeneratingPrompts).unwrap();
        assert_eq!(json, "\"GENERATING_PROMPTS\"");
        let parsed: PipelineState = serde_json::from_str("\"ROLLED_BACK\"").unwrap();
        assert_eq!(parsed, P::RolledBack);
    }
}
