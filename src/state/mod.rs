// Pipeline state machine
//
// Each OperationPipeline owns one StateMachine. Transitions are validated and
// broadcast so observers (UI, tests) can follow the lifecycle without polling.

use std::fmt;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

/// Lifecycle of a pipeline instance.
///
/// `Idle -> Running -> {Completed, Failed} -> Idle`. `Idle` is only re-entered
/// from one of the two terminal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl PipelineState {
    fn can_transition_to(self, next: PipelineState) -> bool {
        matches!(
            (self, next),
            (PipelineState::Idle, PipelineState::Running)
                | (PipelineState::Running, PipelineState::Completed)
                | (PipelineState::Running, PipelineState::Failed)
                | (PipelineState::Completed, PipelineState::Idle)
                | (PipelineState::Failed, PipelineState::Idle)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Emitted on every accepted transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub from: PipelineState,
    pub to: PipelineState,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid pipeline transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// Thread-safe pipeline state with change broadcast
pub struct StateMachine {
    state: RwLock<PipelineState>,
    state_tx: broadcast::Sender<StateChange>,
}

impl StateMachine {
    /// Create an idle state machine with a broadcast buffer of 100 changes
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: RwLock::new(PipelineState::Idle),
            state_tx,
        }
    }

    pub fn current(&self) -> PipelineState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    /// Apply a transition if it is legal from the current state.
    pub fn transition(&self, to: PipelineState) -> Result<StateChange, InvalidTransition> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        *state = to;
        let change = StateChange { from, to };
        // Ignore send errors - it's OK if no one is listening
        let _ = self.state_tx.send(change);
        tracing::trace!("Pipeline state {} -> {}", from, to);
        Ok(change)
    }

    /// Atomically claim the pipeline: `Idle -> Running`. False if not idle.
    pub fn try_begin(&self) -> bool {
        self.transition(PipelineState::Running).is_ok()
    }

    /// Close out a running operation through its terminal state back to idle.
    pub fn finish(&self, succeeded: bool) -> Result<(), InvalidTransition> {
        let terminal = if succeeded {
            PipelineState::Completed
        } else {
            PipelineState::Failed
        };
        self.transition(terminal)?;
        self.transition(PipelineState::Idle)?;
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
