//! State machine of the step loop.

use thiserror::Error;
use tracing::debug;

use crate::options::RunState;

/// States the step loop of one agent can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    /// No run has started yet.
    #[default]
    Idle,
    /// Producing or updating a plan.
    Planning,
    /// Calling the model and dispatching its action.
    Acting,
    /// Inspecting the result of the last action.
    Deciding,
    /// The run is over.
    Terminated(RunState),
}

impl LoopState {
    /// Returns `true` while a run is in progress.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Planning | Self::Acting | Self::Deciding)
    }

    /// Returns `true` once the run has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// Events driving the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// A run starts after its task has been recorded.
    Begin,
    /// A planning step is due.
    Plan,
    /// The next action step starts.
    Act,
    /// An action has been recorded.
    Decide,
    /// The run ends in the given state.
    Terminate(RunState),
}

/// Step loop controller of one agent.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    agent: String,
    state: LoopState,
}

impl Lifecycle {
    /// Creates an idle controller for `agent`.
    #[must_use]
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            state: LoopState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LoopState {
        self.state
    }

    /// Applies an event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: LoopEvent) -> LifecycleResult<LoopState> {
        let next = match (self.state, event) {
            (LoopState::Idle | LoopState::Terminated(_), LoopEvent::Begin)
            | (LoopState::Planning | LoopState::Deciding, LoopEvent::Act) => {
                Some(LoopState::Acting)
            }
            (LoopState::Acting | LoopState::Deciding, LoopEvent::Plan) => {
                Some(LoopState::Planning)
            }
            (LoopState::Acting, LoopEvent::Decide) => Some(LoopState::Deciding),
            (
                LoopState::Planning | LoopState::Acting | LoopState::Deciding,
                LoopEvent::Terminate(outcome),
            ) => Some(LoopState::Terminated(outcome)),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                agent: self.agent.clone(),
                from: self.state,
                event,
            });
        };

        if next_state != self.state {
            debug!(
                agent = %self.agent,
                ?self.state,
                ?next_state,
                ?event,
                "step loop transition"
            );
            self.state = next_state;
        }

        Ok(self.state)
    }
}

/// Errors emitted by the loop controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid step loop transition from {from:?} via {event:?} for agent {agent}")]
    InvalidTransition {
        /// Agent whose transition failed.
        agent: String,
        /// State prior to the attempted transition.
        from: LoopState,
        /// Event that triggered the failure.
        event: LoopEvent,
    },
}

/// Result alias used for loop transitions.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_a_run_with_planning() {
        let mut lifecycle = Lifecycle::new("agent");
        assert_eq!(lifecycle.transition(LoopEvent::Begin).unwrap(), LoopState::Acting);
        assert_eq!(lifecycle.transition(LoopEvent::Plan).unwrap(), LoopState::Planning);
        assert_eq!(lifecycle.transition(LoopEvent::Act).unwrap(), LoopState::Acting);
        assert_eq!(lifecycle.transition(LoopEvent::Decide).unwrap(), LoopState::Deciding);
        assert_eq!(lifecycle.transition(LoopEvent::Act).unwrap(), LoopState::Acting);
        assert_eq!(lifecycle.transition(LoopEvent::Decide).unwrap(), LoopState::Deciding);
        let end = lifecycle
            .transition(LoopEvent::Terminate(RunState::Succeeded))
            .unwrap();
        assert!(end.is_terminal());
        assert!(!end.is_running());
    }

    #[test]
    fn terminated_runs_can_begin_again() {
        let mut lifecycle = Lifecycle::new("agent");
        lifecycle.transition(LoopEvent::Begin).unwrap();
        lifecycle
            .transition(LoopEvent::Terminate(RunState::Exhausted))
            .unwrap();
        assert_eq!(lifecycle.transition(LoopEvent::Begin).unwrap(), LoopState::Acting);
    }

    #[test]
    fn rejects_invalid_transitions() {
        let mut lifecycle = Lifecycle::new("agent");
        let err = lifecycle.transition(LoopEvent::Decide).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: LoopState::Idle,
                event: LoopEvent::Decide,
                ..
            }
        ));

        lifecycle.transition(LoopEvent::Begin).unwrap();
        assert!(lifecycle.transition(LoopEvent::Begin).is_err());
        assert!(lifecycle.transition(LoopEvent::Act).is_err());
        assert_eq!(lifecycle.state(), LoopState::Acting);
    }
}
