use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How the last process lifetime ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitKind {
    /// Left Running through Stopping
    Stopped,
    /// Output closed while Running, without a stop request
    Crashed,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    pub state: State,
    pub last_exit: Option<ExitKind>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: State::Stopped,
            last_exit: None,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: &State) -> bool {
        matches!(
            (&self.state, to),
            (State::Stopped, State::Starting)
                | (State::Starting, State::Running)
                // spawn failure
                | (State::Starting, State::Stopped)
                | (State::Running, State::Stopping)
                // crash
                | (State::Running, State::Stopped)
                | (State::Stopping, State::Stopped)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::info!("State transition: {:?} -> {:?}", self.state, to);
            if to == State::Stopped {
                match self.state {
                    State::Running => self.last_exit = Some(ExitKind::Crashed),
                    State::Stopping => self.last_exit = Some(ExitKind::Stopped),
                    _ => {}
                }
            }
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
