//! Finite state machine for one step's lifecycle within a plan run

use serde::{Deserialize, Serialize};

/// Step lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// Not started yet
    Pending,

    /// An attempt is in flight
    Running,

    /// Waiting out the backoff before the next attempt
    Retrying,

    Succeeded,
    Failed,
    Skipped,
}

/// Step lifecycle event
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// Begin an attempt
    Start,

    /// The attempt succeeded
    Succeed,

    /// The attempt failed
    Fail(String),

    /// Schedule another attempt after a failure
    Retry,

    /// Stop retrying and settle on the last failure
    GiveUp,

    /// Do not run the step at all
    Skip,
}

#[derive(Debug, Clone)]
pub struct StepFsm {
    state: StepState,
    error: Option<String>,
    attempts: u32,
}

impl StepFsm {
    pub fn new() -> Self {
        Self {
            state: StepState::Pending,
            error: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Error of the most recent failed attempt
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of attempts started
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempts beyond the first
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            StepState::Succeeded | StepState::Failed | StepState::Skipped
        )
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StepEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (StepState::Pending, StepEvent::Start) | (StepState::Retrying, StepEvent::Start) => {
                self.attempts += 1;
                StepState::Running
            }
            (StepState::Pending, StepEvent::Skip) => StepState::Skipped,

            (StepState::Running, StepEvent::Succeed) => {
                self.error = None;
                StepState::Succeeded
            }
            (StepState::Running, StepEvent::Fail(err)) => {
                self.error = Some(err.clone());
                StepState::Failed
            }

            (StepState::Failed, StepEvent::Retry) => StepState::Retrying,
            (StepState::Retrying, StepEvent::GiveUp) => StepState::Failed,

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }

    /// Whether another attempt is allowed under `max_retries`
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.state == StepState::Failed && self.retries() < max_retries
    }
}

impl Default for StepFsm {
    fn default() -> Self {
        Self::new()
    }
}
