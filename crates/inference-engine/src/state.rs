//! Runner lifecycle state
//!
//! This module provides the state tag of a single worker pipeline and the
//! rules for moving between states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerState {
    /// Worker process is being started
    Spawning,

    /// Waiting for the health endpoint to answer
    WaitingHealthy,

    /// Artifact is being loaded into the worker
    Loading,

    /// Artifact loaded, no request in flight
    Ready,

    /// A completion stream is being relayed
    Streaming,

    /// Worker is being stopped
    Terminating,

    /// Worker is gone
    Terminated,

    /// Pipeline failed
    Failed(String),
}

impl RunnerState {
    /// Returns true if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerState::Terminated | RunnerState::Failed(_))
    }

    /// Returns true if the worker can serve a completion request
    pub fn is_ready(&self) -> bool {
        matches!(self, RunnerState::Ready)
    }

    /// Gets the failure reason if in the failed state
    pub fn failure(&self) -> Option<&str> {
        match self {
            RunnerState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns true if moving from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: &RunnerState) -> bool {
        use RunnerState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Failed(_)) => true,
            (_, Terminating) => true,
            (Spawning, WaitingHealthy) => true,
            (WaitingHealthy, Loading) => true,
            (Loading, Ready) => true,
            (Ready, Streaming) => true,
            (Streaming, Ready) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerState::Spawning => write!(f, "Spawning"),
            RunnerState::WaitingHealthy => write!(f, "WaitingHealthy"),
            RunnerState::Loading => write!(f, "Loading"),
            RunnerState::Ready => write!(f, "Ready"),
            RunnerState::Streaming => write!(f, "Streaming"),
            RunnerState::Terminating => write!(f, "Terminating"),
            RunnerState::Terminated => write!(f, "Terminated"),
            RunnerState::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

impl Default for RunnerState {
    fn default() -> Self {
        RunnerState::Spawning
    }
}
