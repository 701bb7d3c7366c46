use std::fmt;

use serde::Serialize;

use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    NotStarted,
    Starting,
    Ready,
    Restarting,
    /// Restart budget exhausted or the spawn itself failed. Only an explicit
    /// `start()` leaves this state.
    Failed,
    /// Terminal.
    Stopped,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Readiness state machine. Transitions that do not apply from the current
/// state are ignored and reported as `false`; nothing leaves `Stopped`.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    state: GateState,
    failed_attempts: u32,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            state: GateState::NotStarted,
            failed_attempts: 0,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == GateState::Ready
    }

    /// Admission check for a new request.
    pub fn check(&self) -> WorkerResult<()> {
        match self.state {
            GateState::Ready => Ok(()),
            GateState::Stopped => Err(WorkerError::Stopped),
            GateState::Failed => Err(WorkerError::RetryBudgetExhausted {
                attempts: self.failed_attempts,
            }),
            other => Err(WorkerError::not_ready(other)),
        }
    }

    /// A spawn was issued: first start, explicit restart from `Failed`, or a
    /// scheduled restart after backoff.
    pub fn spawning(&mut self) -> bool {
        self.go(
            matches!(
                self.state,
                GateState::NotStarted | GateState::Restarting | GateState::Failed
            ),
            GateState::Starting,
        )
    }

    /// The worker sent `ready`.
    pub fn ready(&mut self) -> bool {
        self.go(self.state == GateState::Starting, GateState::Ready)
    }

    /// Unexpected exit with retries left.
    pub fn restarting(&mut self) -> bool {
        self.go(
            matches!(self.state, GateState::Starting | GateState::Ready),
            GateState::Restarting,
        )
    }

    /// Unexpected exit with no retries left, or a failed spawn.
    pub fn failed(&mut self, attempts: u32) -> bool {
        let moved = self.go(
            matches!(
                self.state,
                GateState::Starting | GateState::Ready | GateState::Restarting
            ),
            GateState::Failed,
        );
        if moved {
            self.failed_attempts = attempts;
        }
        moved
    }

    pub fn stop(&mut self) -> bool {
        self.go(self.state != GateState::Stopped, GateState::Stopped)
    }

    fn go(&mut self, allowed: bool, to: GateState) -> bool {
        if allowed {
            self.state = to;
        }
        allowed
    }
}
