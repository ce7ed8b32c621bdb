//! Execution state machine.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CommandError;

/// Where an invocation is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecutionState {
    Pending,
    PreHooks,
    RateCheck,
    Executing,
    Committing,
    PostHooks,
    Completed,
    Blocked,
    RateLimited,
    /// Circuit breaker open.
    Unavailable,
    HandlerFailed,
    TimedOut,
    ConflictFailed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Blocked
                | Self::RateLimited
                | Self::Unavailable
                | Self::HandlerFailed
                | Self::TimedOut
                | Self::ConflictFailed
        )
    }

    /// Whether `self → next` is an edge of the machine.
    pub fn can_transition(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, PreHooks)
                // Unknown command
                | (Pending, Blocked)
                | (PreHooks, Blocked)
                | (PreHooks, RateCheck)
                | (RateCheck, RateLimited)
                | (RateCheck, Unavailable)
                | (RateCheck, Executing)
                | (RateCheck, TimedOut)
                | (Executing, HandlerFailed)
                | (Executing, TimedOut)
                | (Executing, Committing)
                | (Committing, ConflictFailed)
                | (Committing, TimedOut)
                | (Committing, HandlerFailed)
                | (Committing, PostHooks)
                | (PostHooks, Completed)
        )
    }

    /// Terminal state an error ends in.
    pub fn for_error(err: &CommandError) -> Self {
        match err {
            CommandError::ValidationBlocked { .. } => Self::Blocked,
            CommandError::RateLimited { .. } => Self::RateLimited,
            CommandError::CommandUnavailable { .. } => Self::Unavailable,
            CommandError::HandlerError(_) => Self::HandlerFailed,
            CommandError::TimeoutError { .. } => Self::TimedOut,
            CommandError::ConflictError { .. } => Self::ConflictFailed,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks one invocation's progress and what it accumulated on the way.
#[derive(Debug)]
pub(crate) struct Execution {
    invocation_id: Uuid,
    state: ExecutionState,
    pub(crate) hooks_run: Vec<String>,
    pub(crate) warnings: Vec<String>,
}

impl Execution {
    pub(crate) fn new(invocation_id: Uuid) -> Self {
        Self {
            invocation_id,
            state: ExecutionState::Pending,
            hooks_run: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> ExecutionState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: ExecutionState) {
        if !self.state.can_transition(next) {
            warn!(
                invocation_id = %self.invocation_id,
                from = %self.state,
                to = %next,
                "Unexpected execution state transition"
            );
        }
        debug!(
            invocation_id = %self.invocation_id,
            from = %self.state,
            to = %next,
            "Execution state transition"
        );
        self.state = next;
    }

    pub(crate) fn fail(&mut self, err: &CommandError) {
        self.advance(ExecutionState::for_error(err));
    }
}
