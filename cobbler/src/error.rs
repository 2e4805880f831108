//! Typed error kinds surfaced by orchestrator operations.
//!
//! Operations return `anyhow::Result`; these values travel inside
//! `anyhow::Error` and callers that must branch on the kind use
//! `downcast_ref::<CobblerError>()`.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::TrailState;

#[derive(Debug, Error)]
pub enum CobblerError {
    #[error("trail '{name}' already exists: {detail}")]
    TrailExists { name: String, detail: String },

    #[error("trail '{name}' not found: {detail}")]
    TrailNotFound { name: String, detail: String },

    #[error("trail '{name}' is busy: {detail}")]
    TrailBusy { name: String, detail: String },

    #[error(
        "stale checkpoint for trail '{trail}': checkpoint commit {expected} but worktree HEAD is {found} (reset the trail or resume with --force)"
    )]
    StaleCheckpoint {
        trail: String,
        expected: String,
        found: String,
    },

    #[error("invalid dependency for task '{task}': {detail}")]
    InvalidDependency { task: String, detail: String },

    #[error("measure failed in cycle {cycle}: {reason}")]
    Measure { cycle: u32, reason: String },

    #[error("task '{task}' failed: {reason}")]
    TaskExecution { task: String, reason: String },

    #[error("git {command} failed: {stderr}")]
    GitOperation { command: String, stderr: String },

    #[error("agent timed out after {}s", timeout.as_secs())]
    AgentTimeout { timeout: Duration },

    #[error("cannot {operation} trail '{name}' while it is {state}")]
    InvalidTransition {
        name: String,
        operation: &'static str,
        state: TrailState,
    },

    #[error("no active trail (start one with `cobbler trail start <name>`)")]
    NoActiveTrail,
}

impl CobblerError {
    /// Find the typed error anywhere in an `anyhow` chain.
    pub fn find(err: &anyhow::Error) -> Option<&CobblerError> {
        err.chain().find_map(|cause| cause.downcast_ref::<CobblerError>())
    }

    /// True when the chain contains an agent timeout.
    pub fn is_timeout(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(CobblerError::AgentTimeout { .. }))
    }
}
