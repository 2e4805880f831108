//! Stable exit codes for cobbler CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed (invalid state, configuration, git or agent errors).
pub const INVALID: i32 = 1;
/// `cobbler analyze` reported findings, or there was nothing to do.
pub const FINDINGS: i32 = 2;
/// `cobbler trail resume` found a checkpoint that no longer matches HEAD.
pub const STALE: i32 = 3;
/// Another cobbler process holds the orchestrator lock, or a task is in flight.
pub const BUSY: i32 = 4;
