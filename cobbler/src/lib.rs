//! Generation-trail orchestrator.
//!
//! A trail is an isolated branch and worktree on which a coding agent runs
//! cycles: Measure proposes tasks, Stitch executes every task whose
//! dependencies are done and commits the result. Progress is checkpointed
//! after every task so an interrupted run can be resumed.
//!
//! - **[`core`]**: Pure logic (task graph, lifecycle rules, recovery
//!   decisions). No I/O.
//! - **[`io`]**: Side effects (git, filesystem state, agent processes,
//!   prompts, configuration).
//!
//! [`Orchestrator`] ties the two together; its operations live in
//! [`lifecycle`], [`cycle`], [`measure`], [`stitch`] and [`recovery`].

pub mod agents;
pub mod analyze;
pub mod core;
pub mod cycle;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod measure;
pub mod orchestrator;
pub mod recovery;
pub mod stats;
pub mod stitch;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::CobblerError;
pub use orchestrator::Orchestrator;
