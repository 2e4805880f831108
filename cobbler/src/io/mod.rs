//! I/O helpers for orchestrator commands.

pub mod agent;
pub mod atomic;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod cycle_log;
pub mod git;
pub mod init;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod tracker;
