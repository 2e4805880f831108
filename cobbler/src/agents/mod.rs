//! Agent sessions for the two phases of a cycle.
//!
//! Each wrapper owns its output schema and prompt settings, writes the
//! session files to the scratch directory and hands the request to an
//! [`Agent`](crate::io::agent::Agent).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::io::agent::RetryPolicy;
use crate::io::config::CobblerConfig;

pub mod measure;
pub mod stitch;

/// Limits applied to one kind of agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub prompt_budget_bytes: usize,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub retry: RetryPolicy,
}

impl SessionLimits {
    pub fn measure(config: &CobblerConfig) -> Self {
        Self::with_timeout(config, config.agent.measure_timeout())
    }

    pub fn stitch(config: &CobblerConfig) -> Self {
        Self::with_timeout(config, config.agent.stitch_timeout())
    }

    fn with_timeout(config: &CobblerConfig, timeout: Duration) -> Self {
        Self {
            prompt_budget_bytes: config.prompt.budget_bytes,
            timeout,
            output_limit_bytes: config.agent.output_limit_bytes,
            retry: RetryPolicy {
                max_attempts: config.agent.max_attempts,
                backoff: config.agent.retry_backoff(),
            },
        }
    }
}

pub(crate) fn write_output_schema(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write schema {}", path.display()))
}

pub(crate) fn parse_schema(name: &str, contents: &str) -> Result<Value> {
    serde_json::from_str(contents).with_context(|| format!("parse embedded {name} schema"))
}
