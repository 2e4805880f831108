//! Agent abstraction for Measure and Stitch sessions.
//!
//! The [`Agent`] trait decouples the cycle engine from the actual coding
//! agent. [`CommandAgent`] runs the configured command in the trail worktree
//! with the prompt on stdin; tests use scripted agents that write canned
//! outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::CobblerError;
use crate::io::process::run_command_with_timeout;

/// Environment variable naming the file the agent may write its JSON to.
pub const OUTPUT_ENV: &str = "COBBLER_OUTPUT";
/// Environment variable naming the JSON Schema the output must satisfy.
pub const OUTPUT_SCHEMA_ENV: &str = "COBBLER_OUTPUT_SCHEMA";

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent (the trail worktree).
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// Path where the agent's JSON output must end up.
    pub output_path: PathBuf,
    /// JSON Schema file describing the expected output.
    pub output_schema_path: PathBuf,
    /// Path to write the agent stdout/stderr log.
    pub log_path: PathBuf,
    /// Maximum time to wait for the agent to complete.
    pub timeout: Duration,
    /// Truncate agent output logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run the agent with the given request. On success the JSON output must
    /// be at `request.output_path`. A timeout must surface as
    /// [`CobblerError::AgentTimeout`].
    fn invoke(&self, request: &AgentRequest) -> Result<()>;
}

/// Agent that spawns an external command.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("agent command must be a non-empty array");
        }
        Ok(Self { command })
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(program = %self.command[0], timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting agent");
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .current_dir(&request.workdir)
            .env(OUTPUT_ENV, &request.output_path)
            .env(OUTPUT_SCHEMA_ENV, &request.output_schema_path);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run agent command {}", self.command[0]))?;

        write_log(
            &request.log_path,
            &output.render_log("agent", request.output_limit_bytes),
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(CobblerError::AgentTimeout {
                timeout: request.timeout,
            }
            .into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            bail!("agent exited with status {:?}", output.status.code());
        }

        if !request.output_path.exists() {
            let stdout = output.stdout_lossy();
            let payload = extract_json_payload(&stdout)
                .ok_or_else(|| anyhow!("agent produced no JSON output"))?;
            fs::write(&request.output_path, payload).with_context(|| {
                format!("write agent output {}", request.output_path.display())
            })?;
        }
        debug!("agent completed successfully");
        Ok(())
    }
}

/// Retry policy for transient agent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each further failure.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Invoke the agent and load its output as schema-checked JSON of type `T`.
///
/// Spawn failures, non-zero exits and missing or malformed output are
/// retried with exponential backoff; a timeout is returned immediately.
pub fn invoke_and_load<A: Agent + ?Sized, T: DeserializeOwned>(
    agent: &A,
    request: &AgentRequest,
    schema: &Value,
    policy: RetryPolicy,
) -> Result<T> {
    invoke_with_retry(agent, request, schema, policy, || Ok(()))
}

/// Like [`invoke_and_load`], calling `before_retry` ahead of every attempt
/// after the first.
#[instrument(skip_all, fields(output_path = %request.output_path.display(), max_attempts = policy.max_attempts))]
pub fn invoke_with_retry<A: Agent + ?Sized, T: DeserializeOwned>(
    agent: &A,
    request: &AgentRequest,
    schema: &Value,
    policy: RetryPolicy,
    mut before_retry: impl FnMut() -> Result<()>,
) -> Result<T> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match invoke_once(agent, request, schema) {
            Ok(value) => return Ok(value),
            Err(err) if CobblerError::is_timeout(&err) => return Err(err),
            Err(err) if attempt >= attempts => {
                return Err(err.context(format!("agent failed after {attempt} attempt(s)")));
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(attempt, error = %format!("{err:#}"), delay_ms = delay.as_millis() as u64, "agent attempt failed, retrying");
                thread::sleep(delay);
                before_retry().context("prepare agent retry")?;
                attempt += 1;
            }
        }
    }
}

fn invoke_once<A: Agent + ?Sized, T: DeserializeOwned>(
    agent: &A,
    request: &AgentRequest,
    schema: &Value,
) -> Result<T> {
    remove_stale_output(&request.output_path)?;
    agent.invoke(request)?;
    let value = read_output_value(&request.output_path)?;
    validate_against_schema(schema, &value)?;
    serde_json::from_value(value)
        .with_context(|| format!("decode agent output {}", request.output_path.display()))
}

fn remove_stale_output(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove stale output {}", path.display())),
    }
}

fn read_output_value(path: &Path) -> Result<Value> {
    if !path.exists() {
        bail!("missing agent output {}", path.display());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read agent output {}", path.display()))?;
    let payload = extract_json_payload(&contents)
        .ok_or_else(|| anyhow!("agent output {} is not JSON", path.display()))?;
    serde_json::from_str(&payload).with_context(|| format!("parse {}", path.display()))
}

/// Check `value` against a JSON Schema document.
pub fn validate_against_schema(schema: &Value, value: &Value) -> Result<()> {
    let compiled = validator_for(schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!("agent output schema validation failed: {}", messages.join("; "));
    }
    Ok(())
}

/// Find the JSON document in agent output.
///
/// Accepts plain JSON, a `{"result": "..."}` envelope whose result holds the
/// document, a fenced code block, or the outermost `{...}` span of free text.
pub fn extract_json_payload(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(inner) = value.get("result").and_then(Value::as_str) {
            return extract_json_payload(inner);
        }
        return value.is_object().then(|| value.to_string());
    }
    if let Some(fenced) = fenced_block(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(fenced)
    {
        return value.is_object().then(|| value.to_string());
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let value = serde_json::from_str::<Value>(&trimmed[start..=end]).ok()?;
    value.is_object().then(|| value.to_string())
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write agent log {}", path.display()))
}
