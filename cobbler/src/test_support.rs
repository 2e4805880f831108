//! Test helpers: deterministic tasks, throwaway git repositories and a
//! scripted agent that replays canned outputs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::core::types::{
    MeasureOutput, ProposedTask, StitchOutput, StitchVerdict, Task, TaskStatus,
};
use crate::error::CobblerError;
use crate::io::agent::{Agent, AgentRequest};
use crate::io::config::CobblerConfig;

/// Create a deterministic `proposed` task from cycle 1.
pub fn task(id: &str, seq: u64, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        title: format!("Task {id}"),
        description: format!("Do {id}"),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        status: TaskStatus::Proposed,
        origin_cycle: 1,
        seq,
        created_at: Utc
            .timestamp_opt(1_700_000_000 + seq as i64, 0)
            .single()
            .unwrap_or_else(Utc::now),
        summary: None,
        failure: None,
    }
}

/// Config suited to tests: no retries, no backoff, short timeouts.
pub fn test_config() -> CobblerConfig {
    let mut cfg = CobblerConfig::default();
    cfg.agent.command = vec!["true".to_string()];
    cfg.agent.max_attempts = 1;
    cfg.agent.retry_backoff_ms = 0;
    cfg.agent.measure_timeout_secs = 30;
    cfg.agent.stitch_timeout_secs = 30;
    cfg.git.main_branch = Some("main".to_string());
    cfg
}

/// A temporary git repository on branch `main` with one commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git(&["config", "user.email", "cobbler@example.com"])?;
        repo.git(&["config", "user.name", "Cobbler Tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# demo\n")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "--quiet", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repository root and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        git_in(self.path(), args)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        write_file(self.path(), rel, contents)
    }
}

/// Run git in `dir` and return trimmed stdout.
pub fn git_in(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn write_file(root: &Path, rel: &str, contents: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write this JSON text as the agent output.
    Output(String),
    /// Edit files in the worktree, then write a Stitch verdict.
    Stitch {
        verdict: StitchVerdict,
        summary: String,
        edits: Vec<(String, String)>,
    },
    /// Edit files in the worktree and report a transient failure.
    Fail {
        message: String,
        edits: Vec<(String, String)>,
    },
    Timeout,
    /// Panic mid-session, simulating a killed process.
    Crash { edits: Vec<(String, String)> },
}

impl Reply {
    /// Measure output proposing `(id, depends_on)` tasks titled `Task <id>`.
    pub fn measure(tasks: &[(&str, &[&str])]) -> Self {
        let output = MeasureOutput {
            tasks: tasks
                .iter()
                .map(|(id, deps)| ProposedTask {
                    id: Some(id.to_string()),
                    title: format!("Task {id}"),
                    description: format!("Do {id}"),
                    depends_on: deps.iter().map(|d| d.to_string()).collect(),
                })
                .collect(),
        };
        Self::Output(serde_json::to_string(&output).unwrap_or_default())
    }

    /// Measure output proposing nothing.
    pub fn idle() -> Self {
        Self::measure(&[])
    }

    /// Stitch `done`, writing `file` with `contents`.
    pub fn done(file: &str, contents: &str) -> Self {
        Self::Stitch {
            verdict: StitchVerdict::Done,
            summary: format!("wrote {file}"),
            edits: vec![(file.to_string(), contents.to_string())],
        }
    }

    pub fn failed(summary: &str) -> Self {
        Self::Stitch {
            verdict: StitchVerdict::Failed,
            summary: summary.to_string(),
            edits: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    prompts: Vec<String>,
}

/// Agent replaying queued [`Reply`] values in order.
///
/// Clones share the same queue, so a test can keep a handle after moving
/// the agent into an orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    script: Rc<RefCell<Script>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Reply>) -> Self {
        let agent = Self::default();
        agent.push(replies);
        agent
    }

    pub fn push(&self, replies: Vec<Reply>) {
        self.script.borrow_mut().replies.extend(replies);
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.script.borrow().prompts.clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().replies.len()
    }

    pub fn assert_drained(&self) {
        let remaining = self.remaining();
        assert_eq!(remaining, 0, "{remaining} scripted replies were never used");
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<()> {
        let reply = {
            let mut script = self.script.borrow_mut();
            script.prompts.push(request.prompt.clone());
            script.replies.pop_front()
        };
        let reply = reply.ok_or_else(|| anyhow!("scripted agent has no reply queued"))?;
        match reply {
            Reply::Output(body) => write_output(request, &body),
            Reply::Stitch {
                verdict,
                summary,
                edits,
            } => {
                apply_edits(&request.workdir, &edits)?;
                let body = serde_json::to_string(&StitchOutput {
                    status: verdict,
                    summary,
                })?;
                write_output(request, &body)
            }
            Reply::Fail { message, edits } => {
                apply_edits(&request.workdir, &edits)?;
                Err(anyhow!(message))
            }
            Reply::Timeout => Err(CobblerError::AgentTimeout {
                timeout: Duration::from_secs(30),
            }
            .into()),
            Reply::Crash { edits } => {
                apply_edits(&request.workdir, &edits)?;
                panic!("scripted agent crash");
            }
        }
    }
}

fn apply_edits(workdir: &Path, edits: &[(String, String)]) -> Result<()> {
    for (rel, contents) in edits {
        write_file(workdir, rel, contents)?;
    }
    Ok(())
}

fn write_output(request: &AgentRequest, body: &str) -> Result<()> {
    if let Some(parent) = request.output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&request.output_path, body)
        .with_context(|| format!("write {}", request.output_path.display()))
}
