//! Stitch agent: executes one ready task in the trail worktree.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::core::types::StitchOutput;
use crate::io::agent::{Agent, AgentRequest, invoke_with_retry};
use crate::io::cycle_log::SessionPaths;
use crate::io::git::Git;
use crate::io::prompt::{PromptBuilder, PromptPack, StitchInputs};

use super::{SessionLimits, parse_schema, write_output_schema};

const STITCH_OUTPUT_SCHEMA: &str = include_str!("../../schemas/stitch_output.schema.json");

#[derive(Debug, Clone)]
pub struct StitchAgent {
    limits: SessionLimits,
}

impl StitchAgent {
    pub fn new(limits: SessionLimits) -> Self {
        Self { limits }
    }

    pub fn prompt(&self, inputs: &StitchInputs) -> Result<PromptPack> {
        let pack = PromptBuilder::new(self.limits.prompt_budget_bytes).build_stitch(inputs)?;
        if !pack.dropped().is_empty() {
            debug!(task = %inputs.task.id, dropped = ?pack.dropped(), "stitch prompt over budget");
        }
        Ok(pack)
    }

    /// Run the agent on one task. The agent edits `workdir` directly; the
    /// caller commits or discards those edits. A retried attempt starts
    /// from a clean worktree.
    pub fn run<A: Agent + ?Sized>(
        &self,
        agent: &A,
        workdir: &Path,
        session: &SessionPaths,
        inputs: &StitchInputs,
    ) -> Result<StitchOutput> {
        let schema = parse_schema("stitch output", STITCH_OUTPUT_SCHEMA)?;
        let prompt = self.prompt(inputs)?;
        session.write_prompt(prompt.as_str())?;
        write_output_schema(&session.schema_path, STITCH_OUTPUT_SCHEMA)?;

        let request = AgentRequest {
            workdir: workdir.to_path_buf(),
            prompt: prompt.as_str().to_string(),
            output_path: session.output_path.clone(),
            output_schema_path: session.schema_path.clone(),
            log_path: session.log_path.clone(),
            timeout: self.limits.timeout,
            output_limit_bytes: self.limits.output_limit_bytes,
        };
        let worktree = Git::new(workdir);
        let output: StitchOutput =
            invoke_with_retry(agent, &request, &schema, self.limits.retry, || {
                warn!(task = %inputs.task.id, "discarding edits of failed attempt");
                worktree.discard_changes()
            })?;
        info!(task = %inputs.task.id, verdict = ?output.status, "stitch session finished");
        Ok(output)
    }
}
