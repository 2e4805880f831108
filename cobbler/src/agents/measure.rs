//! Measure agent: proposes new tasks from the project state.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use crate::core::types::MeasureOutput;
use crate::io::agent::{Agent, AgentRequest, invoke_and_load};
use crate::io::cycle_log::SessionPaths;
use crate::io::prompt::{MeasureInputs, PromptBuilder, PromptPack};

use super::{SessionLimits, parse_schema, write_output_schema};

const MEASURE_OUTPUT_SCHEMA: &str = include_str!("../../schemas/measure_output.schema.json");

#[derive(Debug, Clone)]
pub struct MeasureAgent {
    limits: SessionLimits,
}

impl MeasureAgent {
    pub fn new(limits: SessionLimits) -> Self {
        Self { limits }
    }

    pub fn prompt(&self, inputs: &MeasureInputs) -> Result<PromptPack> {
        let pack = PromptBuilder::new(self.limits.prompt_budget_bytes).build_measure(inputs)?;
        if !pack.dropped().is_empty() {
            debug!(dropped = ?pack.dropped(), "measure prompt over budget");
        }
        Ok(pack)
    }

    pub fn run<A: Agent + ?Sized>(
        &self,
        agent: &A,
        workdir: &Path,
        session: &SessionPaths,
        inputs: &MeasureInputs,
    ) -> Result<MeasureOutput> {
        let schema = parse_schema("measure output", MEASURE_OUTPUT_SCHEMA)?;
        let prompt = self.prompt(inputs)?;
        session.write_prompt(prompt.as_str())?;
        write_output_schema(&session.schema_path, MEASURE_OUTPUT_SCHEMA)?;

        let request = AgentRequest {
            workdir: workdir.to_path_buf(),
            prompt: prompt.as_str().to_string(),
            output_path: session.output_path.clone(),
            output_schema_path: session.schema_path.clone(),
            log_path: session.log_path.clone(),
            timeout: self.limits.timeout,
            output_limit_bytes: self.limits.output_limit_bytes,
        };
        let output: MeasureOutput = invoke_and_load(agent, &request, &schema, self.limits.retry)?;
        info!(
            trail = %inputs.trail,
            cycle = inputs.cycle,
            proposed = output.tasks.len(),
            "measure session finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::agent::RetryPolicy;
    use crate::test_support::{Reply, ScriptedAgent};
    use std::time::Duration;

    fn limits() -> SessionLimits {
        SessionLimits {
            prompt_budget_bytes: 10_000,
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            retry: RetryPolicy::once(),
        }
    }

    fn inputs() -> MeasureInputs {
        MeasureInputs {
            trail: "demo".to_string(),
            cycle: 1,
            source_summary: "README.md (1 lines)".to_string(),
            docs: Vec::new(),
            tasks: Vec::new(),
            failures: Vec::new(),
        }
    }

    #[test]
    fn measure_agent_writes_session_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::measure(&temp.path().join("scratch"), 1);
        let agent = ScriptedAgent::new(vec![Reply::measure(&[("t1", &[]), ("t2", &["t1"])])]);

        let output = MeasureAgent::new(limits())
            .run(&agent, temp.path(), &session, &inputs())
            .expect("run");

        assert_eq!(output.tasks.len(), 2);
        assert_eq!(output.tasks[1].depends_on, vec!["t1".to_string()]);
        assert!(session.prompt_path.is_file());
        assert!(session.schema_path.is_file());
        assert!(agent.prompts()[0].contains("# Measure: trail `demo`, cycle 1"));
    }

    /// Output that violates the schema never reaches the caller.
    #[test]
    fn rejects_output_outside_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::measure(temp.path(), 1);
        let agent = ScriptedAgent::new(vec![Reply::Output(
            r#"{"tasks": [{"title": "", "description": "x"}]}"#.to_string(),
        )]);

        let err = MeasureAgent::new(limits())
            .run(&agent, temp.path(), &session, &inputs())
            .unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }
}
