//! Prompt pack builder for Measure and Stitch sessions.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::Task;

const MEASURE_TEMPLATE: &str = include_str!("prompts/measure.md");
const STITCH_TEMPLATE: &str = include_str!("prompts/stitch.md");

/// Drop order when a Measure prompt exceeds its budget.
const MEASURE_DROP_ORDER: &[&str] = &["docs", "sources", "tasks", "failures"];
/// Drop order when a Stitch prompt exceeds its budget.
const STITCH_DROP_ORDER: &[&str] = &["docs", "sources", "dependencies"];

/// Task view for template rendering.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskContext {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub depends_on: Vec<String>,
    pub summary: Option<String>,
    pub failure: Option<String>,
}

impl TaskContext {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status.as_str().to_string(),
            depends_on: task.depends_on.clone(),
            summary: task.summary.clone(),
            failure: task.failure.clone(),
        }
    }
}

/// A documentation file attached to a prompt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DocFile {
    /// Path relative to the worktree.
    pub path: String,
    pub contents: String,
}

/// Inputs for a Measure prompt.
#[derive(Debug, Clone)]
pub struct MeasureInputs {
    pub trail: String,
    pub cycle: u32,
    pub source_summary: String,
    pub docs: Vec<DocFile>,
    /// Every existing task, in creation order.
    pub tasks: Vec<TaskContext>,
    /// Failed tasks with their reasons.
    pub failures: Vec<TaskContext>,
}

/// Inputs for a Stitch prompt.
#[derive(Debug, Clone)]
pub struct StitchInputs {
    pub trail: String,
    pub cycle: u32,
    pub task: TaskContext,
    /// Direct dependencies of the task (all done).
    pub dependencies: Vec<TaskContext>,
    pub source_summary: String,
    pub docs: Vec<DocFile>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("measure", MEASURE_TEMPLATE)
            .context("load measure template")?;
        env.add_template("stitch", STITCH_TEMPLATE)
            .context("load stitch template")?;
        Ok(Self { env })
    }

    fn render_measure(&self, input: &MeasureInputs) -> Result<String> {
        let template = self.env.get_template("measure")?;
        let rendered = template.render(context! {
            trail => input.trail,
            cycle => input.cycle,
            failures => input.failures,
            tasks => input.tasks,
            source_summary => non_empty(&input.source_summary),
            docs => input.docs,
        })?;
        Ok(rendered)
    }

    fn render_stitch(&self, input: &StitchInputs) -> Result<String> {
        let template = self.env.get_template("stitch")?;
        let rendered = template.render(context! {
            trail => input.trail,
            cycle => input.cycle,
            task => input.task,
            dependencies => input.dependencies,
            source_summary => non_empty(&input.source_summary),
            docs => input.docs,
        })?;
        Ok(rendered)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "contract", "docs").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Section content without its marker.
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid section regex")
});

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, content_start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map(|next| next.0)
            .unwrap_or(rendered.len());
        let content = rendered[*content_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in `drop_order` until the prompt fits `budget`;
/// truncate the last section as a last resort. Returns dropped keys.
fn apply_budget_to_sections(
    sections: &mut Vec<ParsedSection>,
    budget: usize,
    drop_order: &[&str],
) -> Vec<String> {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    let mut dropped = Vec::new();

    for key in drop_order {
        if total_len(sections) <= budget {
            return dropped;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
            dropped.push(key.to_string());
        }
    }

    if total_len(sections) > budget && !sections.is_empty() {
        let other_len: usize = sections[..sections.len() - 1]
            .iter()
            .map(|s| s.content.len())
            .sum();
        let allowed = budget.saturating_sub(other_len);
        if let Some(last) = sections.last_mut()
            && last.content.len() > allowed
        {
            let before_len = last.content.len();
            let mut cut = allowed.saturating_sub(12);
            while !last.content.is_char_boundary(cut) {
                cut -= 1;
            }
            last.content.truncate(cut);
            last.content.push_str("\n[truncated]");
            debug!(
                section = last.key,
                before_len,
                after_len = last.content.len(),
                "truncated section for budget"
            );
        }
    }
    dropped
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_measure(&self, input: &MeasureInputs) -> Result<PromptPack> {
        let rendered = PromptEngine::new()?
            .render_measure(input)
            .context("render measure prompt")?;
        Ok(self.pack(&rendered, MEASURE_DROP_ORDER))
    }

    pub fn build_stitch(&self, input: &StitchInputs) -> Result<PromptPack> {
        let rendered = PromptEngine::new()?
            .render_stitch(input)
            .context("render stitch prompt")?;
        Ok(self.pack(&rendered, STITCH_DROP_ORDER))
    }

    fn pack(&self, rendered: &str, drop_order: &[&str]) -> PromptPack {
        let mut sections = parse_sections(rendered);
        let dropped = apply_budget_to_sections(&mut sections, self.budget_bytes, drop_order);
        let mut content = render_sections(&sections);
        content.push('\n');
        PromptPack { content, dropped }
    }
}

/// A rendered prompt ready to send to the agent.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
    dropped: Vec<String>,
}

impl PromptPack {
    pub fn as_str(&self) -> &str {
        &self.content
    }

    /// Section keys dropped to fit the budget.
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::test_support::task;

    fn measure_inputs() -> MeasureInputs {
        let mut failed = task("broken", 0, &[]);
        failed.status = TaskStatus::Failed;
        failed.failure = Some("tests did not compile".to_string());
        let pending = task("next", 1, &["broken"]);
        MeasureInputs {
            trail: "demo".to_string(),
            cycle: 2,
            source_summary: "src/main.rs (10 lines)".to_string(),
            docs: vec![DocFile {
                path: "README.md".to_string(),
                contents: "# Demo\n".to_string(),
            }],
            tasks: vec![TaskContext::from_task(&failed), TaskContext::from_task(&pending)],
            failures: vec![TaskContext::from_task(&failed)],
        }
    }

    /// Verifies prompt sections appear in deterministic order.
    #[test]
    fn measure_prompt_ordering_is_stable() {
        let pack = PromptBuilder::new(100_000)
            .build_measure(&measure_inputs())
            .expect("build");
        let text = pack.as_str();
        let contract = text.find("# Measure: trail `demo`, cycle 2").expect("contract");
        let failures = text.find("## Failed tasks").expect("failures");
        let tasks = text.find("## Existing tasks").expect("tasks");
        let sources = text.find("## Source summary").expect("sources");
        let docs = text.find("### README.md").expect("docs");
        assert!(contract < failures && failures < tasks && tasks < sources && sources < docs);
        assert!(text.contains("`broken` Task broken: tests did not compile"));
        assert!(text.contains("`next` [proposed] Task next (after broken)"));
        assert!(!text.contains("<!--"));
        assert!(pack.dropped().is_empty());
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let mut inputs = measure_inputs();
        inputs.tasks.clear();
        inputs.failures.clear();
        inputs.docs.clear();
        inputs.source_summary.clear();
        let pack = PromptBuilder::new(100_000).build_measure(&inputs).expect("build");
        assert!(!pack.as_str().contains("## "));
    }

    /// Over-budget prompts drop documentation before task history.
    #[test]
    fn budget_drops_docs_first() {
        let mut inputs = measure_inputs();
        inputs.docs[0].contents = "x".repeat(5_000);
        let full = PromptBuilder::new(100_000).build_measure(&inputs).expect("build");
        let budget = full.as_str().len() - 2_000;
        let pack = PromptBuilder::new(budget).build_measure(&inputs).expect("build");
        assert_eq!(pack.dropped(), ["docs".to_string()]);
        assert!(pack.as_str().contains("## Existing tasks"));
        assert!(!pack.as_str().contains("### README.md"));
    }

    #[test]
    fn stitch_prompt_contains_task_and_dependencies() {
        let mut dep = task("base", 0, &[]);
        dep.status = TaskStatus::Done;
        dep.summary = Some("added the base module".to_string());
        let target = task("feature", 1, &["base"]);
        let inputs = StitchInputs {
            trail: "demo".to_string(),
            cycle: 1,
            task: TaskContext::from_task(&target),
            dependencies: vec![TaskContext::from_task(&dep)],
            source_summary: String::new(),
            docs: Vec::new(),
        };
        let pack = PromptBuilder::new(100_000).build_stitch(&inputs).expect("build");
        let text = pack.as_str();
        assert!(text.contains("# Stitch: task `feature`"));
        assert!(text.contains("**Task feature**"));
        assert!(text.contains("- `base` Task base: added the base module"));
        assert!(!text.contains("## Source summary"));
    }

    #[test]
    fn required_sections_survive_tiny_budgets() {
        let pack = PromptBuilder::new(200)
            .build_measure(&measure_inputs())
            .expect("build");
        assert!(pack.as_str().contains("# Measure"));
        assert!(pack.as_str().contains("[truncated]"));
    }
}
