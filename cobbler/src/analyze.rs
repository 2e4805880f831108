//! Consistency analyzer: cross-reference project documentation with task
//! history.
//!
//! Requirements and use cases are identified by the regex patterns of the
//! `[analyze]` config section. Everything here is read-only.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::types::{Task, TaskStatus};
use crate::io::agent::Agent;
use crate::io::config::AnalyzeConfig;
use crate::io::registry::load_registry;
use crate::io::tracker::TaskStore;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    OrphanedRequirement,
    UntestedUseCase,
    UnscheduledUseCase,
    DanglingReference,
    UndocumentedTask,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingKind::OrphanedRequirement => "orphaned_requirement",
            FindingKind::UntestedUseCase => "untested_use_case",
            FindingKind::UnscheduledUseCase => "unscheduled_use_case",
            FindingKind::DanglingReference => "dangling_reference",
            FindingKind::UndocumentedTask => "undocumented_task",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    /// Requirement, use case or `trail/task` the finding is about.
    pub subject: String,
    /// Document the subject was found in.
    pub location: String,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}): {}",
            self.kind, self.subject, self.location, self.message
        )
    }
}

/// Tasks of one trail, as input to the analyzer.
#[derive(Debug, Clone)]
pub struct TrailTasks {
    pub trail: String,
    pub tasks: Vec<Task>,
}

/// Identifiers found in one group of documents, with the first file each
/// appeared in.
#[derive(Debug, Default)]
struct IdIndex {
    files: usize,
    requirements: BTreeMap<String, String>,
    use_cases: BTreeMap<String, String>,
}

impl IdIndex {
    fn scan(root: &Path, entries: &[String], patterns: &Patterns) -> Result<Self> {
        let mut index = IdIndex::default();
        for (rel, contents) in read_documents(root, entries)? {
            index.files += 1;
            for id in patterns.requirements(&contents) {
                index.requirements.entry(id).or_insert_with(|| rel.clone());
            }
            for id in patterns.use_cases(&contents) {
                index.use_cases.entry(id).or_insert_with(|| rel.clone());
            }
        }
        Ok(index)
    }
}

struct Patterns {
    requirement: Regex,
    use_case: Regex,
}

impl Patterns {
    fn new(config: &AnalyzeConfig) -> Result<Self> {
        Ok(Self {
            requirement: Regex::new(&config.requirement_pattern)
                .context("compile analyze.requirement_pattern")?,
            use_case: Regex::new(&config.use_case_pattern)
                .context("compile analyze.use_case_pattern")?,
        })
    }

    fn requirements(&self, text: &str) -> BTreeSet<String> {
        self.requirement
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn use_cases(&self, text: &str) -> BTreeSet<String> {
        self.use_case
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

/// Read every text file named by `entries` (files or directories).
fn read_documents(root: &Path, entries: &[String]) -> Result<Vec<(String, String)>> {
    let mut docs = Vec::new();
    for entry in entries {
        let path = root.join(entry);
        if !path.exists() {
            debug!(path = %path.display(), "analyze entry missing, skipping");
            continue;
        }
        for item in WalkDir::new(&path).sort_by_file_name() {
            let item = item.with_context(|| format!("walk {}", path.display()))?;
            if !item.file_type().is_file() {
                continue;
            }
            let Ok(contents) = fs::read_to_string(item.path()) else {
                debug!(path = %item.path().display(), "skipping non-utf8 document");
                continue;
            };
            let rel = item.path().strip_prefix(root).unwrap_or(item.path());
            docs.push((rel.to_string_lossy().replace('\\', "/"), contents));
        }
    }
    Ok(docs)
}

fn task_text(task: &Task) -> String {
    let mut text = format!("{}\n{}", task.title, task.description);
    if let Some(summary) = &task.summary {
        text.push('\n');
        text.push_str(summary);
    }
    text
}

/// Cross-reference the documentation under `root` with `trails`.
///
/// Findings are sorted by kind, then subject.
pub fn analyze(root: &Path, trails: &[TrailTasks], config: &AnalyzeConfig) -> Result<Vec<Finding>> {
    let patterns = Patterns::new(config)?;
    let requirements = IdIndex::scan(root, &config.requirements, &patterns)?;
    let use_cases = IdIndex::scan(root, &config.use_cases, &patterns)?;
    let suites = IdIndex::scan(root, &config.test_suites, &patterns)?;
    let roadmap = IdIndex::scan(root, &config.roadmap, &patterns)?;

    let defined_requirements = &requirements.requirements;
    let defined_use_cases = &use_cases.use_cases;

    let has_definitions = requirements.files + use_cases.files > 0;
    let mut task_requirements = BTreeSet::new();
    let mut findings = Vec::new();
    for trail in trails {
        for task in &trail.tasks {
            let text = task_text(task);
            let reqs = patterns.requirements(&text);
            let ucs = patterns.use_cases(&text);
            let documented = reqs.iter().any(|id| defined_requirements.contains_key(id))
                || ucs.iter().any(|id| defined_use_cases.contains_key(id));
            if has_definitions && task.status == TaskStatus::Done && !documented {
                findings.push(Finding {
                    kind: FindingKind::UndocumentedTask,
                    subject: format!("{}/{}", trail.trail, task.id),
                    location: format!("trail {}", trail.trail),
                    message: "done task references no known requirement or use case".to_string(),
                });
            }
            task_requirements.extend(reqs);
        }
    }

    for (id, file) in defined_requirements {
        if !use_cases.requirements.contains_key(id) && !task_requirements.contains(id) {
            findings.push(Finding {
                kind: FindingKind::OrphanedRequirement,
                subject: id.clone(),
                location: file.clone(),
                message: "referenced by no use case and no task".to_string(),
            });
        }
    }

    for (id, file) in defined_use_cases {
        if suites.files > 0 && !suites.use_cases.contains_key(id) {
            findings.push(Finding {
                kind: FindingKind::UntestedUseCase,
                subject: id.clone(),
                location: file.clone(),
                message: "referenced by no test suite".to_string(),
            });
        }
        if roadmap.files > 0 && !roadmap.use_cases.contains_key(id) {
            findings.push(Finding {
                kind: FindingKind::UnscheduledUseCase,
                subject: id.clone(),
                location: file.clone(),
                message: "absent from the roadmap".to_string(),
            });
        }
    }

    // References to requirements are only checked when requirement documents
    // exist; the same goes for use cases.
    for (referencing, defines_use_cases) in [(&use_cases, true), (&suites, false), (&roadmap, false)] {
        if requirements.files > 0 {
            for (id, file) in &referencing.requirements {
                if !defined_requirements.contains_key(id) {
                    findings.push(dangling(id, file, "requirement"));
                }
            }
        }
        if use_cases.files > 0 && !defines_use_cases {
            for (id, file) in &referencing.use_cases {
                if !defined_use_cases.contains_key(id) {
                    findings.push(dangling(id, file, "use case"));
                }
            }
        }
    }

    findings.sort();
    findings.dedup();
    debug!(findings = findings.len(), "analysis complete");
    Ok(findings)
}

fn dangling(id: &str, file: &str, kind: &str) -> Finding {
    Finding {
        kind: FindingKind::DanglingReference,
        subject: id.to_string(),
        location: file.to_string(),
        message: format!("references a {kind} that no document defines"),
    }
}

impl<A: Agent> Orchestrator<A> {
    /// Analyze the repository root against the tasks of every trail.
    pub fn analyze(&self) -> Result<Vec<Finding>> {
        let registry = load_registry(&self.paths.registry_path)?;
        let mut trails = Vec::new();
        for record in registry.by_creation() {
            trails.push(TrailTasks {
                trail: record.name.clone(),
                tasks: TaskStore::new(&self.paths.trail(&record.name)).load()?,
            });
        }
        analyze(&self.paths.root, &trails, &self.config.analyze)
    }
}
