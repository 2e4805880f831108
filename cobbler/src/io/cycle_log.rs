//! Cycle records (`trails/<name>/cycles/<k>/cycle.json`) and per-session
//! scratch paths (`scratch/<name>/cycle-<k>/...`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{CycleStatus, TaskOutcome, TaskResult};
use crate::io::atomic::{read_json_opt, write_json_atomic};
use crate::io::init::TrailPaths;

/// Persisted record of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub index: u32,
    pub trail: String,
    /// Task ids proposed by this cycle's Measure.
    pub proposed: Vec<String>,
    /// Outcomes from this cycle's Stitch, in execution order.
    pub results: Vec<TaskResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CycleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times this cycle was resumed after an interruption.
    #[serde(default)]
    pub resumed: u32,
}

impl CycleRecord {
    pub fn begin(trail: &str, index: u32) -> Self {
        Self {
            index,
            trail: trail.to_string(),
            proposed: Vec::new(),
            results: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            status: CycleStatus::Partial,
            error: None,
            resumed: 0,
        }
    }

    /// Close the record; `complete` iff no stitched task failed.
    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
        self.error = None;
        self.status = if self.results.iter().all(|r| r.outcome == TaskOutcome::Done) {
            CycleStatus::Complete
        } else {
            CycleStatus::Partial
        };
    }

    pub fn fail(&mut self, error: &anyhow::Error) {
        self.ended_at = Some(Utc::now());
        self.status = CycleStatus::Failed;
        self.error = Some(format!("{error:#}"));
    }
}

pub fn cycle_record_path(paths: &TrailPaths, index: u32) -> PathBuf {
    paths.cycle_dir(index).join("cycle.json")
}

pub fn write_cycle_record(paths: &TrailPaths, record: &CycleRecord) -> Result<PathBuf> {
    let path = cycle_record_path(paths, record.index);
    write_json_atomic(&path, record)?;
    Ok(path)
}

pub fn load_cycle_record(paths: &TrailPaths, index: u32) -> Result<Option<CycleRecord>> {
    read_json_opt(&cycle_record_path(paths, index))
}

/// All cycle records of a trail, ordered by index.
pub fn load_cycle_records(paths: &TrailPaths) -> Result<Vec<CycleRecord>> {
    let entries = match fs::read_dir(&paths.cycles_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", paths.cycles_dir.display()));
        }
    };
    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", paths.cycles_dir.display()))?;
        let Some(index) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(record) = load_cycle_record(paths, index)? {
            records.push(record);
        }
    }
    records.sort_by_key(|r| r.index);
    Ok(records)
}

/// Files of one agent session in the scratch directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub output_path: PathBuf,
    pub schema_path: PathBuf,
    pub log_path: PathBuf,
}

impl SessionPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            prompt_path: dir.join("prompt.md"),
            output_path: dir.join("output.json"),
            schema_path: dir.join("output.schema.json"),
            log_path: dir.join("agent.log"),
            dir,
        }
    }

    pub fn measure(trail_scratch: &Path, cycle: u32) -> Self {
        Self::new(trail_scratch.join(format!("cycle-{cycle}")).join("measure"))
    }

    pub fn stitch(trail_scratch: &Path, cycle: u32, task_id: &str) -> Self {
        Self::new(
            trail_scratch
                .join(format!("cycle-{cycle}"))
                .join("stitch")
                .join(task_id),
        )
    }

    /// Create the session directory and save the prompt.
    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create session dir {}", self.dir.display()))?;
        fs::write(&self.prompt_path, prompt)
            .with_context(|| format!("write prompt {}", self.prompt_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::CobblerPaths;

    fn result(id: &str, outcome: TaskOutcome) -> TaskResult {
        TaskResult {
            task_id: id.to_string(),
            outcome,
            commit: None,
            detail: String::new(),
        }
    }

    #[test]
    fn finish_sets_status_from_results() {
        let mut record = CycleRecord::begin("demo", 1);
        record.results.push(result("a", TaskOutcome::Done));
        record.finish();
        assert_eq!(record.status, CycleStatus::Complete);

        record.results.push(result("b", TaskOutcome::Failed));
        record.finish();
        assert_eq!(record.status, CycleStatus::Partial);

        record.fail(&anyhow::anyhow!("measure broke"));
        assert_eq!(record.status, CycleStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("measure broke"));
    }

    #[test]
    fn records_load_in_index_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CobblerPaths::new(temp.path()).trail("demo");
        for index in [10, 2, 1] {
            write_cycle_record(&paths, &CycleRecord::begin("demo", index)).expect("write");
        }
        let indices: Vec<u32> = load_cycle_records(&paths)
            .expect("load")
            .iter()
            .map(|r| r.index)
            .collect();
        assert_eq!(indices, vec![1, 2, 10]);
        assert!(load_cycle_record(&paths, 3).expect("load").is_none());
    }

    #[test]
    fn session_paths_are_scoped_by_cycle_and_task() {
        let scratch = Path::new("/s/demo");
        assert_eq!(
            SessionPaths::measure(scratch, 2).output_path,
            PathBuf::from("/s/demo/cycle-2/measure/output.json")
        );
        assert_eq!(
            SessionPaths::stitch(scratch, 2, "t1").log_path,
            PathBuf::from("/s/demo/cycle-2/stitch/t1/agent.log")
        );
    }
}
