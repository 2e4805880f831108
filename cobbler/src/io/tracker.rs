//! Per-trail task tracker.
//!
//! `tasks.json` holds the current task set (atomic overwrite) and
//! `events.jsonl` is an append-only audit log of every status transition.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::types::{StatusChange, Task, TaskStatus};
use crate::io::atomic::{read_json_opt, write_json_atomic};
use crate::io::init::TrailPaths;

const TASKS_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct TaskFile {
    version: u32,
    tasks: Vec<Task>,
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub at: DateTime<Utc>,
    pub task_id: String,
    /// `None` when the task was created.
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub cycle: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TaskEvent {
    pub fn created(task: &Task) -> Self {
        Self {
            at: Utc::now(),
            task_id: task.id.clone(),
            from: None,
            to: task.status,
            cycle: task.origin_cycle,
            note: None,
        }
    }

    pub fn changed(change: &StatusChange, cycle: u32) -> Self {
        Self {
            at: Utc::now(),
            task_id: change.task_id.clone(),
            from: Some(change.from),
            to: change.to,
            cycle,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Task store of one trail.
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks_path: PathBuf,
    events_path: PathBuf,
}

impl TaskStore {
    pub fn new(paths: &TrailPaths) -> Self {
        Self {
            tasks_path: paths.tasks_path.clone(),
            events_path: paths.events_path.clone(),
        }
    }

    /// Load tasks in creation order; a missing store is empty.
    pub fn load(&self) -> Result<Vec<Task>> {
        let Some(file) = read_json_opt::<TaskFile>(&self.tasks_path)? else {
            return Ok(Vec::new());
        };
        if file.version != TASKS_VERSION {
            return Err(anyhow!(
                "unsupported task store version {} in {}",
                file.version,
                self.tasks_path.display()
            ));
        }
        let mut tasks = file.tasks;
        tasks.sort_by_key(|t| t.seq);
        debug!(count = tasks.len(), "tasks loaded");
        Ok(tasks)
    }

    /// Atomically replace the task set.
    pub fn save(&self, tasks: &[Task]) -> Result<()> {
        let file = TaskFile {
            version: TASKS_VERSION,
            tasks: tasks.to_vec(),
        };
        write_json_atomic(&self.tasks_path, &file)
    }

    /// Append events to the audit log.
    pub fn append_events(&self, events: &[TaskEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.events_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("open {}", self.events_path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append {}", self.events_path.display()))?;
        Ok(())
    }

    /// Save tasks, then log the events that produced them.
    pub fn commit(&self, tasks: &[Task], events: &[TaskEvent]) -> Result<()> {
        self.save(tasks)?;
        self.append_events(events)
    }

    /// Read the audit log.
    ///
    /// A torn final line (crash during append) is skipped with a warning;
    /// an unparsable line anywhere else is an error.
    pub fn load_events(&self) -> Result<Vec<TaskEvent>> {
        let contents = match fs::read_to_string(&self.events_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.events_path.display()));
            }
        };
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<TaskEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) if i + 1 == lines.len() && !contents.ends_with('\n') => {
                    warn!(error = %err, "skipping torn final event line");
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("parse {} line {}", self.events_path.display(), i + 1)
                    });
                }
            }
        }
        Ok(events)
    }

    /// Move the store and its event log into `archive_root/<timestamp>/`.
    ///
    /// Returns the archive directory, or `None` if there was nothing to archive.
    pub fn archive(&self, archive_root: &Path) -> Result<Option<PathBuf>> {
        if !self.tasks_path.exists() && !self.events_path.exists() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let dir = archive_root.join(stamp);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        for path in [&self.tasks_path, &self.events_path] {
            if path.exists() {
                let name = path
                    .file_name()
                    .with_context(|| format!("path missing file name {}", path.display()))?;
                fs::rename(path, dir.join(name))
                    .with_context(|| format!("archive {}", path.display()))?;
            }
        }
        info!(archive = %dir.display(), "task store archived");
        Ok(Some(dir))
    }
}
