//! Trail registry stored in `.cobbler/registry.json`.
//!
//! The registry is the single owner of trail records and the active-trail
//! pointer. It is rewritten atomically after every lifecycle transition.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::TrailState;
use crate::error::CobblerError;
use crate::io::atomic::{read_json_opt, write_json_atomic};

const REGISTRY_VERSION: u32 = 1;

/// Persisted record of one generation trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailRecord {
    pub name: String,
    pub branch: String,
    /// Worktree path relative to the repository root.
    pub worktree: PathBuf,
    /// Branch the trail forked from and merges back into.
    pub base_branch: String,
    pub state: TrailState,
    /// Cumulative number of cycles requested across runs.
    pub cycle_budget: u32,
    pub cycles_completed: u32,
    /// The current run stops early once a cycle is idle.
    #[serde(default)]
    pub until_idle: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Checkpoint file, relative to the repository root.
    pub checkpoint: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Commit on the base branch after the final merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
}

impl TrailRecord {
    pub fn set_state(&mut self, state: TrailState) {
        debug!(trail = %self.name, from = %self.state, to = %state, "trail state change");
        self.state = state;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    #[serde(default)]
    pub trails: Vec<TrailRecord>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            active: None,
            trails: Vec::new(),
        }
    }
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<&TrailRecord> {
        self.trails.iter().find(|t| t.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TrailRecord> {
        self.trails.iter_mut().find(|t| t.name == name)
    }

    /// Record for `name`, or `TrailNotFound`.
    pub fn require(&self, name: &str) -> Result<&TrailRecord> {
        self.get(name).ok_or_else(|| not_found(name))
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut TrailRecord> {
        self.get_mut(name).ok_or_else(|| not_found(name))
    }

    /// Name of the active trail, or `NoActiveTrail`.
    pub fn active_name(&self) -> Result<String> {
        self.active
            .clone()
            .ok_or_else(|| CobblerError::NoActiveTrail.into())
    }

    pub fn insert(&mut self, record: TrailRecord) {
        self.trails.push(record);
    }

    /// Remove a record, clearing the active pointer if it named it.
    pub fn remove(&mut self, name: &str) -> Option<TrailRecord> {
        let pos = self.trails.iter().position(|t| t.name == name)?;
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        Some(self.trails.remove(pos))
    }

    /// Records ordered by creation time (then name).
    pub fn by_creation(&self) -> Vec<&TrailRecord> {
        let mut trails: Vec<&TrailRecord> = self.trails.iter().collect();
        trails.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        trails
    }
}

fn not_found(name: &str) -> anyhow::Error {
    CobblerError::TrailNotFound {
        name: name.to_string(),
        detail: "no such trail in the registry".to_string(),
    }
    .into()
}

/// Load the registry; a missing file is an empty registry.
pub fn load_registry(path: &Path) -> Result<Registry> {
    let registry: Registry = read_json_opt(path)?.unwrap_or_default();
    debug!(
        trails = registry.trails.len(),
        active = ?registry.active,
        "registry loaded"
    );
    Ok(registry)
}

/// Atomically write the registry to disk (temp file + rename).
pub fn write_registry(path: &Path, registry: &Registry) -> Result<()> {
    debug!(path = %path.display(), trails = registry.trails.len(), "writing registry");
    write_json_atomic(path, registry)
}
