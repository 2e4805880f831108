//! Checkpoint persistence.
//!
//! A checkpoint is the durable progress marker of a trail: the worktree
//! commit plus the task-status snapshot at that commit. It is written with
//! an atomic overwrite and carries a SHA-256 digest of its payload, so a
//! truncated or hand-edited file is reported as corruption instead of being
//! trusted.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::types::{Task, TaskStatus};
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub trail: String,
    /// Last fully completed cycle (0 before the first cycle).
    pub cycle_index: u32,
    /// Worktree HEAD at snapshot time.
    pub commit: String,
    pub tasks: BTreeMap<String, TaskStatus>,
    /// Cycle whose Measure has committed tasks but which has not completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_cycle: Option<u32>,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn initial(trail: &str, commit: &str) -> Self {
        Self {
            trail: trail.to_string(),
            cycle_index: 0,
            commit: commit.to_string(),
            tasks: BTreeMap::new(),
            measured_cycle: None,
            written_at: Utc::now(),
        }
    }

    /// Refresh commit and snapshot from the current state.
    pub fn update(&mut self, commit: &str, tasks: &[Task]) {
        self.commit = commit.to_string();
        self.tasks = snapshot(tasks);
        self.written_at = Utc::now();
    }
}

/// Task-status snapshot keyed by task id.
pub fn snapshot(tasks: &[Task]) -> BTreeMap<String, TaskStatus> {
    tasks.iter().map(|t| (t.id.clone(), t.status)).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    digest: String,
    checkpoint: Checkpoint,
}

fn digest(checkpoint: &Checkpoint) -> Result<String> {
    let payload = serde_json::to_vec(checkpoint).context("serialize checkpoint")?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

/// Atomically write a checkpoint with its digest.
pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    debug!(
        path = %path.display(),
        cycle = checkpoint.cycle_index,
        commit = %checkpoint.commit,
        measured_cycle = ?checkpoint.measured_cycle,
        "writing checkpoint"
    );
    let file = CheckpointFile {
        digest: digest(checkpoint)?,
        checkpoint: checkpoint.clone(),
    };
    write_json_atomic(path, &file)
}

/// Load and verify a checkpoint.
///
/// A missing, unparsable or digest-mismatched file is an error.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read checkpoint {}", path.display()))?;
    let file: CheckpointFile = serde_json::from_str(&contents)
        .with_context(|| format!("checkpoint corrupted: parse {}", path.display()))?;
    let expected = digest(&file.checkpoint)?;
    if expected != file.digest {
        return Err(anyhow!(
            "checkpoint corrupted: digest mismatch in {} (recorded {}, computed {})",
            path.display(),
            file.digest,
            expected
        ));
    }
    Ok(file.checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        let mut cp = Checkpoint::initial("demo", "abc123");
        let mut t = task("a", 0, &[]);
        t.status = TaskStatus::Done;
        cp.update("def456", &[t]);
        cp.cycle_index = 2;
        cp.measured_cycle = Some(3);
        write_checkpoint(&path, &cp).expect("write");
        assert_eq!(load_checkpoint(&path).expect("load"), cp);
    }

    /// Editing the payload without updating the digest is detected.
    #[test]
    fn tampered_payload_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        write_checkpoint(&path, &Checkpoint::initial("demo", "abc123")).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        fs::write(&path, contents.replace("abc123", "fff999")).expect("write");
        let err = load_checkpoint(&path).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"), "{err:#}");
    }

    #[test]
    fn truncated_file_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        write_checkpoint(&path, &Checkpoint::initial("demo", "abc123")).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        fs::write(&path, &contents[..contents.len() / 2]).expect("write");
        let err = load_checkpoint(&path).unwrap_err();
        assert!(format!("{err:#}").contains("checkpoint corrupted"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_checkpoint(&temp.path().join("checkpoint.json")).is_err());
    }
}
