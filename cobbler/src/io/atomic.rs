//! Atomic file replacement (temp file + rename).
//!
//! A reader never observes a torn file: it sees either the previous contents
//! or the new ones.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Atomically write `contents` to `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = tmp_path_for(path);
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Atomically write `value` as pretty JSON with a trailing newline.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Read JSON from `path`; `Ok(None)` if the file does not exist.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/dir/value.json");
        write_json_atomic(&path, &vec![1, 2, 3]).expect("write");
        let read: Option<Vec<i32>> = read_json_opt(&path).expect("read");
        assert_eq!(read, Some(vec![1, 2, 3]));
        assert!(!temp.path().join("nested/dir/value.json.tmp").exists());
    }

    #[test]
    fn read_missing_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let read: Option<Vec<i32>> = read_json_opt(&temp.path().join("nope.json")).expect("read");
        assert!(read.is_none());
    }

    #[test]
    fn read_garbage_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.json");
        fs::write(&path, "{not json").expect("write");
        let err = read_json_opt::<Vec<i32>>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }
}
