use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::job::JobSnapshot;

/// Best-effort JSON mirror of job records, keyed by job id.
///
/// Written at terminal transitions and at shutdown so status survives a
/// restart. Never consulted for correctness of the in-memory registry, and
/// never used to resume in-flight work.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs_err::create_dir_all(&dir).context("Failed to create snapshot directory")?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, snapshot: &JobSnapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)
            .context("Failed to serialize job snapshot")?;
        fs_err::write(self.path_for(snapshot.id), content)
            .context("Failed to write job snapshot")?;
        tracing::debug!(job_id = %snapshot.id, "job snapshot persisted");
        Ok(())
    }

    pub fn load(&self, id: Uuid) -> Result<Option<JobSnapshot>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs_err::read_to_string(&path).context("Failed to read job snapshot")?;
        let snapshot = serde_json::from_str(&content).context("Failed to parse job snapshot")?;
        Ok(Some(snapshot))
    }

    /// All persisted snapshots; unparsable files are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<JobSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs_err::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs_err::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable snapshot: {}", err);
                }
            }
        }
        Ok(snapshots)
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ErrorInfo, Job};
    use crate::stage::FailureKind;
    use chrono::Duration;

    fn terminal_snapshot() -> JobSnapshot {
        let mut job = Job::new("https://youtu.be/abc123xyz00", Duration::hours(1));
        job.fail(
            ErrorInfo {
                kind: FailureKind::FatalInput,
                message: "Unsupported video URL".into(),
                detail: "no video id in path".into(),
            },
            Duration::hours(1),
        );
        job.snapshot()
    }

    #[test]
    fn write_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("jobs")).unwrap();
        let snapshot = terminal_snapshot();

        store.write(&snapshot).unwrap();
        let loaded = store.load(snapshot.id).unwrap().expect("snapshot exists");
        assert_eq!(loaded.id, snapshot.id);
        assert_eq!(loaded.state, snapshot.state);
        assert_eq!(loaded.error.as_ref().unwrap().kind, FailureKind::FatalInput);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.load(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn load_all_skips_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf()).unwrap();
        store.write(&terminal_snapshot()).unwrap();
        fs_err::write(dir.path().join("broken.json"), "not json").unwrap();
        fs_err::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
    }
}
