use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

/// A transient resource (audio file, transcript dump) owned by exactly one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub id: Uuid,
    pub job_id: Uuid,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ArtifactEntry {
    handle: ArtifactHandle,
    released: bool,
}

/// Tracks every transient artifact created during job execution and guarantees
/// its release regardless of the exit path.
///
/// Artifacts live inside a ledger-owned temporary workspace, so even a missed
/// release is bounded by the process lifetime. `release` is idempotent;
/// `release_all` is called unconditionally when a job reaches a terminal state,
/// and the background sweep covers expired jobs as a last line.
pub struct ResourceLedger {
    workspace: TempDir,
    entries: Mutex<HashMap<Uuid, ArtifactEntry>>,
}

impl ResourceLedger {
    pub fn new() -> Result<Self> {
        let workspace = TempDir::new().context("Failed to create artifact workspace")?;
        Ok(Self {
            workspace,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Directory where collaborators should place artifact files.
    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }

    /// Record ownership of a file artifact.
    ///
    /// Idempotent on (job, path): registering the same path twice for the same
    /// job returns the existing handle.
    pub fn register(&self, job_id: Uuid, path: PathBuf, size_bytes: u64) -> ArtifactHandle {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries
            .values()
            .find(|e| e.handle.job_id == job_id && e.handle.path == path && !e.released)
        {
            return existing.handle.clone();
        }

        let handle = ArtifactHandle {
            id: Uuid::new_v4(),
            job_id,
            path,
            size_bytes,
            created_at: Utc::now(),
        };
        tracing::debug!(job_id = %job_id, artifact = %handle.id, path = %handle.path.display(), "artifact registered");
        entries.insert(
            handle.id,
            ArtifactEntry {
                handle: handle.clone(),
                released: false,
            },
        );
        handle
    }

    /// Release one artifact. No-op if already released or unknown.
    pub fn release(&self, handle: &ArtifactHandle) {
        let mut entries = self.entries.lock().unwrap();
        self.release_locked(&mut entries, handle.id);
    }

    /// Release every artifact still owned by `job_id`.
    pub fn release_all(&self, job_id: Uuid) {
        let mut entries = self.entries.lock().unwrap();
        let ids: Vec<Uuid> = entries
            .values()
            .filter(|e| e.handle.job_id == job_id && !e.released)
            .map(|e| e.handle.id)
            .collect();
        for id in ids {
            self.release_locked(&mut entries, id);
        }
    }

    /// Number of live artifacts owned by `job_id`.
    pub fn outstanding(&self, job_id: Uuid) -> usize {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|e| e.handle.job_id == job_id && !e.released)
            .count()
    }

    /// Release everything for the given jobs and drop their bookkeeping.
    ///
    /// Used by the background sweep for jobs past their expiry, as a defense
    /// against a missed release on an unusual exit path.
    pub fn sweep(&self, job_ids: &[Uuid]) {
        for job_id in job_ids {
            self.release_all(*job_id);
        }
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| !(e.released && job_ids.contains(&e.handle.job_id)));
    }

    /// Release every artifact the ledger knows about. Used at shutdown.
    pub fn shutdown_sweep(&self) {
        let mut entries = self.entries.lock().unwrap();
        let ids: Vec<Uuid> = entries
            .values()
            .filter(|e| !e.released)
            .map(|e| e.handle.id)
            .collect();
        for id in ids {
            self.release_locked(&mut entries, id);
        }
    }

    fn release_locked(&self, entries: &mut HashMap<Uuid, ArtifactEntry>, id: Uuid) {
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        if entry.released {
            return;
        }
        entry.released = true;
        match fs_err::remove_file(&entry.handle.path) {
            Ok(()) => {
                tracing::debug!(artifact = %id, path = %entry.handle.path.display(), "artifact released");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(artifact = %id, "failed to remove artifact file: {}", err);
            }
        }
    }
}
