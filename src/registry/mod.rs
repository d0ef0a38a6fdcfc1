use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::job::{ErrorInfo, Job, JobSnapshot};
use crate::stage::FailureKind;

/// A registered job plus its cancellation flag.
///
/// The driver task is the only writer of `job`; everyone else takes the lock
/// briefly to copy a snapshot. The cancel flag lives outside the mutex so a
/// cancel request never contends with a transition.
pub struct JobHandle {
    pub job: Mutex<Job>,
    cancel: AtomicBool,
}

impl JobHandle {
    fn new(job: Job) -> Self {
        Self {
            job: Mutex::new(job),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.job.lock().unwrap().snapshot()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry is at capacity ({0} active jobs)")]
    AtCapacity(usize),
}

/// Concurrency-safe map of job id to job record.
///
/// Enforces bounded admission: submissions beyond `max_active` non-terminal
/// jobs are rejected rather than queued.
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<JobHandle>>>,
    max_active: usize,
}

impl JobRegistry {
    pub fn new(max_active: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_active,
        }
    }

    /// Allocate a new job in `Idle` state and insert it atomically.
    pub fn create(&self, source_url: &str, ttl: Duration) -> Result<Arc<JobHandle>, RegistryError> {
        let mut jobs = self.jobs.write().unwrap();
        let active = jobs
            .values()
            .filter(|h| !h.job.lock().unwrap().state().is_terminal())
            .count();
        if active >= self.max_active {
            tracing::warn!(active, max = self.max_active, "admission rejected, registry at capacity");
            return Err(RegistryError::AtCapacity(active));
        }

        let handle = Arc::new(JobHandle::new(Job::new(source_url, ttl)));
        let id = handle.job.lock().unwrap().id;
        jobs.insert(id, handle.clone());
        tracing::info!(job_id = %id, active = active + 1, "job created");
        Ok(handle)
    }

    /// Read-only snapshot of a job, or None if unknown (or already evicted).
    pub fn get(&self, id: Uuid) -> Option<JobSnapshot> {
        self.jobs.read().unwrap().get(&id).map(|h| h.snapshot())
    }

    /// Live handle for the driver task and for cancellation.
    pub fn handle(&self, id: Uuid) -> Option<Arc<JobHandle>> {
        self.jobs.read().unwrap().get(&id).cloned()
    }

    /// All live handles. Used at shutdown to persist snapshots.
    pub fn handles(&self) -> Vec<Arc<JobHandle>> {
        self.jobs.read().unwrap().values().cloned().collect()
    }

    /// Jobs past their expiry, regardless of state.
    ///
    /// A non-terminal job past its expiry means its driver task died without
    /// reaching a terminal transition; the sweep reclaims those too.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.jobs
            .read()
            .unwrap()
            .values()
            .filter_map(|h| {
                let job = h.job.lock().unwrap();
                (job.expires_at < now).then_some(job.id)
            })
            .collect()
    }

    /// Evict expired jobs whose artifacts have all been released.
    ///
    /// An expired job that never reached a terminal state is failed first, so
    /// its admission slot is reclaimed even when the driver task vanished.
    /// `artifacts_released` is supplied by the caller (the ledger); a job with
    /// outstanding artifacts stays until the next sweep.
    pub fn sweep(&self, now: DateTime<Utc>, artifacts_released: impl Fn(Uuid) -> bool) -> Vec<Uuid> {
        let expired = self.expired(now);
        let mut evicted = Vec::new();
        let mut jobs = self.jobs.write().unwrap();
        for id in expired {
            if let Some(handle) = jobs.get(&id) {
                let mut job = handle.job.lock().unwrap();
                if !job.state().is_terminal() {
                    tracing::warn!(job_id = %id, state = %job.state(), "expired job never reached a terminal state, abandoning it");
                    job.fail(
                        ErrorInfo {
                            kind: FailureKind::TransientService,
                            message: "The job stalled and was abandoned".to_string(),
                            detail: "job passed its expiry without reaching a terminal state".to_string(),
                        },
                        Duration::zero(),
                    );
                }
            }
            if artifacts_released(id) {
                jobs.remove(&id);
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted expired jobs");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ErrorInfo, JobState};
    use crate::stage::FailureKind;

    fn ttl() -> Duration {
        Duration::hours(1)
    }

    #[test]
    fn create_and_get_roundtrip() {
        let registry = JobRegistry::new(4);
        let handle = registry.create("https://youtu.be/abc123xyz00", ttl()).unwrap();
        let id = handle.job.lock().unwrap().id;

        let snap = registry.get(id).expect("job should be present");
        assert_eq!(snap.state, JobState::Idle);
        assert_eq!(snap.progress, 0.0);
        assert!(registry.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn admission_is_bounded_by_active_jobs() {
        let registry = JobRegistry::new(2);
        let a = registry.create("https://youtu.be/a", ttl()).unwrap();
        let _b = registry.create("https://youtu.be/b", ttl()).unwrap();

        assert!(matches!(
            registry.create("https://youtu.be/c", ttl()),
            Err(RegistryError::AtCapacity(2))
        ));

        // A terminal job frees a slot even before eviction.
        a.job.lock().unwrap().fail(
            ErrorInfo {
                kind: FailureKind::FatalInput,
                message: "bad".into(),
                detail: "bad".into(),
            },
            ttl(),
        );
        assert!(registry.create("https://youtu.be/c", ttl()).is_ok());
    }

    #[test]
    fn sweep_evicts_expired_terminal_jobs() {
        let registry = JobRegistry::new(4);
        let handle = registry.create("https://youtu.be/a", ttl()).unwrap();
        let id = handle.job.lock().unwrap().id;
        handle.job.lock().unwrap().fail(
            ErrorInfo {
                kind: FailureKind::TransientService,
                message: "boom".into(),
                detail: "boom".into(),
            },
            Duration::zero(),
        );

        let now = Utc::now() + Duration::seconds(1);
        let evicted = registry.sweep(now, |_| true);
        assert_eq!(evicted, vec![id]);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn sweep_skips_jobs_with_outstanding_artifacts_and_active_jobs() {
        let registry = JobRegistry::new(4);
        let active = registry.create("https://youtu.be/a", ttl()).unwrap();
        let active_id = active.job.lock().unwrap().id;

        let done = registry.create("https://youtu.be/b", ttl()).unwrap();
        let done_id = done.job.lock().unwrap().id;
        done.job.lock().unwrap().fail(
            ErrorInfo {
                kind: FailureKind::TransientService,
                message: "boom".into(),
                detail: "boom".into(),
            },
            Duration::zero(),
        );

        let now = Utc::now() + Duration::seconds(1);
        let evicted = registry.sweep(now, |_| false);
        assert!(evicted.is_empty());
        assert!(registry.get(done_id).is_some());
        assert!(registry.get(active_id).is_some());
    }

    #[test]
    fn sweep_reclaims_stuck_nonterminal_jobs_past_expiry() {
        let registry = JobRegistry::new(1);
        let stuck = registry.create("https://youtu.be/a", Duration::zero()).unwrap();
        let stuck_id = stuck.job.lock().unwrap().id;
        // The driver never reaches complete()/fail(); the job sits in Idle.
        assert!(!stuck.snapshot().state.is_terminal());

        let now = Utc::now() + Duration::seconds(1);
        assert_eq!(registry.expired(now), vec![stuck_id]);

        let evicted = registry.sweep(now, |_| true);
        assert_eq!(evicted, vec![stuck_id]);
        assert!(registry.get(stuck_id).is_none());

        // The admission slot is reclaimed.
        assert!(registry.create("https://youtu.be/b", Duration::hours(1)).is_ok());
    }

    #[test]
    fn sweep_marks_stuck_jobs_failed_while_artifacts_are_outstanding() {
        let registry = JobRegistry::new(1);
        let stuck = registry.create("https://youtu.be/a", Duration::zero()).unwrap();
        let stuck_id = stuck.job.lock().unwrap().id;

        // Outstanding artifacts block eviction, but the job is still failed so
        // it stops counting against admission.
        let evicted = registry.sweep(Utc::now() + Duration::seconds(1), |_| false);
        assert!(evicted.is_empty());
        let snap = registry.get(stuck_id).expect("job stays until artifacts release");
        assert_eq!(snap.state, JobState::Error);
        assert_eq!(snap.error.unwrap().kind, FailureKind::TransientService);
        assert!(registry.create("https://youtu.be/b", Duration::hours(1)).is_ok());
    }

    #[test]
    fn cancel_flag_is_visible_through_the_handle() {
        let registry = JobRegistry::new(4);
        let handle = registry.create("https://youtu.be/a", ttl()).unwrap();
        assert!(!handle.is_cancel_requested());
        handle.request_cancel();
        assert!(handle.is_cancel_requested());
    }
}
