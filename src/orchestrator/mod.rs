use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{fingerprint, FingerprintCache};
use crate::collaborators::Collaborators;
use crate::config::PipelineConfig;
use crate::job::{ContentPackage, ErrorInfo, JobSnapshot, SourceMetadata, Transcript, TranscriptSummary, Variant};
use crate::ledger::ResourceLedger;
use crate::persist::SnapshotStore;
use crate::registry::{JobHandle, JobRegistry, RegistryError};
use crate::stage::{AttemptOutcome, StageAttempt, StageError, StageExecutor};
use crate::ContentMillError;

/// A conversion request as accepted by `submit`.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub url: String,
}

/// Acknowledgement returned by `submit`.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub estimated_completion: DateTime<Utc>,
}

/// Public entry point of the pipeline: submit, poll, cancel.
///
/// Composes the registry, ledger, cache and stage executor, and drives each
/// admitted job through the ordered stages on its own tokio task. All stage
/// work happens off the submit path; poll is a pure read.
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    ledger: Arc<ResourceLedger>,
    cache: Arc<FingerprintCache>,
    executor: Arc<StageExecutor>,
    collab: Collaborators,
    pipeline: PipelineConfig,
    store: Option<SnapshotStore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        pipeline: PipelineConfig,
        collab: Collaborators,
        ledger: Arc<ResourceLedger>,
        store: Option<SnapshotStore>,
    ) -> Arc<Self> {
        let executor = Arc::new(StageExecutor::new(
            Duration::from_millis(pipeline.backoff_base_ms),
            Duration::from_millis(pipeline.backoff_cap_ms),
            pipeline.breaker_threshold,
            Duration::from_secs(pipeline.breaker_window_secs),
        ));
        Arc::new(Self {
            registry: Arc::new(JobRegistry::new(pipeline.max_active_jobs)),
            ledger,
            cache: Arc::new(FingerprintCache::new(pipeline.cache_ttl())),
            executor,
            collab,
            pipeline,
            store,
            sweeper: Mutex::new(None),
        })
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// Accept a submission and start driving it in the background.
    ///
    /// Only shape-level validation happens on the calling path; everything
    /// else is observable through `poll`.
    pub fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<JobTicket, ContentMillError> {
        let url = request.url.trim().to_string();
        if url.is_empty() {
            return Err(ContentMillError::InvalidRequest("URL must not be empty".to_string()));
        }

        let handle = self
            .registry
            .create(&url, self.pipeline.job_ttl())
            .map_err(|RegistryError::AtCapacity(_)| ContentMillError::SystemBusy)?;
        let job_id = handle.job.lock().unwrap().id;

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_job(handle).await;
        });

        Ok(JobTicket {
            job_id,
            estimated_completion: Utc::now() + ChronoDuration::seconds(self.pipeline.estimate_secs),
        })
    }

    /// Read-only status snapshot for pollers.
    pub fn poll(&self, job_id: Uuid) -> Result<JobSnapshot, ContentMillError> {
        self.registry.get(job_id).ok_or(ContentMillError::JobNotFound(job_id))
    }

    /// Request cancellation. Acknowledges immediately; the job observes the
    /// flag at its next stage boundary or retry attempt.
    pub fn cancel(&self, job_id: Uuid) -> Result<(), ContentMillError> {
        let handle = self
            .registry
            .handle(job_id)
            .ok_or(ContentMillError::JobNotFound(job_id))?;
        handle.request_cancel();
        tracing::info!(job_id = %job_id, "cancellation requested");
        Ok(())
    }

    /// Drive one job to a terminal state, then clean up.
    async fn run_job(self: Arc<Self>, handle: Arc<JobHandle>) {
        let job_id = handle.job.lock().unwrap().id;
        let outcome = self.drive(&handle).await;

        let retention = self.pipeline.job_ttl();
        {
            let mut job = handle.job.lock().unwrap();
            match outcome {
                Ok(package) => job.complete(package, retention),
                Err(err) => job.fail(
                    ErrorInfo {
                        kind: err.kind,
                        message: err.message,
                        detail: err.detail,
                    },
                    retention,
                ),
            }
        }

        // Cleanup runs on every exit path.
        self.ledger.release_all(job_id);

        if let Some(store) = &self.store {
            if let Err(e) = store.write(&handle.snapshot()) {
                tracing::warn!(job_id = %job_id, "failed to persist job snapshot: {:#}", e);
            }
        }
    }

    async fn drive(&self, handle: &Arc<JobHandle>) -> Result<ContentPackage, StageError> {
        let (job_id, url) = {
            let job = handle.job.lock().unwrap();
            (job.id, job.source_url.clone())
        };

        // Validating
        self.boundary(handle)?;
        handle.job.lock().unwrap().advance();
        let validator = self.collab.url.clone();
        let url_in = url.clone();
        let video = self
            .executor
            .execute(
                "validate",
                self.pipeline.validate_policy(),
                handle.cancel_flag(),
                |a| handle.job.lock().unwrap().record_attempt(a),
                move |_| {
                    let validator = validator.clone();
                    let url = url_in.clone();
                    async move { validator.validate(&url).await.map_err(StageError::from) }
                },
            )
            .await?;

        let transcript_key = fingerprint(&["transcript", &video.id]);
        let cached_transcript: Option<Transcript> = self
            .cache
            .get(&transcript_key, Utc::now())
            .and_then(|s| serde_json::from_str(&s).ok());

        let (transcript, metadata) = if let Some(transcript) = cached_transcript {
            tracing::info!(job_id = %job_id, video_id = %video.id, "transcript cache hit, skipping extraction");

            // ExtractingAudio and Transcribing are satisfied from the cache;
            // record zero-duration attempts so the history stays complete.
            for stage in ["extract", "transcribe"] {
                self.boundary(handle)?;
                let mut job = handle.job.lock().unwrap();
                job.advance();
                job.record_attempt(StageAttempt {
                    stage: stage.to_string(),
                    attempt: 1,
                    outcome: AttemptOutcome::Succeeded,
                    duration_ms: 0,
                });
            }

            let metadata = SourceMetadata {
                video_id: video.id.clone(),
                ..Default::default()
            };
            (transcript, metadata)
        } else {
            // ExtractingAudio
            self.boundary(handle)?;
            handle.job.lock().unwrap().advance();
            let extractor = self.collab.audio.clone();
            let video_in = video.clone();
            let extraction = self
                .executor
                .execute(
                    "extract",
                    self.pipeline.extract_policy(),
                    handle.cancel_flag(),
                    |a| handle.job.lock().unwrap().record_attempt(a),
                    move |_| {
                        let extractor = extractor.clone();
                        let video = video_in.clone();
                        async move { extractor.extract(job_id, &video).await.map_err(StageError::from) }
                    },
                )
                .await?;

            // Transcribing
            self.boundary(handle)?;
            handle.job.lock().unwrap().advance();
            let provider = self.collab.transcription.clone();
            let audio = extraction.audio.clone();
            let transcript = self
                .executor
                .execute(
                    "transcribe",
                    self.pipeline.transcribe_policy(),
                    handle.cancel_flag(),
                    |a| handle.job.lock().unwrap().record_attempt(a),
                    move |_| {
                        let provider = provider.clone();
                        let audio = audio.clone();
                        async move { provider.transcribe(&audio).await.map_err(StageError::from) }
                    },
                )
                .await?;

            // The audio artifact is no longer needed once transcribed.
            self.ledger.release(&extraction.audio);

            if let Ok(serialized) = serde_json::to_string(&transcript) {
                self.cache.put(&transcript_key, serialized, Utc::now());
            }

            (transcript, extraction.metadata)
        };

        // GeneratingContent: the three variants run concurrently and are
        // joined; any exhausted variant fails the whole job.
        self.boundary(handle)?;
        handle.job.lock().unwrap().advance();

        let transcript = Arc::new(transcript);
        let completed = Arc::new(AtomicUsize::new(0));

        let generate = |variant: Variant| {
            let generator = self.collab.generator.clone();
            let executor = self.executor.clone();
            let cache = self.cache.clone();
            let policy = self.pipeline.generate_policy();
            let handle = handle.clone();
            let transcript = transcript.clone();
            let metadata = metadata.clone();
            let key = fingerprint(&["variant", variant.as_str(), &video.id]);
            let completed = completed.clone();

            async move {
                let stage_name = format!("generate-{}", variant.as_str());
                let text = match cache.get(&key, Utc::now()) {
                    Some(hit) => {
                        tracing::debug!(variant = %variant, "variant cache hit");
                        handle.job.lock().unwrap().record_attempt(StageAttempt {
                            stage: stage_name.clone(),
                            attempt: 1,
                            outcome: AttemptOutcome::Succeeded,
                            duration_ms: 0,
                        });
                        hit
                    }
                    None => {
                        let text = executor
                            .execute(
                                &stage_name,
                                policy,
                                handle.cancel_flag(),
                                |a| handle.job.lock().unwrap().record_attempt(a),
                                move |_| {
                                    let generator = generator.clone();
                                    let transcript = transcript.clone();
                                    let metadata = metadata.clone();
                                    async move {
                                        generator
                                            .generate(variant, &transcript, &metadata)
                                            .await
                                            .map_err(StageError::from)
                                    }
                                },
                            )
                            .await?;
                        cache.put(&key, text.clone(), Utc::now());
                        text
                    }
                };

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                handle
                    .job
                    .lock()
                    .unwrap()
                    .set_stage_progress(done as f64 / Variant::ALL.len() as f64);
                Ok::<(Variant, String), StageError>((variant, text))
            }
        };

        let (blog, thread, linkedin) = tokio::join!(
            generate(Variant::Blog),
            generate(Variant::TwitterThread),
            generate(Variant::Linkedin),
        );

        let mut variants = BTreeMap::new();
        for result in [blog, thread, linkedin] {
            let (variant, text) = result?;
            variants.insert(variant, text);
        }

        // A cancellation that raced the final joins still discards the results.
        self.boundary(handle)?;

        Ok(ContentPackage {
            transcript: TranscriptSummary::from(transcript.as_ref()),
            source: metadata,
            variants,
        })
    }

    fn boundary(&self, handle: &JobHandle) -> Result<(), StageError> {
        if handle.is_cancel_requested() {
            Err(StageError::cancelled())
        } else {
            Ok(())
        }
    }

    /// One pass of expiry housekeeping: artifacts first, then registry, then cache.
    pub fn sweep_once(&self, now: DateTime<Utc>) {
        let expired = self.registry.expired(now);
        if !expired.is_empty() {
            self.ledger.sweep(&expired);
        }
        self.registry.sweep(now, |id| self.ledger.outstanding(id) == 0);
        self.cache.evict_expired(now);
    }

    /// Start the background sweep on its configured interval.
    pub fn start_sweeper(self: &Arc<Self>) {
        let orchestrator = self.clone();
        let interval = Duration::from_secs(self.pipeline.sweep_interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                orchestrator.sweep_once(Utc::now());
            }
        });
        *self.sweeper.lock().unwrap() = Some(task);
    }

    /// Stop the sweeper, persist snapshots of everything still registered,
    /// and release every artifact.
    pub fn shutdown(&self) {
        if let Some(task) = self.sweeper.lock().unwrap().take() {
            task.abort();
        }
        if let Some(store) = &self.store {
            for handle in self.registry.handles() {
                let snapshot = handle.snapshot();
                if let Err(e) = store.write(&snapshot) {
                    tracing::warn!(job_id = %snapshot.id, "failed to persist snapshot at shutdown: {:#}", e);
                }
            }
        }
        self.ledger.shutdown_sweep();
        tracing::info!("orchestrator shut down");
    }
}
