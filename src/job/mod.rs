use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::stage::{FailureKind, StageAttempt};

/// Pipeline states, in execution order.
///
/// `Complete` and `Error` are terminal; `Error` is reachable from every
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Idle,
    Validating,
    ExtractingAudio,
    Transcribing,
    GeneratingContent,
    Complete,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }

    /// The state entered when this one succeeds.
    pub fn next(&self) -> Option<JobState> {
        match self {
            JobState::Idle => Some(JobState::Validating),
            JobState::Validating => Some(JobState::ExtractingAudio),
            JobState::ExtractingAudio => Some(JobState::Transcribing),
            JobState::Transcribing => Some(JobState::GeneratingContent),
            JobState::GeneratingContent => Some(JobState::Complete),
            JobState::Complete | JobState::Error => None,
        }
    }

    /// Fixed share of overall progress attributed to this state.
    pub fn weight(&self) -> f64 {
        match self {
            JobState::Idle => 0.0,
            JobState::Validating => 0.02,
            JobState::ExtractingAudio => 0.18,
            JobState::Transcribing => 0.50,
            JobState::GeneratingContent => 0.30,
            JobState::Complete | JobState::Error => 0.0,
        }
    }

    /// Sum of the weights of all states completed before this one.
    pub fn completed_weight(&self) -> f64 {
        match self {
            JobState::Idle | JobState::Validating => 0.0,
            JobState::ExtractingAudio => 0.02,
            JobState::Transcribing => 0.20,
            JobState::GeneratingContent => 0.70,
            JobState::Complete | JobState::Error => 1.0,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Validating => "validating",
            JobState::ExtractingAudio => "extracting-audio",
            JobState::Transcribing => "transcribing",
            JobState::GeneratingContent => "generating-content",
            JobState::Complete => "complete",
            JobState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// The fixed set of supported content variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    Blog,
    TwitterThread,
    Linkedin,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Blog, Variant::TwitterThread, Variant::Linkedin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Blog => "blog",
            Variant::TwitterThread => "twitter-thread",
            Variant::Linkedin => "linkedin",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Individual transcript segment with timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds
    pub start_time: f64,

    /// End time in seconds
    pub end_time: f64,

    /// Segment text
    pub text: String,

    /// Confidence score (0.0 to 1.0)
    pub confidence: Option<f64>,
}

/// A full transcription produced by the transcription provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// The transcribed text
    pub text: String,

    /// Overall confidence score
    pub confidence: Option<f64>,

    /// Segments with timestamps (if available)
    pub segments: Vec<TranscriptSegment>,

    /// Language detected/used
    pub language: String,
}

/// Source video metadata captured during extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub video_id: String,
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
}

/// Condensed transcript view carried in a job's success result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSummary {
    pub text: String,
    pub confidence: Option<f64>,
    pub language: String,
    pub word_count: usize,
}

impl From<&Transcript> for TranscriptSummary {
    fn from(t: &Transcript) -> Self {
        Self {
            text: t.text.clone(),
            confidence: t.confidence,
            language: t.language.clone(),
            word_count: t.text.split_whitespace().count(),
        }
    }
}

/// The success result of a job: the transcript plus all generated variants.
///
/// Values are immutable once produced; a package is only ever surfaced whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPackage {
    pub transcript: TranscriptSummary,
    pub source: SourceMetadata,
    pub variants: BTreeMap<Variant, String>,
}

/// Terminal failure description.
///
/// `message` is the actionable user-facing text; `detail` is operator-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub message: String,
    pub detail: String,
}

/// One submission's lifecycle record.
///
/// A job has exactly one writer (its driver task); everyone else reads
/// snapshots. All transitions go through the methods below, which maintain the
/// invariants: progress never decreases, stage history never shrinks, and
/// exactly one of `result`/`error_info` is set once a terminal state is
/// reached.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub source_url: String,
    state: JobState,
    progress: f64,
    stage_history: Vec<StageAttempt>,
    result: Option<ContentPackage>,
    error_info: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Job {
    pub fn new(source_url: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            state: JobState::Idle,
            progress: 0.0,
            stage_history: Vec::new(),
            result: None,
            error_info: None,
            created_at: now,
            last_updated_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn result(&self) -> Option<&ContentPackage> {
        self.result.as_ref()
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.error_info.as_ref()
    }

    pub fn stage_history(&self) -> &[StageAttempt] {
        &self.stage_history
    }

    /// Advance to the successor of the current state.
    ///
    /// No-op once terminal. Global progress jumps to the completed weight of
    /// the new state, which is always >= the previous value.
    pub fn advance(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(next) = self.state.next() {
            tracing::debug!(job_id = %self.id, from = %self.state, to = %next, "state transition");
            self.state = next;
            self.progress = self.progress.max(next.completed_weight().min(1.0));
            self.touch();
        }
    }

    /// Report fractional completion of the current state, in [0,1].
    ///
    /// The global progress value only ever moves forward.
    pub fn set_stage_progress(&mut self, fraction: f64) {
        if self.state.is_terminal() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let candidate = self.state.completed_weight() + self.state.weight() * fraction;
        if candidate > self.progress {
            self.progress = candidate.min(1.0);
            self.touch();
        }
    }

    pub fn record_attempt(&mut self, attempt: StageAttempt) {
        self.stage_history.push(attempt);
        self.touch();
    }

    /// Terminal success. Ignored if the job is already terminal.
    pub fn complete(&mut self, package: ContentPackage, retention: Duration) {
        if self.state.is_terminal() {
            return;
        }
        self.state = JobState::Complete;
        self.progress = 1.0;
        self.result = Some(package);
        self.touch();
        self.expires_at = self.last_updated_at + retention;
        tracing::info!(job_id = %self.id, "job complete");
    }

    /// Terminal failure. Ignored if the job is already terminal.
    pub fn fail(&mut self, error: ErrorInfo, retention: Duration) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!(job_id = %self.id, kind = error.kind.as_str(), "job failed: {}", error.detail);
        self.state = JobState::Error;
        self.error_info = Some(error);
        self.touch();
        self.expires_at = self.last_updated_at + retention;
    }

    /// Immutable copy of the current state for readers.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            source_url: self.source_url.clone(),
            state: self.state,
            progress: self.progress,
            current_stage: if self.state.is_terminal() {
                None
            } else {
                Some(self.state.to_string())
            },
            stage_history: self.stage_history.clone(),
            result: self.result.clone(),
            error: self.error_info.clone(),
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            expires_at: self.expires_at,
        }
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

/// Read-only view of a job, safe to hand to pollers and to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub source_url: String,
    pub state: JobState,
    pub progress: f64,
    pub current_stage: Option<String>,
    pub stage_history: Vec<StageAttempt>,
    pub result: Option<ContentPackage>,
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{AttemptOutcome, FailureKind};

    fn sample_package() -> ContentPackage {
        let transcript = Transcript {
            text: "hello world".to_string(),
            confidence: Some(0.98),
            segments: Vec::new(),
            language: "en-US".to_string(),
        };
        let mut variants = BTreeMap::new();
        for v in Variant::ALL {
            variants.insert(v, format!("{} content", v));
        }
        ContentPackage {
            transcript: TranscriptSummary::from(&transcript),
            source: SourceMetadata::default(),
            variants,
        }
    }

    #[test]
    fn state_weights_cover_the_whole_pipeline() {
        let total: f64 = [
            JobState::Validating,
            JobState::ExtractingAudio,
            JobState::Transcribing,
            JobState::GeneratingContent,
        ]
        .iter()
        .map(|s| s.weight())
        .sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(JobState::GeneratingContent.completed_weight(), 0.70);
    }

    #[test]
    fn progress_is_monotone_across_transitions_and_fractions() {
        let mut job = Job::new("https://youtu.be/abc123xyz00", Duration::hours(1));
        let mut last = job.progress();

        while !job.state().is_terminal() && job.state() != JobState::GeneratingContent {
            job.advance();
            for f in [0.25, 0.5, 0.1, 0.9] {
                job.set_stage_progress(f);
                assert!(job.progress() >= last, "progress decreased");
                last = job.progress();
            }
        }
        job.complete(sample_package(), Duration::hours(1));
        assert_eq!(job.progress(), 1.0);
        assert_eq!(job.state(), JobState::Complete);
    }

    #[test]
    fn progress_reaches_one_only_on_complete() {
        let mut job = Job::new("https://youtu.be/abc123xyz00", Duration::hours(1));
        job.advance();
        job.advance();
        job.set_stage_progress(1.0);
        assert!(job.progress() < 1.0);
        job.fail(
            ErrorInfo {
                kind: FailureKind::TransientService,
                message: "boom".into(),
                detail: "boom".into(),
            },
            Duration::hours(1),
        );
        assert!(job.progress() < 1.0);
        assert_eq!(job.state(), JobState::Error);
    }

    #[test]
    fn terminal_state_sets_exactly_one_of_result_or_error() {
        let mut job = Job::new("https://youtu.be/abc123xyz00", Duration::hours(1));
        job.complete(sample_package(), Duration::hours(1));
        assert!(job.result().is_some());
        assert!(job.error_info().is_none());

        // A later failure must not overwrite the committed result.
        job.fail(
            ErrorInfo {
                kind: FailureKind::Cancelled,
                message: "late".into(),
                detail: "late".into(),
            },
            Duration::hours(1),
        );
        assert_eq!(job.state(), JobState::Complete);
        assert!(job.result().is_some());
        assert!(job.error_info().is_none());
    }

    #[test]
    fn stage_history_is_append_only() {
        let mut job = Job::new("https://youtu.be/abc123xyz00", Duration::hours(1));
        for attempt in 1..=3 {
            job.record_attempt(StageAttempt {
                stage: "transcribe".into(),
                attempt,
                outcome: AttemptOutcome::Failed(FailureKind::TransientService),
                duration_ms: 10,
            });
        }
        assert_eq!(job.stage_history().len(), 3);
        assert_eq!(job.stage_history()[2].attempt, 3);
    }

    #[test]
    fn snapshot_serializes_states_and_variant_keys_as_kebab_case() {
        let mut job = Job::new("https://youtu.be/abc123xyz00", Duration::hours(1));
        job.advance();
        job.advance();
        let json = serde_json::to_string(&job.snapshot()).unwrap();
        assert!(json.contains("\"state\":\"extracting-audio\""));

        job.complete(sample_package(), Duration::hours(1));
        let json = serde_json::to_string(&job.snapshot()).unwrap();
        assert!(json.contains("twitter-thread"));
        assert!(json.contains("\"state\":\"complete\""));
    }
}
