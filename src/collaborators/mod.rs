use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub mod audio;
pub mod generation;
pub mod transcription;
pub mod url;

use crate::config::Config;
use crate::job::{SourceMetadata, Transcript, Variant};
use crate::ledger::{ArtifactHandle, ResourceLedger};
use crate::stage::StageError;

/// Canonical identity of a validated video source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoId {
    pub id: String,
    pub canonical_url: String,
}

/// Result of the audio-extraction stage: the owned artifact plus whatever
/// source metadata the probe surfaced.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub audio: ArtifactHandle,
    pub metadata: SourceMetadata,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("unsupported URL format: {url}")]
    InvalidFormat { url: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("video runs {minutes:.1} minutes, limit is {limit} minutes")]
    TooLong { minutes: f64, limit: u32 },

    #[error("source unavailable: {detail}")]
    SourceUnavailable { detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    #[error("audio unreadable: {detail}")]
    AudioUnreadable { detail: String },

    #[error("transcription service unavailable: {detail}")]
    ServiceUnavailable { detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("generation service unavailable: {detail}")]
    ServiceUnavailable { detail: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("transcript rejected: {detail}")]
    InvalidTranscript { detail: String },
}

impl From<ValidateError> for StageError {
    fn from(err: ValidateError) -> Self {
        StageError::fatal(
            "Unsupported or malformed video URL, check the link and resubmit",
            err.to_string(),
        )
    }
}

impl From<ExtractError> for StageError {
    fn from(err: ExtractError) -> Self {
        match &err {
            ExtractError::TooLong { .. } => StageError::fatal(
                "Video exceeds the supported length, try a shorter video",
                err.to_string(),
            ),
            ExtractError::SourceUnavailable { .. } => StageError::transient(
                "Could not reach the video source, try again later",
                err.to_string(),
            ),
        }
    }
}

impl From<TranscribeError> for StageError {
    fn from(err: TranscribeError) -> Self {
        match &err {
            TranscribeError::AudioUnreadable { .. } => StageError::fatal(
                "The extracted audio could not be transcribed",
                err.to_string(),
            ),
            TranscribeError::ServiceUnavailable { .. } => StageError::transient(
                "Transcription service is unavailable, try again later",
                err.to_string(),
            ),
        }
    }
}

impl From<GenerateError> for StageError {
    fn from(err: GenerateError) -> Self {
        match &err {
            GenerateError::InvalidTranscript { .. } => StageError::fatal(
                "The transcript could not be turned into content",
                err.to_string(),
            ),
            GenerateError::ServiceUnavailable { .. } | GenerateError::RateLimited { .. } => {
                StageError::transient(
                    "Content generation is temporarily unavailable, try again later",
                    err.to_string(),
                )
            }
        }
    }
}

/// Resolves a raw URL into a canonical video identity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UrlValidator: Send + Sync {
    async fn validate(&self, url: &str) -> Result<VideoId, ValidateError>;
}

/// Produces an audio artifact (owned by `job_id`) for a validated video.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    async fn extract(&self, job_id: Uuid, video: &VideoId) -> Result<Extraction, ExtractError>;
}

/// Turns an audio artifact into a transcript.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn transcribe(&self, audio: &ArtifactHandle) -> Result<Transcript, TranscribeError>;
}

/// Generates one content variant from a transcript.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        variant: Variant,
        transcript: &Transcript,
        metadata: &SourceMetadata,
    ) -> Result<String, GenerateError>;
}

/// The set of external collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub url: Arc<dyn UrlValidator>,
    pub audio: Arc<dyn AudioExtractor>,
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub generator: Arc<dyn ContentGenerator>,
}

impl Collaborators {
    /// Build the production collaborator set from configuration.
    pub async fn from_config(config: &Config, ledger: Arc<ResourceLedger>) -> crate::Result<Self> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(config.aws_region())
            .load()
            .await;

        Ok(Self {
            url: Arc::new(url::YoutubeUrlValidator::new()),
            audio: Arc::new(audio::YtDlpAudioExtractor::new(
                ledger,
                config.pipeline.max_video_duration_minutes,
            )),
            transcription: Arc::new(transcription::AwsTranscriptionProvider::new(
                &aws_config,
                config.aws.clone(),
            )),
            generator: Arc::new(generation::HttpContentGenerator::new(
                config.generation.clone(),
            )?),
        })
    }
}
