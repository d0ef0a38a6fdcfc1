use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_transcribe::types::{LanguageCode, Media, MediaFormat, TranscriptionJob, TranscriptionJobStatus};
use aws_sdk_transcribe::Client as TranscribeClient;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use super::{TranscribeError, TranscriptionProvider};
use crate::config::AwsConfig;
use crate::job::{Transcript, TranscriptSegment};
use crate::ledger::ArtifactHandle;

/// AWS Transcribe transcript format (the parts we consume)
#[derive(Debug, Deserialize)]
struct AwsTranscript {
    results: TranscriptResults,
}

#[derive(Debug, Deserialize)]
struct TranscriptResults {
    transcripts: Vec<TranscriptText>,
    items: Vec<TranscriptItem>,
}

#[derive(Debug, Deserialize)]
struct TranscriptText {
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptItem {
    start_time: Option<String>,
    end_time: Option<String>,
    #[serde(rename = "type")]
    item_type: String,
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    confidence: Option<String>,
    content: String,
}

/// Transcription via S3 upload + AWS Transcribe.
///
/// One call covers the whole round trip: upload, start job, poll with a
/// growing delay, fetch and parse the transcript, delete the S3 object. The
/// per-attempt timeout around this call belongs to the stage executor.
pub struct AwsTranscriptionProvider {
    s3_client: S3Client,
    transcribe_client: TranscribeClient,
    config: AwsConfig,
}

impl AwsTranscriptionProvider {
    pub fn new(aws_config: &aws_config::SdkConfig, config: AwsConfig) -> Self {
        Self {
            s3_client: S3Client::new(aws_config),
            transcribe_client: TranscribeClient::new(aws_config),
            config,
        }
    }

    async fn upload_to_s3(&self, audio: &ArtifactHandle) -> Result<String, TranscribeError> {
        let key = format!(
            "{}audio_{}.mp3",
            self.config.s3_key_prefix.as_deref().unwrap_or(""),
            Uuid::new_v4(),
        );

        tracing::info!("Uploading audio to S3: s3://{}/{}", self.config.s3_bucket, key);

        let content = fs_err::read(&audio.path).map_err(|e| TranscribeError::AudioUnreadable {
            detail: format!("cannot read audio artifact: {}", e),
        })?;

        self.s3_client
            .put_object()
            .bucket(&self.config.s3_bucket)
            .key(&key)
            .body(content.into())
            .content_type("audio/mpeg")
            .send()
            .await
            .map_err(|e| TranscribeError::ServiceUnavailable {
                detail: format!("S3 upload failed: {}", e),
            })?;

        Ok(key)
    }

    async fn start_job(&self, s3_key: &str) -> Result<String, TranscribeError> {
        let job_name = format!("contentmill_{}", Uuid::new_v4());
        let media_uri = format!("s3://{}/{}", self.config.s3_bucket, s3_key);

        tracing::info!("Starting transcription job: {}", job_name);

        let media = Media::builder().media_file_uri(media_uri).build();

        let mut job_builder = self
            .transcribe_client
            .start_transcription_job()
            .transcription_job_name(&job_name)
            .media_format(MediaFormat::Mp3)
            .media(media);

        if let Some(lang) = &self.config.language {
            job_builder = job_builder.language_code(LanguageCode::from(lang.as_str()));
        } else {
            job_builder = job_builder.identify_language(true);
        }

        job_builder
            .send()
            .await
            .map_err(|e| TranscribeError::ServiceUnavailable {
                detail: format!("failed to start transcription job: {}", e),
            })?;

        Ok(job_name)
    }

    async fn wait_for_completion(&self, job_name: &str) -> Result<TranscriptionJob, TranscribeError> {
        let mut check_count = 0u64;
        loop {
            check_count += 1;
            let job = self.get_job(job_name).await?;

            match job.transcription_job_status() {
                Some(TranscriptionJobStatus::InProgress) | Some(TranscriptionJobStatus::Queued) => {
                    // Growing delay up to 30 seconds between status checks
                    let wait = std::cmp::min(5 + (check_count - 1) * 2, 30);
                    sleep(Duration::from_secs(wait)).await;
                }
                Some(TranscriptionJobStatus::Completed) => return Ok(job),
                Some(TranscriptionJobStatus::Failed) => {
                    let reason = job.failure_reason().unwrap_or("unknown").to_string();
                    return Err(Self::classify_failure(reason));
                }
                _ => {
                    return Err(TranscribeError::ServiceUnavailable {
                        detail: "unexpected transcription job status".to_string(),
                    })
                }
            }
        }
    }

    /// Failures about the media itself are fatal; everything else can be retried.
    fn classify_failure(reason: String) -> TranscribeError {
        let lower = reason.to_lowercase();
        let media_problem = ["media format", "sample rate", "decode", "corrupt", "invalid file", "unsupported"]
            .iter()
            .any(|s| lower.contains(s));
        if media_problem {
            TranscribeError::AudioUnreadable { detail: reason }
        } else {
            TranscribeError::ServiceUnavailable { detail: reason }
        }
    }

    async fn get_job(&self, job_name: &str) -> Result<TranscriptionJob, TranscribeError> {
        let response = self
            .transcribe_client
            .get_transcription_job()
            .transcription_job_name(job_name)
            .send()
            .await
            .map_err(|e| TranscribeError::ServiceUnavailable {
                detail: format!("failed to get transcription job status: {}", e),
            })?;

        response
            .transcription_job()
            .cloned()
            .ok_or_else(|| TranscribeError::ServiceUnavailable {
                detail: "transcription job not found".to_string(),
            })
    }

    async fn fetch_transcript(&self, job: &TranscriptionJob) -> Result<Transcript, TranscribeError> {
        let uri = job
            .transcript()
            .and_then(|t| t.transcript_file_uri())
            .ok_or_else(|| TranscribeError::ServiceUnavailable {
                detail: "no transcript URI on completed job".to_string(),
            })?;

        let response = reqwest::get(uri).await.map_err(|e| TranscribeError::ServiceUnavailable {
            detail: format!("failed to download transcript: {}", e),
        })?;
        if !response.status().is_success() {
            return Err(TranscribeError::ServiceUnavailable {
                detail: format!("transcript download returned HTTP {}", response.status()),
            });
        }
        let body = response.text().await.map_err(|e| TranscribeError::ServiceUnavailable {
            detail: format!("failed to read transcript body: {}", e),
        })?;

        let language = job
            .language_code()
            .map(|lc| lc.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        parse_transcript(&body, language)
    }

    async fn cleanup_s3(&self, s3_key: &str) {
        tracing::debug!("Cleaning up S3 object: {}", s3_key);
        if let Err(e) = self
            .s3_client
            .delete_object()
            .bucket(&self.config.s3_bucket)
            .key(s3_key)
            .send()
            .await
        {
            tracing::warn!("failed to clean up S3 object {}: {}", s3_key, e);
        }
    }
}

/// Parse the AWS transcript JSON into our transcript shape.
///
/// Pronunciation items are grouped into segments, split on sentence-ending
/// punctuation or a silence gap longer than one second.
fn parse_transcript(body: &str, language: String) -> Result<Transcript, TranscribeError> {
    let aws: AwsTranscript = serde_json::from_str(body).map_err(|e| TranscribeError::ServiceUnavailable {
        detail: format!("unparsable transcript JSON: {}", e),
    })?;

    let text = aws
        .results
        .transcripts
        .first()
        .map(|t| t.transcript.clone())
        .unwrap_or_default();

    let mut segments: Vec<TranscriptSegment> = Vec::new();
    let mut current_text = String::new();
    let mut current_start: Option<f64> = None;
    let mut current_end: Option<f64> = None;
    let mut confidences: Vec<f64> = Vec::new();

    let mut flush = |text: &mut String, start: &mut Option<f64>, end: &mut Option<f64>, confs: &mut Vec<f64>, out: &mut Vec<TranscriptSegment>| {
        if let (Some(s), Some(e)) = (*start, *end) {
            if !text.trim().is_empty() {
                out.push(TranscriptSegment {
                    start_time: s,
                    end_time: e,
                    text: text.trim().to_string(),
                    confidence: average(confs),
                });
            }
        }
        text.clear();
        *start = None;
        *end = None;
        confs.clear();
    };

    for item in &aws.results.items {
        match item.item_type.as_str() {
            "pronunciation" => {
                let start = item.start_time.as_deref().and_then(|s| s.parse::<f64>().ok());
                let end = item.end_time.as_deref().and_then(|s| s.parse::<f64>().ok());
                let word = item.alternatives.first().map(|a| a.content.as_str()).unwrap_or("");
                let confidence = item
                    .alternatives
                    .first()
                    .and_then(|a| a.confidence.as_deref())
                    .and_then(|c| c.parse::<f64>().ok());

                let gap = start
                    .zip(current_end)
                    .map(|(s, e)| s - e > 1.0)
                    .unwrap_or(false);
                if gap {
                    flush(&mut current_text, &mut current_start, &mut current_end, &mut confidences, &mut segments);
                }

                if current_start.is_none() {
                    current_start = start;
                }
                if !current_text.is_empty() {
                    current_text.push(' ');
                }
                current_text.push_str(word);
                current_end = end.or(current_end);
                if let Some(c) = confidence {
                    confidences.push(c);
                }
            }
            "punctuation" => {
                if let Some(alt) = item.alternatives.first() {
                    current_text.push_str(&alt.content);
                    if matches!(alt.content.as_str(), "." | "!" | "?") {
                        flush(&mut current_text, &mut current_start, &mut current_end, &mut confidences, &mut segments);
                    }
                }
            }
            _ => {}
        }
    }
    flush(&mut current_text, &mut current_start, &mut current_end, &mut confidences, &mut segments);

    let overall: Vec<f64> = segments.iter().filter_map(|s| s.confidence).collect();
    Ok(Transcript {
        text,
        confidence: average(&overall),
        segments,
        language,
    })
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[async_trait]
impl TranscriptionProvider for AwsTranscriptionProvider {
    async fn transcribe(&self, audio: &ArtifactHandle) -> Result<Transcript, TranscribeError> {
        let s3_key = self.upload_to_s3(audio).await?;

        let result = async {
            let job_name = self.start_job(&s3_key).await?;
            let job = self.wait_for_completion(&job_name).await?;
            self.fetch_transcript(&job).await
        }
        .await;

        // The S3 object is removed on every path, success or failure.
        self.cleanup_s3(&s3_key).await;
        result
    }
}
