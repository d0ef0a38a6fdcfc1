use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use uuid::Uuid;

use super::{AudioExtractor, ExtractError, Extraction, VideoId};
use crate::job::SourceMetadata;
use crate::ledger::ResourceLedger;

/// Extracts audio with yt-dlp into the ledger's workspace.
///
/// The probe step enforces the duration limit before any bytes are downloaded,
/// so over-long videos fail fast without creating an artifact.
pub struct YtDlpAudioExtractor {
    yt_dlp_path: String,
    ledger: Arc<ResourceLedger>,
    max_duration_minutes: u32,
}

impl YtDlpAudioExtractor {
    pub fn new(ledger: Arc<ResourceLedger>, max_duration_minutes: u32) -> Self {
        Self {
            yt_dlp_path: "yt-dlp".to_string(),
            ledger,
            max_duration_minutes,
        }
    }

    /// Probe video metadata without downloading.
    async fn probe(&self, video: &VideoId) -> Result<SourceMetadata, ExtractError> {
        tracing::debug!(video_id = %video.id, "probing video metadata");

        let output = Command::new(&self.yt_dlp_path)
            .args(["--dump-json", "--no-playlist", &video.canonical_url])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExtractError::SourceUnavailable {
                detail: format!("failed to run yt-dlp: {}", e),
            })?;

        if !output.status.success() {
            return Err(ExtractError::SourceUnavailable {
                detail: format!("yt-dlp probe failed: {}", String::from_utf8_lossy(&output.stderr)),
            });
        }

        let info: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            ExtractError::SourceUnavailable {
                detail: format!("unparsable yt-dlp output: {}", e),
            }
        })?;

        Ok(SourceMetadata {
            video_id: video.id.clone(),
            title: info["title"].as_str().map(|s| s.to_string()),
            duration_secs: info["duration"].as_f64(),
        })
    }

    fn check_duration(&self, metadata: &SourceMetadata) -> Result<(), ExtractError> {
        if let Some(duration) = metadata.duration_secs {
            let minutes = duration / 60.0;
            if minutes > self.max_duration_minutes as f64 {
                return Err(ExtractError::TooLong {
                    minutes,
                    limit: self.max_duration_minutes,
                });
            }
        }
        Ok(())
    }

    async fn download(&self, video: &VideoId, output_path: &std::path::Path) -> Result<(), ExtractError> {
        tracing::info!(video_id = %video.id, path = %output_path.display(), "downloading audio");

        let output = Command::new(&self.yt_dlp_path)
            .args([
                "--output", &output_path.to_string_lossy(),
                // Lowest-bitrate mp3 is plenty for transcription
                "--extract-audio",
                "--audio-format", "mp3",
                "--audio-quality", "9",
                "--format", "worstaudio[acodec^=mp4a]/worstaudio[ext=m4a]/worstaudio[ext=mp3]/worstaudio",
                "--no-playlist",
                "--concurrent-fragments", "4",
                "--newline",
                &video.canonical_url,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExtractError::SourceUnavailable {
                detail: format!("failed to run yt-dlp: {}", e),
            })?;

        if !output.status.success() {
            return Err(ExtractError::SourceUnavailable {
                detail: format!("yt-dlp download failed: {}", String::from_utf8_lossy(&output.stderr)),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AudioExtractor for YtDlpAudioExtractor {
    async fn extract(&self, job_id: Uuid, video: &VideoId) -> Result<Extraction, ExtractError> {
        let metadata = self.probe(video).await?;
        self.check_duration(&metadata)?;

        let path = self
            .ledger
            .workspace_path()
            .join(format!("audio_{}_{}.mp3", video.id, &job_id.to_string()[..8]));
        self.download(video, &path).await?;

        let size_bytes = fs_err::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| ExtractError::SourceUnavailable {
                detail: format!("downloaded file missing: {}", e),
            })?;

        let audio = self.ledger.register(job_id, path, size_bytes);
        Ok(Extraction { audio, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(limit: u32) -> YtDlpAudioExtractor {
        YtDlpAudioExtractor::new(Arc::new(ResourceLedger::new().unwrap()), limit)
    }

    fn metadata(duration_secs: Option<f64>) -> SourceMetadata {
        SourceMetadata {
            video_id: "dQw4w9WgXcQ".into(),
            title: Some("test".into()),
            duration_secs,
        }
    }

    #[test]
    fn over_long_video_is_rejected_as_fatal() {
        let err = extractor(60).check_duration(&metadata(Some(61.0 * 60.0))).unwrap_err();
        assert!(matches!(err, ExtractError::TooLong { limit: 60, .. }));
    }

    #[test]
    fn videos_within_the_limit_pass() {
        assert!(extractor(60).check_duration(&metadata(Some(59.0 * 60.0))).is_ok());
        // Unknown duration is allowed through; the probe could not tell.
        assert!(extractor(60).check_duration(&metadata(None)).is_ok());
    }
}
