use async_trait::async_trait;
use url::Url;

use super::{UrlValidator, ValidateError, VideoId};

/// Resolves the common YouTube URL shapes into a canonical video id.
pub struct YoutubeUrlValidator;

impl YoutubeUrlValidator {
    pub fn new() -> Self {
        Self
    }

    fn extract_id(url: &Url) -> Option<String> {
        let host = url.host_str()?.trim_start_matches("www.");

        let candidate = match host {
            "youtu.be" => url.path_segments()?.next().map(|s| s.to_string()),
            "youtube.com" | "m.youtube.com" | "music.youtube.com" => {
                let mut segments = url.path_segments()?;
                match segments.next() {
                    Some("watch") => url
                        .query_pairs()
                        .find(|(k, _)| k == "v")
                        .map(|(_, v)| v.into_owned()),
                    Some("embed") | Some("shorts") | Some("v") | Some("live") => {
                        segments.next().map(|s| s.to_string())
                    }
                    _ => None,
                }
            }
            _ => None,
        }?;

        Self::valid_id(&candidate).then_some(candidate)
    }

    fn valid_id(id: &str) -> bool {
        (6..=20).contains(&id.len())
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for YoutubeUrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UrlValidator for YoutubeUrlValidator {
    async fn validate(&self, url: &str) -> Result<VideoId, ValidateError> {
        let invalid = || ValidateError::InvalidFormat { url: url.to_string() };

        let parsed = Url::parse(url.trim()).map_err(|_| invalid())?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid());
        }

        let id = Self::extract_id(&parsed).ok_or_else(invalid)?;
        tracing::debug!(video_id = %id, "URL validated");
        Ok(VideoId {
            canonical_url: format!("https://www.youtube.com/watch?v={}", id),
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn id_of(url: &str) -> Option<String> {
        YoutubeUrlValidator::new().validate(url).await.ok().map(|v| v.id)
    }

    #[tokio::test]
    async fn accepts_common_youtube_forms() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            assert_eq!(id_of(url).await.as_deref(), Some("dQw4w9WgXcQ"), "url: {}", url);
        }
    }

    #[tokio::test]
    async fn canonical_url_is_the_watch_form() {
        let video = YoutubeUrlValidator::new()
            .validate("https://youtu.be/dQw4w9WgXcQ")
            .await
            .unwrap();
        assert_eq!(video.canonical_url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[tokio::test]
    async fn rejects_non_youtube_and_malformed_input() {
        for url in [
            "",
            "not-a-url",
            "ftp://youtube.com/watch?v=dQw4w9WgXcQ",
            "https://vimeo.com/12345",
            "https://www.youtube.com/feed/subscriptions",
            "https://www.youtube.com/watch?v=bad id!",
        ] {
            let result = YoutubeUrlValidator::new().validate(url).await;
            assert!(
                matches!(result, Err(ValidateError::InvalidFormat { .. })),
                "should reject: {}",
                url
            );
        }
    }
}
