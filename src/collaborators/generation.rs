use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ContentGenerator, GenerateError};
use crate::config::GenerationConfig;
use crate::job::{SourceMetadata, Transcript, Variant};

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

/// Content generation against an Anthropic-style messages endpoint.
pub struct HttpContentGenerator {
    client: Client,
    config: GenerationConfig,
    api_key: String,
}

impl HttpContentGenerator {
    pub fn new(config: GenerationConfig) -> crate::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("API key environment variable {} is not set", config.api_key_env)
        })?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { client, config, api_key })
    }

    fn prompt_for(variant: Variant, transcript: &Transcript, metadata: &SourceMetadata) -> String {
        let title = metadata.title.as_deref().unwrap_or("an untitled video");
        let instruction = match variant {
            Variant::Blog => {
                "Write a well-structured blog post (markdown, with a title and subheadings) based on this video transcript. Keep the author's key points and voice."
            }
            Variant::TwitterThread => {
                "Write an engaging twitter thread (numbered tweets, each under 280 characters) summarizing the key insights of this video transcript."
            }
            Variant::Linkedin => {
                "Write a professional LinkedIn post drawing out the main lessons of this video transcript. Conversational but polished, with a hook in the first line."
            }
        };
        format!(
            "{}\n\nVideo: {}\n\nTranscript:\n{}",
            instruction, title, transcript.text
        )
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(
        &self,
        variant: Variant,
        transcript: &Transcript,
        metadata: &SourceMetadata,
    ) -> Result<String, GenerateError> {
        if transcript.text.trim().is_empty() {
            return Err(GenerateError::InvalidTranscript {
                detail: "transcript is empty".to_string(),
            });
        }

        let request = MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            messages: vec![Message {
                role: "user",
                content: Self::prompt_for(variant, transcript, metadata),
            }],
        };

        tracing::debug!(variant = %variant, model = %self.config.model, "requesting content generation");

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerateError::ServiceUnavailable {
                detail: format!("network error: {}", e),
            })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(GenerateError::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            // Client errors mean the request itself was rejected; retrying the
            // same transcript will not help.
            if status.is_client_error() {
                return Err(GenerateError::InvalidTranscript {
                    detail: format!("API rejected request (status {}): {}", status.as_u16(), message),
                });
            }
            return Err(GenerateError::ServiceUnavailable {
                detail: format!("API error (status {}): {}", status.as_u16(), message),
            });
        }

        let body: MessagesResponse =
            response.json().await.map_err(|e| GenerateError::ServiceUnavailable {
                detail: format!("unparsable API response: {}", e),
            })?;

        let text: String = body
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return Err(GenerateError::ServiceUnavailable {
                detail: "API returned no text content".to_string(),
            });
        }

        Ok(text)
    }
}
