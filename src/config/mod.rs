use anyhow::{Context, Result};
use aws_types::region::Region;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::stage::StagePolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// AWS configuration
    pub aws: AwsConfig,

    /// Content generation configuration
    pub generation: GenerationConfig,

    /// Pipeline policy (timeouts, retries, capacity)
    pub pipeline: PipelineConfig,

    /// Application settings
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    pub region: String,

    /// S3 bucket for temporary audio storage
    pub s3_bucket: String,

    /// Optional S3 key prefix
    pub s3_key_prefix: Option<String>,

    /// Transcription language code (auto-detect if not set)
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Messages API endpoint
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Token budget per generated variant
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-attempt timeout for URL validation, in seconds
    pub validate_timeout_secs: u64,

    /// Per-attempt timeout for audio extraction, in seconds
    pub extract_timeout_secs: u64,

    /// Per-attempt timeout for transcription, in seconds
    pub transcribe_timeout_secs: u64,

    /// Per-attempt timeout for each content variant, in seconds
    pub generate_timeout_secs: u64,

    /// Maximum attempts per stage, including the first
    pub max_attempts: u32,

    /// Exponential backoff base delay in milliseconds
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    pub backoff_cap_ms: u64,

    /// Maximum number of non-terminal jobs admitted at once
    pub max_active_jobs: usize,

    /// How long finished jobs stay pollable, in seconds
    pub job_ttl_secs: i64,

    /// Background sweep interval, in seconds
    pub sweep_interval_secs: u64,

    /// Longest video accepted, in minutes
    pub max_video_duration_minutes: u32,

    /// Rough completion estimate returned at submission, in seconds
    pub estimate_secs: i64,

    /// TTL for the dedup cache, in seconds
    pub cache_ttl_secs: i64,

    /// Transient failures within the window before the breaker opens
    pub breaker_threshold: u32,

    /// Circuit breaker window, in seconds
    pub breaker_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory for persisted job snapshots (data dir if not set)
    pub state_dir: Option<PathBuf>,

    /// Mirror job snapshots to disk at terminal transitions
    pub persist_snapshots: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aws: AwsConfig {
                region: "us-east-1".to_string(),
                s3_bucket: "".to_string(),
                s3_key_prefix: Some("contentmill/".to_string()),
                language: None,
            },
            generation: GenerationConfig {
                endpoint: "https://api.anthropic.com/v1/messages".to_string(),
                model: "claude-3-5-haiku-latest".to_string(),
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                max_tokens: 2048,
            },
            pipeline: PipelineConfig {
                validate_timeout_secs: 10,
                extract_timeout_secs: 300,
                transcribe_timeout_secs: 1800,
                generate_timeout_secs: 120,
                max_attempts: 3,
                backoff_base_ms: 500,
                backoff_cap_ms: 15_000,
                max_active_jobs: 8,
                job_ttl_secs: 3600,
                sweep_interval_secs: 60,
                max_video_duration_minutes: 90,
                estimate_secs: 180,
                cache_ttl_secs: 86_400,
                breaker_threshold: 8,
                breaker_window_secs: 60,
            },
            app: AppConfig {
                state_dir: None,
                persist_snapshots: true,
            },
        }
    }
}

impl PipelineConfig {
    pub fn validate_policy(&self) -> StagePolicy {
        StagePolicy {
            attempt_timeout: Duration::from_secs(self.validate_timeout_secs),
            max_attempts: self.max_attempts,
        }
    }

    pub fn extract_policy(&self) -> StagePolicy {
        StagePolicy {
            attempt_timeout: Duration::from_secs(self.extract_timeout_secs),
            max_attempts: self.max_attempts,
        }
    }

    pub fn transcribe_policy(&self) -> StagePolicy {
        StagePolicy {
            attempt_timeout: Duration::from_secs(self.transcribe_timeout_secs),
            max_attempts: self.max_attempts,
        }
    }

    pub fn generate_policy(&self) -> StagePolicy {
        StagePolicy {
            attempt_timeout: Duration::from_secs(self.generate_timeout_secs),
            max_attempts: self.max_attempts,
        }
    }

    pub fn job_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_ttl_secs)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs)
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = fs_err::read_to_string(&config_path)
                .context("Failed to read config file")?;

            let config: Config = serde_yaml::from_str(&content)
                .context("Failed to parse config file")?;

            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        fs_err::write(&config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        Ok(config_dir.join("contentmill").join("config.yaml"))
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.aws.region.trim().is_empty() {
            anyhow::bail!("AWS region must be configured");
        }
        if self.aws.s3_bucket.is_empty() {
            anyhow::bail!("AWS S3 bucket must be configured");
        }
        if self.generation.endpoint.is_empty() {
            anyhow::bail!("Generation endpoint must be configured");
        }
        if self.pipeline.max_attempts == 0 {
            anyhow::bail!("pipeline.max_attempts must be at least 1");
        }
        if self.pipeline.max_active_jobs == 0 {
            anyhow::bail!("pipeline.max_active_jobs must be at least 1");
        }
        Ok(())
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  AWS Region: {}", self.aws.region);
        println!("  S3 Bucket: {}", self.aws.s3_bucket);
        if let Some(prefix) = &self.aws.s3_key_prefix {
            println!("  S3 Prefix: {}", prefix);
        }
        println!("  Generation Model: {}", self.generation.model);
        println!("  Max Active Jobs: {}", self.pipeline.max_active_jobs);
        println!("  Max Attempts: {}", self.pipeline.max_attempts);
        println!("  Persist Snapshots: {}", self.app.persist_snapshots);
    }

    /// Directory for persisted job snapshots
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.app.state_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir().context("Could not determine data directory")?;
        Ok(data_dir.join("contentmill").join("jobs"))
    }

    /// Get AWS region
    pub fn aws_region(&self) -> Region {
        Region::new(self.aws.region.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.pipeline.max_attempts, 3);
        assert_eq!(parsed.generation.api_key_env, "ANTHROPIC_API_KEY");
    }

    #[test]
    fn validate_rejects_missing_bucket_and_zero_attempts() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.aws.s3_bucket = "bucket".into();
        config.pipeline.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.aws.s3_bucket = "bucket".into();
        config.aws.region = "  ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.aws.s3_bucket = "bucket".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn stage_policies_reflect_configured_timeouts() {
        let config = Config::default();
        assert_eq!(
            config.pipeline.transcribe_policy().attempt_timeout,
            Duration::from_secs(1800)
        );
        assert_eq!(config.pipeline.generate_policy().max_attempts, 3);
    }
}
