//! ContentMill - A Rust pipeline service for repurposing video content
//!
//! This library turns a video URL into a trackable asynchronous job that extracts
//! audio, transcribes it with AWS Transcribe, and generates content variants
//! (blog, twitter-thread, linkedin) from the transcript.

pub mod cache;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod job;
pub mod ledger;
pub mod orchestrator;
pub mod output;
pub mod persist;
pub mod registry;
pub mod stage;

pub use cli::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use job::{ContentPackage, JobSnapshot, JobState, Variant};
pub use orchestrator::{JobTicket, Orchestrator, SubmitRequest};

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Errors surfaced by the orchestrator's public API
#[derive(thiserror::Error, Debug)]
pub enum ContentMillError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("System is busy, try again later")]
    SystemBusy,

    #[error("No job found with id {0}")]
    JobNotFound(uuid::Uuid),
}
