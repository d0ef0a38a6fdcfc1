use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "contentmill",
    about = "ContentMill - Turn video URLs into transcripts and repurposed content using AWS Transcribe",
    version,
    long_about = "A pipeline service that converts a video URL into a transcript plus repurposed content variants (blog post, twitter thread, LinkedIn post). Jobs run asynchronously with per-stage retries and pollable progress."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a video URL and wait for the content package
    Run {
        /// Video URL to process (YouTube)
        #[arg(value_name = "URL")]
        url: String,

        /// Directory to write the generated files into (prints to console if not specified)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Console output format
        #[arg(short, long, value_enum, default_value = "markdown")]
        format: OutputFormat,
    },

    /// Show the status of a previously persisted job
    Status {
        /// Job identifier returned at submission
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },

    /// Configure AWS credentials and pipeline settings
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// List supported content variants
    Variants,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum OutputFormat {
    /// Combined markdown document
    Markdown,
    /// JSON with the full package
    Json,
    /// Plain text
    Text,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Markdown => write!(f, "markdown"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}
