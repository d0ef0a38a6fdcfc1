use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use contentmill::collaborators::Collaborators;
use contentmill::job::{JobState, Variant};
use contentmill::ledger::ResourceLedger;
use contentmill::output;
use contentmill::persist::SnapshotStore;
use contentmill::{Cli, Commands, Config, Orchestrator, OutputFormat, SubmitRequest};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "contentmill=debug"
    } else {
        "contentmill=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().await?;

    match cli.command {
        Commands::Run { url, output, format } => {
            run(&config, url, output, format, cli.quiet).await?;
        }
        Commands::Status { job_id } => {
            let store = SnapshotStore::new(config.state_dir()?)?;
            let id = job_id.parse()?;
            match store.load(id)? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => println!("No persisted record for job {}", id),
            }
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                println!("Edit the config file to change settings:");
                println!("  region, bucket and language under `aws`");
                println!("  endpoint and model under `generation`");
                println!("  timeouts, retries and capacity under `pipeline`");
            }
        }
        Commands::Variants => {
            println!("Supported content variants:");
            for variant in Variant::ALL {
                println!("  • {}", variant);
            }
        }
    }

    Ok(())
}

async fn run(
    config: &Config,
    url: String,
    output_dir: Option<std::path::PathBuf>,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let ledger = Arc::new(ResourceLedger::new()?);
    let collab = Collaborators::from_config(config, ledger.clone()).await?;
    let store = if config.app.persist_snapshots {
        Some(SnapshotStore::new(config.state_dir()?)?)
    } else {
        None
    };

    let orchestrator = Orchestrator::new(config.pipeline.clone(), collab, ledger, store);
    orchestrator.start_sweeper();

    tracing::info!("Submitting job for URL: {}", url);
    let ticket = orchestrator.submit(SubmitRequest { url })?;
    println!(
        "Job {} submitted (estimated completion {})",
        ticket.job_id,
        ticket.estimated_completion.format("%H:%M:%S")
    );

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap(),
        );
        bar
    };

    let snapshot = loop {
        let snap = orchestrator.poll(ticket.job_id)?;
        progress.set_position((snap.progress * 100.0).round() as u64);
        if let Some(stage) = &snap.current_stage {
            progress.set_message(stage.clone());
        }
        if snap.state.is_terminal() {
            break snap;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    let result = match snapshot.state {
        JobState::Complete => {
            progress.finish_with_message("complete");
            let package = snapshot.result.expect("complete job carries a result");
            match output_dir {
                Some(dir) => {
                    for path in output::save_to_dir(&package, &dir)? {
                        println!("Wrote {}", path.display());
                    }
                }
                None => output::print_to_console(&package, &format)?,
            }
            Ok(())
        }
        _ => {
            progress.finish_with_message("failed");
            let error = snapshot.error.expect("failed job carries error info");
            tracing::error!(job_id = %ticket.job_id, kind = error.kind.as_str(), "job failed: {}", error.detail);
            Err(anyhow::anyhow!("{}", error.message))
        }
    };

    orchestrator.shutdown();
    result
}
