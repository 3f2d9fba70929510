use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use log::info;
use tokio::sync::broadcast::error::RecvError;

use tubequeue::commands::{AddToQueueRequest, QueueCommands};
use tubequeue::config::AppConfig;
use tubequeue::downloader::catalog::QualityPreference;
use tubequeue::downloader::events::QueueEvent;
use tubequeue::downloader::fallback::{self, FallbackState};
use tubequeue::downloader::manager::{DownloadQueue, QueueOptions};
use tubequeue::downloader::{DownloadStatus, YtDlpSupervisor};
use tubequeue::metadata::InMemoryMetadataStore;
use tubequeue::security::InputValidator;
use tubequeue::utils;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download videos, running the queue until every job settles
    Download {
        #[arg(required = true)]
        urls: Vec<String>,

        /// best, 2160p, 1440p, 1080p, 720p, 480p, 360p or audio
        #[arg(short, long)]
        quality: Option<QualityPreference>,

        /// Directory for finished files
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show how an error message would be classified and what comes next
    Classify {
        message: String,

        /// Structured error tag, e.g. rate_limited
        #[arg(long)]
        tag: Option<String>,

        #[arg(long, default_value_t = 0)]
        client: usize,

        #[arg(long, default_value_t = 0)]
        format: usize,

        #[arg(long, default_value_t = 0)]
        attempts: u32,
    },
    /// Print the effective configuration
    Config,
    /// Check that the extraction tool can be launched
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    // Load configuration
    let loaded = match &cli.config {
        Some(path) => AppConfig::load_from(Some(path.as_path())),
        None => AppConfig::load(),
    };
    let config = match loaded {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            AppConfig::default()
        }
    };

    match cli.command {
        Command::Download {
            urls,
            quality,
            output,
        } => run_download(config, urls, quality, output).await,
        Command::Classify {
            message,
            tag,
            client,
            format,
            attempts,
        } => {
            let current = FallbackState::new(
                client,
                format,
                attempts,
                tubequeue::downloader::catalog::default_max_attempts(),
            );
            let decision = fallback::decide(&current, &message, tag.as_deref(), &config.retry.policy());

            println!("classification: {}", decision.classification);
            println!("auto fallback:  {}", fallback::should_auto_fallback(&message, tag.as_deref()));
            println!("current:        {}", current);
            match decision.next {
                Some(next) => println!("next:           {}", next),
                None => println!("next:           none (retryable: {})", decision.retryable()),
            }
            if let Some(delay) = decision.delay {
                println!("delay:          {:?}", delay);
            }
            Ok(())
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Probe => {
            let supervisor = YtDlpSupervisor::from_config(&config);
            let version = supervisor
                .probe()
                .await
                .with_context(|| format!("{} is not usable", config.ytdlp_path))?;
            println!("{} {}", config.ytdlp_path, version);
            Ok(())
        }
    }
}

async fn run_download(
    mut config: AppConfig,
    urls: Vec<String>,
    quality: Option<QualityPreference>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(output) = output {
        config.download_path = output;
    }
    InputValidator::new().validate_download_path(&config.download_path)?;
    utils::ensure_dir_exists(&config.download_path).await?;

    let queue = Arc::new(DownloadQueue::start(
        QueueOptions::from_config(&config),
        Arc::new(YtDlpSupervisor::from_config(&config)),
        Arc::new(InMemoryMetadataStore::new()),
    ));
    let commands = QueueCommands::new(queue.clone());
    let mut events = queue.subscribe();

    let response = commands
        .add_to_queue(AddToQueueRequest {
            urls,
            quality: quality.map(|q| q.to_string()),
        })
        .await;
    if let Some(message) = &response.message {
        info!("{}", message);
    }
    if response.job_ids.is_empty() {
        anyhow::bail!("Nothing to download");
    }

    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
        .progress_chars("=> ");
    let multi = MultiProgress::new();
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    for job_id in &response.job_ids {
        let bar = multi.add(ProgressBar::new(100));
        bar.set_style(style.clone());
        if let Some(job) = queue.job(job_id).await {
            bar.set_prefix(job.source_url);
        }
        bar.set_message("queued");
        bars.insert(job_id.clone(), bar);
    }

    let render = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => render_event(&bars, event),
                Err(RecvError::Lagged(skipped)) => log::debug!("Progress display skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = queue.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => log::warn!("Interrupted, stopping active download"),
    }
    queue.shutdown().await;
    render.abort();

    let status = commands.get_queue_status().await;
    for job in &status.completed {
        if let Some(path) = &job.output_path {
            println!("done    {}", path.display());
        }
    }
    for job in &status.failed {
        println!(
            "failed  {} ({}): {}",
            job.source_url,
            job.error_kind.map(|kind| kind.to_string()).unwrap_or_default(),
            job.error.as_deref().unwrap_or("unknown error")
        );
    }

    if !status.failed.is_empty() {
        anyhow::bail!("{} download(s) failed", status.failed.len());
    }
    Ok(())
}

fn render_event(bars: &HashMap<String, ProgressBar>, event: QueueEvent) {
    let Some(bar) = bars.get(event.job_id()) else {
        return;
    };

    match event {
        QueueEvent::Progress(progress) => {
            bar.set_position(progress.progress.round() as u64);
            let mut message = String::new();
            if let Some(speed) = progress.current_speed {
                message.push_str(&format!("{}/s", HumanBytes(speed)));
            }
            if let Some(eta) = progress.estimated_time_remaining {
                message.push_str(&format!(" eta {}s", eta));
            }
            bar.set_message(message);
        }
        QueueEvent::FallbackAdvanced {
            classification,
            state,
            ..
        } => bar.set_message(format!("{}, trying {}", classification, state.player_client())),
        QueueEvent::StatusChanged { status, .. } => match status {
            DownloadStatus::Downloading => bar.set_message("downloading"),
            DownloadStatus::Cancelled => bar.abandon_with_message("cancelled"),
            _ => {}
        },
        QueueEvent::JobFailed { classification, .. } => {
            bar.abandon_with_message(format!("failed: {}", classification))
        }
        QueueEvent::JobCompleted { size, .. } => {
            bar.set_position(100);
            bar.finish_with_message(format!("done ({})", HumanBytes(size)));
        }
        QueueEvent::JobAdded { .. } => {}
    }
}
