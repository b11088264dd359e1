use anyhow::{Context, Result};
use clap::Parser;
use engine::{
    config::EncoderConfig,
    coordinator::{EncodingCoordinator, Notice},
    ffmpeg::FfmpegEncoder,
    ffprobe::FfprobeProbe,
    job::JobStatus,
    scan::{self, ScanResult},
    store::{ChangeKind, ChannelObserver, JobStore, StoreEvent},
};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Batch HEVC transcoder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video files or directories to encode
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Concurrent encodes (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Per-job encode timeout in seconds (overrides config)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the final job list as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = EncoderConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if args.workers.is_some() {
        cfg.workers = args.workers;
    }
    if args.timeout.is_some() {
        cfg.encode_timeout_secs = args.timeout;
    }

    let encoder = FfmpegEncoder::new(&cfg)
        .await
        .context("ffmpeg is not usable")?;
    if let Some(version) = encoder.version() {
        info!("Using ffmpeg {}.{}", version.major, version.minor);
    }
    let probe = FfprobeProbe::new(&cfg);
    let coordinator = EncodingCoordinator::new(&cfg, Arc::new(encoder), Arc::new(probe));

    let (observer, events) = ChannelObserver::channel();
    coordinator.store().subscribe(observer);
    tokio::spawn(log_store_events(Arc::clone(coordinator.store()), events));
    tokio::spawn(log_notices(coordinator.subscribe_notices()));

    let interrupt = coordinator.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.is_shut_down() {
                error!("Interrupted again, exiting without waiting for encoders");
                std::process::exit(130);
            }
            warn!(
                "Interrupted, cancelling {} job(s); press Ctrl-C again to exit now",
                interrupt.cancel_all()
            );
        }
    });

    let mut inputs = Vec::new();
    for result in scan::expand_inputs(&args.paths, &cfg.output_suffix) {
        match result {
            ScanResult::Input(path) => inputs.push(path),
            ScanResult::Skipped(path, reason) => info!("Skipping {}: {}", path.display(), reason),
        }
    }

    if inputs.is_empty() {
        warn!("Nothing to encode");
        return Ok(());
    }

    info!("Submitting {} input(s)", inputs.len());
    let report = coordinator.submit(&inputs).await;
    coordinator.wait_idle().await;

    let snapshot = coordinator.store().snapshot();
    let completed = snapshot
        .iter()
        .filter(|j| j.status() == JobStatus::Completed)
        .count();
    let failed = snapshot
        .iter()
        .filter(|j| j.status() == JobStatus::Failed)
        .count();

    if args.json {
        let jobs: Vec<_> = snapshot.iter().collect();
        let rendered =
            serde_json::to_string_pretty(&jobs).context("Failed to serialize job list")?;
        println!("{}", rendered);
    } else {
        for job in &snapshot {
            match job.status() {
                JobStatus::Completed => {
                    println!("OK    {} -> {}", job.file_name(), job.output_path().display())
                }
                status => println!(
                    "{:<5} {}: {}",
                    status.to_string().to_uppercase(),
                    job.file_name(),
                    job.failure_reason().unwrap_or("-")
                ),
            }
        }
        for (path, reason) in &report.rejected {
            println!("SKIP  {}: {}", path.display(), reason);
        }
    }

    info!(
        "Done: {} completed, {} failed, {} rejected",
        completed,
        failed,
        report.rejected.len()
    );

    if failed > 0 || !report.rejected.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

async fn log_store_events(store: Arc<JobStore>, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
    while let Some(event) = events.recv().await {
        let StoreEvent::Changed { index, kind } = event else {
            continue;
        };
        let Some(job) = store.job_at(index) else {
            continue;
        };
        match kind {
            ChangeKind::Progress => debug!("Job {}: {}%", job.id(), job.progress()),
            ChangeKind::Status | ChangeKind::Both => {
                debug!("Job {}: {} ({}%)", job.id(), job.status(), job.progress())
            }
        }
    }
}

async fn log_notices(mut notices: broadcast::Receiver<Notice>) {
    loop {
        match notices.recv().await {
            Ok(notice @ Notice::Completed { .. }) => info!("{}", notice),
            Ok(notice) => error!("{}", notice),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} notice(s)", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
