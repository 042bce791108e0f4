use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
use config::{AppConfig, CliConfig, FileConfig};

mod intake;
use intake::IntakeValidator;

mod notify;
use notify::LogNotifier;

mod pipeline;
use pipeline::{
    JobRunner, JobRunnerConfig, PipelineOrchestrator, ProcessingStatusStore, RetryPolicy,
    SqlitePipelineStore,
};

mod queue;
use queue::{WorkerPool, WorkerPoolConfig};

mod server;
use server::{AllowAllAuthorizer, ServerState};

mod storage;
use storage::FsObjectStore;

mod transcoder;
use transcoder::{FfmpegTranscoder, Transcoder};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory for the pipeline SQLite database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Directory for stored masters and derived artifacts.
    #[clap(long, value_parser = parse_path)]
    pub media_path: Option<PathBuf>,

    /// Scratch directory for per-attempt transcoder work dirs.
    #[clap(long, value_parser = parse_path)]
    pub scratch_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3010)]
    pub port: u16,

    /// Path of the ffmpeg binary.
    #[clap(long)]
    pub ffmpeg_bin: Option<String>,

    /// Path of the ffprobe binary.
    #[clap(long)]
    pub ffprobe_bin: Option<String>,

    /// Optional TOML config file; its values override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir,
        media_path: cli_args.media_path,
        scratch_dir: cli_args.scratch_dir,
        port: cli_args.port,
        ffmpeg_bin: cli_args.ffmpeg_bin,
        ffprobe_bin: cli_args.ffprobe_bin,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening pipeline database at {:?}...", config.pipeline_db_path());
    let store: Arc<dyn ProcessingStatusStore> =
        Arc::new(SqlitePipelineStore::open(config.pipeline_db_path())?);

    let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new(
        &config.ffmpeg_bin,
        &config.ffprobe_bin,
        Duration::from_secs(config.pipeline.transcode_timeout_secs),
        config.pipeline.max_output_bytes,
    ));

    // Environment preflight: surfaced at startup and /health, not per job
    if transcoder.is_available().await {
        match transcoder.version().await {
            Some(version) => info!("Transcoder available: ffmpeg {}", version),
            None => info!("Transcoder available (version unknown)"),
        }
    } else {
        warn!(
            "Transcoder binaries not found ({} / {}); jobs will fail until they are installed",
            config.ffmpeg_bin, config.ffprobe_bin
        );
    }

    let objects = Arc::new(FsObjectStore::new(config.media_path.join("artifacts")));
    let validator = Arc::new(IntakeValidator::new(
        transcoder.clone(),
        config.pipeline.accepted_formats.clone(),
        config.pipeline.max_duration_secs,
    ));

    let runner = Arc::new(JobRunner::new(
        store.clone(),
        transcoder.clone(),
        objects,
        JobRunnerConfig {
            scratch_dir: config.scratch_dir.join("trackpipe"),
            preview_start_secs: config.pipeline.preview_start_secs,
            preview_duration_secs: config.pipeline.preview_duration_secs,
            preview_bitrate_kbps: config.pipeline.preview_bitrate_kbps,
            waveform_sample_count: config.pipeline.waveform_sample_count,
        },
    ));

    let pool = Arc::new(WorkerPool::new(
        runner,
        RetryPolicy::new(&config.pipeline),
        WorkerPoolConfig {
            default_lane_workers: config.pipeline.default_lane_workers,
            low_lane_workers: config.pipeline.low_lane_workers,
        },
    ));

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store.clone(),
        pool.clone(),
        Arc::new(LogNotifier),
        config.pipeline.clone(),
    ));

    let shutdown = CancellationToken::new();
    let worker_handles = pool.start(orchestrator.clone(), shutdown.clone());
    info!("Started {} pipeline workers", worker_handles.len());

    let state = Arc::new(ServerState {
        orchestrator,
        validator,
        transcoder,
        store,
        authorizer: Arc::new(AllowAllAuthorizer),
        config: config.clone(),
    });

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        server_shutdown.cancel();
    });

    tokio::select! {
        result = server::run_server(state, config.port) => {
            if let Err(e) = result {
                error!("Server error: {:#}", e);
            }
        }
        _ = shutdown.cancelled() => {}
    }

    info!("Waiting for workers to stop...");
    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("Bye!");

    Ok(())
}
