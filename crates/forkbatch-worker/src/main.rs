use forkbatch_spool::SpoolQueue;
use forkbatch_worker::batch::JOBS_PER_FORK_VAR;
use forkbatch_worker::handler::{EchoHandler, FailHandler, SleepHandler};
use forkbatch_worker::{hook, HookRegistry, JobHandlerRegistry, Worker, WorkerConfig};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fb-worker")]
#[command(about = "Forking job worker with per-fork batching", long_about = None)]
struct Args {
    /// Queues to watch, in priority order (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    queues: Option<Vec<String>>,

    /// Spool directory
    #[arg(short, long)]
    spool: Option<PathBuf>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Polling interval in seconds; 0 drains the queues and exits
    #[arg(short, long)]
    interval: Option<u64>,

    /// Jobs per forked child; sets JOBS_PER_FORK for this process
    #[arg(short, long)]
    jobs_per_fork: Option<usize>,

    /// Run jobs in the worker process itself
    #[arg(long)]
    no_fork: bool,

    /// Fork once per job and skip batch hooks
    #[arg(long)]
    no_batch: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init(),
    }

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(queues) = args.queues {
        config.queues = queues;
    }
    if let Some(spool) = args.spool {
        config.spool_dir = spool;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }
    if let Some(interval) = args.interval {
        config.interval_secs = interval;
    }
    if args.no_fork {
        config.fork = false;
    }
    if args.no_batch {
        config.batch = false;
    }
    if let Some(n) = args.jobs_per_fork {
        // Still single-threaded here; the batch executor reads it per batch
        std::env::set_var(JOBS_PER_FORK_VAR, n.to_string());
    }

    for queue in &config.queues {
        forkbatch_core::validate_queue_name(queue)?;
    }

    let queue = Arc::new(SpoolQueue::open(&config.spool_dir)?);

    // Create job handler registry
    let handlers = JobHandlerRegistry::new();
    handlers.register("echo", EchoHandler);
    handlers.register("sleep", SleepHandler::new(1000));
    handlers.register("fail", FailHandler);

    tracing::info!("Registered job classes: {:?}", handlers.classes());

    let mut hooks = HookRegistry::new();
    hooks.before_batch(Some(hook(|worker| {
        tracing::debug!("Batch starting in process {}", std::process::id());
        tracing::trace!("Worker: {:?}", worker);
        Ok(())
    })));
    hooks.after_batch(Some(hook(|worker| {
        tracing::debug!("Batch done in process {} ({})", std::process::id(), worker.status());
        Ok(())
    })));

    let worker = Worker::new(config, queue, handlers).with_hooks(hooks);
    worker.work()?;

    Ok(())
}
