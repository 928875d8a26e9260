//! tracemarkd - the watermarking daemon.
//!
//! Opens the store, spawns the worker pool, and runs the expiry sweep on
//! the main thread until SIGINT/SIGTERM trips the root cancellation token.
//! Workers finish the database write they have started, signal their child
//! processes, and exit; interrupted jobs stay RUNNING for the operator.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use tracemark::{service, CancelToken, Config, DataLayout, EventBus, Store, ToolAdapter, WorkerEnv, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "tracemarkd", version, about = "Forensic media watermarking daemon")]
struct Args {
    /// Configuration file (TOML or JSON); overrides TRACEMARK_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        log::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("TRACEMARK_CONFIG", path);
    }
    let cfg = Config::load().context("configuration")?;

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("create data dir {}", cfg.data_dir.display()))?;
    let store = Store::open(&cfg.db_path).context("open database")?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            cancel.cancel();
        })
        .context("install signal handler")?;
    }

    let env = WorkerEnv {
        bus: EventBus::new(),
        tool: ToolAdapter::new(
            cfg.font_path.clone(),
            cfg.scripts_dir.clone(),
            cfg.venv_path.clone(),
        ),
        data: DataLayout::new(&cfg.data_dir),
        cancel: cancel.clone(),
        jpeg_quality: cfg.jpeg_quality,
    };
    let pool = WorkerPool::spawn(cfg.worker_count, &store, &env).context("spawn workers")?;

    log::info!(
        "tracemarkd {} up: {} worker(s), data at {}, db at {}",
        env!("CARGO_PKG_VERSION"),
        cfg.worker_count,
        cfg.data_dir.display(),
        cfg.db_path
    );

    // Sweep cadence on the main thread; shutdown polls once a second.
    let mut last_sweep = Instant::now();
    if let Err(e) = service::expiry_sweep(&store, cfg.stuck_after_secs) {
        log::warn!("initial expiry sweep failed: {e}");
    }
    while !cancel.is_cancelled() {
        cancel.sleep(Duration::from_secs(1));
        if last_sweep.elapsed() >= cfg.cleanup_interval {
            if let Err(e) = service::expiry_sweep(&store, cfg.stuck_after_secs) {
                log::warn!("expiry sweep failed: {e}");
            }
            last_sweep = Instant::now();
        }
    }

    log::info!("draining workers");
    pool.join();
    log::info!("bye");
    Ok(())
}
