//! pools-report: resolve the pool configuration for this machine and print it.
//!
//! With `--smoke <N>` it also starts an orchestrator, pushes N tasks through
//! every pool class, stops it and prints the shutdown report.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use tidepool_core::{load_dotenv, ConfigSource, PoolsConfig, SystemProbe};
use tidepool_scheduler::{
    PoolOrchestrator, PoolStats, QueueKind, SchedulerConfig, SchedulerError, SchedulerHandle,
    ShutdownReport, TaskFuture,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Print the resolved thread-pool configuration as JSON.
#[derive(Parser, Debug)]
#[command(name = "pools-report", version, about)]
struct Cli {
    /// Properties file with pool settings. Without it the TIDEPOOL_* environment
    /// variables apply, then the built-in defaults.
    #[arg(long, env = "TIDEPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Run N tasks through every pool class and report the shutdown.
    #[arg(long, value_name = "N")]
    smoke: Option<usize>,

    /// Threads of the extra custom pool used by --smoke.
    #[arg(long, default_value_t = 2)]
    custom_threads: usize,

    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,
}

// ── Smoke run ───────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct ClassRun {
    scheduler: String,
    pool: String,
    completed: usize,
    rejected: usize,
    failed: usize,
}

#[derive(Debug, Serialize)]
struct SmokeRun {
    tasks_per_class: usize,
    runs: Vec<ClassRun>,
    pools: Vec<PoolStats>,
    shutdown: ShutdownReport,
    elapsed_ms: u64,
}

fn push_tasks(handle: &SchedulerHandle, n: usize, work: fn(usize) -> u64) -> ClassRun {
    let mut run = ClassRun {
        scheduler: handle.name().to_string(),
        pool: handle.pool_name().to_string(),
        ..ClassRun::default()
    };
    let mut futures: Vec<TaskFuture<u64>> = Vec::with_capacity(n);
    for i in 0..n {
        match handle.submit(move || work(i)) {
            Ok(future) => futures.push(future),
            Err(SchedulerError::Rejected { .. }) => run.rejected += 1,
            Err(e) => {
                warn!(scheduler = %handle.name(), error = %e, "submission failed");
                run.failed += 1;
            }
        }
    }
    for future in futures {
        match future.get() {
            Ok(_) => run.completed += 1,
            Err(e) => {
                warn!(scheduler = %handle.name(), error = %e, "task failed");
                run.failed += 1;
            }
        }
    }
    run
}

fn light_work(i: usize) -> u64 {
    (i as u64).wrapping_mul(31).rotate_left(7)
}

fn io_work(i: usize) -> u64 {
    std::thread::sleep(Duration::from_millis(1));
    i as u64
}

fn intensive_work(i: usize) -> u64 {
    (0..10_000u64).fold(i as u64, |acc, x| acc.wrapping_mul(6364136223846793005).wrapping_add(x))
}

fn smoke(config: PoolsConfig, n: usize, custom_threads: usize) -> Result<SmokeRun> {
    let began = Instant::now();
    let io_threads = config.io.core_size;
    let orchestrator = PoolOrchestrator::new(config);
    orchestrator.start().context("failed to start pool orchestrator")?;

    let light = orchestrator.create_cpu_light_scheduler(SchedulerConfig::new().with_name("smoke-cpu-light"))?;
    // The io pool has no queue; the ceiling keeps submissions from this
    // thread within its idle workers instead of being rejected.
    let io = orchestrator.create_io_scheduler(
        SchedulerConfig::new()
            .with_name("smoke-io")
            .with_max_concurrent(io_threads),
    )?;
    let intensive =
        orchestrator.create_cpu_intensive_scheduler(SchedulerConfig::new().with_name("smoke-cpu-intensive"))?;
    let custom = orchestrator.create_custom_scheduler(
        SchedulerConfig::new().with_name("smoke-custom"),
        custom_threads,
        QueueKind::Bounded(n.max(1)),
    )?;

    let runs = vec![
        push_tasks(&light, n, light_work),
        push_tasks(&io, n, io_work),
        push_tasks(&intensive, n, intensive_work),
        push_tasks(&custom, n, light_work),
    ];
    for run in &runs {
        info!(
            scheduler = %run.scheduler,
            completed = run.completed,
            rejected = run.rejected,
            failed = run.failed,
            "smoke run finished"
        );
    }

    let pools = orchestrator.pool_stats();
    let shutdown = orchestrator.stop()?;
    Ok(SmokeRun {
        tasks_per_class: n,
        runs,
        pools,
        shutdown,
        elapsed_ms: began.elapsed().as_millis() as u64,
    })
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let source = match &cli.config {
        Some(path) => Some(
            ConfigSource::from_file(path)
                .with_context(|| format!("failed to read pool config {}", path.display()))?,
        ),
        None => ConfigSource::from_env(),
    };
    let config = PoolsConfig::load(source.as_ref(), &SystemProbe).context("invalid pool configuration")?;
    config.log_summary();

    let output = match cli.smoke {
        Some(n) => {
            let run = smoke(config.clone(), n, cli.custom_threads)?;
            json!({ "config": config.summary(), "smoke": run })
        }
        None => json!({ "config": config.summary() }),
    };

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", rendered);
    Ok(())
}
