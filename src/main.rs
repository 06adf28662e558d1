use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tap_duckdb::catalog::Selection;
use tap_duckdb::checkpoint::CheckpointManager;
use tap_duckdb::singer::Emitter;
use tap_duckdb::source::duckdb::DuckDbFactory;
use tap_duckdb::{Config, RunContext, Tap};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "tap-duckdb")]
#[command(about = "Singer tap for DuckDB databases", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    #[arg(short, long, help = "Write the catalog to stdout and exit")]
    discover: bool,

    #[arg(long, visible_alias = "properties", value_name = "FILE", help = "Catalog with stream selection")]
    catalog: Option<PathBuf>,

    #[arg(short, long, value_name = "FILE", help = "State from a previous run")]
    state: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Also write every checkpoint to this file")]
    state_output: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting tap-duckdb");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    info!(
        path = ?config.path,
        database = %config.database,
        max_concurrent_streams = config.sync.max_concurrent_streams,
        checkpoint_every = config.sync.checkpoint_every,
        "Configuration summary"
    );

    let factory = DuckDbFactory::new(&config);

    if args.discover {
        let tap = Tap::new(RunContext::new(config, Emitter::stdout()), factory);
        tap.discover(tokio::io::stdout()).await.context("Discovery failed")?;
        return Ok(());
    }

    let selection = match &args.catalog {
        Some(path) => Selection::load(path)
            .await
            .with_context(|| format!("Failed to load catalog from {:?}", path))?,
        None => {
            warn!("No catalog given; every discovered stream is selected");
            Selection::all()
        }
    };

    let mut ctx = RunContext::new(config, Emitter::stdout()).with_selection(selection);

    if let Some(path) = &args.state {
        match CheckpointManager::new(path).load().await? {
            Some(state) => ctx = ctx.with_state(state),
            None => warn!("State file {:?} not found, starting fresh", path),
        }
    }
    if let Some(path) = &args.state_output {
        ctx = ctx.with_state_output(CheckpointManager::new(path));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    ctx = ctx.with_stop_signal(stop_rx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, stopping after the current record");
            let _ = stop_tx.send(true);
        }
    });

    let tap = Tap::new(ctx, factory);
    let summary = tap.run().await.context("Sync aborted")?;
    tap.context().emitter.flush().await?;

    for warning in &summary.warnings {
        warn!("{}", warning);
    }
    for (stream, e) in &summary.failed {
        error!(stream = %stream, "{}", e);
    }
    if !summary.is_success() {
        std::process::exit(1);
    }

    Ok(())
}

/// Logs go to stderr; stdout carries the message stream.
fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("tap_duckdb=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("tap_duckdb=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
