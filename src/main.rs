use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netshaper::cli::{format_dry_run, Args};
use netshaper::config::{default_config_path, load_settings};
use netshaper::metrics::spawn_sampler;
use netshaper::rules::RuleStore;
use netshaper::runtime::{CommandExecutor, ProcessExecutor, SimulatedHost};
use netshaper::server::{create_router, AppState};
use netshaper::store::Store;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut settings = load_settings(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    args.apply_overrides(&mut settings);

    let store = Store::open(&settings.state_file, settings.naming.clone())
        .await
        .with_context(|| format!("Failed to open state file {}", settings.state_file.display()))?;
    let records = RuleStore::open(&settings.rules_file)
        .await
        .with_context(|| format!("Failed to open rules file {}", settings.rules_file.display()))?;

    // Dry-run mode: print settings and stored state, then exit
    if args.dry_run {
        let output = format_dry_run(&settings, &store.snapshot().await, &records.list().await);
        println!("{}", output);
        return Ok(());
    }

    let executor: Arc<dyn CommandExecutor> = if args.simulate {
        warn!("Running against a simulated host; no containers will be touched");
        Arc::new(SimulatedHost::new(&settings))
    } else {
        Arc::new(ProcessExecutor::new())
    };

    let addr = format!("{}:{}", settings.bind_addr, settings.port);
    let interval = settings.sample_interval();
    let restore_on_start = settings.restore_on_start;
    let state = AppState::new(settings, Arc::new(store), Arc::new(records), executor);

    // Shaping state does not survive an endpoint restart; rebuild it before serving
    if restore_on_start {
        let report = state.rules.restore().await;
        info!(
            "Restore: {} interfaces initialized, {} rules replayed, {} stale, {} failed",
            report.initialized.len(),
            report.replayed.len(),
            report.stale.len(),
            report.failures.len()
        );
    }

    let sampler = spawn_sampler(state.sampler(), interval);
    let state = state.with_metrics(sampler.snapshots.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("netshaper listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health                  - Health check");
    info!("  *    /api/clusters[/..]        - Clusters and devices");
    info!("  *    /api/sync/{{preview,execute}} - Reconciliation");
    info!("  *    /api/rules[/..]           - Traffic shaping rules");
    info!("  GET  /api/metrics/stream       - Live metrics (SSE)");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("Server error")?;

    info!("Shutting down");
    let _ = sampler.shutdown.send(true);
    let _ = sampler.task.await;
    Ok(())
}
