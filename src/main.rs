mod api;
mod automation;
mod client;
mod config;
mod db;
mod error;
mod fees;
mod scheduler;
mod state;
mod tracker;

use crate::automation::config::ConfigStore;
use crate::automation::history::HistoryLog;
use crate::automation::{Controller, EngineSettings};
use crate::client::NodeClient;
use crate::fees::setter::ApplySettings;
use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "lnd-feeboss", about = "Fee policy automation for LND")]
struct Cli {
    /// Path to lnd-feeboss.toml config file
    #[arg(short, long, default_value = "lnd-feeboss.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control API and run the scheduler (default)
    Daemon,
    /// Execute a single fee pass and exit
    RunOnce,
    /// Print current status from the database
    Status,
    /// Print the most recent fee updates
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    info!("lnd-feeboss v{} starting", env!("CARGO_PKG_VERSION"));

    if config.general.dry_run {
        warn!("DRY-RUN MODE: No fee updates will be sent");
    }

    let db = Arc::new(db::Database::open(&config.general.database_path)?);

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let controller = build_controller(&config, db)?;
            run_daemon(&config, controller).await
        }
        Commands::RunOnce => {
            let controller = build_controller(&config, db)?;
            run_once(controller).await
        }
        Commands::Status => print_status(&config, db),
        Commands::History { limit } => print_history(db, limit),
    }
}

fn build_controller(config: &Config, db: Arc<db::Database>) -> anyhow::Result<Controller> {
    let client: Arc<dyn NodeClient> = Arc::new(client::LndRestClient::new(config)?);
    let store = ConfigStore::persistent(Arc::clone(&db), config.initial_automation()?);
    Ok(Controller::new(
        client,
        store,
        db,
        ApplySettings::from_config(config),
        EngineSettings::from_config(config),
    ))
}

async fn run_daemon(config: &Config, controller: Controller) -> anyhow::Result<()> {
    // Startup connectivity check. Not fatal: passes retry at every tick.
    info!("Verifying LND connectivity...");
    match controller.node_info().await {
        Ok(info) => info!(
            "Connected to LND node: {} ({}), {} active channels",
            info.alias, info.pubkey, info.num_active_channels
        ),
        Err(e) => warn!("Cannot reach LND yet: {}", e),
    }

    if config.general.autostart {
        controller.start()?;
    }

    // Shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal, finishing current pass...");
        let _ = shutdown_tx.send(true);
    });

    let listener = tokio::net::TcpListener::bind(&config.general.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.general.listen_addr))?;
    info!("Control API listening on http://{}", config.general.listen_addr);

    let app = api::router(api::AppState {
        controller: controller.clone(),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
        .context("HTTP server failed")?;

    if controller.status().running {
        controller.stop()?;
    }
    info!("Shutting down gracefully");
    Ok(())
}

async fn run_once(controller: Controller) -> anyhow::Result<()> {
    info!("Running single pass...");
    let result = controller.run_once().await?;
    info!(
        "Single pass complete: {} applied, {} skipped, {} failed",
        result.applied, result.skipped, result.failed
    );
    Ok(())
}

fn print_status(config: &Config, db: Arc<db::Database>) -> anyhow::Result<()> {
    let store = ConfigStore::persistent(Arc::clone(&db), config.initial_automation()?);
    let automation = store.get();
    let history = HistoryLog::new(Arc::clone(&db));

    let total_updates = history.count()?;
    let last = history.recent(1)?;

    let tracked_channels: i64 = db.conn().query_row(
        "SELECT COUNT(DISTINCT channel_id) FROM channel_samples",
        [],
        |r| r.get(0),
    )?;

    println!("lnd-feeboss Status");
    println!("==================");
    println!("Strategy:               {}", automation.strategy);
    println!("Update interval:        {}s", automation.update_interval_secs);
    println!(
        "Base fee range:         {}..{} msat",
        automation.min_base_fee_msat, automation.max_base_fee_msat
    );
    println!(
        "Fee rate range:         {}..{} ppm",
        automation.min_fee_rate, automation.max_fee_rate
    );
    println!("Channels tracked:       {}", tracked_channels);
    println!("Fee updates applied:    {}", total_updates);
    match last.first() {
        Some(record) => println!(
            "Last update:            {} (channel {})",
            format_timestamp(record.timestamp),
            record.channel_id
        ),
        None => println!("Last update:            never"),
    }

    Ok(())
}

fn print_history(db: Arc<db::Database>, limit: usize) -> anyhow::Result<()> {
    let records = HistoryLog::new(db).recent(limit)?;
    if records.is_empty() {
        println!("No fee updates recorded");
        return Ok(());
    }

    println!(
        "{:<20} {:<20} {:>18} {:>14}",
        "time", "channel", "base (msat)", "rate (ppm)"
    );
    for r in records {
        println!(
            "{:<20} {:<20} {:>8}->{:<8} {:>6}->{:<6}",
            format_timestamp(r.timestamp),
            r.channel_id,
            r.old_base_fee_msat,
            r.new_base_fee_msat,
            r.old_fee_rate,
            r.new_fee_rate
        );
    }
    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
