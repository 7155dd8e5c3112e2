//! Spendwatch CLI
//!
//! Command-line interface for the spending monitor.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use spendwatch::api::{AppState, HttpServer};
use spendwatch::collector::PriceTable;
use spendwatch::db::Stores;
use spendwatch::{telemetry, Config, MonitorController};

/// Spendwatch - spending limits for AI API usage
#[derive(Parser)]
#[command(name = "spendwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "SPENDWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive cost webhooks and enforce spending limits
    Serve {
        /// Address to bind to
        #[arg(long)]
        host: Option<String>,

        /// HTTP port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show spending over a trailing period
    Summary {
        /// Hours to look back
        #[arg(long, default_value = "24")]
        hours: u32,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    telemetry::init_logging(&config.logging, cli.verbose);

    let result = match cli.command {
        Commands::Serve { host, port } => run_serve(config, host, port).await,
        Commands::Summary { hours, format } => run_summary(config, hours, format).await,
        Commands::CheckConfig => run_check_config(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(mut config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let stores = Stores::connect(&config.database)
        .await
        .context("connecting to the ledger")?;
    let monitor = Arc::new(MonitorController::from_config(&config, stores)?);
    monitor
        .restore(Utc::now())
        .await
        .context("restoring window state from the ledger")?;

    for definition in monitor.definitions() {
        match definition.limit {
            Some(limit) => info!(kind = %definition.kind, limit = %limit, "Tracking window"),
            None => info!(kind = %definition.kind, "Tracking window without limit"),
        }
    }

    if config.webhook.secret.is_none() {
        warn!("No webhook secret configured, signatures will not be verified");
    }

    let metrics = match telemetry::install_prometheus() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    };

    let state = AppState {
        monitor: monitor.clone(),
        webhook_secret: config.webhook.secret.as_deref().map(Arc::from),
        prices: config
            .webhook
            .estimate_missing_cost
            .then(|| Arc::new(PriceTable::new())),
        metrics,
    };

    let reconciler = (!config.alerting.reconcile_interval.is_zero()).then(|| {
        tokio::spawn(monitor.clone().run_reconciler(config.alerting.reconcile_interval))
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting Spendwatch on {}", addr);

    HttpServer::new(state).serve(&addr, shutdown_signal()).await?;

    if let Some(handle) = reconciler {
        handle.abort();
    }

    info!("Spendwatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn run_summary(config: Config, hours: u32, format: OutputFormat) -> anyhow::Result<()> {
    let stores = Stores::connect(&config.database).await?;
    let monitor = MonitorController::from_config(&config, stores)?;

    let summary = monitor.spending_summary(hours).await?;
    let totals = monitor.totals_at(Utc::now()).await?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({ "summary": summary, "windows": totals });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Spending over the last {} hours", summary.hours_analyzed);
            println!("  Requests:      {}", summary.total_requests);
            println!("  Total cost:    ${}", summary.total_cost.round_dp(4));
            println!("  Avg / request: ${}", summary.avg_cost_per_request.round_dp(6));
            if let (Some(first), Some(last)) = (summary.first_request, summary.last_request) {
                println!("  First / last:  {first} / {last}");
            }
            println!();
            println!("Current windows");
            for total in &totals {
                let limit = monitor
                    .limit_of(&total.kind)
                    .map_or_else(|| "none".to_string(), |l| format!("${l}"));
                let severity = monitor
                    .severity_of(total)
                    .map_or_else(|| "-".to_string(), |s| s.to_string());
                println!(
                    "  {:<10} ${:<12} limit {:<10} {} ({} events, from {})",
                    total.kind.name(),
                    total.sum_cost.round_dp(4),
                    limit,
                    severity,
                    total.event_count,
                    total.window_start
                );
            }
        }
    }

    Ok(())
}

fn run_check_config(mut config: Config) -> anyhow::Result<()> {
    if config.webhook.secret.is_some() {
        config.webhook.secret = Some("********".to_string());
    }
    if config.database.url.is_some() {
        config.database.url = Some("********".to_string());
    }

    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("Configuration is valid");
    Ok(())
}
