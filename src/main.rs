//! # PrcDrop — price-drop tracker
//!
//! Watches product pages and emails a subscriber once the price falls below
//! the first price seen.
//!
//! Usage:
//!   prcdrop                          # Start scheduler + HTTP gateway
//!   prcdrop serve --dry-run          # Log alerts instead of sending mail
//!   prcdrop probe <url>              # One-off price check
//!   prcdrop init-config              # Write a default config file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prcdrop_core::PrcDropConfig;
use prcdrop_core::config::expand_path;
use prcdrop_core::selectors::SelectorStore;
use prcdrop_core::traits::PriceProbe;
use prcdrop_core::types::normalize_url;
use prcdrop_gateway::AppState;
use prcdrop_probe::HttpProbe;
use prcdrop_scheduler::dispatch::{notifier_from_config, operator_notifier_from_config};
use prcdrop_scheduler::{Scheduler, SubscriptionStore};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "prcdrop",
    version,
    about = "📉 PrcDrop — get an email when a product's price drops"
)]
struct Cli {
    /// Config file (default: ~/.prcdrop/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and HTTP gateway (default)
    Serve {
        /// Log alerts instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Fetch a product page once and print its price
    Probe {
        url: String,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "prcdrop=debug,prcdrop_core=debug,prcdrop_probe=debug,prcdrop_scheduler=debug,prcdrop_gateway=debug,operator=debug,tower_http=debug"
    } else {
        "prcdrop=info,prcdrop_core=info,prcdrop_probe=info,prcdrop_scheduler=info,prcdrop_gateway=info,operator=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(PrcDropConfig::default_path)
}

fn load_config(cli: &Cli) -> Result<PrcDropConfig> {
    let config = match &cli.config {
        Some(path) => PrcDropConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PrcDropConfig::load()?,
    };
    tracing::debug!("⚙️ Config loaded from {}", config_path(cli).display());
    Ok(config)
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn serve(config: PrcDropConfig, dry_run: bool) -> Result<()> {
    let db_path = expand_path(&config.scheduler.db_path);
    let store = Arc::new(
        SubscriptionStore::open(&db_path)
            .with_context(|| format!("opening {}", db_path.display()))?,
    );
    let selectors = Arc::new(SelectorStore::from_file(&expand_path(&config.selectors.path)));
    let probe = Arc::new(HttpProbe::new(&config.probe)?);
    let notifier = notifier_from_config(&config, dry_run)?;

    let scheduler = Arc::new(
        Scheduler::from_config(&config, store, selectors, probe, notifier)
            .with_operator_notifier(operator_notifier_from_config(&config)),
    );
    scheduler.recover().await?;

    let (tx, rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_signal(rx.clone())));
    let state = Arc::new(AppState::new(scheduler, Arc::new(config)));
    let mut gateway = tokio::spawn(prcdrop_gateway::serve(state, shutdown_signal(rx)));

    let gateway_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("🛑 Ctrl-C received, shutting down");
            let _ = tx.send(true);
            gateway.await
        }
        result = &mut gateway => {
            let _ = tx.send(true);
            result
        }
    };

    scheduler_task.await?;
    gateway_result??;
    tracing::info!("👋 Bye");
    Ok(())
}

async fn probe_once(config: PrcDropConfig, url: &str) -> Result<()> {
    let url = url.trim();
    normalize_url(url)?;
    let selectors = SelectorStore::from_file(&expand_path(&config.selectors.path));
    let probe = HttpProbe::new(&config.probe)?;
    let price = probe.probe(url, &selectors.snapshot()).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "url": url, "price": price }))?
    );
    Ok(())
}

fn init_config(cli: &Cli, force: bool) -> Result<()> {
    let path = config_path(cli);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    PrcDropConfig::default().save_to(&path)?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match &cli.command {
        None => serve(load_config(&cli)?, false).await,
        Some(Command::Serve { dry_run }) => serve(load_config(&cli)?, *dry_run).await,
        Some(Command::Probe { url }) => probe_once(load_config(&cli)?, url).await,
        Some(Command::InitConfig { force }) => init_config(&cli, *force),
    }
}
