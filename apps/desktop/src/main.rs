use std::{path::PathBuf, sync::Arc};

use alloy_primitives::{address, Address};
use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    BindingEvent, ContributionAggregator, ContributionController, ControllerConfig, Gesture,
    OrchestratorConfig, TransactionOrchestrator,
};
use ledger_gateway::{SimulatedLedger, WalletHandle};
use shared::{
    domain::{BucketId, Catalog, SessionId},
    protocol::{Fill, SnapshotView},
    units::tokens,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings_from, Settings, SETTINGS_FILE};

/// Demo account holding the simulated wallet's tokens.
const DEMO_WALLET: Address = address!("00000000000000000000000000000000c0ffee01");
const DEMO_WALLET_BALANCE: u64 = 100;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; missing files fall back to defaults.
    #[arg(long, default_value = SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    rpc_url: Option<String>,
    #[arg(long)]
    catalog: Option<PathBuf>,
    #[arg(long)]
    log_filter: Option<String>,
    /// Bucket to contribute one unit to after loading.
    #[arg(long)]
    bucket: Option<String>,
    /// Initial simulated totals, e.g. `--seed US=5 --seed CN=3` (whole tokens).
    #[arg(long = "seed", value_parser = parse_seed)]
    seeds: Vec<(String, u64)>,
    /// How many leaders to list.
    #[arg(long, default_value_t = 10)]
    top: usize,
    /// Print the snapshot as JSON instead of a table.
    #[arg(long)]
    json: bool,
    /// Start without a connected wallet.
    #[arg(long)]
    no_wallet: bool,
}

fn parse_seed(raw: &str) -> Result<(String, u64), String> {
    let (id, amount) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=AMOUNT, got '{raw}'"))?;
    let amount = amount
        .trim()
        .parse::<u64>()
        .map_err(|err| format!("invalid amount in '{raw}': {err}"))?;
    Ok((id.trim().to_string(), amount))
}

fn settings_from(args: &Args) -> Result<Settings> {
    let mut settings = load_settings_from(&args.config, |key| std::env::var(key).ok())?;
    if let Some(v) = &args.rpc_url {
        settings.rpc_url = v.clone();
    }
    if let Some(v) = &args.catalog {
        settings.catalog_path = Some(v.clone());
    }
    if let Some(v) = &args.log_filter {
        settings.log_filter = v.clone();
    }
    settings.validate()?;
    Ok(settings)
}

fn load_catalog(settings: &Settings) -> Result<Catalog> {
    let catalog = match &settings.catalog_path {
        Some(path) => Catalog::load(path),
        None => Catalog::builtin(),
    };
    Ok(catalog?)
}

async fn seed_ledger(
    ledger: &SimulatedLedger,
    catalog: &Catalog,
    seeds: &[(String, u64)],
    decimals: u8,
) -> Result<()> {
    let defaults = [("US".to_string(), 5), ("CN".to_string(), 3)];
    let seeds = if seeds.is_empty() { &defaults[..] } else { seeds };
    for (raw, amount) in seeds {
        let bucket = catalog
            .resolve(raw)
            .with_context(|| format!("cannot seed bucket '{raw}'"))?;
        ledger.set_total(&bucket.id, tokens(*amount, decimals)).await;
    }
    ledger
        .mint(DEMO_WALLET, tokens(DEMO_WALLET_BALANCE, decimals))
        .await;
    Ok(())
}

fn print_snapshot(view: &SnapshotView, settings: &Settings, top: usize) {
    let scale = view.color_scale(settings.token_decimals);
    match scale.legend() {
        Some((min, max)) => println!(
            "Colony sizes ({}): {min} .. {max}{}",
            settings.token_symbol,
            if view.stale { " (updating)" } else { "" }
        ),
        None => println!("No contributions yet."),
    }
    for leader in view.leaders().take(top) {
        let shade = match scale.fill(leader.amount) {
            Fill::NoContribution => "-".to_string(),
            Fill::Intensity(t) => format!("{:.0}%", t * 100.0),
        };
        println!(
            "  #{:<3} {:<2} {:<28} {:>6}",
            leader.rank + 1,
            leader.id,
            leader.tooltip(&settings.token_symbol, settings.token_decimals)
                .replace('\n', " | "),
            shade
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = settings_from(&args)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let catalog = Arc::new(load_catalog(&settings)?);
    info!(
        buckets = catalog.len(),
        rpc_url = %settings.rpc_url,
        chain_id = settings.chain_id,
        "desktop: catalog loaded, using the in-process simulated ledger"
    );

    let ledger = SimulatedLedger::new(settings.ledger_address, settings.token_address);
    seed_ledger(&ledger, &catalog, &args.seeds, settings.token_decimals).await?;

    let wallet = if args.no_wallet {
        WalletHandle::disconnected()
    } else {
        WalletHandle::connected(ledger.signer(DEMO_WALLET))
    };

    let aggregator = Arc::new(ContributionAggregator::new(
        Arc::clone(&catalog),
        Arc::clone(&ledger) as _,
    ));
    let orchestrator = TransactionOrchestrator::new(
        SessionId::new(),
        Arc::clone(&catalog),
        Arc::clone(&ledger) as _,
        wallet,
        OrchestratorConfig {
            spender: settings.ledger_address,
            unit: settings.contribution_unit(),
            gas_limit: Some(settings.contribute_gas_limit),
            lock_timeout: settings.lock_timeout(),
        },
    );
    let controller = ContributionController::new(
        aggregator,
        orchestrator,
        ControllerConfig {
            token_symbol: settings.token_symbol.clone(),
            token_decimals: settings.token_decimals,
            status_clear_after: settings.status_clear_after(),
        },
    );

    let view = controller.load().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_snapshot(&view, &settings, args.top);
    }

    let Some(bucket) = args.bucket.as_deref() else {
        return Ok(());
    };

    let mut events = controller.subscribe_events();
    let handle = match controller.request_contribution(bucket)? {
        Gesture::Started(handle) => handle,
        Gesture::Debounced => bail!("a contribution to {bucket} is already being handled"),
    };

    loop {
        match events.recv().await {
            Ok(BindingEvent::Status(entry)) => {
                println!("{}", entry.message);
                if entry.is_settled() {
                    break;
                }
            }
            Ok(BindingEvent::Error { class, message }) => {
                warn!(?class, %message, "desktop: binding error");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "desktop: event stream interrupted");
                break;
            }
        }
    }
    handle.await.context("contribution task panicked")?;

    let view = controller.snapshot();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        let id: BucketId = bucket.parse()?;
        if let Some(updated) = view.bucket(&id) {
            println!(
                "{}",
                updated.tooltip(&settings.token_symbol, settings.token_decimals)
            );
        }
        print_snapshot(&view, &settings, args.top);
    }
    controller.acknowledge();
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
