//! `nodehost` - contract-driven node runtime host
//!
//! Thin CLI over `nodehost-core`: contract validation, fingerprints, the
//! protocol lockfile, and a stdin-fed host running the reference handlers.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use nodehost_core::contract::Contract;
use nodehost_core::handler::memory::reference_handlers;
use nodehost_core::{
    ContractStore, Envelope, HandlerRegistry, HostBuilder, HostConfig, InMemoryEventSource, NodeKind,
    ProtocolLockfile,
};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command {
        Commands::Validate { dir, strict } => validate(&dir, strict),
        Commands::Fingerprint { file } => fingerprint(&file),
        Commands::Lock { check, path } => lock(&path, check),
        Commands::Run {
            contracts,
            echo_compute,
            health,
        } => {
            let mut config = load_config(config_path.as_deref())?;
            if contracts.is_some() {
                config.runtime.contracts_dir = contracts;
            }
            run(config, echo_compute, health).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    let mut config = match path {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => HostConfig::load_or_default().context("Failed to load configuration")?,
    };
    config
        .apply_env_overrides()
        .context("Invalid environment override")?;
    Ok(config)
}

fn validate(dir: &Path, strict: bool) -> Result<()> {
    let mut store = ContractStore::new().strict(strict);
    let loaded = store
        .load_dir(dir)
        .with_context(|| format!("Contract validation failed in {}", dir.display()))?;

    for outcome in &loaded {
        let meta = outcome.metadata();
        println!(
            "{:<40} {:<13} {:<10} {}",
            meta.node_id(),
            meta.kind().to_string(),
            meta.version(),
            meta.fingerprint()
        );
    }
    println!("{} contract(s) valid", loaded.len());
    Ok(())
}

fn fingerprint(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let contract = Contract::from_yaml(&text)?;
    let computed = contract.compute_fingerprint()?;
    println!("{}", computed);

    if let Some(declared) = &contract.fingerprint {
        if *declared != computed {
            bail!("declared fingerprint {} does not match computed {}", declared, computed);
        }
    }
    Ok(())
}

fn lock(path: &Path, check: bool) -> Result<()> {
    let mut registry = HandlerRegistry::new();
    for handler in reference_handlers() {
        registry.register(handler)?;
    }
    let current = ProtocolLockfile::generate(&registry);

    if !check {
        current.save(path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let committed = ProtocolLockfile::load(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let comparison = committed.check(&current)?;
    for change in &comparison.compatible {
        println!("compatible: {}", change);
    }
    if comparison.is_clean() {
        println!("{} is up to date", path.display());
    } else {
        println!("{} has compatible changes; run `nodehost lock` to refresh it", path.display());
    }
    Ok(())
}

async fn run(config: HostConfig, echo_compute: bool, print_health: bool) -> Result<()> {
    let mut builder = HostBuilder::new(config.clone()).handlers(reference_handlers());

    if echo_compute {
        if let Some(dir) = &config.runtime.contracts_dir {
            let mut store = ContractStore::new();
            store.load_dir(dir)?;
            for meta in store.iter().filter(|m| m.kind() == NodeKind::Compute) {
                builder = builder.compute(meta.node_id(), |payload| Ok(payload.clone()));
            }
        }
    }

    let (sender, source) = InMemoryEventSource::channel(256);
    let host = builder.boot(Box::new(source)).await.context("Boot failed")?;
    tracing::info!(state = %host.state(), nodes = host.nodes().len(), "host booted");

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => {
                    if sender.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(line = line_no, error = %e, "skipping malformed envelope"),
            }
        }
        anyhow::Ok(())
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping");
            on_signal.cancel();
        }
    });

    let summary = host.run(cancel).await;
    reader.abort();
    let report = host.health();
    host.shutdown().await?;

    let summary = summary?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if print_health {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if summary.failed > 0 {
        bail!("{} envelope(s) failed", summary.failed);
    }
    Ok(())
}
