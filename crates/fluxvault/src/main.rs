mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fluxvault_agent::{AgentConfig, AgentServer};
use fluxvault_core::Identity;
use fluxvault_crypto::FileKeyStore;
use fluxvault_keeper::{Keeper, KeeperConfig};
use fluxvault_logging::{FileConfig, FluxvaultSubscriberBuilder, WorkerGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::{Cli, Command, LogFormat};

fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let mut builder = FluxvaultSubscriberBuilder::new().with_level(cli.log_level.clone());
    if cli.log_format == LogFormat::Pretty {
        builder = builder.with_pretty_console(true);
    }
    if let Some(dir) = &cli.log_dir {
        builder = builder.with_file_output(FileConfig {
            directory: dir.clone(),
            ..FileConfig::default()
        });
    }
    builder.try_init().context("failed to initialize logging")
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        token.cancel();
    });
}

async fn run_agent(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(config_path)
        .with_context(|| format!("loading agent config {}", config_path.display()))?;
    let identities = Arc::new(config.identity_directory()?);
    let server = AgentServer::bind(config, identities).await?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    server.run(shutdown).await?;
    Ok(())
}

async fn run_keeper(config_path: &std::path::Path, once: bool) -> anyhow::Result<()> {
    let mut config = KeeperConfig::from_file(config_path)
        .with_context(|| format!("loading keeper config {}", config_path.display()))?;
    config.run_once |= once;

    let keys = FileKeyStore::new(&config.key_store_dir);
    if let Some(account) = &config.signing_account {
        let key = keys.load_or_generate(account)?;
        let identity = Identity::new(account.clone(), key.verifying_key());
        info!(
            account = %account,
            public_key = %identity.public_key_base64(),
            "Signing connections"
        );
    }

    let run_once = config.run_once;
    let keeper = Keeper::with_static_addresses(config, &keys)?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let report = keeper.run(shutdown).await;
    if run_once {
        if let Some(report) = report {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed() > 0 {
                anyhow::bail!("{} of {} agent sessions failed", report.failed(), report.agents.len());
            }
        }
    }
    Ok(())
}

fn keygen(account: &str, key_dir: &std::path::Path) -> anyhow::Result<()> {
    let keys = FileKeyStore::new(key_dir);
    let key = keys.load_or_generate(account)?;
    let identity = Identity::new(account, key.verifying_key());
    println!("account:    {account}");
    println!("public_key: {}", identity.public_key_base64());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;

    match &cli.command {
        Command::Agent { config } => run_agent(config).await,
        Command::Keeper { config, once } => run_keeper(config, *once).await,
        Command::Keygen { account, key_dir } => keygen(account, key_dir),
    }
}
