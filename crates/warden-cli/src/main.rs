mod bootstrap;
mod cli;
mod config;
mod console;
mod output;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use ed25519_dalek::VerifyingKey;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use warden_core::{CommandSurface, ControlLoop};
use warden_ledger::{verify_chainpack, verify_ledger_file};
use warden_security::parse_verifying_key;
use warden_supervisor::ProcessWorker;
use warden_types::{AgentId, WardenError};

use crate::cli::{Cli, Commands, ConfigAction};
use crate::config::WardenConfig;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn fatal_cause(err: &anyhow::Error) -> Option<&WardenError> {
    err.chain()
        .filter_map(|e| e.downcast_ref::<WardenError>())
        .find(|e| e.is_fatal())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(cause) = fatal_cause(&err) {
                error!(error = %cause, "Fatal startup error");
                output::print_error(&format!("FATAL: {err:#}"));
                output::print_error(
                    "warden cannot guarantee a trustworthy audit trail and will not continue. \
                     Inspect the ledger and key store before restarting.",
                );
                ExitCode::from(2)
            } else {
                output::print_error(&format!("{err:#}"));
                ExitCode::FAILURE
            }
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let state_dir = config::resolve_state_dir(cli.state_dir)?;
    match cli.command {
        Commands::Keygen { force } => {
            let key = bootstrap::key_store(&state_dir).generate(force)?;
            output::print_success(&format!(
                "Keys written to {}",
                bootstrap::key_store(&state_dir).dir().display()
            ));
            println!("  verifying key: {}", hex::encode(key.to_bytes()));
            Ok(())
        }
        Commands::Config { action } => handle_config(action, &state_dir),
        Commands::VerifyLedgerFile { file, key } => {
            let key = verifying_key(&state_dir, key.as_deref())?;
            let path = file.unwrap_or_else(|| bootstrap::ledger_path(&state_dir));
            let entries = verify_ledger_file(&path, &key)
                .with_context(|| format!("Ledger {} failed verification", path.display()))?;
            output::print_success(&format!("{}: {entries} entries verified", path.display()));
            Ok(())
        }
        Commands::VerifyChainpack { path, key } => {
            let key = verifying_key(&state_dir, key.as_deref())?;
            let entries = verify_chainpack(&path, &key)
                .with_context(|| format!("Chainpack {} failed verification", path.display()))?;
            output::print_success(&format!("{}: {entries} entries verified", path.display()));
            Ok(())
        }
        Commands::Run => {
            let config = WardenConfig::load(&state_dir)?;
            run(&state_dir, config, cli.json).await
        }
        Commands::Operator(op) => {
            let config = WardenConfig::load(&state_dir)?;
            let ctx = bootstrap::open_context(&state_dir, &config).await?;
            let surface = CommandSurface::new(ctx);
            let out = surface.execute(op.into(), cli.token.as_deref()).await?;
            output::print_output(&out, cli.json)
        }
    }
}

fn verifying_key(state_dir: &Path, key_hex: Option<&str>) -> Result<VerifyingKey> {
    match key_hex {
        Some(key_hex) => Ok(parse_verifying_key(key_hex)?),
        None => Ok(bootstrap::key_store(state_dir).load_verifying_key()?),
    }
}

fn handle_config(action: ConfigAction, state_dir: &Path) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let path = WardenConfig::config_path(state_dir);
            if path.exists() {
                println!("Config already exists at: {}", path.display());
                println!("Use `warden config show` to view it.");
                return Ok(());
            }
            WardenConfig::default().save(state_dir)?;
            println!("Created default config at: {}", path.display());
        }
        ConfigAction::Show => {
            let config = WardenConfig::load(state_dir)?;
            println!("# state_dir = {}", state_dir.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

async fn run(state_dir: &Path, config: WardenConfig, json: bool) -> Result<()> {
    let ctx = bootstrap::open_context(state_dir, &config).await?;

    for agent in &config.agents {
        let worker = Arc::new(ProcessWorker::new(agent.command.clone(), agent.args.clone()));
        match ctx.supervisor.spawn(AgentId::new(agent.name.clone()), worker).await {
            Ok(incarnation) => info!(agent = %agent.name, %incarnation, "Agent started"),
            Err(e) => warn!(agent = %agent.name, error = %e, "Agent not started"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = tokio::spawn(ControlLoop::new(ctx.clone(), config.intervals(), shutdown_rx.clone()).run());
    let surface = Arc::new(CommandSurface::new(ctx.clone()));
    let lines = console::console_lines().context("Failed to start console")?;
    let mut console_task = tokio::spawn(console::run(surface, json, lines, shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("Interrupt received");
        }
        Ok(true) = &mut console_task => info!("Stop requested from console"),
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = control.await {
        warn!(error = %e, "Control loop ended abnormally");
    }
    console_task.abort();
    info!(mode = %ctx.state.mode(), "Warden stopped");
    Ok(())
}
