//! UPI escrow registrar command line interface
//!
//! Registers UPI ids against the remote registry, links escrow wallets to
//! them and keeps the local cache reconciled. Results are printed as JSON.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use metrics::describe_counter;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use upi_registry::{
    DeleteOptions, GenerateEscrowOptions, HttpRegistryClient, IdentityKeyFile, Registrar,
    RegistryError, SledCache, OPERATIONS_METRIC,
};
use upi_types::{Address, UpiId};

use crate::config::{default_config_path, init_logging, RegistrarConfig};

#[derive(Parser)]
#[command(name = "upi-registrar")]
#[command(about = "Manage UPI id to escrow wallet mappings", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to <config dir>/upi-registrar/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Registry endpoint, overriding the configuration
    #[arg(long, global = true, value_name = "URL")]
    registry_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,
    /// Generate the identity key that signs registry writes
    Keygen {
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Show the identity address
    Whoami,
    /// Register a UPI id for this identity
    Register { upi_id: String },
    /// Move a mapping to a new UPI id
    Update { old: String, new: String },
    /// Remove a mapping
    Delete(DeleteCommand),
    /// Escrow wallet operations
    Escrow {
        #[command(subcommand)]
        action: EscrowCommands,
    },
    /// Overwrite the local cache with the registry's view
    Reconcile {
        /// Owner to reconcile (defaults to this identity)
        #[arg(long, value_name = "ADDRESS")]
        owner: Option<String>,
    },
    /// List cached mappings
    List {
        #[arg(long, value_name = "ADDRESS")]
        owner: Option<String>,
    },
}

#[derive(Args)]
struct DeleteCommand {
    upi_id: String,
    /// Delete even though an escrow wallet is still linked
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand)]
enum EscrowCommands {
    /// Generate an escrow wallet and link it to a mapping
    Generate(GenerateCommand),
    /// Link an existing unlinked wallet again
    RetryLink { upi_id: String },
    /// Show the wallet stored for a mapping
    Show {
        upi_id: String,
        /// Decrypt the key and check it against the recorded address
        #[arg(long)]
        verify: bool,
    },
}

#[derive(Args)]
struct GenerateCommand {
    upi_id: String,
    /// Replace an existing wallet; its key material is discarded
    #[arg(long)]
    regenerate: bool,
    /// Skip the confirmation prompt for --regenerate
    #[arg(long, requires = "regenerate")]
    yes: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match RegistrarConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(url) = &cli.registry_url {
        config.registry_url = url.clone();
    }
    init_logging(&config);
    describe_counter!(OPERATIONS_METRIC, "Registrar operations by outcome");

    match run(cli.command, &config).await {
        Ok(Value::Null) => ExitCode::SUCCESS,
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &RegistrarConfig) -> Result<Value> {
    match command {
        Commands::Config => {
            if let Some(path) = default_config_path() {
                println!("# default location: {}", path.display());
            }
            print!("{}", config.redacted().to_toml()?);
            Ok(Value::Null)
        }
        Commands::Keygen { force } => keygen(config, force),
        Commands::Whoami => {
            let keyfile = load_identity(config)?;
            Ok(json!({ "address": keyfile.address }))
        }
        Commands::Register { upi_id } => {
            let registrar = open_registrar(config)?;
            let outcome = registrar
                .register(&parse_upi(&upi_id)?, registrar.identity())
                .await?;
            Ok(json!({
                "upi_id": outcome.record.upi_id,
                "owner": outcome.record.owner,
                "adopted": outcome.adopted,
                "reference": outcome.reference,
            }))
        }
        Commands::Update { old, new } => {
            let registrar = open_registrar(config)?;
            let outcome = registrar.update(&parse_upi(&old)?, &parse_upi(&new)?).await?;
            Ok(json!({
                "record": outcome.record,
                "removed": outcome.removed,
                "registered": outcome.registered,
            }))
        }
        Commands::Delete(cmd) => {
            let registrar = open_registrar(config)?;
            let outcome = registrar
                .delete(&parse_upi(&cmd.upi_id)?, DeleteOptions { force: cmd.force })
                .await?;
            Ok(json!({
                "upi_id": outcome.upi_id,
                "reference": outcome.reference,
                "local_only": outcome.local_only(),
                "unlinked_escrow": outcome.unlinked_escrow,
            }))
        }
        Commands::Escrow { action } => handle_escrow_commands(action, config).await,
        Commands::Reconcile { owner } => {
            let registrar = open_registrar(config)?;
            let owner = resolve_owner(owner.as_deref(), &registrar)?;
            let report = registrar.reconcile(&owner).await?;
            Ok(serde_json::to_value(report)?)
        }
        Commands::List { owner } => {
            let registrar = open_registrar(config)?;
            let owner = resolve_owner(owner.as_deref(), &registrar)?;
            Ok(serde_json::to_value(registrar.mappings(&owner)?)?)
        }
    }
}

async fn handle_escrow_commands(cmd: EscrowCommands, config: &RegistrarConfig) -> Result<Value> {
    let registrar = open_registrar(config)?;

    match cmd {
        EscrowCommands::Generate(generate) => {
            let upi_id = parse_upi(&generate.upi_id)?;
            if generate.regenerate && !generate.yes {
                if let Some(existing) = registrar.escrow_wallet(&upi_id)? {
                    let prompt = format!(
                        "Key material of escrow {} will be destroyed and cannot be recovered. Continue?",
                        existing.address
                    );
                    if !confirm(&prompt)? {
                        anyhow::bail!("regenerate aborted");
                    }
                }
            }
            let outcome = registrar
                .generate_escrow(
                    &upi_id,
                    GenerateEscrowOptions {
                        regenerate: generate.regenerate,
                    },
                )
                .await?;
            Ok(json!({
                "upi_id": outcome.upi_id,
                "escrow_address": outcome.address,
                "reference": outcome.reference,
                "reused_key": outcome.reused_key,
                "replaced": outcome.replaced,
            }))
        }
        EscrowCommands::RetryLink { upi_id } => {
            let outcome = registrar.retry_escrow_link(&parse_upi(&upi_id)?).await?;
            Ok(json!({
                "upi_id": outcome.upi_id,
                "escrow_address": outcome.address,
                "reference": outcome.reference,
            }))
        }
        EscrowCommands::Show { upi_id, verify } => {
            let upi_id = parse_upi(&upi_id)?;
            let wallet = registrar
                .escrow_wallet(&upi_id)?
                .with_context(|| format!("no escrow wallet stored for {upi_id}"))?;
            let mut output = json!({
                "upi_id": upi_id,
                "escrow_address": wallet.address,
                "linked": wallet.is_linked(),
                "encrypted": wallet.key.is_encrypted(),
                "created_at": wallet.created_at,
            });
            if verify {
                registrar.unlock_escrow(&upi_id, None)?;
                output["key_verified"] = Value::Bool(true);
            }
            Ok(output)
        }
    }
}

fn keygen(config: &RegistrarConfig, force: bool) -> Result<Value> {
    let path = config.identity_key_path();
    let (keyfile, _) = IdentityKeyFile::generate(config.identity_key_password.as_deref())?;
    keyfile
        .save(&path, force)
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    Ok(json!({
        "address": keyfile.address,
        "key_file": path,
        "encrypted": keyfile.secret.is_encrypted(),
    }))
}

fn load_identity(config: &RegistrarConfig) -> Result<IdentityKeyFile> {
    let path = config.identity_key_path();
    IdentityKeyFile::load(&path).with_context(|| {
        format!(
            "failed to load identity key {} (run `upi-registrar keygen` first)",
            path.display()
        )
    })
}

fn open_registrar(config: &RegistrarConfig) -> Result<Registrar> {
    let signing_key = load_identity(config)?
        .unlock(config.identity_key_password.as_deref())
        .context("failed to unlock identity key")?;
    let client = HttpRegistryClient::new(
        &config.registry_url,
        signing_key,
        Duration::from_secs(config.request_timeout_secs),
    )
    .with_context(|| format!("invalid registry URL {}", config.registry_url))?;

    let cache_path = config.cache_path();
    let cache = SledCache::open(&cache_path)
        .with_context(|| format!("failed to open local cache {}", cache_path.display()))?;

    let registrar = Registrar::new(Arc::new(client), Arc::new(cache));
    debug!(
        identity = %registrar.identity(),
        registry_url = %config.registry_url,
        cache = %cache_path.display(),
        "opened registrar"
    );
    Ok(match &config.escrow_key_password {
        Some(password) => registrar.with_escrow_password(password.clone()),
        None => registrar,
    })
}

fn parse_upi(raw: &str) -> Result<UpiId> {
    UpiId::parse(raw).map_err(|err| RegistryError::from(err).into())
}

fn resolve_owner(raw: Option<&str>, registrar: &Registrar) -> Result<Address> {
    match raw {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid owner address {raw}")),
        None => Ok(registrar.identity()),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Registry errors carry whether local state changed and whether a retry can help.
fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<RegistryError>() {
        Some(registry_err) => {
            let body = json!({
                "error": registry_err.kind(),
                "message": registry_err.to_string(),
                "local_state_changed": registry_err.local_state_changed(),
                "retryable": registry_err.is_retryable(),
            });
            eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
        }
        None => eprintln!("Error: {err:#}"),
    }
}
