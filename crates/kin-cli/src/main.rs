use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use kin_core::keys;
use kin_core::metadata::SecurityMetadataPatch;
use kin_core::{
    export_backup, import_backup, Actor, BackupIntegrity, Capability, KinConfig, Pin,
    ProviderChoice, ProviderKind, Role, Storage, StorageContext,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const ENV_PIN: &str = "KIN_PIN";
const ENV_NEW_PIN: &str = "KIN_NEW_PIN";

#[derive(Parser, Debug)]
#[command(author, version, about = "Kin caregiving data store", long_about = None)]
struct Cli {
    /// Directory for the local store (defaults to KIN_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// local, supabase or auto
    #[arg(long, global = true)]
    provider: Option<ProviderChoice>,
    /// Family member running the command
    #[arg(long, global = true, default_value = "owner")]
    user: String,
    /// admin, caregiver or viewer
    #[arg(long, global = true, default_value = "admin")]
    role: Role,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the security metadata record
    Init,
    /// Show provider and protection state
    Status,
    /// Set or change the PIN
    SetPin,
    /// Turn local encryption on or off
    Encryption {
        #[command(subcommand)]
        action: EncryptionAction,
    },
    /// Print a stored value as JSON
    Get { key: String },
    /// Store a JSON value under a key
    Put { key: String, value: String },
    /// Delete a stored value
    Remove { key: String },
    /// Write a checksummed backup file
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Verify and merge a backup file
    Import { file: PathBuf },
    /// List security events, newest first
    Events {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Erase all data, the PIN and the audit trail
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum EncryptionAction {
    Enable,
    Disable,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kin_core=warn,kin=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let actor = Actor::new(cli.user.clone(), cli.role);
    let storage = open_storage(&cli)?;

    match cli.command {
        Commands::Init => init_command(&storage).await,
        Commands::Status => status_command(&storage).await,
        Commands::SetPin => set_pin_command(&storage, &actor).await,
        Commands::Encryption { action } => encryption_command(&storage, &actor, action).await,
        Commands::Get { key } => {
            unlock_if_needed(&storage, &actor).await?;
            let value: Value = storage.load(resolve_key(&key)?, Value::Null).await;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Commands::Put { key, value } => {
            let key = resolve_key(&key)?;
            let value: Value = serde_json::from_str(&value).context("value must be JSON")?;
            unlock_if_needed(&storage, &actor).await?;
            storage.authorize(&actor, Capability::WriteRecords).await?;
            let storage = Arc::new(storage);
            storage.persist(key, &value).await?;
            Ok(())
        }
        Commands::Remove { key } => {
            let key = resolve_key(&key)?;
            unlock_if_needed(&storage, &actor).await?;
            storage.authorize(&actor, Capability::WriteRecords).await?;
            storage.remove(key).await;
            Ok(())
        }
        Commands::Export { out } => {
            unlock_if_needed(&storage, &actor).await?;
            let raw = export_backup(&storage, &actor).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, raw)
                        .with_context(|| format!("write {}", path.display()))?;
                    println!("Backup written to {}", path.display());
                }
                None => println!("{raw}"),
            }
            Ok(())
        }
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            unlock_if_needed(&storage, &actor).await?;
            let summary = import_backup(&storage, &actor, &raw).await?;
            if summary.integrity == BackupIntegrity::Unsigned {
                println!("Warning: backup has no checksum; imported on schema checks only");
            }
            for c in &summary.collections {
                println!("{}: {} replaced, {} added", c.key, c.replaced, c.added);
            }
            println!("Settings replaced");
            Ok(())
        }
        Commands::Events { limit, json } => {
            unlock_if_needed(&storage, &actor).await?;
            let events = storage.audit().recent(limit);
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                for e in events {
                    println!(
                        "{} {:?} {} [{}] {}",
                        e.timestamp.to_rfc3339(),
                        e.severity,
                        serde_json::to_value(e.event_type)?
                            .as_str()
                            .unwrap_or_default(),
                        e.user,
                        e.details
                    );
                }
            }
            Ok(())
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("refusing to erase all data without --yes");
            }
            storage.load_audit_log().await;
            storage.reset_all(&actor).await?;
            println!("All data erased");
            Ok(())
        }
    }
}

fn open_storage(cli: &Cli) -> Result<Storage> {
    let mut config = KinConfig::from_env();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    let context = Arc::new(StorageContext::resolve(cli.provider, &config));
    Ok(Storage::open(context, &config)?)
}

/// Accepts `kin_entries` or the short form `entries`.
fn resolve_key(name: &str) -> Result<&'static str> {
    keys::ALL
        .iter()
        .copied()
        .find(|k| *k == name || k.strip_prefix("kin_") == Some(name))
        .ok_or_else(|| anyhow!("unknown key {name:?}; expected one of {}", keys::ALL.join(", ")))
}

/// Loads the audit trail, asking for the PIN first when values are encrypted.
async fn unlock_if_needed(storage: &Storage, actor: &Actor) -> Result<()> {
    let meta = storage.metadata().get().await;
    if meta.encryption_enabled && storage.context().provider() == ProviderKind::Local {
        let pin = prompt_pin_once("Enter PIN: ")?;
        storage.unlock(actor, &pin).await?;
    } else {
        storage.load_audit_log().await;
    }
    Ok(())
}

async fn init_command(storage: &Storage) -> Result<()> {
    let meta = storage
        .metadata()
        .update(SecurityMetadataPatch::default())
        .await?;
    info!(version = meta.version, "security metadata ready");
    println!("Initialised ({} provider)", storage.context().provider());
    Ok(())
}

async fn status_command(storage: &Storage) -> Result<()> {
    let meta = storage.metadata().get().await;
    println!("provider:   {}", storage.context().provider());
    println!("family:     {}", storage.context().family_id());
    println!("pin set:    {}", meta.has_pin());
    println!("encryption: {}", if meta.encryption_enabled { "on" } else { "off" });
    Ok(())
}

async fn set_pin_command(storage: &Storage, actor: &Actor) -> Result<()> {
    let meta = storage.metadata().get().await;
    let current = if meta.has_pin() {
        let pin = prompt_pin_once("Current PIN: ")?;
        storage.unlock(actor, &pin).await?;
        Some(pin)
    } else {
        storage.load_audit_log().await;
        None
    };
    let new = prompt_new_pin()?;
    storage.set_pin(actor, current.as_ref(), &new).await?;
    println!("PIN updated");
    Ok(())
}

async fn encryption_command(
    storage: &Storage,
    actor: &Actor,
    action: EncryptionAction,
) -> Result<()> {
    let pin = prompt_pin_once("Enter PIN: ")?;
    storage.unlock(actor, &pin).await?;
    match action {
        EncryptionAction::Enable => {
            storage.enable_encryption(actor, &pin).await?;
            println!("Encryption enabled");
        }
        EncryptionAction::Disable => {
            storage.disable_encryption(actor, &pin).await?;
            println!("Encryption disabled");
        }
    }
    Ok(())
}

fn prompt_pin_once(prompt: &str) -> Result<Pin> {
    if let Ok(pin) = std::env::var(ENV_PIN) {
        if !pin.is_empty() {
            return Ok(Pin::parse(&pin)?);
        }
    }
    let pin = rpassword::prompt_password(prompt).map_err(|e| anyhow!("PIN prompt: {e}"))?;
    Ok(Pin::parse(&pin)?)
}

fn prompt_new_pin() -> Result<Pin> {
    if let Ok(pin) = std::env::var(ENV_NEW_PIN) {
        if !pin.is_empty() {
            return Ok(Pin::parse(&pin)?);
        }
    }
    let first = rpassword::prompt_password("New PIN: ").map_err(|e| anyhow!("PIN prompt: {e}"))?;
    let second =
        rpassword::prompt_password("Confirm PIN: ").map_err(|e| anyhow!("PIN prompt: {e}"))?;
    if first != second {
        bail!("PINs do not match");
    }
    Ok(Pin::parse(&first)?)
}
