//! smartlock CLI
//!
//! Terminal control surface for a smart-lock controller.
//!
//! ## Features
//!
//! - **Remote unlock**: send an unlock command and watch the status
//! - **Keys and patterns**: list, enroll, block and delete (with confirmation)
//! - **Pattern recording**: one tap per Enter press
//! - **Access log**: view the log, pruning entries past the retention window

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use smartlock::{
    Collection, Config, ConfirmationToken, DeleteTarget, LogEntry, MirrorHealth, SmartLock,
    UnlockState,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// smartlock - control a smart lock from the terminal
#[derive(Parser, Debug)]
#[command(name = "smartlock")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, env = "SMARTLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// REST store base URL; the local store is used when unset
    #[arg(long, env = "SMARTLOCK_STORE_URL")]
    store_url: Option<String>,

    /// Directory for the local store
    #[arg(long, env = "SMARTLOCK_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Principal whose collections to use
    #[arg(long, env = "SMARTLOCK_PRINCIPAL")]
    principal: Option<String>,

    /// Audit sink endpoint
    #[arg(long, env = "SMARTLOCK_SINK_URL")]
    sink_url: Option<String>,

    /// Log level
    #[arg(long, default_value = "warn", env = "SMARTLOCK_LOG_LEVEL")]
    log_level: Level,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show principal, unlock status and mirror state
    Status,
    /// Send a remote unlock
    Unlock,
    /// Manage RFID keys
    #[command(subcommand)]
    Keys(KeysCmd),
    /// Manage knock patterns
    #[command(subcommand)]
    Patterns(PatternsCmd),
    /// Open the access log (prunes old entries first)
    Logs,
    /// Print mirror changes until ctrl-c
    Watch,
}

#[derive(Subcommand, Debug)]
enum KeysCmd {
    /// List enrolled keys
    List,
    /// Enroll a key
    Add {
        /// Card identifier
        uid: String,
        /// Display label
        name: String,
    },
    /// Toggle the blocked flag of a key
    Block {
        /// Key id
        id: String,
    },
    /// Delete a key
    Delete {
        /// Key id
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PatternsCmd {
    /// List enrolled patterns
    List,
    /// Record and save a new pattern
    Record {
        /// Display label
        name: String,
    },
    /// Toggle the blocked flag of a pattern
    Block {
        /// Pattern id
        id: String,
    },
    /// Delete a pattern
    Delete {
        /// Pattern id
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = build_config(&args)?;
    debug!(?config, "Configuration resolved");

    let lock = SmartLock::open(config)
        .await
        .context("Failed to open smart lock")?;
    if lock.principal().is_none() {
        lock.close().await?;
        bail!("no principal: pass --principal or set `principal` in the config file");
    }

    let outcome = run(&lock, args.command).await;
    lock.close().await.context("Failed to close smart lock")?;
    outcome
}

/// Merge the config file with flags and environment.
fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let storage = args
                .storage_path
                .clone()
                .unwrap_or_else(Config::default_storage_path);
            let file = Config::new(&storage).config_file_path();
            if file.exists() {
                Config::load(&file).with_context(|| format!("Failed to load {}", file.display()))?
            } else {
                Config::new(storage)
            }
        }
    };

    if let Some(path) = &args.storage_path {
        config.storage_path.clone_from(path);
    }
    if let Some(url) = &args.store_url {
        config = config.with_store_url(url);
    }
    if let Some(principal) = &args.principal {
        config = config.with_principal(principal);
    }
    if let Some(url) = &args.sink_url {
        config = config.with_sink_url(url);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(lock: &SmartLock, command: Cmd) -> Result<()> {
    match command {
        Cmd::Status => {
            wait_for_mirrors(lock).await;
            let principal = lock.principal().map(|p| p.to_string()).unwrap_or_default();
            println!("principal:  {principal}");
            println!("unlock:     {}", describe_unlock(&lock.unlock_state()));
            println!("keys:       {} ({})", lock.keys().len(), describe_health(&lock.mirror_health(Collection::RfidTags)));
            println!(
                "patterns:   {} of {} ({})",
                lock.patterns().len(),
                lock.config().max_patterns,
                describe_health(&lock.mirror_health(Collection::KnockPatterns))
            );
            println!("log:        {} ({})", lock.logs().len(), describe_health(&lock.mirror_health(Collection::AccessLogs)));
        }
        Cmd::Unlock => {
            let mut states = lock.watch_unlock();
            lock.issue_unlock().await.context("Unlock failed")?;
            println!("{}", describe_unlock(&states.borrow_and_update()));
            let hold = lock.config().unlock_hold() + Duration::from_secs(1);
            if tokio::time::timeout(hold, states.changed()).await.is_ok() {
                println!("{}", describe_unlock(&states.borrow()));
            }
        }
        Cmd::Keys(cmd) => run_keys(lock, cmd).await?,
        Cmd::Patterns(cmd) => run_patterns(lock, cmd).await?,
        Cmd::Logs => {
            wait_for_mirrors(lock).await;
            let entries = lock.open_log_view().await.context("Failed to open log view")?;
            if entries.is_empty() {
                println!("(no log entries)");
            }
            for entry in &entries {
                print_log(entry);
            }
        }
        Cmd::Watch => watch(lock).await?,
    }
    Ok(())
}

async fn run_keys(lock: &SmartLock, cmd: KeysCmd) -> Result<()> {
    match cmd {
        KeysCmd::List => {
            wait_for_mirrors(lock).await;
            let keys = lock.keys();
            if keys.is_empty() {
                println!("(no keys)");
            }
            for key in keys {
                let state = if key.blocked { "blocked" } else { "active" };
                println!("{}  {:<12} {:<20} {state}", key.id, key.uid, key.name);
            }
        }
        KeysCmd::Add { uid, name } => {
            let id = lock.enroll_key(&uid, &name).await.context("Failed to enroll key")?;
            println!("enrolled {id}");
        }
        KeysCmd::Block { id } => {
            wait_for_mirrors(lock).await;
            let blocked = lock.toggle_key_blocked(&id).await.context("Failed to update key")?;
            println!("{id} {}", if blocked { "blocked" } else { "unblocked" });
        }
        KeysCmd::Delete { id, yes } => {
            wait_for_mirrors(lock).await;
            let token = lock
                .request_delete(DeleteTarget::Key(id.clone()))
                .context("Failed to delete key")?;
            confirm_and_delete(lock, &token, yes).await?;
        }
    }
    Ok(())
}

async fn run_patterns(lock: &SmartLock, cmd: PatternsCmd) -> Result<()> {
    match cmd {
        PatternsCmd::List => {
            wait_for_mirrors(lock).await;
            let patterns = lock.patterns();
            if patterns.is_empty() {
                println!("(no patterns)");
            }
            for pattern in patterns {
                let state = if pattern.blocked { "blocked" } else { "active" };
                println!(
                    "{}  {:<20} {} taps {:?} {state}",
                    pattern.id,
                    pattern.name,
                    pattern.tap_count(),
                    pattern.intervals
                );
            }
        }
        PatternsCmd::Record { name } => {
            wait_for_mirrors(lock).await;
            record(lock, &name).await?;
        }
        PatternsCmd::Block { id } => {
            wait_for_mirrors(lock).await;
            let blocked = lock
                .toggle_pattern_blocked(&id)
                .await
                .context("Failed to update pattern")?;
            println!("{id} {}", if blocked { "blocked" } else { "unblocked" });
        }
        PatternsCmd::Delete { id, yes } => {
            wait_for_mirrors(lock).await;
            let token = lock
                .request_delete(DeleteTarget::Pattern(id.clone()))
                .context("Failed to delete pattern")?;
            confirm_and_delete(lock, &token, yes).await?;
        }
    }
    Ok(())
}

/// Interactive recording: Enter taps, `s` saves, `q` cancels.
async fn record(lock: &SmartLock, name: &str) -> Result<()> {
    lock.start_recording().context("Cannot start recording")?;
    println!("Recording \"{name}\": press Enter for each tap, `s` + Enter to save, `q` + Enter to cancel");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match line.trim() {
            "" => {
                lock.record_tap();
                println!("  tap {}", lock.tap_count());
            }
            "s" => {
                let id = lock.stop_and_save(name).await.context("Failed to save pattern")?;
                println!("saved {id}");
                return Ok(());
            }
            "q" => {
                lock.cancel_recording();
                println!("cancelled");
                return Ok(());
            }
            other => println!("  unknown input {other:?}"),
        }
    }

    lock.cancel_recording();
    println!("input closed, recording cancelled");
    Ok(())
}

async fn confirm_and_delete(lock: &SmartLock, token: &ConfirmationToken, yes: bool) -> Result<()> {
    let confirmed = if yes {
        true
    } else {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{} [y/N] ", token.prompt()).as_bytes())
            .await?;
        stdout.flush().await?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let answer = lines.next_line().await?.unwrap_or_default();
        matches!(answer.trim(), "y" | "Y" | "yes")
    };

    if confirmed {
        lock.confirm_delete(token).await.context("Delete failed")?;
        println!("deleted {}", token.target().id());
    } else {
        lock.cancel_delete(token);
        println!("kept {}", token.target().id());
    }
    Ok(())
}

async fn watch(lock: &SmartLock) -> Result<()> {
    let mut changes = lock.changes();
    let mut unlock = lock.watch_unlock();
    info!("Watching mirrors, ctrl-c to stop");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to install ctrl-c signal handler")?;
                info!("Received ctrl-c, stopping");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                println!(
                    "keys={} patterns={} log={}",
                    lock.keys().len(),
                    lock.patterns().len(),
                    lock.logs().len()
                );
                if let Some(latest) = lock.logs().first() {
                    print_log(latest);
                }
            }
            changed = unlock.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("unlock: {}", describe_unlock(&unlock.borrow_and_update()));
            }
        }
    }
    Ok(())
}

/// Give the live views a moment to deliver their first contents.
async fn wait_for_mirrors(lock: &SmartLock) {
    const COLLECTIONS: [Collection; 3] = [
        Collection::RfidTags,
        Collection::KnockPatterns,
        Collection::AccessLogs,
    ];

    let mut changes = lock.changes();
    let ready = tokio::time::timeout(Duration::from_secs(5), async {
        while COLLECTIONS
            .iter()
            .any(|c| lock.mirror_health(*c) == MirrorHealth::Pending)
        {
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if ready.is_err() {
        debug!("Mirrors still pending after 5s");
    }
}

fn print_log(entry: &LogEntry) {
    let when = entry
        .timestamp
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .map_or_else(|| "-".repeat(19), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
    println!("{when}  {:<13} {}", entry.kind.as_str(), entry.detail);
}

fn describe_unlock(state: &UnlockState) -> String {
    match state {
        UnlockState::Locked => "locked".to_string(),
        UnlockState::Unlocking => "sending unlock...".to_string(),
        UnlockState::Unlocked => "UNLOCKED".to_string(),
        UnlockState::Failed(reason) => format!("FAILED: {reason}"),
    }
}

fn describe_health(health: &MirrorHealth) -> String {
    match health {
        MirrorHealth::Detached => "detached".to_string(),
        MirrorHealth::Pending => "loading".to_string(),
        MirrorHealth::Live => "live".to_string(),
        MirrorHealth::Stale(reason) => format!("stale: {reason}"),
    }
}
