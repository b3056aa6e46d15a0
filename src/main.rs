use std::path::PathBuf;
use std::sync::Arc;

use alarmd::config::DaemonConfig;
use alarmd::credential;
use alarmd::storage::Store;
use alarmd::{ipc, AppContext};
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "alarmd", about = "Access-controlled real-time alarm coordination daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket server port
    #[arg(long, env = "ALARMD_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite database, token file, and config.toml
    #[arg(long, env = "ALARMD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ALARMD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "ALARMD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand is given).
    Serve,
    /// Read-only Store introspection and token issuance for operators.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
enum AdminAction {
    /// List every page in the database, with owner.
    ListPages,
    /// List every alarm on a page.
    ListAlarms {
        page_id: String,
    },
    /// Mint a bearer token for an existing user, stored in tokens.json.
    IssueToken {
        username: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Admin { action }) => run_admin(action, args.data_dir).await?,
        None | Some(Command::Serve) => run_serve(args.port, args.data_dir, args.log).await?,
    }

    Ok(())
}

/// Initialize the tracing subscriber.
///
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
/// Falls back to stdout-only logging, with a warning, if the log directory
/// cannot be created — never panics on a bad log path.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("alarmd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

async fn run_serve(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "alarmd starting");

    let config = Arc::new(DaemonConfig::new(port, data_dir, log, None));
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "config loaded"
    );

    let store = Arc::new(Store::new(&config.data_dir).await.context("failed to open database")?);

    if credential::load_token_file(&config.token_file()).is_empty() {
        warn!(
            path = %config.token_file().display(),
            "no tokens on file yet — use `alarmd admin issue-token <username>` after creating a user"
        );
    }
    let verifier = credential::verifier_from_file(&config.token_file());

    let ctx = Arc::new(AppContext::new(config, store, Arc::new(verifier)));
    ipc::run(ctx).await
}

async fn run_admin(action: AdminAction, data_dir: Option<PathBuf>) -> Result<()> {
    let config = DaemonConfig::new(None, data_dir, None, None);
    let store = Store::new(&config.data_dir).await.context("failed to open database")?;

    match action {
        AdminAction::ListPages => {
            let pages = store.list_all_pages().await?;
            for page in pages {
                println!("{}\t{}\towner={}", page.id, page.name, page.owner_id);
            }
        }
        AdminAction::ListAlarms { page_id } => {
            let mut ids = std::collections::HashSet::new();
            ids.insert(page_id);
            let alarms = store.list_alarms_in_pages(&ids).await?;
            for alarm in alarms {
                println!(
                    "{}\t{}\t{} {}\tactive={}",
                    alarm.id, alarm.ticker, alarm.option, alarm.condition, alarm.active
                );
            }
        }
        AdminAction::IssueToken { username } => {
            let user = store.find_user_by_username(&username).await?;
            let token = credential::issue_token(&config.token_file(), &user.id, &user.username)
                .context("failed to write token file")?;
            println!("{token}");
        }
    }

    Ok(())
}
