// SPDX-License-Identifier: MIT

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use labeld::config::DaemonConfig;
use labeld::hub::Hub;
use labeld::project::ProjectRegistry;
use labeld::registry::SessionRegistry;
use labeld::storage::{
    http::HttpStore, local::LocalStore, memory::MemoryStore, ObjectStore, SnapshotStore,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "labeld",
    about = "Label Sync Host — collaborative annotation synchronization daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket server port
    #[arg(long, env = "LABELD_PORT")]
    port: Option<u16>,

    /// Data directory for snapshots, project metadata, and config
    #[arg(long, env = "LABELD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LABELD_LOG")]
    log: Option<String>,

    /// Bind address for the WebSocket server (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "LABELD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "LABELD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the sync hub (default when no subcommand given).
    ///
    /// Runs labeld in the foreground. Editors connect over WebSocket on the
    /// configured port; an HTTP GET /health probe is served on the same port.
    ///
    /// Examples:
    ///   labeld serve
    ///   labeld
    Serve,
    /// Query a running hub's health endpoint.
    ///
    /// Exit code 0 when the hub responds, 1 when it is stopped or unreachable.
    ///
    /// Examples:
    ///   labeld status
    ///   labeld status --json
    Status {
        /// Print the raw health JSON instead of a human summary.
        #[arg(long)]
        json: bool,
    },
    /// Manage labeling projects in the configured storage backend.
    ///
    /// Operates on the store directly, so it works whether or not a hub is
    /// running. A running hub picks up a new project on the next register;
    /// deleting a project a hub still serves leaves its in-memory task alive
    /// until the idle sweep evicts it.
    ///
    /// Examples:
    ///   labeld project create scenes --items 20,20,15
    ///   labeld project list
    ///   labeld project delete scenes
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project with one task per entry of --items.
    Create {
        name: String,
        /// Item count per task, comma separated (e.g. 20,20,15 = 3 tasks).
        #[arg(long, value_delimiter = ',', required = true)]
        items: Vec<usize>,
    },
    /// List project names.
    List,
    /// Delete a project, its metadata, and every snapshot of its tasks.
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let log_format = std::env::var("LABELD_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref(), &log_format);

    match args.command {
        Some(Command::Status { json }) => {
            let config = DaemonConfig::new(
                args.port,
                args.data_dir,
                Some("error".to_string()),
                args.bind_address,
            );
            let exit_code = run_status(&config, json).await;
            std::process::exit(exit_code);
        }
        Some(Command::Project { action }) => {
            let config = DaemonConfig::new(
                args.port,
                args.data_dir,
                Some("error".to_string()),
                args.bind_address,
            );
            run_project(&config, action).await?;
        }
        None | Some(Command::Serve) => {
            run_server(args.port, args.data_dir, args.log, args.bind_address).await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("labeld.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

// ── labeld serve ──────────────────────────────────────────────────────────────

/// Build the durable backend named in `[storage]`.
fn build_store(config: &DaemonConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.storage.backend.as_str() {
        "local" => {
            let root = config.data_dir.join("store");
            std::fs::create_dir_all(&root)
                .with_context(|| format!("cannot create store dir: {}", root.display()))?;
            Ok(Arc::new(LocalStore::new(root)))
        }
        "http" => {
            let url = config
                .storage
                .http_url
                .as_deref()
                .context("storage.backend = \"http\" requires storage.http_url")?;
            let store = HttpStore::new(url, config.storage.http_token.clone())
                .context("cannot build http store client")?;
            Ok(Arc::new(store))
        }
        "memory" => {
            warn!("storage.backend = \"memory\" — nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        other => bail!("unknown storage backend: {other:?} (expected local, http, or memory)"),
    }
}

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    bind_address: Option<String>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "labeld starting");

    let config = Arc::new(DaemonConfig::new(port, data_dir, log, bind_address));
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        backend = %config.storage.backend,
        "config loaded"
    );

    let store = build_store(&config)?;
    let snapshots = SnapshotStore::new(store.clone(), config.snapshot.keep);
    let projects = ProjectRegistry::new(store);
    let registry = Arc::new(SessionRegistry::new(config.lease_ttl()));

    let hub = Hub::new(config, registry, projects, snapshots);
    let listener = hub.bind().await?;

    tokio::spawn(hub.clone().run_idle_sweep());

    // Graceful shutdown: the serve loop drains sessions and flushes a final
    // snapshot for every dirty task before returning.
    {
        let hub = hub.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            hub.begin_shutdown();
        });
    }

    hub.serve(listener).await
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "cannot register SIGTERM handler — Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

// ── labeld project ────────────────────────────────────────────────────────────

async fn run_project(config: &DaemonConfig, action: ProjectAction) -> Result<()> {
    use labeld::project::ProjectMeta;

    let registry = ProjectRegistry::new(build_store(config)?);
    match action {
        ProjectAction::Create { name, items } => {
            if items.iter().any(|&n| n == 0) {
                bail!("every task needs at least one item");
            }
            registry.create(&ProjectMeta::new(&name, &items)).await?;
            println!("created project '{name}' with {} task(s)", items.len());
        }
        ProjectAction::List => {
            let names = registry.list().await?;
            if names.is_empty() {
                println!("no projects");
            }
            for name in names {
                let meta = registry.load(&name).await?;
                let items: usize = meta.tasks.iter().map(|t| t.item_count).sum();
                println!("{name}  ({} tasks, {items} items)", meta.tasks.len());
            }
        }
        ProjectAction::Delete { name } => {
            registry.delete(&name).await?;
            println!("deleted project '{name}'");
        }
    }
    Ok(())
}

// ── labeld status ─────────────────────────────────────────────────────────────

/// Returns exit code: 0 = healthy, 1 = stopped/unresponsive.
async fn run_status(config: &DaemonConfig, json: bool) -> i32 {
    let host = if config.bind_address == "0.0.0.0" {
        "127.0.0.1"
    } else {
        config.bind_address.as_str()
    };
    let url = format!("http://{}:{}/health", host, config.port);

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: cannot build http client: {e}");
            return 1;
        }
    };

    let body: serde_json::Value = match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                eprintln!("error: malformed health response: {e}");
                return 1;
            }
        },
        Ok(resp) => {
            if json {
                println!(r#"{{"status":"unhealthy","httpStatus":{}}}"#, resp.status().as_u16());
            } else {
                println!("labeld: unhealthy (health endpoint returned {})", resp.status());
            }
            return 1;
        }
        Err(_) => {
            if json {
                println!(r#"{{"status":"stopped"}}"#);
            } else {
                println!("labeld: stopped (no hub listening on port {})", config.port);
            }
            return 1;
        }
    };

    if json {
        println!("{body}");
    } else {
        let version = body["version"].as_str().unwrap_or("?");
        let uptime = body["uptime"].as_u64().unwrap_or(0);
        let sessions = body["activeSessions"].as_u64().unwrap_or(0);
        let tasks = body["openTasks"].as_u64().unwrap_or(0);
        println!("labeld {version}: running");
        println!("  uptime:    {}", format_duration(uptime));
        println!("  sessions:  {sessions}");
        println!("  tasks:     {tasks}");
    }
    0
}

fn format_duration(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
