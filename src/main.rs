//! # IIoT Assistant CLI (`assistant`)
//!
//! ## Usage
//!
//! ```bash
//! assistant --config ./config/assistant.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `assistant serve` | Start the HTTP/SSE server |
//! | `assistant ingest [--dry-run]` | Index the knowledge directory once and report |
//! | `assistant ask "<question>"` | One-shot conversation printed to stdout |
//! | `assistant modes` | Show the mode → tools table |
//! | `assistant tools` | List registered tools |
//! | `assistant init-demo-db <path>` | Create the demo SQLite MES database |
//! | `assistant completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Create a demo database and point [tools] database_url at it
//! assistant init-demo-db ./data/mes.sqlite
//!
//! # Check what the knowledge directory would produce
//! assistant ingest --dry-run
//!
//! # Ask in report mode
//! assistant ask "Chart Motor-01 output for the last week" --mode db
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use futures_util::StreamExt;
use iiot_assistant::config::{self, Config};
use iiot_assistant::dispatch::{dispatch, DisplayEvent};
use iiot_assistant::ingest::{self, IngestReport, IngestStrategy};
use iiot_assistant::server::{self, AppState};
use iiot_assistant::db;
use iiot_assistant::tools::device::spawn_simulator;
use iiot_assistant::tools::{DeviceCache, ToolRegistry};
use iiot_assistant_core::models::Mode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// IIoT Assistant: a streaming, tool-calling assistant for industrial
/// operations consoles.
#[derive(Parser)]
#[command(name = "assistant", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/assistant.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/SSE server.
    Serve,

    /// Index the knowledge directory once and print the report.
    Ingest {
        /// Extract and chunk only; no embeddings, nothing stored.
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask one question and print the streamed answer.
    Ask {
        question: String,

        /// auto, docs, db or iot.
        #[arg(long, default_value = "auto")]
        mode: String,

        /// Print display events as JSON lines instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Show which tools and prompt each mode uses.
    Modes,

    /// List registered tools and their parameters.
    Tools,

    /// Create (or recreate) the demo MES database.
    InitDemoDb { path: PathBuf },

    /// Print shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "assistant", &mut std::io::stdout());
            return Ok(());
        }
        Commands::InitDemoDb { path } => {
            db::create_demo_database(path).await?;
            println!("Demo database created at {}", path.display());
            println!("Set [tools] database_url = \"{}\"", db::sqlite_url(path));
            return Ok(());
        }
        _ => {}
    }

    let cfg = load_or_minimal(&cli.config)?;

    match cli.command {
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Ingest { dry_run } => run_ingest_command(&cfg, dry_run).await?,
        Commands::Ask {
            question,
            mode,
            json,
        } => run_ask(&cfg, question, &mode, json).await?,
        Commands::Modes => print_modes(&cfg)?,
        Commands::Tools => print_tools(&cfg)?,
        Commands::Completions { .. } | Commands::InitDemoDb { .. } => {}
    }

    Ok(())
}

/// A missing file at the default location runs with [`Config::minimal`];
/// an explicit path that does not exist is an error.
fn load_or_minimal(path: &std::path::Path) -> Result<Config> {
    if path.exists() {
        return config::load_config(path);
    }
    if path == std::path::Path::new("./config/assistant.toml") {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::minimal());
    }
    bail!("Config file not found: {}", path.display())
}

async fn run_ingest_command(cfg: &Config, dry_run: bool) -> Result<()> {
    let report = if dry_run {
        ingest::dry_run(&cfg.knowledge).await?
    } else {
        let (state, _) = AppState::from_config(cfg)?;
        match state.ingest(IngestStrategy::Replace).await? {
            Some(report) => report,
            None => bail!("embeddings are disabled; set [embedding] provider to ingest"),
        }
    };
    print_report(&report, dry_run);
    Ok(())
}

fn print_report(report: &IngestReport, dry_run: bool) {
    if dry_run {
        println!("Dry run for knowledge directory (nothing stored):");
    } else {
        println!("Ingestion complete:");
    }
    println!("  files seen:     {}", report.files_seen);
    println!("  files ingested: {}", report.files_ingested);
    println!("  files skipped:  {}", report.files_skipped);
    println!("  files failed:   {}", report.files_failed);
    println!("  chunks:         {}", report.chunks);
}

async fn run_ask(
    cfg: &Config,
    question: String,
    mode: &str,
    json: bool,
) -> Result<()> {
    let mode = Mode::try_from_label(mode)
        .with_context(|| format!("Unknown mode '{}'. Use auto, docs, db or iot.", mode))?;
    let (state, devices) = AppState::from_config(cfg)?;
    let cancel = CancellationToken::new();
    let _stop = cancel.clone().drop_guard();

    if cfg.tools.simulate_devices {
        prime_devices(&devices, cfg, cancel.clone()).await;
    }
    if cfg.knowledge.ingest_on_startup && mode.uses_retrieval() {
        if let Some(report) = state.ingest(IngestStrategy::Append).await? {
            tracing::info!(chunks = report.chunks, "knowledge indexed");
        }
    }

    let mut push = state.push().subscribe();
    tokio::spawn(async move {
        while let Some(event) = push.recv().await {
            match &event.media_path {
                Some(path) => eprintln!("[{:?}] {} ({})", event.media_type, event.content, path),
                None => eprintln!("[{:?}] {}", event.media_type, event.content),
            }
        }
    });

    let session = state.sessions().get_or_create(None);
    let tokens = state
        .orchestrator()
        .converse(session, question, mode, cancel.clone());
    let mut events = dispatch(tokens);

    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        if json {
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
            continue;
        }
        match event {
            DisplayEvent::Text { delta } => {
                write!(stdout, "{}", delta)?;
                stdout.flush()?;
            }
            DisplayEvent::Placeholder { text } => eprintln!("{}", text),
            DisplayEvent::Action { payload } => {
                writeln!(stdout, "{}", serde_json::to_string_pretty(&payload)?)?;
            }
            DisplayEvent::Replace { text } => writeln!(stdout, "\n{}", text)?,
            DisplayEvent::Error { code, message } => {
                writeln!(stdout)?;
                bail!("[{}] {}", code, message);
            }
            DisplayEvent::Done => writeln!(stdout)?,
        }
    }
    Ok(())
}

/// Start the simulator and give it one tick so the cache has readings.
async fn prime_devices(devices: &DeviceCache, cfg: &Config, cancel: CancellationToken) {
    spawn_simulator(
        devices.clone(),
        cfg.tools.devices.clone(),
        Duration::from_millis(cfg.tools.simulate_interval_ms),
        cancel,
    );
    for _ in 0..20 {
        if !devices.device_ids().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn print_modes(cfg: &Config) -> Result<()> {
    let registry = cfg.capability_registry()?;
    for (mode, profile) in registry.profiles() {
        let retrieval = if mode.uses_retrieval() { "retrieval" } else { "no retrieval" };
        println!("{} (prompt '{}', {})", mode, profile.prompt_key, retrieval);
        if profile.tools.is_empty() {
            println!("  (no tools)");
        }
        for tool in &profile.tools {
            println!("  {}", tool);
        }
    }
    Ok(())
}

fn print_tools(cfg: &Config) -> Result<()> {
    let registry = ToolRegistry::from_config(cfg, DeviceCache::new())?;
    if registry.is_empty() {
        println!("No tools registered.");
        return Ok(());
    }
    for info in registry.list() {
        let params = info.parameters["properties"]
            .as_object()
            .map(|props| props.keys().cloned().collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        println!("{}({})", info.name, params);
        println!("  {}", info.description);
    }
    Ok(())
}
