//! dlrelay - host the dataLayer relay from the command line
//!
//! This tool provides commands for:
//! - Checking the resolved relay configuration
//! - Showing how a single pushed record is shaped
//! - Replaying a file of pushes through the relay and a transport
//!
//! Uses XDG Base Directory specification for file locations:
//! - Logs: $XDG_STATE_HOME/dlrelay/dlrelay.log (~/.local/state/dlrelay/dlrelay.log)
//! - Config: $XDG_CONFIG_HOME/dlrelay/config.toml (~/.config/dlrelay/config.toml)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dlrelay_core::relay::{DispatchPolicy, Interceptor, Outcome};
use dlrelay_core::transport::{CollectClient, DeliveryStats, HttpScriptLoader, HttpTransport};
use dlrelay_core::{
    Config, DataLayer, EventValue, Initialization, RelayEngine, ScriptRequest, TransportCommand,
    TransportHandle,
};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

/// Records processed per idle slice.
const IDLE_BATCH: usize = 8;

#[derive(Parser)]
#[command(name = "dlrelay")]
#[command(about = "Relay dataLayer pushes to a measurement endpoint")]
#[command(version)]
struct Args {
    /// Verbose output (writes the log file)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the resolved relay configuration
    Status,

    /// Show the outbound parameters for one JSON record
    Shape {
        /// The record, e.g. '{"event":"purchase","value":10}'
        record: String,
    },

    /// Replay a file of pushes (one JSON value per line) through the relay
    Replay {
        file: PathBuf,

        /// Lines already in the queue before the relay is installed
        #[arg(long, default_value = "0")]
        preloaded: usize,

        /// Print transport calls instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging if verbose; the guard must outlive the command
    let _log_guard = if args.verbose {
        Some(
            dlrelay_core::logging::init(&config.logging, config.relay.debug)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Shape { record } => cmd_shape(&config, &record),
        Command::Replay {
            file,
            preloaded,
            dry_run,
        } => cmd_replay(&config, &file, preloaded, dry_run),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("dlrelay Configuration");
    println!("=====================");
    println!();

    let relay = &config.relay;
    println!("Config file:     {}", Config::config_path().display());
    println!("Measurement ID:  {}", relay.measurement_id);
    println!(
        "Endpoint:        {}",
        relay.endpoint().unwrap_or("<not set, using public default>")
    );
    println!("Script URL:      {}", relay.script_url());
    println!("Debug:           {}", relay.debug);
    println!();
    println!(
        "Dispatch:        {}",
        DispatchPolicy::from_config(&config.dispatch)
    );
    println!("Guard:           {}", config.guard.enabled);
    println!("Bundle key:      {}", config.params.bundle_param_name);
    println!("Well-known keys: {}", config.params.well_known.len());
    println!(
        "Persistent:      {}",
        if config.persistence.fields.is_empty() {
            "<none>".to_string()
        } else {
            config.persistence.fields.join(", ")
        }
    );
    println!(
        "Blocked events:  {}",
        config.filter.blocked_event_prefixes.join(", ")
    );

    Ok(())
}

fn cmd_shape(config: &Config, record: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(record).context("record is not valid JSON")?;

    let mut interceptor = Interceptor::new(config);
    match interceptor.process(&EventValue::from(value)) {
        Outcome::Forward { name, params } => {
            println!("event: {}", name);
            println!("{}", serde_json::to_string_pretty(&params)?);
        }
        Outcome::Blocked { name } => println!("blocked: {:?}", name),
        Outcome::DataOnly => println!("data-only push (no event name), nothing forwarded"),
        Outcome::Ignored => println!("not an object, ignored"),
    }

    Ok(())
}

fn cmd_replay(config: &Config, file: &Path, preloaded: usize, dry_run: bool) -> Result<()> {
    let mut entries = read_entries(file)?;
    let rest = entries.split_off(preloaded.min(entries.len()));

    let loader = if dry_run {
        Loader::DryRun
    } else {
        let client = CollectClient::new(&config.transport).context("failed to create client")?;
        Loader::Http(HttpScriptLoader::new(client))
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let delivery = runtime.block_on(async {
        let mut engine = RelayEngine::install(config, DataLayer::with_entries(entries));
        let worker = run_relay(&mut engine, &loader, rest).await;

        println!("{}", engine.report());
        if engine.gate().slot().is_guarded() {
            print_audit(&engine);
        }

        // dropping the engine closes the delivery channel
        drop(engine);
        match worker {
            Some(handle) => handle.await.ok(),
            None => None,
        }
    });

    if let Some(stats) = delivery {
        println!(
            "delivery: {} sent, {} failed, {} skipped, {} retries",
            stats.events_sent, stats.events_failed, stats.events_skipped, stats.retries
        );
    }

    Ok(())
}

/// Push `rest` while the transport script loads, then run out the scheduler.
async fn run_relay(
    engine: &mut RelayEngine,
    loader: &Loader,
    rest: Vec<EventValue>,
) -> Option<JoinHandle<DeliveryStats>> {
    let request = match engine.initialize() {
        Initialization::LoadScript(request) => Some(request),
        Initialization::Ready | Initialization::AlreadyStarted => None,
    };
    let mut settled = request.is_none();
    let load = async {
        match &request {
            Some(request) => loader.load(request).await,
            None => Err(dlrelay_core::Error::Config("no script requested".to_string())),
        }
    };
    tokio::pin!(load);

    let idle = engine.policy() == DispatchPolicy::Idle;
    let mut worker = None;
    let mut pending = rest.into_iter().peekable();

    loop {
        let next_due = engine.next_due();
        let has_pushes = pending.peek().is_some();
        let idle_work = idle && engine.scheduled_len() > 0;

        tokio::select! {
            biased;

            outcome = &mut load, if !settled => {
                settled = true;
                match outcome {
                    Ok(loaded) => {
                        worker = loaded.worker;
                        engine.script_settled(Ok(loaded.handle));
                    }
                    Err(e) => {
                        eprintln!("transport script failed to load: {}", e);
                        engine.script_settled(Err(e));
                    }
                }
            }
            _ = sleep_until(next_due), if next_due.is_some() => {
                engine.run_due(std::time::Instant::now());
            }
            _ = tokio::task::yield_now(), if has_pushes => {
                if let Some(entry) = pending.next() {
                    engine.push(vec![entry]);
                }
            }
            _ = tokio::task::yield_now(), if idle_work => {
                engine.run_idle(IDLE_BATCH);
            }
            else => break,
        }
    }

    worker
}

async fn sleep_until(due: Option<std::time::Instant>) {
    if let Some(due) = due {
        tokio::time::sleep_until(tokio::time::Instant::from_std(due)).await;
    }
}

fn read_entries(file: &Path) -> Result<Vec<EventValue>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", file.display(), index + 1))?;
        entries.push(EventValue::from(value));
    }

    if entries.is_empty() {
        bail!("{} contains no entries", file.display());
    }
    Ok(entries)
}

fn print_audit(engine: &RelayEngine) {
    println!();
    println!("Handle writes:");
    for entry in engine.audit_log() {
        println!(
            "  {} {:<8} {:<12} {} ({})",
            entry.at.format("%H:%M:%S%.3f"),
            entry.origin.as_str(),
            entry.value_type,
            entry.preview,
            entry.trace
        );
    }
}

/// Where the transport comes from.
enum Loader {
    /// Succeeds at once with a transport printing to stdout
    DryRun,
    Http(HttpScriptLoader),
}

struct Loaded {
    handle: Box<dyn TransportHandle>,
    worker: Option<JoinHandle<DeliveryStats>>,
}

impl Loader {
    async fn load(&self, request: &ScriptRequest) -> dlrelay_core::Result<Loaded> {
        match self {
            Loader::DryRun => Ok(Loaded {
                handle: Box::new(StdoutTransport),
                worker: None,
            }),
            Loader::Http(loader) => {
                let (transport, worker): (HttpTransport, _) = loader.load(request).await?;
                Ok(Loaded {
                    handle: Box::new(transport),
                    worker: Some(tokio::spawn(worker.run())),
                })
            }
        }
    }
}

/// Prints every transport call instead of sending it.
struct StdoutTransport;

impl TransportHandle for StdoutTransport {
    fn call(&mut self, command: TransportCommand) {
        println!("{}", command);
    }

    fn kind(&self) -> &'static str {
        "stdout"
    }
}
