use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use boardwalk_core::config::AppConfig;
use boardwalk_core::event::{EventBus, RunEvent};
use boardwalk_core::types::{GraphDescriptor, Values};

use boardwalk_runtime::invoke::required_input_keys;
use boardwalk_runtime::{
    core_kit, FileLoader, HandlerRegistry, Harness, PendingRequest, Run, RunLogger, RunSnapshot,
    SnapshotKind, TraversalMachine,
};

#[derive(Parser)]
#[command(name = "boardwalk", version, about = "Run dataflow boards")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "boardwalk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a board from its JSON file
    Run {
        /// Board file
        board: PathBuf,
        /// Input values as key=value (value parsed as JSON when possible)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Save a snapshot here instead of prompting when the board asks for input
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Continue a saved run
    Resume {
        /// Board file the snapshot was taken from
        board: PathBuf,
        /// Snapshot file written by `run --save`
        snapshot: PathBuf,
        /// Values for the waiting node as key=value
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Save a snapshot here if the board asks for input again
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Check that a board parses and has an entry point
    Validate {
        /// Board file
        board: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("boardwalk=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "boardwalk",
            &mut io::stdout(),
        );
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { board } => {
            let graph = load_board(&board)?;
            let machine = TraversalMachine::new(&graph)?;
            let entries: Vec<&str> = machine
                .current()
                .opportunities
                .iter()
                .map(|e| e.to.as_str())
                .collect();
            println!(
                "{}: {} nodes, {} edges, {} nested boards; entries: {}",
                board.display(),
                graph.nodes.len(),
                graph.edges.len(),
                graph.graphs.len(),
                entries.join(", ")
            );
        }
        Commands::Run {
            board,
            inputs,
            save,
        } => {
            let graph = load_board(&board)?;
            let presets = parse_inputs(&inputs)?;
            let harness = build_harness(&config, &board);
            let run = harness.harness.run_with_inputs(graph, presets);
            drive(harness, run, save.as_deref()).await?;
        }
        Commands::Resume {
            board,
            snapshot,
            inputs,
            save,
        } => {
            let graph = load_board(&board)?;
            let text = std::fs::read_to_string(&snapshot)
                .with_context(|| format!("reading snapshot {}", snapshot.display()))?;
            let snapshot = RunSnapshot::from_json(&text)?;
            let values = if inputs.is_empty() {
                let prompt = format!("values for {}", snapshot.waiting_node());
                read_values(&prompt, &[])?
            } else {
                parse_inputs(&inputs)?
            };
            let harness = build_harness(&config, &board);
            let run = harness.harness.resume(graph, snapshot, values)?;
            drive(harness, run, save.as_deref()).await?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// A harness plus the optional event bus its run logger listens on.
struct CliHarness {
    harness: Harness,
    bus: Option<Arc<EventBus>>,
    log: Option<(PathBuf, u8)>,
}

fn build_harness(config: &AppConfig, board: &Path) -> CliHarness {
    let mut registry = HandlerRegistry::new();
    registry.register_kit(core_kit());

    let base = config
        .loader_base()
        .or_else(|| board.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let mut harness = Harness::new(registry)
        .with_config(config.harness.clone())
        .with_loader(FileLoader::new())
        .with_base(base.to_string_lossy().to_string());

    let (bus, log) = match &config.log {
        Some(log) => {
            let bus = Arc::new(EventBus::new(config.harness.event_capacity));
            harness = harness.with_event_bus(bus.clone());
            (Some(bus), Some((PathBuf::from(&log.dir), log.level)))
        }
        None => (None, None),
    };

    CliHarness { harness, bus, log }
}

/// Pull events until the run finishes, answering requests from stdin or
/// saving a snapshot when `save` is set.
async fn drive(cli: CliHarness, mut run: Run, save: Option<&Path>) -> anyhow::Result<()> {
    let cancel = cli.harness.cancel_token();

    let logger = match (cli.bus, cli.log) {
        (Some(bus), Some((dir, level))) => {
            let logger = RunLogger::new(dir, level);
            let handle = tokio::spawn(logger.run(bus.clone(), run.run_id().clone(), cancel.clone()));
            while bus.subscriber_count() == 0 && !handle.is_finished() {
                tokio::task::yield_now().await;
            }
            Some(handle)
        }
        _ => None,
    };

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let result = pump(&mut run, save, &cancel).await;

    if let Some(handle) = logger {
        if !run.is_finished() {
            cancel.cancel();
        }
        handle.await.ok();
    }
    result
}

async fn pump(run: &mut Run, save: Option<&Path>, cancel: &CancellationToken) -> anyhow::Result<()> {
    loop {
        while let Some(event) = run.next().await {
            print_event(&event);
        }

        let Some(request) = run.pending().cloned() else {
            break;
        };

        if let Some(path) = save {
            let snapshot = run.save()?;
            std::fs::write(path, snapshot.to_json()?)
                .with_context(|| format!("writing snapshot {}", path.display()))?;
            info!(node = %request.node.id, path = %path.display(), "Run suspended");
            return Ok(());
        }

        if cancel.is_cancelled() {
            bail!("run cancelled while waiting for input");
        }

        match request.kind {
            SnapshotKind::Input => {
                let values = answer_input(&request)?;
                run.provide_input(values)?;
            }
            SnapshotKind::Secret => {
                let values = answer_secrets(&request)?;
                run.provide_secrets(values)?;
            }
        }
    }

    if let Some(error) = run.take_error() {
        return Err(error.into());
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::NodeStart(data) => {
            eprintln!("{}[{}: {}]", indent(data.origin.nesting), data.node.id, data.node.node_type);
        }
        RunEvent::Skip(data) => {
            eprintln!(
                "{}[{}: skipped, missing {}]",
                indent(data.origin.nesting),
                data.node.id,
                data.missing_inputs.join(", ")
            );
        }
        RunEvent::Output(data) if data.origin.nesting == 0 && !data.bubbled => {
            let text = serde_json::to_string_pretty(&data.outputs).unwrap_or_default();
            println!("{}", text);
        }
        RunEvent::Output(data) => {
            let text = serde_json::to_string(&data.outputs).unwrap_or_default();
            eprintln!("{}[{}: {}]", indent(data.origin.nesting), data.node.id, text);
        }
        RunEvent::Error(data) => match &data.node {
            Some(node) => eprintln!("[ERROR {}] {}: {}", data.kind, node, data.message),
            None => eprintln!("[ERROR {}] {}", data.kind, data.message),
        },
        _ => {}
    }
}

fn indent(nesting: usize) -> String {
    "  ".repeat(nesting)
}

fn answer_input(request: &PendingRequest) -> anyhow::Result<Values> {
    let keys = required_input_keys(&request.inputs);
    let title = request
        .inputs
        .get("schema")
        .and_then(|s| s.get("title"))
        .and_then(|t| t.as_str())
        .unwrap_or(&request.node.id)
        .to_string();
    read_values(&title, &keys)
}

/// Secrets come from the environment first, then stdin.
fn answer_secrets(request: &PendingRequest) -> anyhow::Result<Values> {
    let mut values = Values::new();
    let mut missing = Vec::new();
    for key in &request.keys {
        match std::env::var(key) {
            Ok(value) => {
                values.insert(key.clone(), serde_json::Value::String(value));
            }
            Err(_) => missing.push(key.clone()),
        }
    }
    if !missing.is_empty() {
        let prompted = read_values(&format!("secrets for {}", request.node.id), &missing)?;
        values.extend(prompted);
    }
    Ok(values)
}

/// Prompt on stderr and read one line per key. Without keys, read a single
/// line holding a JSON object or space separated `key=value` pairs.
fn read_values(prompt: &str, keys: &[String]) -> anyhow::Result<Values> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut next_line = |label: &str| -> anyhow::Result<String> {
        eprint!("{}> ", label);
        io::stderr().flush().ok();
        match lines.next() {
            Some(line) => Ok(line?),
            None => bail!("stdin closed while waiting for {}", label),
        }
    };

    if keys.is_empty() {
        let line = next_line(prompt)?;
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(trimmed)?;
            return match value {
                serde_json::Value::Object(map) => Ok(map),
                _ => bail!("expected a JSON object"),
            };
        }
        let pairs: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
        return parse_inputs(&pairs);
    }

    eprintln!("{}", prompt);
    let mut values = Values::new();
    for key in keys {
        let line = next_line(key)?;
        values.insert(key.clone(), parse_value(line.trim()));
    }
    Ok(values)
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<Values> {
    let mut values = Values::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got \"{}\"", pair);
        };
        values.insert(key.trim().to_string(), parse_value(value));
    }
    Ok(values)
}

/// JSON when it parses, else the raw string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn load_board(path: &Path) -> anyhow::Result<GraphDescriptor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading board {}", path.display()))?;
    let mut graph = GraphDescriptor::from_json(&text)?;
    if graph.url.is_none() {
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        graph.url = Some(format!("file://{}", absolute.display()));
    }
    Ok(graph)
}
