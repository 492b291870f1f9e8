// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{Message, RuntimeEvent};
use flowruntime::{
    dependency, diff_configs, events, parse_config, subflow, FlowRuntime, NodeRegistry,
    ParsedConfig, RuntimeConfig,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the flows in a file and keep them running
    Run {
        /// Path to the flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Node to hand a message to once started (repeatable)
        #[arg(short, long)]
        inject: Vec<String>,

        /// Payload of injected messages, as JSON
        #[arg(short, long)]
        payload: Option<String>,

        /// Runtime settings JSON file
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// How long stop waits for each node to close
        #[arg(long)]
        close_timeout_ms: Option<u64>,

        /// Stop after this long instead of waiting for Ctrl-C
        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Check a flow file for structural problems
    Validate {
        /// Path to the flow JSON file
        file: PathBuf,
    },

    /// Show what redeploying NEW over OLD would touch
    Diff {
        old: PathBuf,
        new: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example flow file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flows.json")]
        output: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            file,
            inject,
            payload,
            settings,
            close_timeout_ms,
            duration_ms,
        } => {
            let mut config = match settings {
                Some(path) => load_settings(&path)?,
                None => RuntimeConfig::default(),
            };
            if let Some(ms) = close_timeout_ms {
                config.node_close_timeout = ms;
            }
            run_flows(&file, config, inject, payload, duration_ms).await?;
        }

        Commands::Validate { file } => {
            validate_flows(&file)?;
        }

        Commands::Diff { old, new } => {
            diff_flows(&old, &new)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_flows(output)?;
        }
    }

    Ok(())
}

fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

/// A flow file is either a bare record array or `{"flows": [...]}`.
fn read_records(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove("flows") {
            Some(Value::Array(records)) => Ok(records),
            _ => bail!("{}: expected an array of node records", path.display()),
        },
        _ => bail!("{}: expected an array of node records", path.display()),
    }
}

fn load_settings(path: &Path) -> Result<RuntimeConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn is_builtin(node_type: &str) -> bool {
    events::is_receiver_type(node_type) || subflow::is_internal_type(node_type)
}

async fn run_flows(
    file: &Path,
    config: RuntimeConfig,
    inject: Vec<String>,
    payload: Option<String>,
    duration_ms: Option<u64>,
) -> Result<()> {
    println!("🚀 Loading flows from: {}", file.display());
    let records = read_records(file)?;

    let payload: Value = match payload {
        Some(text) => serde_json::from_str(&text).context("payload must be JSON")?,
        None => Value::Null,
    };

    let runtime = FlowRuntime::new(Arc::new(standard_registry()), config);

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RuntimeEvent::FlowStarted { flow_id, active_nodes, .. } => {
                    println!("▶️  Flow {} started ({} nodes)", flow_id, active_nodes);
                }
                RuntimeEvent::FlowStopped { flow_id, closed, timed_out, .. } => {
                    println!("⏹️  Flow {} stopped ({} closed, {} timed out)", flow_id, closed, timed_out);
                }
                RuntimeEvent::NodeStatus { node_id, status, .. } => {
                    println!("     ℹ️  [{}] {}", node_id, status.text.unwrap_or_default());
                }
                RuntimeEvent::NodeFailed { node_id, node_type, error, .. } => {
                    println!("  ❌ Node {} ({}) failed: {}", node_id, node_type, error);
                }
                RuntimeEvent::NodeCloseTimedOut { node_id, timeout_ms, .. } => {
                    println!("  ⚠️  Node {} did not close within {}ms", node_id, timeout_ms);
                }
                RuntimeEvent::UnhandledError { node_id, message, .. } => {
                    println!("  💥 [{}] {}", node_id, message);
                }
                RuntimeEvent::NodeClosed { .. } => {}
            }
        }
    });

    runtime.load(&records).await?;
    tracing::debug!(flows = ?runtime.flow_ids(), "Flows loaded");

    for node_id in &inject {
        let msg = Message::with_payload(payload.clone());
        runtime
            .inject(node_id, msg)
            .with_context(|| format!("injecting into {}", node_id))?;
    }

    match duration_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => {
            println!("Running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    let report = runtime.stop_all().await;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Stop Summary:");
    println!("   Closed: {}", report.closed.len());
    println!("   Timed out: {}", report.timed_out.len());
    for (node_id, error) in &report.failed {
        println!("   Failed: {} ({})", node_id, error);
    }

    Ok(())
}

fn check(config: &ParsedConfig, registry: &NodeRegistry) -> Vec<String> {
    let mut problems = Vec::new();
    for flow in std::iter::once(&config.global).chain(&config.flows) {
        if let Err(e) = dependency::validate_flow(flow) {
            problems.push(format!("flow {}: {}", flow.id, e));
        }
    }
    for missing in config.missing_types(|t| registry.contains(t) || is_builtin(t)) {
        problems.push(format!("unknown node type: {}", missing));
    }
    problems
}

fn validate_flows(file: &Path) -> Result<()> {
    println!("🔍 Validating flows: {}", file.display());

    let records = read_records(file)?;
    let config = parse_config(&records)?;
    let problems = check(&config, &standard_registry());

    if !problems.is_empty() {
        for problem in &problems {
            println!("❌ {}", problem);
        }
        bail!("{} problem(s) found", problems.len());
    }

    println!("✅ Flows are valid:");
    println!("   Flows: {}", config.flows.len());
    println!("   Subflow templates: {}", config.subflows.len());
    println!("   Global config nodes: {}", config.global.nodes.len());
    println!("   Nodes: {}", config.all_nodes.len());

    Ok(())
}

fn diff_flows(old: &Path, new: &Path) -> Result<()> {
    let old = parse_config(&read_records(old)?)?;
    let new = parse_config(&read_records(new)?)?;
    let diff = diff_configs(&old, &new);

    if diff.is_empty() {
        println!("No changes");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&diff)?);
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = standard_registry();

    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_flows(output: PathBuf) -> Result<()> {
    let flows = json!([
        {"id": "main", "type": "tab", "label": "Example",
         "env": [{"name": "GREETING", "value": "hello", "type": "str"}]},
        {"id": "greet", "type": "change", "z": "main", "x": 100, "y": 100,
         "property": "payload", "value": "GREETING", "valueType": "env",
         "wires": [["wait"]]},
        {"id": "wait", "type": "delay", "z": "main", "x": 300, "y": 100,
         "delay_ms": 500, "wires": [["log"]]},
        {"id": "log", "type": "debug", "z": "main", "x": 500, "y": 100, "wires": []},
        {"id": "errors", "type": "catch", "z": "main", "x": 100, "y": 200,
         "wires": [["log"]]}
    ]);

    let json = serde_json::to_string_pretty(&flows)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flows: {}", output.display());
    println!();
    println!("Run them with:");
    println!("  flow run --file {} --inject greet --duration-ms 1000", output.display());

    Ok(())
}
