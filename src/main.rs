use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowforge_core::config::AppConfig;
use flowforge_core::event::EventBus;
use flowforge_core::graph::Graph;
use flowforge_core::traits::{EmbeddingService, MemoryStore, VisionService};
use flowforge_core::types::{EngineEvent, ExecutionState, NodeStatus};

use flowforge_engine::{build_order, ExecutionController, NodeDispatcher, RunLogger, Services, StrategyDefaults};
use flowforge_memory::{InMemoryStore, SqliteMemoryStore};
use flowforge_tools::{ProcessSandbox, ReqwestHttpProxy};

#[derive(Parser)]
#[command(name = "flowforge", version, about = "Run automation graphs from the command line")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowforge.toml", env = "FLOWFORGE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph and print the run summary
    Run {
        /// Graph JSON file
        graph: PathBuf,
        /// Also print every node's result
        #[arg(long)]
        results: bool,
    },
    /// Print the execution order of a graph without running it
    Order {
        /// Graph JSON file
        graph: PathBuf,
    },
    /// Show current configuration
    Config,
    /// List agent memory sessions in the configured database
    Sessions,
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
                .unwrap_or_else(|_| EnvFilter::new("flowforge=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "flowforge", &mut std::io::stdout());
        }
        Commands::Order { graph } => {
            // Ordering needs no config or collaborators
            let order = build_order(&load_graph(&graph)?);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "order": order.order,
                    "excluded": order.excluded,
                }))?
            );
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Sessions => {
            let config = load_config(&cli.config)?;
            let Some(path) = config.memory.resolved_db_path() else {
                anyhow::bail!("No [memory] db_path configured");
            };
            let store = SqliteMemoryStore::open(&path)?;
            for session in store.sessions()? {
                println!(
                    "{}\t{} messages\t{}",
                    session.session_id, session.messages, session.last_activity
                );
            }
        }
        Commands::Run { graph, results } => {
            let config = load_config(&cli.config)?;
            let graph = load_graph(&graph)?;
            run_graph(&config, graph, results).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".flowforge").join("config.toml"));
    match home_config {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(AppConfig::load(&path)?)
        }
        _ => {
            warn!("No config file found, using defaults (no model service)");
            Ok(AppConfig::default())
        }
    }
}

fn load_graph(path: &Path) -> anyhow::Result<Graph> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read graph {}: {}", path.display(), e))?;
    Ok(Graph::from_json(&json)?)
}

/// Wire concrete collaborators from config.
fn build_services(config: &AppConfig) -> anyhow::Result<Services> {
    let mut services = Services::default()
        .with_http(Arc::new(ReqwestHttpProxy::new(&config.http)?))
        .with_sandbox(Arc::new(ProcessSandbox::new(
            config.sandbox.clone().unwrap_or_default(),
        )));

    if let Some(model) = &config.model {
        let client = Arc::new(flowforge_llm::OpenAiClient::new(model.clone()));
        let embedding: Arc<dyn EmbeddingService> = client.clone();
        let vision: Arc<dyn VisionService> = client.clone();
        services = services
            .with_chat(flowforge_llm::create_chat(model, client))
            .with_embedding(embedding)
            .with_vision(vision);
        info!(provider = %model.provider, model = %model.model_id, "Model services configured");
    }

    let memory: Arc<dyn MemoryStore> = match config.memory.resolved_db_path() {
        Some(path) => Arc::new(SqliteMemoryStore::open(&path)?),
        None => Arc::new(InMemoryStore::new()),
    };
    Ok(services.with_memory(memory))
}

async fn run_graph(config: &AppConfig, graph: Graph, print_results: bool) -> anyhow::Result<()> {
    let dispatcher = Arc::new(NodeDispatcher::with_defaults(
        build_services(config)?,
        StrategyDefaults::from_config(config),
    ));
    let event_bus = Arc::new(EventBus::default());
    let controller = ExecutionController::new(dispatcher)
        .with_observer(event_bus.clone())
        .with_history_limit(config.engine.history_limit);

    let cancel = CancellationToken::new();

    // Spawn RunLogger if logging is enabled
    let logger_handle = match &config.log {
        Some(log_config) if log_config.enabled => {
            let logger = RunLogger::new(log_config.resolved_dir(), log_config.level);
            Some(tokio::spawn(logger.run(event_bus.clone(), cancel.clone())))
        }
        _ => None,
    };

    // Per-node progress on stderr
    let mut rx = event_bus.subscribe();
    let printer_cancel = cancel.clone();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = printer_cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(EngineEvent::NodeStatusChanged { node_id, status, message, .. }) => {
                        if status != NodeStatus::Waiting {
                            match message {
                                Some(m) => eprintln!("[{}: {}] {}", node_id, status, truncate(&m, 200)),
                                None => eprintln!("[{}: {}]", node_id, status),
                            }
                        }
                    }
                    Ok(EngineEvent::AgentIteration { node_id, iteration, tool }) => {
                        if let Some(tool) = tool {
                            eprintln!("[{}: iteration {}] tool: {}", node_id, iteration, tool);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    let state = tokio::select! {
        state = controller.start(graph) => state?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nStopping...");
            controller.stop()?;
            cancel.cancel();
            ExecutionState::Idle
        }
    };

    let latest = controller.history().into_iter().next();
    let results = controller.results();

    // Dropping the last publishers closes the bus; observers drain and exit
    drop(controller);
    drop(event_bus);
    printer.await.ok();
    if let Some(handle) = logger_handle {
        handle.await.ok();
    }

    let Some(result) = latest else {
        anyhow::bail!("Run stopped before completion");
    };

    let summary = if print_results {
        serde_json::json!({ "run": result, "results": results })
    } else {
        serde_json::to_value(&result)?
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if state == ExecutionState::Error {
        anyhow::bail!(
            "Run finished with errors: {}",
            result.error.unwrap_or_default()
        );
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
