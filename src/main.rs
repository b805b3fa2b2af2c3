mod check;
mod demo;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepwise_core::config::{AppConfig, StoreBackend};
use stepwise_core::error::StepwiseError;
use stepwise_core::event::EventBus;
use stepwise_core::traits::{Generator, ThreadStore};
use stepwise_core::types::{FlowEvent, ThreadId};

use stepwise_flow::{support, ConversationRunner, InMemoryThreadStore, StepRegistry};
use stepwise_memory::SqliteThreadStore;

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Step-gated dialogue controller")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepwise.toml")]
    config: PathBuf,

    /// Thread ID (auto-generated if not provided)
    #[arg(short, long)]
    thread: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation
    Repl,
    /// Send a single message on a thread and exit
    Run {
        /// The message to send
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Play the scripted support conversation
    Demo {
        /// Use canned replies instead of calling the model
        #[arg(long)]
        offline: bool,
    },
    /// Validate the flow and environment
    Check,
    /// Show current configuration (including the effective flow)
    Config,
    /// List stored threads
    Threads,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepwise=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;
    let registry = build_registry(&config);

    match &cli.command {
        Some(Commands::Check) => {
            let registry = registry.map_err(|e| e.to_string());
            let failed = check::run_check(&config, &registry);
            if failed > 0 {
                anyhow::bail!("{} check(s) failed", failed);
            }
            return Ok(());
        }
        Some(Commands::Config) => {
            let mut effective = config.clone();
            if effective.flow.is_none() {
                effective.flow = Some(support::flow_config());
            }
            println!("{}", toml::to_string_pretty(&effective)?);
            return Ok(());
        }
        _ => {}
    }

    let registry = Arc::new(registry?);
    let store = open_store(&config)?;

    if let Some(Commands::Threads) = &cli.command {
        let ids = store.list().await?;
        if ids.is_empty() {
            println!("No stored threads.");
        }
        for id in ids {
            if let Some(snapshot) = store.load(&id).await? {
                println!(
                    "{}  step={}  outcome={}  messages={}  updated={}",
                    id,
                    snapshot.step,
                    snapshot.outcome,
                    snapshot.history.len(),
                    snapshot.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        return Ok(());
    }

    let generator: Arc<dyn Generator> = match &cli.command {
        Some(Commands::Demo { offline: true }) => Arc::new(demo::CannedGenerator::new()),
        _ => stepwise_llm::create_generator(&config.model)?,
    };

    let event_bus = Arc::new(EventBus::default());
    let runner = ConversationRunner::new(registry, generator, store, config.runner.clone())
        .with_event_bus(event_bus.clone());

    let thread_id = cli
        .thread
        .as_deref()
        .map(ThreadId::from_str)
        .unwrap_or_default();
    info!(thread = %thread_id, model = %config.model.model_id, "Stepwise starting");

    match cli.command {
        Some(Commands::Run { message }) => {
            let text = message.join(" ");
            let text = if text.is_empty() {
                // Read from stdin
                io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                text
            };
            run_once(&runner, &event_bus, &thread_id, &text).await?;
        }
        Some(Commands::Demo { .. }) => run_demo(&runner, &event_bus, &thread_id).await?,
        Some(Commands::Repl) | None => run_repl(&runner, &event_bus, &thread_id).await?,
        Some(Commands::Check)
        | Some(Commands::Config)
        | Some(Commands::Threads)
        | Some(Commands::Completions { .. }) => unreachable!("handled above"),
    }

    Ok(())
}

fn build_registry(config: &AppConfig) -> stepwise_core::Result<StepRegistry> {
    match &config.flow {
        Some(flow) => StepRegistry::from_config(flow),
        None => support::registry(),
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ThreadStore>> {
    Ok(match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryThreadStore::new()),
        StoreBackend::Sqlite => {
            let path = config.store.resolved_path();
            Arc::new(SqliteThreadStore::open(&path)?)
        }
    })
}

/// Print flow events published during the last turn.
fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<FlowEvent>) {
    while let Ok(event) = rx.try_recv() {
        match event {
            FlowEvent::FactRecorded { fact, value, .. } => {
                println!("\x1b[2m  [fact] {} = {}\x1b[0m", fact, value);
            }
            FlowEvent::StepChanged { from, to, reason, .. } => match reason {
                Some(reason) => println!("\x1b[33m  [step] {} -> {} ({})\x1b[0m", from, to, reason),
                None => println!("\x1b[33m  [step] {} -> {}\x1b[0m", from, to),
            },
            FlowEvent::Terminal { outcome, .. } => {
                println!("\x1b[32m  [outcome] {}\x1b[0m", outcome);
            }
            FlowEvent::ActionIgnored { action, .. } => {
                println!("\x1b[2m  [ignored] {}\x1b[0m", action);
            }
            FlowEvent::TurnStarted { .. }
            | FlowEvent::TurnFailed { .. }
            | FlowEvent::TurnCompleted { .. }
            | FlowEvent::ThreadReset { .. } => {}
        }
    }
}

async fn run_once(
    runner: &ConversationRunner,
    event_bus: &EventBus,
    thread_id: &ThreadId,
    input: &str,
) -> anyhow::Result<()> {
    let mut rx = event_bus.subscribe();
    let result = runner.handle_turn(thread_id, input).await;
    drain_events(&mut rx);
    let outcome = result?;
    println!("{}", outcome.reply);
    Ok(())
}

async fn run_demo(
    runner: &ConversationRunner,
    event_bus: &EventBus,
    thread_id: &ThreadId,
) -> anyhow::Result<()> {
    println!("Thread: {}\n", thread_id);
    let mut rx = event_bus.subscribe();

    for (turn, message) in demo::MESSAGES.iter().enumerate() {
        println!("--- Turn {} ---", turn + 1);
        println!("User: {}", message);
        let result = runner.handle_turn(thread_id, message).await;
        drain_events(&mut rx);
        let outcome = result?;
        println!("Assistant: {}", outcome.reply);
        println!("Current step: {}", outcome.step);
        println!("Facts: {}\n", outcome.facts);
    }
    Ok(())
}

async fn run_repl(
    runner: &ConversationRunner,
    event_bus: &EventBus,
    thread_id: &ThreadId,
) -> anyhow::Result<()> {
    let state = runner.get_or_create_thread(thread_id).await?;
    println!("Stepwise v{}", env!("CARGO_PKG_VERSION"));
    println!("Thread: {}", thread_id);
    println!("Step: {}", state.step_name(runner.registry()));
    println!("Type /state to inspect, /reset to start over, /quit to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut rx = event_bus.subscribe();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break; // EOF
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" | "/q" => {
                println!("Goodbye!");
                break;
            }
            "/state" => {
                match runner.snapshot(thread_id).await? {
                    Some(snapshot) => {
                        let facts = stepwise_flow::FactStore::from_map(snapshot.facts);
                        println!("Step: {}", snapshot.step);
                        println!("Facts: {}", facts);
                        println!("Outcome: {}", snapshot.outcome);
                        println!("Messages: {}", snapshot.history.len());
                    }
                    None => println!("Thread has no stored state yet."),
                }
                continue;
            }
            "/reset" => {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt("Discard this conversation?")
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if confirmed {
                    runner.reset_thread(thread_id).await?;
                    let state = runner.get_or_create_thread(thread_id).await?;
                    drain_events(&mut rx);
                    println!("Thread reset. Step: {}", state.step_name(runner.registry()));
                }
                continue;
            }
            _ => {}
        }

        let result = runner.handle_turn(thread_id, input).await;
        drain_events(&mut rx);
        match result {
            Ok(outcome) => println!("{}\n", outcome.reply),
            // A broken flow fails every turn the same way.
            Err(
                e @ (StepwiseError::PreconditionViolation { .. }
                | StepwiseError::TemplateBinding { .. }
                | StepwiseError::Database(_)),
            ) => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Turn failed; thread unchanged");
                eprintln!("\x1b[31mError: {}\x1b[0m\n", e);
            }
        }
    }

    Ok(())
}
