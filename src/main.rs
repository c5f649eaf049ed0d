use anyhow::{Context, Result};
use clap::Parser;
use plotline::config::manager::DEFAULT_MODEL;
use plotline::config::ConfigManager;
use plotline::domain::extractor::DisplayFilter;
use plotline::logging::init_tracing;
use plotline::{ActionRegistry, AgentReply, AgenticLoop, CompletionRouter, Conversation, SendError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stream chat completions through a bounded tool-using agent loop.
#[derive(Parser)]
#[command(name = "plotline", version, about, long_about = None)]
struct Cli {
    /// Config file to use in place of the per-user one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provider name (preset or configured)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Log level or filter directive (PLOTLINE_LOG overrides)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// One-shot prompt. Starts an interactive session when omitted.
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut manager = match cli.config {
        Some(path) => ConfigManager::with_global_path(Some(path)),
        None => ConfigManager::new(),
    };
    let workspace = std::env::current_dir().ok();
    manager
        .load(workspace.as_deref())
        .context("failed to load configuration")?;
    let config = manager.config().clone();

    let resolved = manager.resolve_provider(cli.provider.as_deref())?;
    if resolved.api_key.is_empty() {
        warn!(provider = %resolved.descriptor.name, "no API key configured");
    }

    let model = cli
        .model
        .or(config.model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    info!(provider = %resolved.descriptor.name, model = %model, "starting");

    let router = CompletionRouter::new(resolved.descriptor, &resolved.api_key)?;
    let agent = AgenticLoop::new(
        Arc::new(router),
        Arc::new(ActionRegistry::new()),
        config.agent.loop_config(model),
    );
    let conversation = Conversation::new(config.system_prompt.clone());

    if !cli.prompt.is_empty() {
        return run_turn(&agent, &conversation, &cli.prompt.join(" ")).await;
    }

    eprintln!("plotline: type /exit or press Ctrl-D to quit, Ctrl-C cancels a reply");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/exit" {
            break;
        }
        if let Err(e) = run_turn(&agent, &conversation, input).await {
            eprintln!("error: {:#}", e);
        }
    }

    Ok(())
}

/// Run one user turn, streaming text to stdout while Ctrl-C cancels it.
async fn run_turn(agent: &AgenticLoop, conversation: &Conversation, input: &str) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let cancel = CancellationToken::new();

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut filter = DisplayFilter::new();
        let mut shown = String::new();
        while let Some(chunk) = rx.recv().await {
            let text = filter.push(&chunk);
            stdout.write_all(text.as_bytes()).await?;
            stdout.flush().await?;
            shown.push_str(&text);
        }
        let tail = filter.finish();
        stdout.write_all(tail.as_bytes()).await?;
        shown.push_str(&tail);
        Ok::<_, std::io::Error>(shown)
    });

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = conversation.send(agent, input, tx, cancel).await;
    interrupt.abort();
    let shown = printer.await??;
    println!();

    match result {
        Ok(reply) => {
            report(&reply, &shown);
            Ok(())
        }
        Err(SendError::Failed(failure)) => {
            report(&failure.partial, &shown);
            Err(failure.error.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Print the final answer if it differs from what was shown while
/// streaming, then list what the actions did.
fn report(reply: &AgentReply, shown: &str) {
    if let Some(text) = reply.final_display(shown) {
        if !text.is_empty() {
            println!("\n{}", text);
        }
    }
    for action in &reply.actions {
        match (&action.description, &action.error) {
            (_, Some(error)) if !action.success => eprintln!("[{}] failed: {}", action.action_type, error),
            (Some(description), _) => eprintln!("[{}] {}", action.action_type, description),
            _ => eprintln!("[{}] done", action.action_type),
        }
    }
    if reply.cancelled {
        eprintln!("(cancelled)");
    }
}
