//! castle 命令行：对一份战场快照执行一条指令
//!
//! 用法：`castle --objects battle.json "All units attack enemy castle"`

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use castle::config::load_config;
use castle::react::ReactEvent;
use castle::AgentRuntime;

/// Run one battle command against a battlefield snapshot
#[derive(Parser, Debug)]
#[command(name = "castle")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The command for the units, in natural language
    request: String,

    /// Battlefield snapshot: a JSON list of game objects, or `{"gameObjects": [...]}`
    #[arg(short, long)]
    objects: PathBuf,

    /// Configuration file (defaults to config/default.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the model backend (ollama, openai, mock)
    #[arg(long)]
    provider: Option<String>,

    /// Override the step bound
    #[arg(long)]
    max_steps: Option<usize>,

    /// Print only the final JSON result
    #[arg(short, long)]
    quiet: bool,
}

fn print_event(ev: &ReactEvent) {
    match ev {
        ReactEvent::StepStarted { step, max_steps } => println!("━━ Step {}/{} ━━", step, max_steps.saturating_sub(1)),
        ReactEvent::ModelOutput { text, .. } => println!("{}", text.trim()),
        ReactEvent::CodeParsed { code, .. } => println!("── Executing parsed code ──\n{}", code),
        ReactEvent::Observation { text, .. } => println!("── Observation ──\n{}", text),
        ReactEvent::StepFailed { kind, message, .. } => println!("── Step failed ({}) ──\n{}", kind, message),
        ReactEvent::FinalAnswer { step, .. } => println!("── Final answer at step {} ──", step),
        ReactEvent::NoAnswer { steps } => println!("No answer after {} steps", steps),
        ReactEvent::TokenUsage {
            input_tokens,
            output_tokens,
            ..
        } => println!("(tokens: {} in / {} out)", input_tokens, output_tokens),
    }
}

fn read_objects(path: &PathBuf) -> anyhow::Result<Vec<serde_json::Value>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let json: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?;
    match json {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut map) => match map.remove("gameObjects") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => anyhow::bail!("{} has no gameObjects list", path.display()),
        },
        _ => anyhow::bail!("{} must contain a list of game objects", path.display()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    castle::observability::init();
    let cli = Cli::parse();

    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    if let Some(provider) = cli.provider {
        cfg.llm.provider = provider;
    }
    if let Some(max_steps) = cli.max_steps {
        cfg.agent.max_steps = max_steps;
    }
    let records = read_objects(&cli.objects)?;
    let runtime = AgentRuntime::new(cfg);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let quiet = cli.quiet;
    let printer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            if !quiet {
                print_event(&ev);
            }
        }
    });

    let result = runtime
        .process_command(&records, &cli.request, Some(tx))
        .await
        .context("Command failed")?;
    let _ = printer.await;

    match result {
        Some(answer) => println!("{}", serde_json::to_string_pretty(&answer)?),
        None => {
            eprintln!("No answer");
            println!("null");
        }
    }
    Ok(())
}
