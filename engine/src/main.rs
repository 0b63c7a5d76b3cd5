use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use scout_core::{PipelineConfig, RunManager, RunStore, SendMessageRequest, StatusLog};
use scout_providers::{Generator, HttpGenerator, HttpSearchBackend, SearchBackend};
use scout_types::{Mode, StatusEvent};

#[derive(Parser, Debug)]
#[command(name = "scout-engine")]
#[command(about = "Headless Scout research pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a run, stream its status events, and print the final answer.
    Run {
        message: String,
        #[arg(long, default_value = "fast")]
        mode: Mode,
        #[arg(long)]
        conversation_id: Option<String>,
        /// Existing conversation title; suppresses title generation.
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        /// JSON config file; defaults are used when absent.
        #[arg(long)]
        config: Option<String>,
        #[arg(long, env = "SCOUT_SEARCH_ENDPOINT")]
        search_endpoint: String,
        #[arg(long, env = "SCOUT_GENERATOR_URL", default_value = "https://api.openai.com/v1")]
        generator_url: String,
        #[arg(long, env = "SCOUT_GENERATOR_MODEL", default_value = "gpt-4o-mini")]
        model: String,
    },
    /// List persisted runs.
    Runs {
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Replay the persisted event log of a run.
    Events {
        run_id: String,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Delete a run's persisted state and event log.
    Delete {
        run_id: String,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            message,
            mode,
            conversation_id,
            title,
            state_dir,
            config,
            search_endpoint,
            generator_url,
            model,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let config = match config {
                Some(path) => PipelineConfig::load(&PathBuf::from(path))
                    .context("failed to load config file")?,
                None => PipelineConfig::load_or_default(&state_dir.join("config.json")),
            };

            let api_key = first_env(&["SCOUT_API_KEY", "OPENAI_API_KEY"]);
            let generator: Arc<dyn Generator> =
                Arc::new(HttpGenerator::new(generator_url, model, api_key));
            let backend: Arc<dyn SearchBackend> = Arc::new(HttpSearchBackend::new(
                search_endpoint,
                first_env(&["SCOUT_SEARCH_API_KEY"]),
            ));

            let manager = Arc::new(RunManager::new(&state_dir, config, generator, backend)?);
            let mut events = manager.subscribe();
            let ticket = manager
                .send_message(SendMessageRequest {
                    conversation_id,
                    message,
                    mode,
                    history: Vec::new(),
                    conversation_title: title,
                })
                .await?;
            info!("started run {}", ticket.run_id);

            while let Ok(event) = events.recv().await {
                if event.run_id != ticket.run_id {
                    continue;
                }
                print_event(&event);
                if event.stage.is_terminal() {
                    break;
                }
            }

            let run = manager.load_run(&ticket.run_id)?;
            println!("\n{}\n", run.answer);
            if !run.citations.is_empty() {
                println!("Citations:");
                for citation in &run.citations {
                    println!("  [{}] {}", citation.index, citation.url);
                }
            }
            if let Some(title) = &run.title {
                println!("Title: {}", title);
            }
        }
        Command::Runs { state_dir } => {
            let store = RunStore::new(&resolve_state_dir(state_dir))?;
            for summary in store.load_summaries()? {
                println!(
                    "{}  {:<12} {:<8} {}",
                    summary.run_id,
                    summary.stage.as_str(),
                    summary.mode.as_str(),
                    summary.title.as_deref().unwrap_or(summary.query.as_str())
                );
            }
        }
        Command::Events { run_id, state_dir } => {
            let store = Arc::new(RunStore::new(&resolve_state_dir(state_dir))?);
            let log = StatusLog::new(store);
            for event in log.replay(&run_id)? {
                print_event(&event);
            }
        }
        Command::Delete { run_id, state_dir } => {
            let store = RunStore::new(&resolve_state_dir(state_dir))?;
            store.delete_run(&run_id)?;
            println!("deleted run {}", run_id);
        }
    }

    Ok(())
}

fn print_event(event: &StatusEvent) {
    let marker = if event.is_replay { "~" } else { " " };
    println!(
        "{}[{:>3}] {:<13} {}",
        marker,
        event.seq,
        event.stage.as_str(),
        event.message
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("SCOUT_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".scout")
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dir_flag_takes_precedence() {
        let dir = resolve_state_dir(Some("/tmp/custom".to_string()));
        assert_eq!(dir, PathBuf::from("/tmp/custom"));
    }

    #[test]
    fn run_subcommand_parses_mode() {
        let cli = Cli::parse_from([
            "scout-engine",
            "run",
            "what is rust",
            "--mode",
            "thorough",
            "--search-endpoint",
            "https://search.example.com/invoke",
        ]);
        match cli.command {
            Command::Run { mode, message, .. } => {
                assert_eq!(mode, Mode::Thorough);
                assert_eq!(message, "what is rust");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
