mod commands;
mod telemetry;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

use commands::VerifyArgs;

/// Offline operator tooling for the task engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration (TOML). TASK_ENGINE_* variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON learning store file
    #[arg(long, global = true, default_value = "task-engine-learning.json")]
    store: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score page text with self-check and evidence stages (no AI judge)
    Verify {
        #[arg(long)]
        task_type: String,
        #[arg(long, conflicts_with = "text_file")]
        text: Option<String>,
        #[arg(long)]
        text_file: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
        /// Share of steps that succeeded, 0-100
        #[arg(long)]
        action_rate: Option<f64>,
    },
    /// Rank root-cause hypotheses for a step error
    Diagnose {
        #[arg(long)]
        error: String,
        #[arg(long, default_value_t = 1)]
        attempts: u32,
        #[arg(long, default_value_t = false)]
        expired_credential: bool,
    },
    /// Inspect failure memory
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Show known issues that would be handed to the next run
    Hints {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        task_type: String,
    },
}

#[derive(Subcommand, Debug)]
enum MemoryCommand {
    /// Best learned fix for an action
    Lookup {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        action_type: String,
        #[arg(long)]
        selector: Option<String>,
    },
    /// Every failure row in the store
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(args.json);

    let config = commands::load_config(args.config.as_deref())?;
    debug!(store = %args.store.display(), "task-runner starting");

    let output = match args.command {
        Command::Verify {
            task_type,
            text,
            text_file,
            url,
            action_rate,
        } => commands::verify(
            &config,
            VerifyArgs {
                task_type,
                text,
                text_file,
                url,
                action_rate,
            },
        )?,
        Command::Diagnose {
            error,
            attempts,
            expired_credential,
        } => commands::diagnose(&error, attempts, expired_credential)?,
        Command::Memory {
            command: MemoryCommand::Lookup {
                domain,
                action_type,
                selector,
            },
        } => commands::memory_lookup(&config, &args.store, &domain, &action_type, selector.as_deref()).await?,
        Command::Memory {
            command: MemoryCommand::List,
        } => commands::memory_list(&args.store).await?,
        Command::Hints { domain, task_type } => commands::hints(&config, &args.store, &domain, &task_type).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_nested_memory_lookup() {
        let args = Args::parse_from([
            "task-runner",
            "--store",
            "/tmp/l.json",
            "memory",
            "lookup",
            "--domain",
            "example.com",
            "--action-type",
            "click",
        ]);
        assert_eq!(args.store, PathBuf::from("/tmp/l.json"));
        assert!(matches!(
            args.command,
            Command::Memory {
                command: MemoryCommand::Lookup { selector: None, .. }
            }
        ));
    }

    #[test]
    fn test_text_and_text_file_conflict() {
        let parsed = Args::try_parse_from([
            "task-runner",
            "verify",
            "--task-type",
            "booking",
            "--text",
            "x",
            "--text-file",
            "page.txt",
        ]);
        assert!(parsed.is_err());
    }
}
