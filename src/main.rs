use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_sync::config::Config;
use agent_sync::replay;

#[derive(Parser)]
#[command(name = "agent-sync")]
#[command(author, about = "Agent conversation-state sync: replay and inspect push events", long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("AGENT_SYNC_GIT_HASH"), ")"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines capture of push events and print the final state
    Replay {
        /// Capture file, one event frame per line
        file: PathBuf,

        /// Conversation to make live (default: first one in the capture)
        #[arg(short, long)]
        conversation: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "agent_sync=debug"
    } else {
        "agent_sync=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Replay {
            file,
            conversation,
            format,
        } => {
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?,
            );
            let report = replay::replay(reader, conversation.as_deref(), &config)?;
            tracing::debug!(
                "Replayed {} events from {}",
                report.events_total,
                file.display()
            );
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&report)?),
                "text" => print!("{}", replay::render_text(&report)),
                other => anyhow::bail!("Unknown format '{}'. Use 'text' or 'json'", other),
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
