//! Command-line arguments for the `voxagent` binary.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Conversational voice agent pipeline
#[derive(Parser, Debug)]
#[command(
    name = "voxagent",
    version,
    about = "Conversational voice agent pipeline"
)]
pub struct Cli {
    /// Subcommand to execute (default: chat)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

/// Parse a duration string into seconds.
///
/// Supports any duration format accepted by `humantime`: bare numbers (seconds),
/// single-unit (`30s`, `5m`, `2h`), and compound (`1h30m`, `2m30s`).
/// `0` disables the timeout.
fn parse_timeout_secs(s: &str) -> Result<u64, String> {
    let s = s.trim();
    // Bare number → seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }
    humantime::parse_duration(s)
        .map(|d| d.as_secs())
        .map_err(|e| e.to_string())
}

/// Options for an interactive session
#[derive(clap::Args, Debug, Default, Clone, PartialEq)]
pub struct ChatArgs {
    /// Language code for speech recognition (e.g., uk, en)
    #[arg(long, value_name = "LANG")]
    pub language: Option<String>,

    /// TTS voice id
    #[arg(long, value_name = "VOICE")]
    pub voice: Option<String>,

    /// End the session after this long without activity (e.g., 90s, 5m; 0 disables)
    #[arg(long, value_name = "DURATION", value_parser = parse_timeout_secs)]
    pub idle_timeout: Option<u64>,

    /// Skip the greeting the bot gives when the session starts
    #[arg(long)]
    pub no_greeting: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Chat with the agent from the terminal (typed turns)
    Chat(ChatArgs),

    /// Validate configuration and report which LLM provider would be used
    Check,

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (file + environment) as TOML
    Show,
    /// Print the configuration file path
    Path,
}
