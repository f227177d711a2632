use anyhow::Result;
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use voxagent::chat::run_chat;
use voxagent::cli::{ChatArgs, Cli, Commands, ConfigAction};
use voxagent::config::{Config, EnvCredentials};
use voxagent::task::TaskOutcome;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    voxagent::logging::init(cli.verbose, cli.quiet, cli.json_logs)?;
    tracing::debug!(version = %voxagent::version_string(), "voxagent starting");

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            finish(run_chat(config, ChatArgs::default(), cli.quiet).await?)?;
        }
        Some(Commands::Chat(args)) => {
            let config = load_config(cli.config.as_deref())?;
            finish(run_chat(config, args, cli.quiet).await?)?;
        }
        Some(Commands::Check) => {
            let config = load_config(cli.config.as_deref())?;
            check(&config)?;
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "voxagent", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Explicit `--config` must exist; the default location may be absent.
fn load_config(explicit: Option<&std::path::Path>) -> Result<Config> {
    let config = match (explicit, Config::default_path()) {
        (Some(path), _) => Config::load(path)?,
        (None, Some(path)) => Config::load_or_default(&path)?,
        (None, None) => Config::default(),
    };
    Ok(config.with_env_overrides())
}

/// Maps the session outcome to the process exit status.
fn finish(outcome: TaskOutcome) -> Result<()> {
    match outcome {
        TaskOutcome::Failed(failure) => {
            anyhow::bail!("session failed in {}: {}", failure.stage, failure.message)
        }
        other => {
            tracing::info!(outcome = %other, "session ended");
            Ok(())
        }
    }
}

/// Validate configuration and report provider selection.
fn check(config: &Config) -> Result<()> {
    config.validate()?;
    println!("{} configuration is valid", "●".green());
    println!("  {}  {}", "Language:".dimmed(), config.stt.language);
    println!("  {}     {} ({})", "Voice:".dimmed(), config.tts.voice_id, config.tts.model);

    match config.select_llm(&EnvCredentials) {
        Ok(selection) => {
            for (i, provider) in selection.providers().enumerate() {
                let role = if i == 0 { "LLM:" } else { "Fallback:" };
                println!("  {}  {} ({})", role.dimmed(), provider.name, provider.model);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "●".red(), e);
            Err(e.into())
        }
    }
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&std::path::Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => match voxagent::config::resolve_path(custom_path) {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("could not determine the configuration directory"),
        },
    }
    Ok(())
}
