//! Terminal chat: typed user turns over the in-process transport, replies
//! streamed from the configured LLM provider.

use crate::cli::ChatArgs;
use crate::config::{Config, EnvCredentials};
use crate::runner::PipelineRunner;
use crate::services::llm_http::services_from_selection;
use crate::session::{SessionServices, build_session};
use crate::task::TaskOutcome;
use crate::transport::{LocalTransport, Outbound};
use owo_colors::OwoColorize;
use std::io::{BufRead, Write};
use tokio::sync::mpsc;

/// Applies command-line overrides on top of the loaded configuration.
pub fn apply_args(mut config: Config, args: &ChatArgs) -> Config {
    if let Some(language) = &args.language {
        config.stt.language = language.clone();
    }
    if let Some(voice) = &args.voice {
        config.tts.voice_id = voice.clone();
    }
    if let Some(secs) = args.idle_timeout {
        config.session.idle_timeout_secs = secs;
    }
    if args.no_greeting {
        config.prompt.greeting.clear();
    }
    config
}

/// Reads stdin on a plain thread so a pending read never holds up shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Runs one interactive session until the user quits, the idle timeout
/// fires, or the pipeline fails.
pub async fn run_chat(config: Config, args: ChatArgs, quiet: bool) -> anyhow::Result<TaskOutcome> {
    let config = apply_args(config, &args);
    config.validate()?;

    let selection = config.select_llm(&EnvCredentials)?;
    if !quiet {
        eprintln!(
            "{} {} ({})",
            "LLM:".dimmed(),
            selection.primary.name,
            selection.primary.model
        );
        eprintln!("{}", "Type a message, or /quit to leave.".dimmed());
    }

    let services = SessionServices {
        llm: services_from_selection(&selection),
        ..SessionServices::default()
    };
    let (transport, mut client) = LocalTransport::new();
    let session = build_session(&config, services, &transport, Vec::new())?;
    let handle = session.handle.clone();
    let metrics = session.metrics.clone();

    let runner = PipelineRunner::new(true);
    let run = tokio::spawn(async move { session.run(&runner).await });

    client.connect("terminal")?;
    let mut lines = spawn_stdin_reader();
    let mut replying = false;
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    let line = line.trim();
                    if line == "/quit" {
                        client.disconnect()?;
                        break;
                    }
                    if !line.is_empty() {
                        client.send_text(line)?;
                    }
                }
                None => {
                    client.disconnect()?;
                    break;
                }
            },
            output = client.recv() => match output {
                Some(Outbound::Text(text)) => {
                    if !replying {
                        replying = true;
                        print!("{} ", "bot>".green());
                    }
                    print!("{text}");
                    stdout.flush()?;
                }
                Some(Outbound::ResponseEnd) => {
                    replying = false;
                    println!();
                }
                Some(Outbound::Audio(_)) => {}
                None => break,
            },
            _ = handle.finished() => break,
        }
    }

    let outcome = run.await?;
    if !quiet && let Some(metrics) = metrics {
        let summary = metrics.summary();
        eprintln!(
            "{} {} prompt / {} completion tokens",
            "Usage:".dimmed(),
            summary.llm_usage.prompt_tokens,
            summary.llm_usage.completion_tokens
        );
    }
    Ok(outcome)
}
