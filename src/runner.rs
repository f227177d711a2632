//! Pipeline runner: drives tasks to completion and owns signal handling.

use crate::error::{Result, VoxError};
use crate::frame::CancelReason;
use crate::task::{PipelineTask, TaskFailure, TaskHandle, TaskOutcome};
use tokio::task::{JoinHandle, JoinSet};

/// Runs one or many [`PipelineTask`]s.
///
/// With `handle_sigint`, SIGINT (and SIGTERM on unix) cancel every task the
/// runner is driving; each then reports `Cancelled(Signal)`.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRunner {
    handle_sigint: bool,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PipelineRunner {
    pub fn new(handle_sigint: bool) -> Self {
        Self { handle_sigint }
    }

    /// Runs a single task until it reaches a terminal state.
    pub async fn run(&self, task: PipelineTask) -> TaskOutcome {
        let watcher = self.watch_signals(vec![task.handle()]);
        let outcome = task.run().await;
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        outcome
    }

    /// Runs tasks concurrently, isolated from each other.
    ///
    /// A task that panics is reported as failed without affecting the rest.
    /// Outcomes are returned in input order.
    pub async fn run_all(&self, tasks: Vec<PipelineTask>) -> Vec<TaskOutcome> {
        let handles: Vec<TaskHandle> = tasks.iter().map(PipelineTask::handle).collect();
        let watcher = self.watch_signals(handles);

        let mut set = JoinSet::new();
        let mut outcomes: Vec<Option<TaskOutcome>> = Vec::with_capacity(tasks.len());
        let mut names = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.into_iter().enumerate() {
            names.push(task.name().to_string());
            outcomes.push(None);
            set.spawn(async move { (index, task.run().await) });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => tracing::error!(error = %e, "pipeline task aborted"),
            }
        }
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        outcomes
            .into_iter()
            .zip(names)
            .map(|(outcome, name)| {
                outcome.unwrap_or_else(|| {
                    TaskOutcome::Failed(TaskFailure {
                        stage: name,
                        message: "task panicked".to_string(),
                    })
                })
            })
            .collect()
    }

    fn watch_signals(&self, handles: Vec<TaskHandle>) -> Option<JoinHandle<()>> {
        if !self.handle_sigint {
            return None;
        }
        Some(tokio::spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        tracing::warn!(error = %e, "failed to listen for SIGINT");
                        return;
                    }
                    tracing::info!("received SIGINT, cancelling");
                }
                res = wait_for_sigterm() => {
                    if let Err(e) = res {
                        tracing::warn!(error = %e, "failed to listen for SIGTERM");
                        return;
                    }
                    tracing::info!("received SIGTERM, cancelling");
                }
            }
            for handle in &handles {
                handle.cancel_with(CancelReason::Signal);
            }
        }))
    }
}

/// Wait for SIGTERM signal.
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| VoxError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await
}
