//! Pipeline task: one session's lifecycle around a [`Pipeline`].
//!
//! ```text
//! Created ──run()──▶ Running ──End at tail──────────────▶ Completed
//!                      │
//!                      ├─cancel / idle / signal─▶ Cancelling ──▶ Cancelled
//!                      └─fatal Error frame──────▶ Cancelling ──▶ Failed
//! ```

use crate::config::SessionConfig;
use crate::defaults;
use crate::error::{Result, VoxError};
use crate::frame::{CancelReason, Direction, FrameData, FrameSource, StartParams};
use crate::observer::{ActivityObserver, Observer, ObserverHub};
use crate::pipeline::Pipeline;
use crate::pipeline::orchestrator::{RunningPipeline, TASK_ENDPOINT};
use crate::pipeline::stage::Routed;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;

/// Session parameters carried by the `Start` frame and the task itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskParams {
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    /// How long stages get to acknowledge cancellation before being aborted.
    pub cancel_timeout: Duration,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl TaskParams {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            audio_in_sample_rate: config.audio_in_sample_rate,
            audio_out_sample_rate: config.audio_out_sample_rate,
            enable_metrics: config.enable_metrics,
            enable_usage_metrics: config.enable_usage_metrics,
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            cancel_timeout: Duration::from_millis(defaults::CANCEL_TIMEOUT_MS),
        }
    }

    fn start_params(&self) -> StartParams {
        StartParams {
            audio_in_sample_rate: self.audio_in_sample_rate,
            audio_out_sample_rate: self.audio_out_sample_rate,
            enable_metrics: self.enable_metrics,
            enable_usage_metrics: self.enable_usage_metrics,
        }
    }
}

/// Lifecycle state of a [`PipelineTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Running,
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The fatal error that ended a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub stage: String,
    pub message: String,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled(CancelReason),
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Completed => TaskStatus::Completed,
            Self::Cancelled(_) => TaskStatus::Cancelled,
            Self::Failed(_) => TaskStatus::Failed,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Cancelled(reason) => write!(f, "cancelled ({reason})"),
            Self::Failed(failure) => write!(f, "failed in {}: {}", failure.stage, failure.message),
        }
    }
}

enum Command {
    Queue(Vec<FrameData>),
    Cancel(CancelReason),
}

/// Control handle for a [`PipelineTask`]; cheap to clone and usable from
/// any thread, including transport event callbacks.
#[derive(Clone)]
pub struct TaskHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TaskStatus>,
    cancelling: Arc<AtomicBool>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("status", &self.status())
            .finish()
    }
}

impl TaskHandle {
    /// Queues one frame at the head of the pipeline.
    pub fn queue_frame(&self, data: FrameData) -> Result<()> {
        self.queue_frames(vec![data])
    }

    /// Queues frames at the head of the pipeline, in order.
    ///
    /// Frames queued before `run()` are delivered right after `Start`.
    /// Fails once the task is cancelling or finished.
    pub fn queue_frames(&self, frames: Vec<FrameData>) -> Result<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(VoxError::TaskNotRunning {
                status: status.to_string(),
            });
        }
        if self.cancelling.load(Ordering::SeqCst) {
            return Err(VoxError::CancellationRace {
                operation: "queue_frames".to_string(),
            });
        }
        self.commands
            .send(Command::Queue(frames))
            .map_err(|_| VoxError::TaskNotRunning {
                status: self.status().to_string(),
            })
    }

    /// Cancels the session (e.g. client disconnected).
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Requested);
    }

    /// Cancels the session with an explicit reason. Repeated calls are no-ops.
    pub fn cancel_with(&self, reason: CancelReason) {
        if self.cancelling.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.commands.send(Command::Cancel(reason)).is_err() {
            tracing::debug!(%reason, "cancel after task finished");
        }
    }

    /// Ends the session gracefully once everything queued so far is processed.
    pub fn stop_when_done(&self) -> Result<()> {
        self.queue_frame(FrameData::End)
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Waits until the task reaches a terminal status.
    pub async fn finished(&self) -> TaskStatus {
        let mut rx = self.status.clone();
        if rx.wait_for(|s| s.is_terminal()).await.is_err() {
            tracing::debug!("task dropped without running");
        }
        let status = *rx.borrow();
        status
    }
}

/// A pipeline plus the session parameters and observers it runs with.
pub struct PipelineTask {
    name: String,
    pipeline: Pipeline,
    params: TaskParams,
    observers: Vec<Arc<dyn Observer>>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: TaskHandle,
    status: watch::Sender<TaskStatus>,
}

impl PipelineTask {
    pub fn new(pipeline: Pipeline, params: TaskParams, observers: Vec<Arc<dyn Observer>>) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(TaskStatus::Created);
        let handle = TaskHandle {
            commands: commands_tx,
            status: status_rx,
            cancelling: Arc::new(AtomicBool::new(false)),
        };
        Self {
            name: TASK_ENDPOINT.to_string(),
            pipeline,
            params,
            observers,
            commands,
            handle,
            status,
        }
    }

    /// Names the task in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.handle.status()
    }

    /// Runs the session to a terminal state.
    pub async fn run(self) -> TaskOutcome {
        let PipelineTask {
            name,
            pipeline,
            params,
            mut observers,
            mut commands,
            handle,
            status,
        } = self;

        let activity = Arc::new(Notify::new());
        if params.idle_timeout.is_some() {
            observers.push(Arc::new(ActivityObserver::new(activity.clone())));
        }
        let hub = ObserverHub::spawn(observers);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Routed>();

        tracing::info!(task = %name, stages = ?pipeline.stage_names(), "pipeline task starting");
        let running = pipeline.launch(sink_tx, hub.clone(), cancel_rx);
        let source = FrameSource::new(TASK_ENDPOINT);
        status.send_replace(TaskStatus::Running);
        running.push(source.frame(FrameData::Start(params.start_params())));

        let mut session = Session {
            running,
            source,
            params,
            cancel_tx,
            cancelling: handle.cancelling.clone(),
            status: &status,
            cancel_reason: None,
            cancel_deadline: None,
            failure: None,
        };
        let mut idle_deadline = params.idle_timeout.map(|timeout| Instant::now() + timeout);
        let mut commands_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                Some(routed) = sink_rx.recv() => {
                    if let Some(outcome) = session.on_boundary_frame(routed) {
                        break outcome;
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Queue(frames)) => session.queue(frames),
                    Some(Command::Cancel(reason)) => session.begin_cancel(reason),
                    None => commands_open = false,
                },
                _ = activity.notified() => {
                    if let Some(timeout) = params.idle_timeout {
                        idle_deadline = Some(Instant::now() + timeout);
                    }
                }
                _ = sleep_until(idle_deadline), if idle_deadline.is_some() && session.cancel_reason.is_none() => {
                    tracing::info!(task = %name, "no activity within idle timeout");
                    session.begin_cancel(CancelReason::IdleTimeout);
                }
                _ = sleep_until(session.cancel_deadline), if session.cancel_deadline.is_some() => {
                    tracing::warn!(task = %name, "stages did not acknowledge cancellation in time, aborting");
                    break session.cancelled_outcome();
                }
                Some(joined) = session.running.join_next() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(task = %name, error = %e, "stage panicked");
                        session.fail("unknown", format!("stage panicked: {e}"));
                    }
                }
            }
        };

        let Session { running, cancel_tx, cancelling, .. } = session;
        cancelling.store(true, Ordering::SeqCst);
        cancel_tx.send_replace(true);
        running.shutdown().await;
        hub.shutdown().await;

        match &outcome {
            TaskOutcome::Failed(_) => tracing::error!(task = %name, %outcome, "pipeline task finished"),
            _ => tracing::info!(task = %name, %outcome, "pipeline task finished"),
        }
        status.send_replace(outcome.status());
        outcome
    }
}

/// Run-time state of a task between `Start` and its terminal outcome.
struct Session<'a> {
    running: RunningPipeline,
    source: FrameSource,
    params: TaskParams,
    cancel_tx: watch::Sender<bool>,
    cancelling: Arc<AtomicBool>,
    status: &'a watch::Sender<TaskStatus>,
    cancel_reason: Option<CancelReason>,
    cancel_deadline: Option<Instant>,
    failure: Option<TaskFailure>,
}

impl Session<'_> {
    fn is_cancelling(&self) -> bool {
        self.cancel_reason.is_some()
    }

    fn queue(&mut self, frames: Vec<FrameData>) {
        if self.is_cancelling() {
            tracing::debug!(count = frames.len(), "dropping frames queued during cancellation");
            return;
        }
        for data in frames {
            if !self.running.push(self.source.frame(data)) {
                tracing::warn!("pipeline head closed, frame dropped");
            }
        }
    }

    fn begin_cancel(&mut self, reason: CancelReason) {
        if self.is_cancelling() {
            return;
        }
        tracing::info!(%reason, "cancelling pipeline");
        self.cancel_reason = Some(reason);
        self.cancelling.store(true, Ordering::SeqCst);
        self.status.send_replace(TaskStatus::Cancelling);
        self.cancel_tx.send_replace(true);
        self.running.push(self.source.frame(FrameData::Cancel(reason)));
        self.cancel_deadline = Some(Instant::now() + self.params.cancel_timeout);
    }

    fn fail(&mut self, stage: &str, message: String) {
        if self.failure.is_none() {
            self.failure = Some(TaskFailure {
                stage: stage.to_string(),
                message,
            });
        }
        self.begin_cancel(CancelReason::Failure);
    }

    fn cancelled_outcome(&mut self) -> TaskOutcome {
        match self.failure.take() {
            Some(failure) => TaskOutcome::Failed(failure),
            None => TaskOutcome::Cancelled(self.cancel_reason.unwrap_or(CancelReason::Requested)),
        }
    }

    /// Handles a frame that left the chain at either end.
    fn on_boundary_frame(&mut self, routed: Routed) -> Option<TaskOutcome> {
        let Routed { frame, direction } = routed;
        match (frame.data(), direction) {
            (FrameData::Cancel(_), Direction::Downstream) => {
                tracing::debug!("cancel signal traversed the pipeline");
                Some(self.cancelled_outcome())
            }
            (FrameData::End, Direction::Downstream) if !self.is_cancelling() => {
                Some(TaskOutcome::Completed)
            }
            (FrameData::Error(error), _) if error.fatal => {
                tracing::error!(stage = %error.stage, message = %error.message, "fatal stage error");
                self.fail(&error.stage, error.message.clone());
                None
            }
            (FrameData::Error(error), _) => {
                tracing::warn!(stage = %error.stage, message = %error.message, "recoverable stage error");
                None
            }
            _ => {
                tracing::trace!(frame = %frame, ?direction, "frame left the pipeline");
                None
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
