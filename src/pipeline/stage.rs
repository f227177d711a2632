//! The stage contract and the per-stage context used to emit frames.

use crate::frame::{Direction, ErrorFrame, Frame, FrameData, FrameSource, StartParams};
use crate::observer::{FramePushed, ObserverHub};
use crate::pipeline::error::StageError;
use crate::pipeline::orchestrator::TASK_ENDPOINT;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

/// A processing stage in the pipeline.
///
/// A stage receives one frame at a time, in order, and emits zero or more
/// frames in either direction through its [`StageContext`]. Lifecycle frames
/// (`Start`, `End`, `Cancel`) are handled by the runner, which calls the
/// matching hook and forwards the frame itself.
#[async_trait]
pub trait Stage: Send + 'static {
    /// Returns the name of this stage for routing, logging and errors.
    fn name(&self) -> &str;

    /// Called when the `Start` frame reaches this stage.
    async fn start(
        &mut self,
        _params: &StartParams,
        _ctx: &StageContext,
    ) -> Result<(), StageError> {
        Ok(())
    }

    /// Handles one data frame.
    ///
    /// Frames the stage does not consume must be forwarded with
    /// [`StageContext::forward`]; nothing is forwarded implicitly.
    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> Result<(), StageError>;

    /// Called when the `End` frame arrives. Flush buffered output here.
    async fn finish(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Called when the `Cancel` frame arrives. Release resources and drop
    /// anything that was buffered.
    async fn cancel(&mut self, _ctx: &StageContext) {}
}

/// Message carried between stage inboxes.
#[derive(Debug, Clone)]
pub struct Routed {
    pub frame: Frame,
    pub direction: Direction,
}

/// One neighbour of a stage: its name and its two inboxes.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) name: Arc<str>,
    pub(crate) data: mpsc::UnboundedSender<Routed>,
    pub(crate) system: mpsc::UnboundedSender<Routed>,
}

impl Link {
    /// Sends to the system inbox for system frames, the data inbox otherwise.
    pub(crate) fn send(&self, routed: Routed) -> bool {
        let inbox = if routed.frame.is_system() {
            &self.system
        } else {
            &self.data
        };
        inbox.send(routed).is_ok()
    }
}

/// Handle a stage uses to emit frames, report errors and watch cancellation.
///
/// Cheap to clone; helper tasks spawned by a stage may hold their own copy.
#[derive(Clone)]
pub struct StageContext {
    source: Arc<FrameSource>,
    downstream: Link,
    upstream: Link,
    boundary: mpsc::UnboundedSender<Routed>,
    observers: ObserverHub,
    cancelled: watch::Receiver<bool>,
}

impl StageContext {
    pub(crate) fn new(
        name: &str,
        downstream: Link,
        upstream: Link,
        boundary: mpsc::UnboundedSender<Routed>,
        observers: ObserverHub,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source: Arc::new(FrameSource::new(name)),
            downstream,
            upstream,
            boundary,
            observers,
            cancelled,
        }
    }

    /// Name of the owning stage.
    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Creates a frame produced by this stage.
    pub fn frame(&self, data: FrameData) -> Frame {
        self.source.frame(data)
    }

    /// Creates a frame from `data` and pushes it in `direction`.
    pub fn push(&self, data: FrameData, direction: Direction) {
        let frame = self.frame(data);
        self.forward(frame, direction);
    }

    pub fn push_downstream(&self, data: FrameData) {
        self.push(data, Direction::Downstream);
    }

    pub fn push_upstream(&self, data: FrameData) {
        self.push(data, Direction::Upstream);
    }

    /// Passes an existing frame on, unchanged, in `direction`.
    pub fn forward(&self, frame: Frame, direction: Direction) {
        let link = match direction {
            Direction::Downstream => &self.downstream,
            Direction::Upstream => &self.upstream,
        };
        self.observers.notify(FramePushed {
            source: self.source.name().clone(),
            destination: link.name.clone(),
            frame: frame.clone(),
            direction,
            timestamp: Instant::now(),
        });
        if !link.send(Routed { frame, direction }) {
            tracing::trace!(
                stage = %self.name(),
                destination = %link.name,
                "neighbour inbox closed, frame dropped"
            );
        }
    }

    /// Reports a stage error to the task boundary as an `Error` frame.
    pub fn report_error(&self, error: &StageError) {
        let frame = self.frame(FrameData::Error(ErrorFrame {
            stage: self.name().to_string(),
            message: error.message().to_string(),
            fatal: error.is_fatal(),
        }));
        self.observers.notify(FramePushed {
            source: self.source.name().clone(),
            destination: TASK_ENDPOINT.into(),
            frame: frame.clone(),
            direction: Direction::Upstream,
            timestamp: Instant::now(),
        });
        if self
            .boundary
            .send(Routed {
                frame,
                direction: Direction::Upstream,
            })
            .is_err()
        {
            tracing::warn!(stage = %self.name(), %error, "task boundary closed, error lost");
        }
    }

    /// True once the session has started cancelling.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves when the session starts cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            // Sender gone: the task is finished, nothing will cancel us.
            std::future::pending::<()>().await;
        }
    }
}
