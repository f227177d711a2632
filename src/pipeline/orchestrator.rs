//! Pipeline: an ordered, bidirectional chain of stages.

use crate::error::{Result, VoxError};
use crate::frame::{Direction, Frame};
use crate::observer::{FramePushed, ObserverHub};
use crate::pipeline::runner::{Inbox, run_stage};
use crate::pipeline::stage::{Link, Routed, Stage, StageContext};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};

/// Name under which the task appears as a frame endpoint.
pub const TASK_ENDPOINT: &str = "PipelineTask";

/// An ordered chain of stages, not yet running.
///
/// Downstream output of stage *i* feeds stage *i+1*; upstream output feeds
/// stage *i-1*. The first stage's upstream output and the last stage's
/// downstream output go to the owning task.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self> {
        if stages.is_empty() {
            return Err(VoxError::EmptyPipeline);
        }
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Wires the chain and spawns one task per stage.
    pub(crate) fn launch(
        self,
        sink: mpsc::UnboundedSender<Routed>,
        observers: ObserverHub,
        cancelled: watch::Receiver<bool>,
    ) -> RunningPipeline {
        let task_link = Link {
            name: TASK_ENDPOINT.into(),
            data: sink.clone(),
            system: sink.clone(),
        };

        let mut links = Vec::with_capacity(self.stages.len());
        let mut inboxes = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let (data_tx, data_rx) = mpsc::unbounded_channel();
            let (system_tx, system_rx) = mpsc::unbounded_channel();
            links.push(Link {
                name: Arc::from(stage.name()),
                data: data_tx,
                system: system_tx,
            });
            inboxes.push(Inbox {
                data: data_rx,
                system: system_rx,
            });
        }

        let head = links[0].clone();
        let last = links.len() - 1;
        let mut tasks = JoinSet::new();

        for (i, (stage, inbox)) in self.stages.into_iter().zip(inboxes).enumerate() {
            let downstream = if i == last {
                task_link.clone()
            } else {
                links[i + 1].clone()
            };
            let upstream = if i == 0 {
                task_link.clone()
            } else {
                links[i - 1].clone()
            };
            let ctx = StageContext::new(
                stage.name(),
                downstream,
                upstream,
                sink.clone(),
                observers.clone(),
                cancelled.clone(),
            );
            tasks.spawn(run_stage(stage, ctx, inbox));
        }

        RunningPipeline {
            head,
            observers,
            tasks,
        }
    }
}

/// A pipeline whose stages are running.
pub(crate) struct RunningPipeline {
    head: Link,
    observers: ObserverHub,
    tasks: JoinSet<()>,
}

impl RunningPipeline {
    /// Queues a frame at the head of the chain, travelling downstream.
    pub(crate) fn push(&self, frame: Frame) -> bool {
        self.observers.notify(FramePushed {
            source: TASK_ENDPOINT.into(),
            destination: self.head.name.clone(),
            frame: frame.clone(),
            direction: Direction::Downstream,
            timestamp: Instant::now(),
        });
        self.head.send(Routed {
            frame,
            direction: Direction::Downstream,
        })
    }

    /// Waits for the next stage task to exit.
    pub(crate) async fn join_next(&mut self) -> Option<std::result::Result<(), JoinError>> {
        self.tasks.join_next().await
    }

    /// Aborts whatever is still running and waits for it.
    pub(crate) async fn shutdown(mut self) {
        self.tasks.abort_all();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!(error = %e, "stage panicked");
            }
        }
    }
}
