//! Drives one stage on its own tokio task.

use crate::frame::{Direction, FrameData};
use crate::pipeline::error::StageError;
use crate::pipeline::stage::{Routed, Stage, StageContext};
use tokio::sync::mpsc;

/// Inboxes of one stage.
pub(crate) struct Inbox {
    pub(crate) data: mpsc::UnboundedReceiver<Routed>,
    pub(crate) system: mpsc::UnboundedReceiver<Routed>,
}

impl Inbox {
    /// Next message, system frames first.
    async fn next(&mut self) -> Option<Routed> {
        tokio::select! {
            biased;
            Some(routed) = self.system.recv() => Some(routed),
            Some(routed) = self.data.recv() => Some(routed),
            else => None,
        }
    }
}

/// Main processing loop for a stage.
///
/// Returns after the stage has seen `Cancel` or `End`, or when both inboxes
/// are closed.
pub(crate) async fn run_stage(mut stage: Box<dyn Stage>, ctx: StageContext, mut inbox: Inbox) {
    let name = stage.name().to_string();

    while let Some(Routed { frame, direction }) = inbox.next().await {
        match frame.data() {
            FrameData::Cancel(reason) => {
                tracing::debug!(stage = %name, %reason, "cancelling");
                stage.cancel(&ctx).await;
                ctx.forward(frame, direction);
                break;
            }
            _ if ctx.is_cancelled() => {
                tracing::trace!(stage = %name, frame = %frame, "dropped after cancellation");
            }
            FrameData::Start(params) => {
                let params = *params;
                ctx.forward(frame, direction);
                if let Err(e) = stage.start(&params, &ctx).await {
                    handle_error(&name, &ctx, e);
                }
            }
            FrameData::End if direction == Direction::Downstream => {
                if let Err(e) = stage.finish(&ctx).await {
                    handle_error(&name, &ctx, e);
                }
                ctx.forward(frame, direction);
                break;
            }
            _ => {
                let result = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        tracing::debug!(stage = %name, "in-flight processing abandoned");
                        continue;
                    }
                    result = stage.process(frame, direction, &ctx) => result,
                };
                if let Err(e) = result {
                    handle_error(&name, &ctx, e);
                }
            }
        }
    }

    tracing::trace!(stage = %name, "stage stopped");
}

fn handle_error(name: &str, ctx: &StageContext, error: StageError) {
    match &error {
        StageError::Recoverable(msg) => tracing::warn!(stage = %name, "{}", msg),
        StageError::Fatal(msg) => tracing::error!(stage = %name, "{}", msg),
    }
    ctx.report_error(&error);
}
