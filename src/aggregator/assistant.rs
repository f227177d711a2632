//! Assistant-side context aggregation.

use crate::context::{Message, SharedContext};
use crate::frame::{Direction, Frame, FrameData};
use crate::pipeline::{Stage, StageContext, StageError};
use async_trait::async_trait;

/// Accumulates streamed LLM text and commits the full assistant message
/// once the LLM signals the end of its response.
pub struct AssistantContextAggregator {
    context: SharedContext,
    response: Option<String>,
}

impl AssistantContextAggregator {
    pub fn new(context: SharedContext) -> Self {
        Self {
            context,
            response: None,
        }
    }

    fn commit(&mut self, ctx: &StageContext) {
        let Some(text) = self.response.take() else {
            tracing::warn!("response end without response start");
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        tracing::info!(assistant = %text, "assistant response committed");
        let message = Message::assistant(text);
        self.context.append(message.clone());
        ctx.push_downstream(FrameData::ContextUpdate(message));
    }
}

#[async_trait]
impl Stage for AssistantContextAggregator {
    fn name(&self) -> &str {
        "AssistantContextAggregator"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        if direction == Direction::Downstream {
            match frame.data() {
                FrameData::LlmResponseStart => {
                    if self.response.is_some() {
                        tracing::warn!("new response started before the previous one ended");
                    }
                    self.response = Some(String::new());
                }
                FrameData::LlmText(text) => {
                    self.response.get_or_insert_with(String::new).push_str(text);
                }
                FrameData::LlmResponseEnd => {
                    ctx.forward(frame, direction);
                    self.commit(ctx);
                    return Ok(());
                }
                _ => {}
            }
        }
        ctx.forward(frame, direction);
        Ok(())
    }

    async fn cancel(&mut self, _ctx: &StageContext) {
        if self.response.take().is_some() {
            tracing::debug!("discarding unfinished assistant response");
        }
    }
}
