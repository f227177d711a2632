//! User-side context aggregation.

use crate::context::{Message, SharedContext};
use crate::frame::{Direction, Frame, FrameData};
use crate::pipeline::{Stage, StageContext, StageError};
use async_trait::async_trait;

/// Collects final transcripts for the current turn and commits them as one
/// user message when the turn ends, then requests a generation.
pub struct UserContextAggregator {
    context: SharedContext,
    fragments: Vec<String>,
}

impl UserContextAggregator {
    pub fn new(context: SharedContext) -> Self {
        Self {
            context,
            fragments: Vec::new(),
        }
    }

    fn request_generation(&self, ctx: &StageContext) {
        ctx.push_downstream(FrameData::LlmContext(self.context.snapshot()));
    }

    fn commit_turn(&mut self, ctx: &StageContext) {
        let text = join_fragments(&self.fragments);
        self.fragments.clear();
        if text.is_empty() {
            tracing::debug!("turn ended without transcript, nothing to commit");
            return;
        }

        tracing::info!(user = %text, "user turn committed");
        let message = Message::user(text);
        self.context.append(message.clone());
        ctx.push_downstream(FrameData::ContextUpdate(message));
        self.request_generation(ctx);
    }
}

/// Joins transcript fragments, inserting a space only where neither side
/// already has whitespace.
pub fn join_fragments(fragments: &[String]) -> String {
    let mut text = String::new();
    for fragment in fragments {
        let needs_space = !text.is_empty()
            && !text.ends_with(char::is_whitespace)
            && !fragment.starts_with(char::is_whitespace);
        if needs_space {
            text.push(' ');
        }
        text.push_str(fragment);
    }
    text.trim().to_string()
}

#[async_trait]
impl Stage for UserContextAggregator {
    fn name(&self) -> &str {
        "UserContextAggregator"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        if direction == Direction::Upstream {
            ctx.forward(frame, direction);
            return Ok(());
        }

        match frame.data() {
            FrameData::TranscriptFinal(transcript) => {
                if !transcript.text.trim().is_empty() {
                    self.fragments.push(transcript.text.clone());
                }
            }
            FrameData::TranscriptPartial(_) => {}
            FrameData::UserTurnEnded(_) => {
                ctx.forward(frame.clone(), direction);
                self.commit_turn(ctx);
            }
            FrameData::AppendMessages { messages, run_llm } => {
                for message in messages {
                    self.context.append(message.clone());
                    ctx.push_downstream(FrameData::ContextUpdate(message.clone()));
                }
                if *run_llm {
                    self.request_generation(ctx);
                }
            }
            FrameData::RunSignal => self.request_generation(ctx),
            _ => ctx.forward(frame, direction),
        }
        Ok(())
    }

    async fn cancel(&mut self, _ctx: &StageContext) {
        if !self.fragments.is_empty() {
            tracing::debug!(
                fragments = self.fragments.len(),
                "discarding uncommitted user transcript"
            );
        }
        self.fragments.clear();
    }
}
