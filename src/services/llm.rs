//! LLM service contract and the generation stage.

use crate::context::ContextSnapshot;
use crate::error::{Result, VoxError};
use crate::frame::{Direction, Frame, FrameData, MetricsData, StartParams, TokenUsage};
use crate::pipeline::{Stage, StageContext, StageError};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One item of a streamed generation.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmChunk {
    Text(String),
    Usage(TokenUsage),
}

pub type LlmStream = BoxStream<'static, Result<LlmChunk>>;

/// A chat-completion provider.
#[async_trait]
pub trait LlmService: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Starts a streamed generation over the given context.
    async fn generate(&self, context: &ContextSnapshot) -> Result<LlmStream>;
}

/// Generates a response for every `LlmContext` frame.
///
/// Providers are tried in order; a provider that fails before producing any
/// text hands over to the next one. When every provider fails the stage
/// reports a fatal `ServiceUnavailable` error.
pub struct LlmStage {
    providers: Vec<Arc<dyn LlmService>>,
    enable_metrics: bool,
    enable_usage_metrics: bool,
}

impl LlmStage {
    pub fn new(providers: Vec<Arc<dyn LlmService>>) -> Self {
        Self {
            providers,
            enable_metrics: false,
            enable_usage_metrics: false,
        }
    }

    async fn generate(
        &self,
        snapshot: &ContextSnapshot,
        ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        let mut failures = Vec::new();

        for provider in &self.providers {
            match self.run_provider(provider.as_ref(), snapshot, ctx).await {
                Ok(()) => return Ok(()),
                Err(Attempt::BeforeOutput(e)) => {
                    tracing::warn!(provider = provider.name(), error = %e, "llm provider failed, trying next");
                    failures.push(format!("{}: {}", provider.name(), e));
                }
                Err(Attempt::MidStream(e)) => {
                    return Err(VoxError::unavailable(provider.name(), e.to_string()).into());
                }
            }
        }

        Err(VoxError::unavailable("llm", failures.join("; ")).into())
    }

    async fn run_provider(
        &self,
        provider: &dyn LlmService,
        snapshot: &ContextSnapshot,
        ctx: &StageContext,
    ) -> std::result::Result<(), Attempt> {
        let started = Instant::now();
        let mut stream = provider
            .generate(snapshot)
            .await
            .map_err(Attempt::BeforeOutput)?;
        let mut responding = false;

        while let Some(item) = stream.next().await {
            match item {
                Ok(LlmChunk::Text(text)) => {
                    if !responding {
                        responding = true;
                        ctx.push_downstream(FrameData::LlmResponseStart);
                        if self.enable_metrics {
                            ctx.push_downstream(FrameData::ControlMeta(MetricsData::Ttfb {
                                processor: provider.name().to_string(),
                                value: started.elapsed(),
                            }));
                        }
                    }
                    if !text.is_empty() {
                        ctx.push_downstream(FrameData::LlmText(text));
                    }
                }
                Ok(LlmChunk::Usage(usage)) => {
                    if self.enable_usage_metrics {
                        ctx.push_downstream(FrameData::ControlMeta(MetricsData::LlmUsage {
                            processor: provider.name().to_string(),
                            model: provider.model().to_string(),
                            usage,
                        }));
                    }
                }
                Err(e) if responding => return Err(Attempt::MidStream(e)),
                Err(e) => return Err(Attempt::BeforeOutput(e)),
            }
        }

        if !responding {
            ctx.push_downstream(FrameData::LlmResponseStart);
        }
        ctx.push_downstream(FrameData::LlmResponseEnd);
        if self.enable_metrics {
            ctx.push_downstream(FrameData::ControlMeta(MetricsData::Processing {
                processor: provider.name().to_string(),
                value: started.elapsed(),
            }));
        }
        Ok(())
    }
}

enum Attempt {
    BeforeOutput(VoxError),
    MidStream(VoxError),
}

#[async_trait]
impl Stage for LlmStage {
    fn name(&self) -> &str {
        "Llm"
    }

    async fn start(
        &mut self,
        params: &StartParams,
        _ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        self.enable_metrics = params.enable_metrics;
        self.enable_usage_metrics = params.enable_usage_metrics;
        Ok(())
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        match frame.data() {
            FrameData::LlmContext(snapshot) if direction == Direction::Downstream => {
                tracing::debug!(messages = snapshot.len(), "generating response");
                self.generate(snapshot, ctx).await
            }
            _ => {
                ctx.forward(frame, direction);
                Ok(())
            }
        }
    }
}

/// One scripted LLM reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Streams these fragments, then usage.
    Text(Vec<String>),
    /// Fails before producing output.
    Unavailable(String),
}

#[derive(Debug, Default)]
struct ScriptedState {
    replies: VecDeque<ScriptedReply>,
    contexts: Vec<ContextSnapshot>,
}

/// LLM that replays scripted replies (for testing).
///
/// The last reply repeats once the script is exhausted.
#[derive(Debug, Clone)]
pub struct ScriptedLlm {
    name: String,
    state: Arc<Mutex<ScriptedState>>,
    last: Arc<Mutex<Option<ScriptedReply>>>,
    chunk_delay: Duration,
}

impl ScriptedLlm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(ScriptedState::default())),
            last: Arc::new(Mutex::new(None)),
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_reply(self, fragments: &[&str]) -> Self {
        self.push(ScriptedReply::Text(
            fragments.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }

    pub fn unavailable(name: impl Into<String>) -> Self {
        let llm = Self::new(name);
        llm.push(ScriptedReply::Unavailable("503 Service Unavailable".into()));
        llm
    }

    /// Sleeps before every streamed fragment.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Contexts received so far.
    pub fn contexts(&self) -> Vec<ContextSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contexts
            .clone()
    }

    fn push(&self, reply: ScriptedReply) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replies
            .push_back(reply);
    }

    fn next_reply(&self, context: &ContextSnapshot) -> Option<ScriptedReply> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.contexts.push(context.clone());
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reply) = state.replies.pop_front() {
            *last = Some(reply);
        }
        last.clone()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, context: &ContextSnapshot) -> Result<LlmStream> {
        let fragments = match self.next_reply(context) {
            Some(ScriptedReply::Text(fragments)) => fragments,
            Some(ScriptedReply::Unavailable(message)) => {
                return Err(VoxError::unavailable(self.name.clone(), message));
            }
            None => vec!["OK".to_string()],
        };

        let completion_tokens = fragments.len() as u64;
        let prompt_tokens = context.len() as u64;
        let delay = self.chunk_delay;
        let text = stream::iter(fragments).then(move |fragment| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, VoxError>(LlmChunk::Text(fragment))
        });
        let usage = stream::once(async move {
            Ok::<_, VoxError>(LlmChunk::Usage(TokenUsage {
                prompt_tokens,
                completion_tokens,
            }))
        });
        Ok(text.chain(usage).boxed())
    }
}
