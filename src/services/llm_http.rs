//! Streaming client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Both Cerebras and Google (through its OpenAI compatibility layer) speak
//! this protocol, so one client covers every configured provider.

use crate::config::{LlmSelection, ResolvedProvider};
use crate::context::{ContextSnapshot, Message};
use crate::error::{Result, VoxError};
use crate::frame::TokenUsage;
use crate::services::llm::{LlmChunk, LlmService, LlmStream};
use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize, Debug)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize, Debug)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize, Debug)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Debug, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChunkUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Splits a server-sent-events byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line arrives, so a UTF-8 character split
/// across network chunks is decoded whole.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes, returning every complete `data:` payload.
    ///
    /// Payloads after the `[DONE]` sentinel are ignored.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=end).collect();
            if self.done {
                continue;
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
            } else if !data.is_empty() {
                payloads.push(data.to_string());
            }
        }
        payloads
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Turns one `data:` payload into stream items.
fn parse_payload(payload: &str) -> Result<Vec<LlmChunk>> {
    let chunk: ChatChunk = serde_json::from_str(payload)
        .map_err(|e| VoxError::Other(format!("malformed completion chunk: {e}")))?;
    let mut items: Vec<LlmChunk> = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .filter(|text| !text.is_empty())
        .map(LlmChunk::Text)
        .collect();
    if let Some(usage) = chunk.usage {
        items.push(LlmChunk::Usage(TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }));
    }
    Ok(items)
}

/// An OpenAI-compatible chat-completion provider.
#[derive(Clone)]
pub struct OpenAiCompatibleLlm {
    name: String,
    model: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl fmt::Debug for OpenAiCompatibleLlm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatibleLlm")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl OpenAiCompatibleLlm {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl From<&ResolvedProvider> for OpenAiCompatibleLlm {
    fn from(provider: &ResolvedProvider) -> Self {
        Self::new(
            provider.name.clone(),
            &provider.base_url,
            provider.model.clone(),
            provider.api_key.clone(),
        )
    }
}

/// Builds one client per selected provider, primary first.
pub fn services_from_selection(selection: &LlmSelection) -> Vec<Arc<dyn LlmService>> {
    selection
        .providers()
        .map(|p| Arc::new(OpenAiCompatibleLlm::from(p)) as Arc<dyn LlmService>)
        .collect()
}

struct StreamState<S> {
    body: S,
    decoder: SseDecoder,
    queued: VecDeque<Result<LlmChunk>>,
    service: String,
}

/// Decodes an SSE response body into LLM chunks.
///
/// A body that ends or fails before `[DONE]` yields a final
/// `ServiceUnavailable`, so a truncated reply is never mistaken for a
/// complete one.
fn completion_stream<S, B, E>(body: S, service: String) -> LlmStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: fmt::Display + Send,
{
    let state = StreamState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        queued: VecDeque::new(),
        service,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queued.pop_front() {
                return Some((item, state));
            }
            if state.decoder.is_done() {
                return None;
            }
            let message = match state.body.next().await {
                Some(Ok(bytes)) => {
                    for payload in state.decoder.push(bytes.as_ref()) {
                        match parse_payload(&payload) {
                            Ok(items) => state.queued.extend(items.into_iter().map(Ok)),
                            Err(e) => state.queued.push_back(Err(e)),
                        }
                    }
                    continue;
                }
                Some(Err(e)) => format!("stream interrupted: {e}"),
                None => "stream ended before [DONE]".to_string(),
            };
            state.decoder.done = true;
            return Some((Err(VoxError::unavailable(&state.service, message)), state));
        }
    })
    .boxed()
}

#[async_trait]
impl LlmService for OpenAiCompatibleLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, context: &ContextSnapshot) -> Result<LlmStream> {
        let request = ChatRequest {
            model: &self.model,
            messages: context.messages(),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };
        tracing::debug!(endpoint = %self.endpoint, model = %self.model, messages = context.len(), "sending chat completion request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoxError::unavailable(&self.name, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VoxError::unavailable(
                &self.name,
                format!("HTTP {status}: {error_text}"),
            ));
        }

        Ok(completion_stream(response.bytes_stream(), self.name.clone()))
    }
}
