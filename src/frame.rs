//! Frames: the immutable units of data that flow through a pipeline.
//!
//! A [`Frame`] wraps a [`FrameData`] payload together with the name of the
//! stage that produced it, a per-producer sequence number and a creation
//! timestamp. Payloads sit behind an `Arc`, so cloning a frame (for observers
//! or fan-out) never copies audio or text.

use crate::context::{ContextSnapshot, Message};
use crate::services::tts::TtsSettingsUpdate;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Direction a frame travels through the stage chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From transport input towards transport output.
    Downstream,
    /// From transport output back towards transport input.
    Upstream,
}

/// Session parameters announced by the `Start` frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartParams {
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
}

/// Why a pipeline is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit `cancel()` call (e.g. client disconnected).
    Requested,
    /// No activity for the configured idle timeout.
    IdleTimeout,
    /// Process interrupt (SIGINT/SIGTERM) forwarded by the runner.
    Signal,
    /// A fatal stage error; the pipeline is torn down before reporting Failed.
    Failure,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::Requested => "requested",
            CancelReason::IdleTimeout => "idle timeout",
            CancelReason::Signal => "signal",
            CancelReason::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// A failure reported by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorFrame {
    pub stage: String,
    pub message: String,
    pub fatal: bool,
}

/// A chunk of mono 16-bit PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Transport-assigned sequence number, used to detect reordering.
    pub seq: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32, seq: u64) -> Self {
        Self {
            samples,
            sample_rate,
            seq,
        }
    }

    /// Duration of this chunk in milliseconds.
    pub fn duration_ms(&self) -> u32 {
        samples_to_ms(self.samples.len(), self.sample_rate)
    }
}

/// Converts a sample count to milliseconds at the given rate.
pub fn samples_to_ms(samples: usize, sample_rate: u32) -> u32 {
    if sample_rate == 0 {
        return 0;
    }
    ((samples as u64 * 1000) / sample_rate as u64) as u32
}

/// A transcript fragment from speech-to-text.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub language: Option<String>,
}

impl Transcript {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            language: None,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            language: None,
        }
    }
}

/// What ended a user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEndReason {
    /// Trailing silence reached the VAD stop window and no analyzer is configured.
    Silence,
    /// The semantic analyzer judged the utterance complete.
    Semantic,
    /// Trailing silence reached the maximum bound.
    MaxSilence,
    /// The analyzer failed or timed out; fixed-silence decision used instead.
    AnalyzerFallback,
    /// The client typed a message instead of speaking.
    Text,
}

/// Payload of a `UserTurnEnded` frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnEnd {
    pub reason: TurnEndReason,
    /// Analyzer completion probability, if one was consulted.
    pub probability: Option<f32>,
    /// Trailing silence observed when the decision was made.
    pub silence_ms: u32,
}

/// Token accounting reported by an LLM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Metrics carried by `ControlMeta` frames.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsData {
    /// Time to first byte/token.
    Ttfb { processor: String, value: Duration },
    /// Total processing time for one request.
    Processing { processor: String, value: Duration },
    /// LLM token usage.
    LlmUsage {
        processor: String,
        model: String,
        usage: TokenUsage,
    },
    /// Characters sent to TTS.
    TtsUsage { processor: String, characters: usize },
}

/// Frame payloads.
#[derive(Debug, Clone)]
pub enum FrameData {
    Start(StartParams),
    End,
    Cancel(CancelReason),
    Error(ErrorFrame),
    InputAudio(AudioChunk),
    UserStartedSpeaking,
    UserStoppedSpeaking,
    UserTurnEnded(TurnEnd),
    TranscriptPartial(Transcript),
    TranscriptFinal(Transcript),
    /// Append complete messages to the context, optionally running the LLM.
    AppendMessages {
        messages: Vec<Message>,
        run_llm: bool,
    },
    /// Run the LLM on the current context.
    RunSignal,
    /// Generation request carrying the context to generate from.
    LlmContext(ContextSnapshot),
    LlmResponseStart,
    LlmText(String),
    LlmResponseEnd,
    /// A message was committed to the conversation context.
    ContextUpdate(Message),
    /// Speak this text verbatim, bypassing the LLM.
    TtsSpeak(String),
    TtsStarted,
    TtsAudio(AudioChunk),
    TtsStopped,
    TtsUpdateSettings(TtsSettingsUpdate),
    ControlMeta(MetricsData),
}

/// Payload-free frame tag, used for filtering and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameKind {
    Start,
    End,
    Cancel,
    Error,
    InputAudio,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    UserTurnEnded,
    TranscriptPartial,
    TranscriptFinal,
    AppendMessages,
    RunSignal,
    LlmContext,
    LlmResponseStart,
    LlmText,
    LlmResponseEnd,
    ContextUpdate,
    TtsSpeak,
    TtsStarted,
    TtsAudio,
    TtsStopped,
    TtsUpdateSettings,
    ControlMeta,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Start => "Start",
            FrameKind::End => "End",
            FrameKind::Cancel => "Cancel",
            FrameKind::Error => "Error",
            FrameKind::InputAudio => "InputAudio",
            FrameKind::UserStartedSpeaking => "UserStartedSpeaking",
            FrameKind::UserStoppedSpeaking => "UserStoppedSpeaking",
            FrameKind::UserTurnEnded => "UserTurnEnded",
            FrameKind::TranscriptPartial => "TranscriptPartial",
            FrameKind::TranscriptFinal => "TranscriptFinal",
            FrameKind::AppendMessages => "AppendMessages",
            FrameKind::RunSignal => "RunSignal",
            FrameKind::LlmContext => "LlmContext",
            FrameKind::LlmResponseStart => "LlmResponseStart",
            FrameKind::LlmText => "LlmText",
            FrameKind::LlmResponseEnd => "LlmResponseEnd",
            FrameKind::ContextUpdate => "ContextUpdate",
            FrameKind::TtsSpeak => "TtsSpeak",
            FrameKind::TtsStarted => "TtsStarted",
            FrameKind::TtsAudio => "TtsAudio",
            FrameKind::TtsStopped => "TtsStopped",
            FrameKind::TtsUpdateSettings => "TtsUpdateSettings",
            FrameKind::ControlMeta => "ControlMeta",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FrameData {
    pub fn kind(&self) -> FrameKind {
        match self {
            FrameData::Start(_) => FrameKind::Start,
            FrameData::End => FrameKind::End,
            FrameData::Cancel(_) => FrameKind::Cancel,
            FrameData::Error(_) => FrameKind::Error,
            FrameData::InputAudio(_) => FrameKind::InputAudio,
            FrameData::UserStartedSpeaking => FrameKind::UserStartedSpeaking,
            FrameData::UserStoppedSpeaking => FrameKind::UserStoppedSpeaking,
            FrameData::UserTurnEnded(_) => FrameKind::UserTurnEnded,
            FrameData::TranscriptPartial(_) => FrameKind::TranscriptPartial,
            FrameData::TranscriptFinal(_) => FrameKind::TranscriptFinal,
            FrameData::AppendMessages { .. } => FrameKind::AppendMessages,
            FrameData::RunSignal => FrameKind::RunSignal,
            FrameData::LlmContext(_) => FrameKind::LlmContext,
            FrameData::LlmResponseStart => FrameKind::LlmResponseStart,
            FrameData::LlmText(_) => FrameKind::LlmText,
            FrameData::LlmResponseEnd => FrameKind::LlmResponseEnd,
            FrameData::ContextUpdate(_) => FrameKind::ContextUpdate,
            FrameData::TtsSpeak(_) => FrameKind::TtsSpeak,
            FrameData::TtsStarted => FrameKind::TtsStarted,
            FrameData::TtsAudio(_) => FrameKind::TtsAudio,
            FrameData::TtsStopped => FrameKind::TtsStopped,
            FrameData::TtsUpdateSettings(_) => FrameKind::TtsUpdateSettings,
            FrameData::ControlMeta(_) => FrameKind::ControlMeta,
        }
    }
}

/// An immutable frame. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Frame {
    sequence: u64,
    producer: Arc<str>,
    timestamp: Instant,
    data: Arc<FrameData>,
}

impl Frame {
    /// Creates a frame. Prefer [`FrameSource::frame`], which assigns sequence ids.
    pub fn new(producer: Arc<str>, sequence: u64, data: FrameData) -> Self {
        Self {
            sequence,
            producer,
            timestamp: Instant::now(),
            data: Arc::new(data),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn data(&self) -> &FrameData {
        &self.data
    }

    pub fn kind(&self) -> FrameKind {
        self.data.kind()
    }

    /// System frames jump ahead of queued data frames.
    pub fn is_system(&self) -> bool {
        matches!(self.kind(), FrameKind::Cancel | FrameKind::Error)
    }

    /// Frames that count as session activity for the idle timeout.
    pub fn is_activity(&self) -> bool {
        matches!(
            self.kind(),
            FrameKind::UserStartedSpeaking
                | FrameKind::UserStoppedSpeaking
                | FrameKind::UserTurnEnded
                | FrameKind::TranscriptPartial
                | FrameKind::TranscriptFinal
                | FrameKind::AppendMessages
                | FrameKind::RunSignal
                | FrameKind::LlmContext
                | FrameKind::LlmResponseStart
                | FrameKind::LlmText
                | FrameKind::LlmResponseEnd
                | FrameKind::ContextUpdate
                | FrameKind::TtsSpeak
                | FrameKind::TtsStarted
                | FrameKind::TtsAudio
                | FrameKind::TtsStopped
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}({})", self.producer, self.sequence, self.kind())
    }
}

/// Named frame producer with a strictly increasing sequence counter.
///
/// Shared (behind `Arc`) by everything that emits frames on behalf of one
/// stage, so sequence ids stay monotonic even when a stage pushes from a
/// helper task.
#[derive(Debug)]
pub struct FrameSource {
    name: Arc<str>,
    next: AtomicU64,
}

impl FrameSource {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn frame(&self, data: FrameData) -> Frame {
        let sequence = self.next.fetch_add(1, Ordering::Relaxed);
        Frame::new(self.name.clone(), sequence, data)
    }
}
