//! Turn detector: decides when the user has finished speaking.
//!
//! The energy VAD proposes a candidate turn end after `stop_secs` of
//! silence. Without an analyzer that candidate is the decision. With one,
//! the analyzer is asked (bounded by a timeout) whether the utterance is
//! complete: a confident "yes" ends the turn right away, otherwise the
//! detector waits for speech to resume or for the trailing silence to reach
//! `max_silence_secs`. Analyzer failures fall back to the VAD decision.

use crate::config::TurnConfig;
use crate::defaults;
use crate::error::VoxError;
use crate::frame::{AudioChunk, TurnEnd, TurnEndReason, samples_to_ms};
use crate::turn::analyzer::TurnAnalyzer;
use crate::turn::vad::{Vad, VadEvent, VadParams, rescale_samples, secs_to_ms, secs_to_samples};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Turn-taking policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnParams {
    pub vad: VadParams,
    /// Upper bound on trailing silence while the analyzer says "incomplete".
    pub max_silence_secs: f32,
    /// Analyzer probability at or above which the turn ends.
    pub completion_threshold: f32,
    pub analyzer_timeout: Duration,
    /// Most utterance audio kept for the analyzer (seconds).
    pub max_analysis_secs: f32,
}

impl Default for TurnParams {
    fn default() -> Self {
        Self {
            vad: VadParams::default(),
            max_silence_secs: defaults::MAX_SILENCE_SECS,
            completion_threshold: defaults::COMPLETION_THRESHOLD,
            analyzer_timeout: Duration::from_millis(defaults::ANALYZER_TIMEOUT_MS),
            max_analysis_secs: defaults::ANALYZER_MAX_AUDIO_SECS,
        }
    }
}

impl TurnParams {
    /// Maximum trailing silence, never shorter than the VAD stop window.
    pub fn max_silence_ms(&self) -> u32 {
        secs_to_ms(self.max_silence_secs).max(self.vad.stop_ms())
    }

    /// [`max_silence_ms`](Self::max_silence_ms) as a sample count.
    pub fn max_silence_samples(&self, sample_rate: u32) -> u64 {
        secs_to_samples(self.max_silence_secs, sample_rate).max(self.vad.stop_samples(sample_rate))
    }
}

impl From<&TurnConfig> for TurnParams {
    fn from(config: &TurnConfig) -> Self {
        Self {
            vad: VadParams {
                threshold: config.vad_threshold,
                start_secs: config.start_secs,
                stop_secs: config.stop_secs,
            },
            max_silence_secs: config.max_silence_secs,
            completion_threshold: config.completion_threshold,
            analyzer_timeout: Duration::from_millis(config.analyzer_timeout_ms),
            max_analysis_secs: defaults::ANALYZER_MAX_AUDIO_SECS,
        }
    }
}

/// Per-session turn-taking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Waiting for the user to speak.
    Idle,
    /// The user is speaking.
    Listening,
    /// The user paused and the analyzer judged the utterance incomplete.
    Finalizing,
}

/// Decisions emitted by the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TurnEvent {
    UserStartedSpeaking,
    UserStoppedSpeaking,
    TurnEnded(TurnEnd),
}

pub struct TurnDetector {
    params: TurnParams,
    vad: Vad,
    analyzer: Option<Arc<dyn TurnAnalyzer>>,
    state: TurnState,
    audio: VecDeque<i16>,
    sample_rate: u32,
    trailing_silence: u64,
    last_probability: Option<f32>,
}

impl TurnDetector {
    pub fn new(params: TurnParams, analyzer: Option<Arc<dyn TurnAnalyzer>>) -> Self {
        Self {
            params,
            vad: Vad::new(params.vad),
            analyzer,
            state: TurnState::Idle,
            audio: VecDeque::new(),
            sample_rate: defaults::AUDIO_IN_SAMPLE_RATE,
            trailing_silence: 0,
            last_probability: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn params(&self) -> &TurnParams {
        &self.params
    }

    /// Feeds one chunk of inbound audio and returns the resulting decisions.
    pub async fn push_audio(&mut self, chunk: &AudioChunk) -> Vec<TurnEvent> {
        let result = self.vad.process(&chunk.samples, chunk.sample_rate);
        self.buffer(chunk);

        match self.state {
            TurnState::Idle => {
                if result.event == VadEvent::SpeechStart {
                    self.state = TurnState::Listening;
                    vec![TurnEvent::UserStartedSpeaking]
                } else {
                    Vec::new()
                }
            }
            TurnState::Listening => {
                if result.event == VadEvent::SpeechEnd {
                    self.trailing_silence = result.silence_samples;
                    let mut events = vec![TurnEvent::UserStoppedSpeaking];
                    events.extend(self.decide().await);
                    events
                } else {
                    Vec::new()
                }
            }
            TurnState::Finalizing => {
                if result.event == VadEvent::SpeechStart {
                    tracing::debug!("speech resumed before turn end");
                    self.state = TurnState::Listening;
                    self.trailing_silence = 0;
                    return vec![TurnEvent::UserStartedSpeaking];
                }
                if !result.is_speech {
                    self.trailing_silence += chunk.samples.len() as u64;
                }
                if self.trailing_silence >= self.params.max_silence_samples(self.sample_rate) {
                    vec![self.end(TurnEndReason::MaxSilence)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Returns to `Idle`, dropping any partial utterance.
    pub fn reset(&mut self) {
        self.vad.reset();
        self.state = TurnState::Idle;
        self.audio.clear();
        self.trailing_silence = 0;
        self.last_probability = None;
    }

    async fn decide(&mut self) -> Vec<TurnEvent> {
        let Some(analyzer) = self.analyzer.clone() else {
            return vec![self.end(TurnEndReason::Silence)];
        };
        if self.trailing_silence >= self.params.max_silence_samples(self.sample_rate) {
            return vec![self.end(TurnEndReason::MaxSilence)];
        }

        let audio: Vec<i16> = self.audio.iter().copied().collect();
        let timeout = self.params.analyzer_timeout;
        match tokio::time::timeout(timeout, analyzer.analyze(&audio, self.sample_rate)).await {
            Ok(Ok(prediction)) => {
                self.last_probability = Some(prediction.probability);
                if prediction.is_complete(self.params.completion_threshold) {
                    vec![self.end(TurnEndReason::Semantic)]
                } else {
                    tracing::debug!(
                        probability = prediction.probability,
                        "utterance judged incomplete, waiting"
                    );
                    self.state = TurnState::Finalizing;
                    Vec::new()
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(analyzer = analyzer.name(), error = %e, "turn analyzer failed, using silence");
                vec![self.end(TurnEndReason::AnalyzerFallback)]
            }
            Err(_) => {
                let e = VoxError::TurnDetectionTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                tracing::warn!(analyzer = analyzer.name(), "{}, using silence", e);
                vec![self.end(TurnEndReason::AnalyzerFallback)]
            }
        }
    }

    fn end(&mut self, reason: TurnEndReason) -> TurnEvent {
        let turn_end = TurnEnd {
            reason,
            probability: self.last_probability.take(),
            silence_ms: samples_to_ms(self.trailing_silence as usize, self.sample_rate),
        };
        tracing::debug!(?reason, silence_ms = turn_end.silence_ms, "user turn ended");
        self.state = TurnState::Idle;
        self.audio.clear();
        self.trailing_silence = 0;
        TurnEvent::TurnEnded(turn_end)
    }

    fn buffer(&mut self, chunk: &AudioChunk) {
        if chunk.sample_rate != self.sample_rate {
            self.trailing_silence =
                rescale_samples(self.trailing_silence, self.sample_rate, chunk.sample_rate);
            self.sample_rate = chunk.sample_rate;
            self.audio.clear();
        }
        self.audio.extend(chunk.samples.iter().copied());

        // While idle keep only enough to cover the speech onset.
        let cap_secs = match self.state {
            TurnState::Idle => self.params.vad.start_secs + 0.1,
            _ => self.params.max_analysis_secs,
        };
        let cap = (cap_secs.max(0.0) * self.sample_rate as f32) as usize;
        if self.audio.len() > cap {
            let excess = self.audio.len() - cap;
            self.audio.drain(..excess);
        }
    }
}
