//! Text-to-speech service contract and the synthesis stage.

use crate::config::TtsConfig;
use crate::error::{Result, VoxError};
use crate::frame::{AudioChunk, Direction, Frame, FrameData, MetricsData, StartParams};
use crate::pipeline::{Stage, StageContext, StageError};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Voice, model and sampling parameters used for synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsSettings {
    pub voice_id: String,
    pub model: String,
    pub sampling_params: BTreeMap<String, serde_json::Value>,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
}

impl From<&TtsConfig> for TtsSettings {
    fn from(config: &TtsConfig) -> Self {
        Self {
            voice_id: config.voice_id.clone(),
            model: config.model.clone(),
            sampling_params: config.sampling_params.clone(),
            sample_rate: crate::defaults::AUDIO_OUT_SAMPLE_RATE,
        }
    }
}

impl TtsSettings {
    /// Applies a partial update. A `null` sampling value removes the key.
    pub fn apply(&mut self, update: &TtsSettingsUpdate) {
        if let Some(voice_id) = &update.voice_id {
            self.voice_id = voice_id.clone();
        }
        if let Some(model) = &update.model {
            self.model = model.clone();
        }
        for (key, value) in &update.sampling_params {
            if value.is_null() {
                self.sampling_params.remove(key);
            } else {
                self.sampling_params.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Mid-session change to [`TtsSettings`]; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TtsSettingsUpdate {
    pub voice_id: Option<String>,
    pub model: Option<String>,
    pub sampling_params: BTreeMap<String, serde_json::Value>,
}

pub type TtsStream = BoxStream<'static, Result<AudioChunk>>;

/// A text-to-speech provider.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &str;

    /// Synthesizes `text`, streaming audio chunks back.
    async fn synthesize(&self, text: &str, settings: &TtsSettings) -> Result<TtsStream>;
}

/// Splits streamed LLM text into sentences and synthesizes each one.
///
/// LLM text frames are forwarded after their audio so that downstream
/// consumers see speech and text in the same order the user hears them.
pub struct TtsStage {
    service: Arc<dyn TextToSpeech>,
    settings: TtsSettings,
    pending: String,
    speaking: bool,
    enable_metrics: bool,
    enable_usage_metrics: bool,
}

impl TtsStage {
    pub fn new(service: Arc<dyn TextToSpeech>, settings: TtsSettings) -> Self {
        Self {
            service,
            settings,
            pending: String::new(),
            speaking: false,
            enable_metrics: false,
            enable_usage_metrics: false,
        }
    }

    pub fn settings(&self) -> &TtsSettings {
        &self.settings
    }

    async fn speak(&mut self, text: &str, ctx: &StageContext) -> std::result::Result<(), StageError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        if !self.speaking {
            self.speaking = true;
            ctx.push_downstream(FrameData::TtsStarted);
        }

        tracing::debug!(tts = self.service.name(), voice = %self.settings.voice_id, text, "synthesizing");
        let started = Instant::now();
        let mut audio = self
            .service
            .synthesize(text, &self.settings)
            .await
            .map_err(|e| unavailable(self.service.name(), e))?;

        let mut first = true;
        while let Some(chunk) = audio.next().await {
            let chunk = chunk.map_err(|e| unavailable(self.service.name(), e))?;
            if first {
                first = false;
                if self.enable_metrics {
                    ctx.push_downstream(FrameData::ControlMeta(MetricsData::Ttfb {
                        processor: self.service.name().to_string(),
                        value: started.elapsed(),
                    }));
                }
            }
            ctx.push_downstream(FrameData::TtsAudio(chunk));
        }

        if self.enable_usage_metrics {
            ctx.push_downstream(FrameData::ControlMeta(MetricsData::TtsUsage {
                processor: self.service.name().to_string(),
                characters: text.chars().count(),
            }));
        }
        Ok(())
    }

    async fn flush(&mut self, ctx: &StageContext) -> std::result::Result<(), StageError> {
        let rest = std::mem::take(&mut self.pending);
        self.speak(&rest, ctx).await?;
        if self.speaking {
            self.speaking = false;
            ctx.push_downstream(FrameData::TtsStopped);
        }
        Ok(())
    }
}

fn unavailable(service: &str, error: VoxError) -> StageError {
    match error {
        VoxError::ServiceUnavailable { .. } => error.into(),
        other => VoxError::unavailable(service, other.to_string()).into(),
    }
}

/// Splits off every complete sentence at the front of `buffer`.
///
/// A sentence ends at `.`, `!`, `?` or `…` followed by whitespace; a
/// terminator at the very end of the buffer waits for more text.
pub fn take_sentences(buffer: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    loop {
        let mut cut = None;
        let mut chars = buffer.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if matches!(c, '.' | '!' | '?' | '…')
                && let Some(&(next_i, next)) = chars.peek()
                && next.is_whitespace()
            {
                cut = Some(next_i);
                break;
            }
        }
        let Some(cut) = cut else { break };
        let sentence: String = buffer.drain(..cut).collect();
        sentences.push(sentence.trim().to_string());
    }
    sentences
}

#[async_trait]
impl Stage for TtsStage {
    fn name(&self) -> &str {
        "TextToSpeech"
    }

    async fn start(
        &mut self,
        params: &StartParams,
        _ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        self.settings.sample_rate = params.audio_out_sample_rate;
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
        if direction == Direction::Upstream {
            ctx.forward(frame, direction);
            return Ok(());
        }

        match frame.data() {
            FrameData::LlmText(text) => {
                self.pending.push_str(text);
                for sentence in take_sentences(&mut self.pending) {
                    self.speak(&sentence, ctx).await?;
                }
                ctx.forward(frame, direction);
            }
            FrameData::LlmResponseEnd => {
                self.flush(ctx).await?;
                ctx.forward(frame, direction);
            }
            FrameData::TtsSpeak(text) => {
                let text = text.clone();
                self.speak(&text, ctx).await?;
                self.flush(ctx).await?;
            }
            FrameData::TtsUpdateSettings(update) => {
                self.settings.apply(update);
                tracing::info!(
                    voice = %self.settings.voice_id,
                    model = %self.settings.model,
                    "tts settings updated"
                );
            }
            _ => ctx.forward(frame, direction),
        }
        Ok(())
    }

    async fn finish(&mut self, ctx: &StageContext) -> std::result::Result<(), StageError> {
        self.flush(ctx).await
    }

    async fn cancel(&mut self, _ctx: &StageContext) {
        self.pending.clear();
        self.speaking = false;
    }
}

/// A synthesis request seen by [`MockTextToSpeech`].
#[derive(Debug, Clone, PartialEq)]
pub struct TtsCall {
    pub text: String,
    pub settings: TtsSettings,
}

/// Text-to-speech that records requests and returns silence (for testing).
///
/// Produces one 20ms chunk of silence per ten characters of text.
#[derive(Debug, Clone, Default)]
pub struct MockTextToSpeech {
    calls: Arc<Mutex<Vec<TtsCall>>>,
    fail: bool,
}

impl MockTextToSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<TtsCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TextToSpeech for MockTextToSpeech {
    fn name(&self) -> &str {
        "mock-tts"
    }

    async fn synthesize(&self, text: &str, settings: &TtsSettings) -> Result<TtsStream> {
        if self.fail {
            return Err(VoxError::unavailable("mock-tts", "voice service offline"));
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TtsCall {
                text: text.to_string(),
                settings: settings.clone(),
            });

        let rate = settings.sample_rate;
        let chunk_len = (rate / 50) as usize;
        let chunks = text.chars().count().div_ceil(10).max(1);
        let audio = (0..chunks)
            .map(move |seq| Ok(AudioChunk::new(vec![0; chunk_len], rate, seq as u64)))
            .collect::<Vec<Result<AudioChunk>>>();
        Ok(stream::iter(audio).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use crate::pipeline::stage::test_support::Harness;

    fn settings() -> TtsSettings {
        TtsSettings::from(&TtsConfig::default())
    }

    async fn send(
        stage: &mut TtsStage,
        harness: &Harness,
        data: FrameData,
    ) -> std::result::Result<(), StageError> {
        let frame = harness.input(data);
        stage.process(frame, Direction::Downstream, &harness.ctx).await
    }

    #[test]
    fn test_take_sentences_waits_for_whitespace() {
        let mut buffer = "Привіт! Як справи? Добре".to_string();
        assert_eq!(take_sentences(&mut buffer), vec!["Привіт!", "Як справи?"]);
        assert_eq!(buffer, " Добре");

        let mut buffer = "Version 3.5 is out.".to_string();
        assert!(take_sentences(&mut buffer).is_empty());
    }

    #[test]
    fn test_settings_update_merges_sampling_params() {
        let mut settings = settings();
        let mut sampling_params = BTreeMap::new();
        sampling_params.insert("temperature".to_string(), serde_json::json!(0.7));
        sampling_params.insert("min_p".to_string(), serde_json::Value::Null);
        settings.apply(&TtsSettingsUpdate {
            voice_id: Some("other-voice".into()),
            model: None,
            sampling_params,
        });

        assert_eq!(settings.voice_id, "other-voice");
        assert_eq!(settings.model, "public/tts/ua-rt");
        assert_eq!(settings.sampling_params.get("temperature"), Some(&serde_json::json!(0.7)));
        assert!(!settings.sampling_params.contains_key("min_p"));
    }

    #[tokio::test]
    async fn test_sentences_spoken_as_they_complete() {
        let tts = MockTextToSpeech::new();
        let mut stage = TtsStage::new(Arc::new(tts.clone()), settings());
        let mut harness = Harness::new("tts");

        send(&mut stage, &harness, FrameData::LlmResponseStart).await.unwrap();
        send(&mut stage, &harness, FrameData::LlmText("Hello there. How".into())).await.unwrap();
        assert_eq!(tts.calls().len(), 1);
        send(&mut stage, &harness, FrameData::LlmText(" are you".into())).await.unwrap();
        send(&mut stage, &harness, FrameData::LlmResponseEnd).await.unwrap();

        let texts: Vec<_> = tts.calls().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["Hello there.", "How are you"]);

        let kinds: Vec<_> = harness
            .drain_downstream()
            .iter()
            .map(FrameData::kind)
            .collect();
        assert_eq!(kinds[0], FrameKind::LlmResponseStart);
        assert_eq!(kinds[1], FrameKind::TtsStarted);
        assert_eq!(kinds[kinds.len() - 2], FrameKind::TtsStopped);
        assert_eq!(kinds[kinds.len() - 1], FrameKind::LlmResponseEnd);
    }

    #[tokio::test]
    async fn test_uses_configured_voice_and_output_rate() {
        let tts = MockTextToSpeech::new();
        let mut stage = TtsStage::new(Arc::new(tts.clone()), settings());
        let harness = Harness::new("tts");
        let params = StartParams {
            audio_in_sample_rate: 16000,
            audio_out_sample_rate: 22050,
            enable_metrics: false,
            enable_usage_metrics: false,
        };
        stage.start(&params, &harness.ctx).await.unwrap();

        send(&mut stage, &harness, FrameData::TtsSpeak("Привіт".into())).await.unwrap();

        let call = &tts.calls()[0];
        assert_eq!(call.settings.voice_id, "olesia-conversation");
        assert_eq!(call.settings.model, "public/tts/ua-rt");
        assert_eq!(call.settings.sample_rate, 22050);
        assert_eq!(
            call.settings.sampling_params.get("min_p"),
            Some(&serde_json::json!(0.01))
        );
    }

    #[tokio::test]
    async fn test_update_frame_applies_to_next_synthesis() {
        let tts = MockTextToSpeech::new();
        let mut stage = TtsStage::new(Arc::new(tts.clone()), settings());
        let harness = Harness::new("tts");

        send(
            &mut stage,
            &harness,
            FrameData::TtsUpdateSettings(TtsSettingsUpdate {
                voice_id: Some("new-voice".into()),
                ..TtsSettingsUpdate::default()
            }),
        )
        .await
        .unwrap();
        send(&mut stage, &harness, FrameData::TtsSpeak("hi".into())).await.unwrap();

        assert_eq!(tts.calls()[0].settings.voice_id, "new-voice");
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_fatal() {
        let mut stage = TtsStage::new(Arc::new(MockTextToSpeech::failing()), settings());
        let harness = Harness::new("tts");
        let err = send(&mut stage, &harness, FrameData::TtsSpeak("hi".into()))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_text() {
        let tts = MockTextToSpeech::new();
        let mut stage = TtsStage::new(Arc::new(tts.clone()), settings());
        let harness = Harness::new("tts");

        send(&mut stage, &harness, FrameData::LlmText("unfinished".into())).await.unwrap();
        stage.cancel(&harness.ctx).await;
        stage.finish(&harness.ctx).await.unwrap();

        assert!(tts.calls().is_empty());
    }
}
