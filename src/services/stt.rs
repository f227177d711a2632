//! Speech-to-text service contract and pipeline stage.

use crate::error::{Result, VoxError};
use crate::frame::{AudioChunk, Direction, Frame, FrameData, StartParams, Transcript};
use crate::pipeline::{Stage, StageContext, StageError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Audio kept while no stream is open, replayed when one opens.
const PRE_ROLL_MS: u32 = 500;

/// A speech-to-text provider.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;

    /// Opens a recognition stream for one utterance.
    async fn open_stream(&self, language: &str, sample_rate: u32) -> Result<Box<dyn SttStream>>;
}

/// One utterance worth of streaming recognition.
#[async_trait]
pub trait SttStream: Send {
    /// Sends audio; returns whatever transcripts became available.
    async fn send_audio(&mut self, samples: &[i16]) -> Result<Vec<Transcript>>;

    /// Signals end of audio and returns the remaining (final) transcripts.
    async fn finish(self: Box<Self>) -> Result<Vec<Transcript>>;

    /// Abandons the stream without waiting for results.
    async fn close(self: Box<Self>) {}
}

/// Streams user audio to STT between `UserStartedSpeaking` and
/// `UserTurnEnded`, emitting transcripts before the turn-end frame.
pub struct SttStage {
    service: Arc<dyn SpeechToText>,
    language: String,
    sample_rate: u32,
    stream: Option<Box<dyn SttStream>>,
    pre_roll: VecDeque<AudioChunk>,
}

impl SttStage {
    pub fn new(service: Arc<dyn SpeechToText>, language: impl Into<String>) -> Self {
        Self {
            service,
            language: language.into(),
            sample_rate: crate::defaults::AUDIO_IN_SAMPLE_RATE,
            stream: None,
            pre_roll: VecDeque::new(),
        }
    }

    fn emit(ctx: &StageContext, transcripts: Vec<Transcript>) {
        for transcript in transcripts {
            if transcript.is_final {
                tracing::debug!(text = %transcript.text, "final transcript");
                ctx.push_downstream(FrameData::TranscriptFinal(transcript));
            } else {
                ctx.push_downstream(FrameData::TranscriptPartial(transcript));
            }
        }
    }

    fn unavailable(&self, error: VoxError) -> StageError {
        match error {
            VoxError::ServiceUnavailable { .. } => error.into(),
            other => VoxError::unavailable(self.service.name(), other.to_string()).into(),
        }
    }

    async fn open(&mut self, ctx: &StageContext) -> std::result::Result<(), StageError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut stream = self
            .service
            .open_stream(&self.language, self.sample_rate)
            .await
            .map_err(|e| self.unavailable(e))?;
        tracing::debug!(stt = self.service.name(), language = %self.language, "stt stream opened");

        for chunk in self.pre_roll.drain(..) {
            let transcripts = stream
                .send_audio(&chunk.samples)
                .await
                .map_err(|e| VoxError::unavailable(self.service.name(), e.to_string()))?;
            Self::emit(ctx, transcripts);
        }
        self.stream = Some(stream);
        Ok(())
    }

    async fn finish_stream(&mut self, ctx: &StageContext) -> std::result::Result<(), StageError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let transcripts = stream.finish().await.map_err(|e| self.unavailable(e))?;
        Self::emit(ctx, transcripts);
        Ok(())
    }

    fn remember(&mut self, chunk: &AudioChunk) {
        self.pre_roll.push_back(chunk.clone());
        let limit = PRE_ROLL_MS as usize * chunk.sample_rate as usize / 1000;
        while self.pre_roll.iter().map(|c| c.samples.len()).sum::<usize>() > limit {
            self.pre_roll.pop_front();
        }
    }
}

#[async_trait]
impl Stage for SttStage {
    fn name(&self) -> &str {
        "SpeechToText"
    }

    async fn start(
        &mut self,
        params: &StartParams,
        _ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        self.sample_rate = params.audio_in_sample_rate;
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
            FrameData::InputAudio(chunk) => match self.stream.as_mut() {
                Some(stream) => {
                    let result = stream.send_audio(&chunk.samples).await;
                    let transcripts = result.map_err(|e| self.unavailable(e))?;
                    Self::emit(ctx, transcripts);
                }
                None => self.remember(chunk),
            },
            FrameData::UserStartedSpeaking => {
                ctx.forward(frame.clone(), direction);
                self.open(ctx).await?;
            }
            FrameData::UserTurnEnded(_) => {
                self.finish_stream(ctx).await?;
                self.pre_roll.clear();
                ctx.forward(frame, direction);
            }
            _ => ctx.forward(frame, direction),
        }
        Ok(())
    }

    async fn finish(&mut self, ctx: &StageContext) -> std::result::Result<(), StageError> {
        self.finish_stream(ctx).await
    }

    async fn cancel(&mut self, _ctx: &StageContext) {
        self.pre_roll.clear();
        if let Some(stream) = self.stream.take() {
            stream.close().await;
        }
    }
}

/// Record of streams opened on a [`MockSpeechToText`].
#[derive(Debug, Default)]
struct MockSttState {
    utterances: VecDeque<Vec<String>>,
    opened: Vec<String>,
    audio_samples: usize,
    closed: usize,
}

/// Speech-to-text that returns scripted utterances (for testing).
///
/// Each opened stream consumes the next scripted utterance and returns its
/// fragments as final transcripts when finished.
#[derive(Debug, Clone, Default)]
pub struct MockSpeechToText {
    state: Arc<Mutex<MockSttState>>,
    fail_open: bool,
}

impl MockSpeechToText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an utterance made of the given fragments.
    pub fn with_utterance(self, fragments: &[&str]) -> Self {
        self.lock()
            .utterances
            .push_back(fragments.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    /// Languages of the streams opened so far.
    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    pub fn audio_samples(&self) -> usize {
        self.lock().audio_samples
    }

    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockSttState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SpeechToText for MockSpeechToText {
    fn name(&self) -> &str {
        "mock-stt"
    }

    async fn open_stream(&self, language: &str, _sample_rate: u32) -> Result<Box<dyn SttStream>> {
        if self.fail_open {
            return Err(VoxError::unavailable("mock-stt", "service offline"));
        }
        let fragments = {
            let mut state = self.lock();
            state.opened.push(language.to_string());
            state.utterances.pop_front().unwrap_or_default()
        };
        Ok(Box::new(MockSttStream {
            owner: self.clone(),
            fragments,
        }))
    }
}

struct MockSttStream {
    owner: MockSpeechToText,
    fragments: Vec<String>,
}

#[async_trait]
impl SttStream for MockSttStream {
    async fn send_audio(&mut self, samples: &[i16]) -> Result<Vec<Transcript>> {
        self.owner.lock().audio_samples += samples.len();
        Ok(self
            .fragments
            .first()
            .map(|f| vec![Transcript::partial(f.clone())])
            .unwrap_or_default())
    }

    async fn finish(self: Box<Self>) -> Result<Vec<Transcript>> {
        Ok(self
            .fragments
            .into_iter()
            .map(Transcript::final_text)
            .collect())
    }

    async fn close(self: Box<Self>) {
        self.owner.lock().closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameKind, TurnEnd, TurnEndReason};
    use crate::pipeline::stage::test_support::Harness;

    fn turn_end() -> FrameData {
        FrameData::UserTurnEnded(TurnEnd {
            reason: TurnEndReason::Silence,
            probability: None,
            silence_ms: 200,
        })
    }

    fn audio(seq: u64) -> FrameData {
        FrameData::InputAudio(AudioChunk::new(vec![100; 320], 16000, seq))
    }

    async fn send(stage: &mut SttStage, harness: &Harness, data: FrameData) -> std::result::Result<(), StageError> {
        let frame = harness.input(data);
        stage.process(frame, Direction::Downstream, &harness.ctx).await
    }

    #[tokio::test]
    async fn test_finals_precede_turn_end() {
        let stt = MockSpeechToText::new().with_utterance(&["Hi", " there"]);
        let mut stage = SttStage::new(Arc::new(stt.clone()), "uk");
        let mut harness = Harness::new("stt");

        send(&mut stage, &harness, FrameData::UserStartedSpeaking).await.unwrap();
        send(&mut stage, &harness, audio(0)).await.unwrap();
        send(&mut stage, &harness, turn_end()).await.unwrap();

        let kinds: Vec<_> = harness
            .drain_downstream()
            .iter()
            .map(FrameData::kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                FrameKind::UserStartedSpeaking,
                FrameKind::TranscriptPartial,
                FrameKind::TranscriptFinal,
                FrameKind::TranscriptFinal,
                FrameKind::UserTurnEnded,
            ]
        );
        assert_eq!(stt.opened(), vec!["uk".to_string()]);
    }

    #[tokio::test]
    async fn test_pre_roll_replayed_on_open() {
        let stt = MockSpeechToText::new().with_utterance(&["hi"]);
        let mut stage = SttStage::new(Arc::new(stt.clone()), "uk");
        let harness = Harness::new("stt");

        // 40 chunks of 20ms; only the last 500ms are kept
        for seq in 0..40 {
            send(&mut stage, &harness, audio(seq)).await.unwrap();
        }
        send(&mut stage, &harness, FrameData::UserStartedSpeaking).await.unwrap();

        assert_eq!(stt.audio_samples(), 25 * 320);
    }

    #[tokio::test]
    async fn test_pre_roll_bounded_for_tiny_chunks() {
        let stt = MockSpeechToText::new().with_utterance(&["hi"]);
        let mut stage = SttStage::new(Arc::new(stt.clone()), "uk");
        let harness = Harness::new("stt");

        // 15 samples each, under a millisecond apiece
        for seq in 0..2000 {
            let chunk = AudioChunk::new(vec![100; 15], 16000, seq);
            send(&mut stage, &harness, FrameData::InputAudio(chunk)).await.unwrap();
        }
        send(&mut stage, &harness, FrameData::UserStartedSpeaking).await.unwrap();

        // 500ms at 16kHz is 8000 samples: 533 whole chunks
        assert_eq!(stt.audio_samples(), 533 * 15);
    }

    #[tokio::test]
    async fn test_open_failure_is_fatal() {
        let mut stage = SttStage::new(Arc::new(MockSpeechToText::failing()), "uk");
        let harness = Harness::new("stt");

        let err = send(&mut stage, &harness, FrameData::UserStartedSpeaking)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_cancel_closes_open_stream() {
        let stt = MockSpeechToText::new().with_utterance(&["partial"]);
        let mut stage = SttStage::new(Arc::new(stt.clone()), "uk");
        let mut harness = Harness::new("stt");

        send(&mut stage, &harness, FrameData::UserStartedSpeaking).await.unwrap();
        stage.cancel(&harness.ctx).await;

        assert_eq!(stt.closed(), 1);
        let kinds: Vec<_> = harness
            .drain_downstream()
            .iter()
            .map(FrameData::kind)
            .collect();
        assert!(!kinds.contains(&FrameKind::TranscriptFinal));
    }
}
