//! Pipeline stage wrapping the [`TurnDetector`].

use crate::frame::{Direction, Frame, FrameData};
use crate::pipeline::{Stage, StageContext, StageError};
use crate::turn::analyzer::TurnAnalyzer;
use crate::turn::detector::{TurnDetector, TurnEvent, TurnParams};
use async_trait::async_trait;
use std::sync::Arc;

/// Watches inbound audio and emits speaking and turn-end frames.
///
/// `UserStartedSpeaking` is pushed before the audio chunk that triggered it,
/// so downstream STT is listening before that chunk arrives; stop and
/// turn-end frames follow the chunk that completed the pause.
pub struct TurnDetectorStage {
    detector: TurnDetector,
}

impl TurnDetectorStage {
    pub fn new(params: TurnParams, analyzer: Option<Arc<dyn TurnAnalyzer>>) -> Self {
        Self {
            detector: TurnDetector::new(params, analyzer),
        }
    }
}

fn event_frame(event: TurnEvent) -> FrameData {
    match event {
        TurnEvent::UserStartedSpeaking => FrameData::UserStartedSpeaking,
        TurnEvent::UserStoppedSpeaking => FrameData::UserStoppedSpeaking,
        TurnEvent::TurnEnded(end) => FrameData::UserTurnEnded(end),
    }
}

#[async_trait]
impl Stage for TurnDetectorStage {
    fn name(&self) -> &str {
        "TurnDetector"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        let FrameData::InputAudio(chunk) = frame.data() else {
            ctx.forward(frame, direction);
            return Ok(());
        };
        if direction != Direction::Downstream {
            ctx.forward(frame, direction);
            return Ok(());
        }

        let events = self.detector.push_audio(chunk).await;
        let (before, after): (Vec<_>, Vec<_>) = events
            .into_iter()
            .partition(|e| *e == TurnEvent::UserStartedSpeaking);

        for event in before {
            ctx.push_downstream(event_frame(event));
        }
        ctx.forward(frame, direction);
        for event in after {
            ctx.push_downstream(event_frame(event));
        }
        Ok(())
    }

    async fn cancel(&mut self, _ctx: &StageContext) {
        self.detector.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioChunk, FrameKind, Transcript};
    use crate::pipeline::stage::test_support::Harness;

    fn audio(amplitude: i16, seq: u64) -> FrameData {
        FrameData::InputAudio(AudioChunk::new(vec![amplitude; 320], 16000, seq))
    }

    #[tokio::test]
    async fn test_speaking_frames_surround_audio() {
        let mut harness = Harness::new("TurnDetector");
        let mut stage = TurnDetectorStage::new(TurnParams::default(), None);

        let mut seq = 0;
        for amplitude in [8000i16; 10].into_iter().chain([0i16; 10]) {
            let frame = harness.input(audio(amplitude, seq));
            stage
                .process(frame, Direction::Downstream, &harness.ctx)
                .await
                .unwrap();
            seq += 1;
        }

        let kinds: Vec<FrameKind> = harness
            .drain_downstream()
            .iter()
            .map(FrameData::kind)
            .collect();
        // Started precedes the 10th speech chunk; stop + end follow the 10th silent one
        assert_eq!(kinds[9], FrameKind::UserStartedSpeaking);
        assert_eq!(kinds[10], FrameKind::InputAudio);
        assert_eq!(kinds[kinds.len() - 3], FrameKind::InputAudio);
        assert_eq!(kinds[kinds.len() - 2], FrameKind::UserStoppedSpeaking);
        assert_eq!(kinds[kinds.len() - 1], FrameKind::UserTurnEnded);
        assert_eq!(
            kinds.iter().filter(|k| **k == FrameKind::InputAudio).count(),
            20
        );
    }

    #[tokio::test]
    async fn test_other_frames_pass_through() {
        let mut harness = Harness::new("TurnDetector");
        let mut stage = TurnDetectorStage::new(TurnParams::default(), None);
        let frame = harness.input(FrameData::TranscriptFinal(Transcript::final_text("hi")));
        stage
            .process(frame, Direction::Downstream, &harness.ctx)
            .await
            .unwrap();
        let out = harness.drain_downstream();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), FrameKind::TranscriptFinal);
    }
}
