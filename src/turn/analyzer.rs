//! Semantic end-of-turn analysis.

use crate::error::{Result, VoxError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Verdict of a turn analyzer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnPrediction {
    /// Probability (0.0 to 1.0) that the utterance is complete.
    pub probability: f32,
}

impl TurnPrediction {
    pub fn is_complete(&self, threshold: f32) -> bool {
        self.probability >= threshold
    }
}

/// Classifier that judges whether an utterance is complete.
#[async_trait]
pub trait TurnAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Analyzes the utterance audio (mono 16-bit PCM) ending at the pause.
    async fn analyze(&self, audio: &[i16], sample_rate: u32) -> Result<TurnPrediction>;
}

/// One scripted analyzer response.
#[derive(Debug, Clone)]
pub enum ScriptedVerdict {
    Probability(f32),
    Fail(String),
    /// Never answers; exercises the analyzer timeout.
    Hang,
}

/// Turn analyzer that replays a fixed script (for testing).
///
/// Once the script is exhausted the last verdict repeats.
#[derive(Debug, Clone)]
pub struct ScriptedTurnAnalyzer {
    script: Arc<Mutex<VecDeque<ScriptedVerdict>>>,
    last: Arc<Mutex<ScriptedVerdict>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTurnAnalyzer {
    pub fn new(script: Vec<ScriptedVerdict>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            last: Arc::new(Mutex::new(ScriptedVerdict::Probability(1.0))),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always answers with `probability`.
    pub fn always(probability: f32) -> Self {
        Self::new(vec![ScriptedVerdict::Probability(probability)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_verdict(&self) -> ScriptedVerdict {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = script.pop_front() {
            *last = next;
        }
        last.clone()
    }
}

#[async_trait]
impl TurnAnalyzer for ScriptedTurnAnalyzer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn analyze(&self, _audio: &[i16], _sample_rate: u32) -> Result<TurnPrediction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_verdict() {
            ScriptedVerdict::Probability(probability) => Ok(TurnPrediction { probability }),
            ScriptedVerdict::Fail(message) => Err(VoxError::Other(message)),
            ScriptedVerdict::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Err(VoxError::Other("analyzer hung".to_string()))
            }
        }
    }
}
