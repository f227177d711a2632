//! Speech endpoint ("turn") detection.

pub mod analyzer;
pub mod detector;
pub mod stage;
pub mod vad;

pub use analyzer::{ScriptedTurnAnalyzer, ScriptedVerdict, TurnAnalyzer, TurnPrediction};
pub use detector::{TurnDetector, TurnEvent, TurnParams, TurnState};
pub use stage::TurnDetectorStage;
pub use vad::{Vad, VadEvent, VadParams, VadState, calculate_rms};
