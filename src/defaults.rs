//! Default configuration constants for voxagent.
//!
//! Shared by the config file defaults, the turn detector and the services
//! so that every layer agrees on the same values.

/// Default inbound audio sample rate in Hz.
///
/// 16kHz mono PCM is what speech recognition and the turn analyzer expect.
pub const AUDIO_IN_SAMPLE_RATE: u32 = 16000;

/// Default outbound (synthesized) audio sample rate in Hz.
pub const AUDIO_OUT_SAMPLE_RATE: u32 = 22050;

/// Default RMS threshold (0.0 to 1.0) above which a chunk counts as speech.
pub const VAD_THRESHOLD: f32 = 0.02;

/// Continuous speech required before the user is considered to be speaking.
pub const VAD_START_SECS: f32 = 0.2;

/// Continuous non-speech after which a pause becomes a candidate turn end.
pub const VAD_STOP_SECS: f32 = 0.2;

/// Upper bound on trailing silence before a turn is ended regardless of
/// what the semantic analyzer thinks.
pub const MAX_SILENCE_SECS: f32 = 3.0;

/// Probability at or above which the analyzer's verdict ends the turn.
pub const COMPLETION_THRESHOLD: f32 = 0.5;

/// How long a single analyzer call may take before falling back to VAD.
pub const ANALYZER_TIMEOUT_MS: u64 = 500;

/// Most utterance audio handed to the analyzer, in seconds.
pub const ANALYZER_MAX_AUDIO_SECS: f32 = 8.0;

/// Session idle timeout in seconds.
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// Time allowed for a CancelSignal to traverse the pipeline before stages
/// are aborted.
pub const CANCEL_TIMEOUT_MS: u64 = 2000;

/// Default language code for speech-to-text.
pub const DEFAULT_LANGUAGE: &str = "uk";

/// Default TTS voice identifier.
pub const DEFAULT_VOICE: &str = "olesia-conversation";

/// Default TTS model identifier.
pub const DEFAULT_TTS_MODEL: &str = "public/tts/ua-rt";

/// Default `min_p` sampling override for TTS.
pub const DEFAULT_TTS_MIN_P: f64 = 0.01;

/// Cerebras OpenAI-compatible endpoint and default model.
pub const CEREBRAS_BASE_URL: &str = "https://api.cerebras.ai/v1";
pub const CEREBRAS_MODEL: &str = "llama3.1-8b";

/// Google's OpenAI-compatible Gemini endpoint and default model.
pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const GOOGLE_MODEL: &str = "gemini-2.0-flash";

/// Default system prompt seeded into every conversation.
pub const SYSTEM_PROMPT: &str = "Ти дружній ШІ асистент, що розмовляє українською. \
Відповідай привітно та підтримуй розмову. Не використовуй емодзі та спеціальні символи \
у своїх відповідях. Ти жіночого роду.";

/// Instruction appended when a client connects, before the first generation.
pub const GREETING_PROMPT: &str = "Привітайся та коротко розкажи про себе.";
