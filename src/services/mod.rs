//! External AI services (speech-to-text, LLM, text-to-speech) and the
//! pipeline stages that drive them.

pub mod llm;
#[cfg(feature = "http-llm")]
pub mod llm_http;
pub mod stt;
pub mod tts;

pub use llm::{LlmChunk, LlmService, LlmStage, LlmStream, ScriptedLlm, ScriptedReply};
#[cfg(feature = "http-llm")]
pub use llm_http::{OpenAiCompatibleLlm, services_from_selection};
pub use stt::{MockSpeechToText, SpeechToText, SttStage, SttStream};
pub use tts::{MockTextToSpeech, TextToSpeech, TtsSettings, TtsSettingsUpdate, TtsStage};
