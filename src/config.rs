use crate::defaults;
use crate::error::{Result, VoxError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub session: SessionConfig,
    pub turn: TurnConfig,
    pub prompt: PromptConfig,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SttConfig {
    /// Recognition language code (e.g. "uk").
    pub language: String,
}

/// Text-to-speech configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    pub voice_id: String,
    pub model: String,
    /// Provider-specific sampling overrides, passed through as-is.
    pub sampling_params: BTreeMap<String, serde_json::Value>,
}

/// LLM provider list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Keep later credentialed providers as runtime fallbacks.
    pub use_fallbacks: bool,
    /// Providers in order of preference.
    pub providers: Vec<ProviderConfig>,
}

/// One OpenAI-compatible chat-completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub base_url: String,
}

/// Session parameters handed to the pipeline task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
    /// Seconds without activity before the session is cancelled; 0 disables.
    pub idle_timeout_secs: u64,
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
}

/// Turn-taking configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnConfig {
    pub vad_threshold: f32,
    pub start_secs: f32,
    pub stop_secs: f32,
    pub max_silence_secs: f32,
    pub completion_threshold: f32,
    pub analyzer_timeout_ms: u64,
}

/// Conversation prompts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromptConfig {
    /// Seeds the conversation context.
    pub system: String,
    /// Instruction appended when a client connects.
    pub greeting: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            language: defaults::DEFAULT_LANGUAGE.to_string(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        let mut sampling_params = BTreeMap::new();
        sampling_params.insert(
            "min_p".to_string(),
            serde_json::json!(defaults::DEFAULT_TTS_MIN_P),
        );
        Self {
            voice_id: defaults::DEFAULT_VOICE.to_string(),
            model: defaults::DEFAULT_TTS_MODEL.to_string(),
            sampling_params,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            use_fallbacks: false,
            providers: vec![
                ProviderConfig {
                    name: "cerebras".to_string(),
                    api_key_env: "CEREBRAS_API_KEY".to_string(),
                    model: defaults::CEREBRAS_MODEL.to_string(),
                    base_url: defaults::CEREBRAS_BASE_URL.to_string(),
                },
                ProviderConfig {
                    name: "google".to_string(),
                    api_key_env: "GOOGLE_API_KEY".to_string(),
                    model: defaults::GOOGLE_MODEL.to_string(),
                    base_url: defaults::GOOGLE_BASE_URL.to_string(),
                },
            ],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio_in_sample_rate: defaults::AUDIO_IN_SAMPLE_RATE,
            audio_out_sample_rate: defaults::AUDIO_OUT_SAMPLE_RATE,
            idle_timeout_secs: defaults::IDLE_TIMEOUT_SECS,
            enable_metrics: true,
            enable_usage_metrics: true,
        }
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            vad_threshold: defaults::VAD_THRESHOLD,
            start_secs: defaults::VAD_START_SECS,
            stop_secs: defaults::VAD_STOP_SECS,
            max_silence_secs: defaults::MAX_SILENCE_SECS,
            completion_threshold: defaults::COMPLETION_THRESHOLD,
            analyzer_timeout_ms: defaults::ANALYZER_TIMEOUT_MS,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system: defaults::SYSTEM_PROMPT.to_string(),
            greeting: defaults::GREETING_PROMPT.to_string(),
        }
    }
}

/// Where API keys come from.
pub trait CredentialSource {
    /// Returns the credential stored under `key`, if any and non-empty.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads credentials from process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl CredentialSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).filter(|v| !v.is_empty()).cloned()
    }
}

/// A provider whose credential was found.
#[derive(Clone, PartialEq)]
pub struct ResolvedProvider {
    pub name: String,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

impl fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Outcome of LLM provider selection.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSelection {
    pub primary: ResolvedProvider,
    pub fallbacks: Vec<ResolvedProvider>,
}

impl LlmSelection {
    /// Primary first, then fallbacks in order.
    pub fn providers(&self) -> impl Iterator<Item = &ResolvedProvider> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to load config from {}", path.display())),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXAGENT_LANGUAGE → stt.language
    /// - VOXAGENT_VOICE → tts.voice_id
    /// - VOXAGENT_IDLE_TIMEOUT_SECS → session.idle_timeout_secs
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(language) = std::env::var("VOXAGENT_LANGUAGE")
            && !language.is_empty()
        {
            self.stt.language = language;
        }

        if let Ok(voice) = std::env::var("VOXAGENT_VOICE")
            && !voice.is_empty()
        {
            self.tts.voice_id = voice;
        }

        if let Ok(timeout) = std::env::var("VOXAGENT_IDLE_TIMEOUT_SECS")
            && !timeout.is_empty()
        {
            match timeout.parse() {
                Ok(secs) => self.session.idle_timeout_secs = secs,
                Err(_) => tracing::warn!(value = %timeout, "ignoring invalid VOXAGENT_IDLE_TIMEOUT_SECS"),
            }
        }

        self
    }

    /// Checks values that deserialize fine but cannot drive a session.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: impl Into<String>) -> VoxError {
            VoxError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.into(),
            }
        }

        if self.stt.language.trim().is_empty() {
            return Err(invalid("stt.language", "must not be empty"));
        }
        if self.tts.voice_id.trim().is_empty() {
            return Err(invalid("tts.voice_id", "must not be empty"));
        }
        if self.session.audio_in_sample_rate == 0 {
            return Err(invalid("session.audio_in_sample_rate", "must be positive"));
        }
        if self.session.audio_out_sample_rate == 0 {
            return Err(invalid("session.audio_out_sample_rate", "must be positive"));
        }
        if !(self.turn.vad_threshold > 0.0 && self.turn.vad_threshold < 1.0) {
            return Err(invalid("turn.vad_threshold", "must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.turn.completion_threshold) {
            return Err(invalid("turn.completion_threshold", "must be between 0 and 1"));
        }
        if self.turn.stop_secs <= 0.0 || self.turn.start_secs < 0.0 {
            return Err(invalid("turn.stop_secs", "VAD windows must be positive"));
        }
        if self.llm.providers.is_empty() {
            return Err(invalid("llm.providers", "at least one provider is required"));
        }
        for provider in &self.llm.providers {
            if provider.api_key_env.trim().is_empty() {
                return Err(invalid(
                    "llm.providers.api_key_env",
                    format!("missing for provider '{}'", provider.name),
                ));
            }
            if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://") {
                return Err(invalid(
                    "llm.providers.base_url",
                    format!("'{}' is not an http(s) URL", provider.base_url),
                ));
            }
        }
        Ok(())
    }

    /// Picks the first provider with an available credential.
    ///
    /// With `use_fallbacks`, every later provider that also has a credential
    /// is kept as a fallback. Fails with `NoLlmCredentials` when none has one.
    pub fn select_llm(&self, credentials: &dyn CredentialSource) -> Result<LlmSelection> {
        let mut resolved = self.llm.providers.iter().filter_map(|p| {
            credentials.get(&p.api_key_env).map(|api_key| ResolvedProvider {
                name: p.name.clone(),
                model: p.model.clone(),
                base_url: p.base_url.clone(),
                api_key,
            })
        });

        let Some(primary) = resolved.next() else {
            return Err(VoxError::NoLlmCredentials {
                tried: self
                    .llm
                    .providers
                    .iter()
                    .map(|p| p.api_key_env.clone())
                    .collect(),
            });
        };
        let fallbacks = if self.llm.use_fallbacks {
            resolved.collect()
        } else {
            Vec::new()
        };

        tracing::info!(provider = %primary.name, model = %primary.model, fallbacks = fallbacks.len(), "LLM provider selected");
        Ok(LlmSelection { primary, fallbacks })
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxagent/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("voxagent").join("config.toml"))
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Resolves the config path: explicit path first, then the default location.
pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    #[cfg(feature = "cli")]
    {
        Config::default_path()
    }
    #[cfg(not(feature = "cli"))]
    {
        None
    }
}
