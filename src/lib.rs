//! voxagent - real-time frame pipeline engine for conversational voice agents
//!
//! Audio, text and control frames flow through an ordered, bidirectional
//! chain of stages (transport in → turn detection → STT → context → LLM →
//! TTS → transport out). A [`PipelineTask`] owns the session lifecycle and a
//! [`PipelineRunner`] drives one or many tasks to completion.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod aggregator;
#[cfg(all(feature = "cli", feature = "http-llm"))]
pub mod chat;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod context;
pub mod defaults;
pub mod error;
pub mod frame;
pub mod logging;
pub mod observer;
pub mod pipeline;
pub mod runner;
pub mod services;
pub mod session;
pub mod task;
pub mod transport;
pub mod turn;

// Frames and conversation state
pub use context::{ContextSnapshot, ConversationContext, Message, Role, SharedContext};
pub use frame::{Direction, Frame, FrameData, FrameKind};

// Pipeline core
pub use pipeline::error::StageError;
pub use pipeline::orchestrator::Pipeline;
pub use pipeline::stage::{Stage, StageContext};

// Lifecycle
pub use runner::PipelineRunner;
pub use task::{PipelineTask, TaskHandle, TaskOutcome, TaskParams, TaskStatus};

// Sessions
pub use session::{Session, SessionServices, build_session};
pub use transport::{LocalTransport, Transport};

// Observers
pub use observer::{FramePushed, LoggingObserver, MetricsObserver, Observer};

// Error handling
pub use error::{Result, VoxError};

// Config
pub use config::{Config, CredentialSource, EnvCredentials, LlmSelection};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
