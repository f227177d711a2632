//! Assembles a conversational session from configuration and services.
//!
//! Chain: transport in → turn detector → STT → user aggregator → LLM → TTS
//! → transport out → assistant aggregator.

use crate::aggregator::ContextAggregatorPair;
use crate::config::Config;
use crate::context::{Message, SharedContext};
use crate::error::{Result, VoxError};
use crate::frame::FrameData;
use crate::observer::{LoggingObserver, MetricsObserver, Observer};
use crate::pipeline::{Pipeline, Stage};
use crate::runner::PipelineRunner;
use crate::services::llm::{LlmService, LlmStage};
use crate::services::stt::{SpeechToText, SttStage};
use crate::services::tts::{TextToSpeech, TtsSettings, TtsStage};
use crate::task::{PipelineTask, TaskHandle, TaskOutcome, TaskParams};
use crate::transport::{Subscription, Transport, TransportEventKind};
use crate::turn::{TurnAnalyzer, TurnDetectorStage, TurnParams};
use std::sync::Arc;

/// External services a session talks to.
///
/// Without STT the session only accepts typed turns; without TTS replies
/// are delivered as text only.
#[derive(Default)]
pub struct SessionServices {
    pub stt: Option<Arc<dyn SpeechToText>>,
    /// LLM providers, primary first.
    pub llm: Vec<Arc<dyn LlmService>>,
    pub tts: Option<Arc<dyn TextToSpeech>>,
    pub turn_analyzer: Option<Arc<dyn TurnAnalyzer>>,
}

/// A ready-to-run session.
pub struct Session {
    pub task: PipelineTask,
    pub handle: TaskHandle,
    pub context: SharedContext,
    /// Present when metrics are enabled.
    pub metrics: Option<MetricsObserver>,
    pub subscriptions: Vec<Subscription>,
}

impl Session {
    /// Runs the session and removes its transport handlers afterwards.
    pub async fn run(self, runner: &PipelineRunner) -> TaskOutcome {
        let Session {
            task,
            subscriptions,
            ..
        } = self;
        let outcome = runner.run(task).await;
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        outcome
    }
}

/// Builds the pipeline, task and transport handlers for one session.
///
/// The context is seeded with the system prompt. When the client connects
/// the greeting instruction is appended and a generation is requested; when
/// it disconnects the task is cancelled.
pub fn build_session(
    config: &Config,
    services: SessionServices,
    transport: &dyn Transport,
    mut observers: Vec<Arc<dyn Observer>>,
) -> Result<Session> {
    if services.llm.is_empty() {
        return Err(VoxError::ConfigInvalidValue {
            key: "llm.providers".to_string(),
            message: "no LLM service available".to_string(),
        });
    }

    let context = SharedContext::new(vec![Message::system(config.prompt.system.clone())]);
    let aggregators = ContextAggregatorPair::new(context.clone());

    let mut stages: Vec<Box<dyn Stage>> = vec![
        transport.input(),
        Box::new(TurnDetectorStage::new(
            TurnParams::from(&config.turn),
            services.turn_analyzer,
        )),
    ];
    if let Some(stt) = services.stt {
        stages.push(Box::new(SttStage::new(stt, config.stt.language.clone())));
    }
    stages.push(Box::new(aggregators.user()));
    stages.push(Box::new(LlmStage::new(services.llm)));
    if let Some(tts) = services.tts {
        stages.push(Box::new(TtsStage::new(tts, TtsSettings::from(&config.tts))));
    }
    stages.push(transport.output());
    stages.push(Box::new(aggregators.assistant()));

    let pipeline = Pipeline::new(stages)?;
    tracing::debug!(stages = ?pipeline.stage_names(), "session pipeline assembled");

    let params = TaskParams::from_config(&config.session);
    let metrics = params.enable_metrics.then(MetricsObserver::new);
    if let Some(metrics) = &metrics {
        observers.push(Arc::new(metrics.clone()));
    }
    observers.push(Arc::new(LoggingObserver));

    let task = PipelineTask::new(pipeline, params, observers);
    let handle = task.handle();

    let mut subscriptions = Vec::new();
    let greeting = config.prompt.greeting.trim().to_string();
    if !greeting.is_empty() {
        let on_connect = handle.clone();
        subscriptions.push(transport.events().on(
            TransportEventKind::ClientConnected,
            move |_client| {
                let request = FrameData::AppendMessages {
                    messages: vec![Message::system(greeting.clone())],
                    run_llm: true,
                };
                if let Err(e) = on_connect.queue_frame(request) {
                    tracing::warn!(error = %e, "could not queue greeting");
                }
            },
        ));
    }
    let on_disconnect = handle.clone();
    subscriptions.push(transport.events().on(
        TransportEventKind::ClientDisconnected,
        move |_client| on_disconnect.cancel(),
    ));

    Ok(Session {
        task,
        handle,
        context,
        metrics,
        subscriptions,
    })
}
