//! Observers: read-only side-channel consumers of every frame push.
//!
//! Each observer gets its own queue and tokio task, so a slow observer never
//! stalls the pipeline and observers never see each other's effects.

use crate::frame::{Direction, Frame, FrameKind, MetricsData, TokenUsage};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// One hop of a frame between two pipeline endpoints.
#[derive(Debug, Clone)]
pub struct FramePushed {
    /// Endpoint that pushed the frame (a stage name, or the task).
    pub source: Arc<str>,
    /// Endpoint that receives the frame.
    pub destination: Arc<str>,
    pub frame: Frame,
    pub direction: Direction,
    pub timestamp: Instant,
}

/// Read-only frame consumer.
pub trait Observer: Send + Sync + 'static {
    /// Called for every frame push, in push order.
    fn on_push(&self, event: &FramePushed);

    /// Called once after the last frame of the session.
    fn on_finish(&self) {}
}

enum ObserverMsg {
    Push(Arc<FramePushed>),
    Close,
}

struct HubInner {
    proxies: Vec<mpsc::UnboundedSender<ObserverMsg>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Fan-out of frame pushes to a fixed set of observers.
#[derive(Clone)]
pub struct ObserverHub {
    inner: Arc<HubInner>,
}

impl ObserverHub {
    /// Spawns one proxy task per observer. Must be called inside a runtime.
    pub fn spawn(observers: Vec<Arc<dyn Observer>>) -> Self {
        let mut proxies = Vec::with_capacity(observers.len());
        let mut handles = Vec::with_capacity(observers.len());

        for observer in observers {
            let (tx, mut rx) = mpsc::unbounded_channel::<ObserverMsg>();
            let handle = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    match msg {
                        ObserverMsg::Push(event) => observer.on_push(&event),
                        ObserverMsg::Close => break,
                    }
                }
                observer.on_finish();
            });
            proxies.push(tx);
            handles.push(handle);
        }

        Self {
            inner: Arc::new(HubInner {
                proxies,
                handles: Mutex::new(handles),
            }),
        }
    }

    /// A hub with no observers.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(HubInner {
                proxies: Vec::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.proxies.is_empty()
    }

    pub fn notify(&self, event: FramePushed) {
        if self.inner.proxies.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for proxy in &self.inner.proxies {
            if proxy.send(ObserverMsg::Push(event.clone())).is_err() {
                tracing::trace!("observer proxy already closed");
            }
        }
    }

    /// Drains every observer queue and waits for the proxies to finish.
    pub async fn shutdown(&self) {
        for proxy in &self.inner.proxies {
            if proxy.send(ObserverMsg::Close).is_err() {
                tracing::trace!("observer proxy already closed");
            }
        }
        let handles: Vec<_> = {
            let mut guard = self
                .inner
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "observer task failed");
            }
        }
    }
}

/// Logs every frame push at debug level (audio at trace level).
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_push(&self, event: &FramePushed) {
        let arrow = match event.direction {
            Direction::Downstream => "→",
            Direction::Upstream => "←",
        };
        match event.frame.kind() {
            FrameKind::InputAudio | FrameKind::TtsAudio => tracing::trace!(
                source = %event.source,
                destination = %event.destination,
                "{} {}",
                arrow,
                event.frame
            ),
            _ => tracing::debug!(
                source = %event.source,
                destination = %event.destination,
                "{} {}",
                arrow,
                event.frame
            ),
        }
    }
}

/// Aggregated per-session metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    /// Number of frames that left each producing endpoint, per kind.
    pub frames: BTreeMap<FrameKind, u64>,
    /// Time-to-first-byte samples per processor.
    pub ttfb: BTreeMap<String, Vec<Duration>>,
    pub llm_usage: TokenUsage,
    pub tts_characters: usize,
}

/// Counts frames and collects metrics frames.
///
/// A frame is counted once per hop, so a frame that crosses four stages is
/// counted four times; metrics payloads are only taken from their first hop.
#[derive(Debug, Clone, Default)]
pub struct MetricsObserver {
    summary: Arc<Mutex<MetricsSummary>>,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> MetricsSummary {
        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Count of hops for one kind of frame.
    pub fn count(&self, kind: FrameKind) -> u64 {
        self.summary().frames.get(&kind).copied().unwrap_or(0)
    }
}

impl Observer for MetricsObserver {
    fn on_push(&self, event: &FramePushed) {
        let mut summary = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        *summary.frames.entry(event.frame.kind()).or_insert(0) += 1;

        if event.frame.producer() != &*event.source {
            return;
        }
        if let crate::frame::FrameData::ControlMeta(metrics) = event.frame.data() {
            match metrics {
                MetricsData::Ttfb { processor, value } => {
                    summary.ttfb.entry(processor.clone()).or_default().push(*value);
                }
                MetricsData::LlmUsage { usage, .. } => {
                    summary.llm_usage.prompt_tokens += usage.prompt_tokens;
                    summary.llm_usage.completion_tokens += usage.completion_tokens;
                }
                MetricsData::TtsUsage { characters, .. } => {
                    summary.tts_characters += characters;
                }
                MetricsData::Processing { .. } => {}
            }
        }
    }

    fn on_finish(&self) {
        let summary = self.summary();
        tracing::debug!(
            prompt_tokens = summary.llm_usage.prompt_tokens,
            completion_tokens = summary.llm_usage.completion_tokens,
            tts_characters = summary.tts_characters,
            "session metrics"
        );
    }
}

/// Wakes the task's idle timer whenever an activity frame moves.
pub(crate) struct ActivityObserver {
    notify: Arc<Notify>,
}

impl ActivityObserver {
    pub(crate) fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }
}

impl Observer for ActivityObserver {
    fn on_push(&self, event: &FramePushed) {
        if event.frame.is_activity() {
            self.notify.notify_one();
        }
    }
}
