//! Transport boundary: the stages that move frames in and out of a session,
//! plus client connection events.

pub mod local;

pub use local::{ClientHandle, LocalTransport, Outbound};

use crate::pipeline::Stage;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Client connection events a transport reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportEventKind {
    ClientConnected,
    ClientDisconnected,
}

impl fmt::Display for TransportEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientConnected => write!(f, "client connected"),
            Self::ClientDisconnected => write!(f, "client disconnected"),
        }
    }
}

/// The remote participant an event refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: String,
}

pub type EventCallback = Box<dyn Fn(&ClientInfo) + Send + Sync>;

type HandlerTable = BTreeMap<TransportEventKind, Vec<(u64, Arc<EventCallback>)>>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HandlerTable,
}

/// Subscription table for transport events.
///
/// Callbacks run synchronously on the transport's input task, in
/// registration order.
#[derive(Clone, Default)]
pub struct EventHandlers {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        let counts: BTreeMap<_, _> = registry
            .handlers
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("EventHandlers")
            .field("handlers", &counts)
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `kind`. The callback stays registered until
    /// [`Subscription::unsubscribe`] is called.
    pub fn on(
        &self,
        kind: TransportEventKind,
        callback: impl Fn(&ClientInfo) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(Box::new(callback) as EventCallback)));
        Subscription {
            handlers: self.clone(),
            kind,
            id,
        }
    }

    /// Runs every callback registered for `kind`.
    pub fn dispatch(&self, kind: TransportEventKind, client: &ClientInfo) {
        // Callbacks may subscribe or unsubscribe; do not call them under the lock.
        let callbacks: Vec<Arc<EventCallback>> = self
            .lock()
            .handlers
            .get(&kind)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        tracing::debug!(event = %kind, client = %client.id, handlers = callbacks.len(), "transport event");
        for callback in callbacks {
            callback(client);
        }
    }

    pub fn count(&self, kind: TransportEventKind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration handle returned by [`EventHandlers::on`].
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    handlers: EventHandlers,
    kind: TransportEventKind,
    id: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    /// Removes the callback; later events no longer reach it.
    pub fn unsubscribe(self) {
        let mut registry = self.handlers.lock();
        if let Some(list) = registry.handlers.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

/// A source and sink of session frames.
pub trait Transport {
    /// Stage placed at the head of the pipeline.
    fn input(&self) -> Box<dyn Stage>;

    /// Stage placed after TTS, delivering bot output to the client.
    fn output(&self) -> Box<dyn Stage>;

    /// Connection event subscriptions.
    fn events(&self) -> &EventHandlers;
}
