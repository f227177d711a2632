//! Conversation history shared by the two context aggregators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        f.write_str(s)
    }
}

/// A complete conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Append-only ordered message history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    messages: Vec<Message>,
}

impl ConversationContext {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Read-only copy of the history as it is right now.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot(self.messages.iter().cloned().collect())
    }
}

/// Immutable view of the context handed to the LLM for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot(Arc<[Message]>);

impl ContextSnapshot {
    pub fn messages(&self) -> &[Message] {
        &self.0
    }
}

impl Deref for ContextSnapshot {
    type Target = [Message];

    fn deref(&self) -> &[Message] {
        &self.0
    }
}

impl From<Vec<Message>> for ContextSnapshot {
    fn from(messages: Vec<Message>) -> Self {
        Self(messages.into())
    }
}

/// Session-scoped handle on the conversation context.
///
/// Only the user and assistant aggregators write through it, and only one of
/// them acts at a time; the lock is never held across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    inner: Arc<Mutex<ConversationContext>>,
}

impl SharedContext {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConversationContext::new(messages))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConversationContext> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, message: Message) {
        self.lock().push(message);
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.lock().snapshot()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages().to_vec()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
