//! Context aggregators: the two stages that own writes to the conversation.

pub mod assistant;
pub mod user;

pub use assistant::AssistantContextAggregator;
pub use user::{UserContextAggregator, join_fragments};

use crate::context::SharedContext;

/// User and assistant aggregators bound to the same conversation.
#[derive(Debug, Clone)]
pub struct ContextAggregatorPair {
    context: SharedContext,
}

impl ContextAggregatorPair {
    pub fn new(context: SharedContext) -> Self {
        Self { context }
    }

    /// Stage placed after speech-to-text.
    pub fn user(&self) -> UserContextAggregator {
        UserContextAggregator::new(self.context.clone())
    }

    /// Stage placed after transport output.
    pub fn assistant(&self) -> AssistantContextAggregator {
        AssistantContextAggregator::new(self.context.clone())
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }
}
