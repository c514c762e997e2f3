//! Shared graph state and the append reducer

use crate::conversation::{Conversation, Message};

/// State threaded through every node of a graph run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphState {
    pub messages: Conversation,
}

impl GraphState {
    pub fn new(messages: Conversation) -> Self {
        Self { messages }
    }

    /// Merge a node's partial update. Messages are only ever appended.
    pub fn apply(&mut self, update: StateUpdate) {
        self.messages.extend(update.messages);
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn into_conversation(self) -> Conversation {
        self.messages
    }
}

/// Partial state returned by a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<Message>,
}

impl StateUpdate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn message(message: Message) -> Self {
        Self {
            messages: vec![message],
        }
    }

    pub fn messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}
