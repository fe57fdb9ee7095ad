//! Append-only conversation history.

use crate::llm::{Message, Role};

/// Ordered messages of one run. Messages can be appended but never removed
/// or edited, so every earlier state of the history is a prefix of the
/// current one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Content of the most recent user message.
    pub fn latest_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

impl From<Vec<Message>> for ConversationHistory {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

impl From<String> for ConversationHistory {
    fn from(input: String) -> Self {
        Self {
            messages: vec![Message::user(input)],
        }
    }
}

impl From<&str> for ConversationHistory {
    fn from(input: &str) -> Self {
        Self::from(input.to_string())
    }
}
