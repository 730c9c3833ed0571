use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use geminichat_llm::ProviderMessage;

/// Prefix applied to provider failures rendered into the transcript.
pub const ERROR_PREFIX: &str = "Error: ";
/// Text committed when a single-shot completion returns nothing.
pub const NO_RESPONSE_TEXT: &str = "No response";

/// Lifecycle status for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Still receiving stream deltas.
    Streaming,
    Done,
    Cancelled,
    Error,
}

/// One chat entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub from_user: bool,
    /// Creation time in unix milliseconds.
    pub timestamp: i64,
    pub status: MessageStatus,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from_user: true,
            timestamp: now_millis(),
            status: MessageStatus::Done,
        }
    }

    /// Creates the empty assistant entry that stream commits overwrite.
    pub fn placeholder() -> Self {
        Self {
            text: String::new(),
            from_user: false,
            timestamp: now_millis(),
            status: MessageStatus::Streaming,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == MessageStatus::Streaming
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        if self.from_user {
            ProviderMessage::user(self.text.clone())
        } else {
            ProviderMessage::model(self.text.clone())
        }
    }
}

/// Formats a provider failure the way it is shown in the transcript.
pub fn error_text(message: &str) -> String {
    format!("{ERROR_PREFIX}{message}")
}

/// Immutable conversation snapshot published to observers.
///
/// `generation` changes every time the conversation is cleared, so commits
/// aimed at an older generation can be recognised as stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub generation: u64,
    pub messages: Arc<Vec<Message>>,
}

impl Conversation {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Full history as role-tagged turns in chronological order.
    pub fn to_provider_messages(&self) -> Vec<ProviderMessage> {
        self.iter().map(Message::to_provider_message).collect()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
