#![deny(unsafe_code)]

/// Terminal front end over the reply aggregator.
pub mod app;
/// Conversation state and the streaming reply aggregator.
pub mod chat;
/// Layered settings (defaults, JSON file, environment).
pub mod settings;

pub use chat::{ReplyAggregator, SendOutcome};
