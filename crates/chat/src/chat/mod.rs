/// Streaming reply aggregation: buffering, throttled commits, completion and failure.
pub mod aggregator;
/// Chat entries and conversation snapshots.
pub mod message;
/// Observable conversation state and the commit protocol.
pub mod state;
pub mod throttle;

pub use aggregator::{
    AggregatorConfig, ReplyAggregator, ReplyMode, SESSION_ABORTED, STREAM_CLOSED_EARLY, SendOutcome,
};
pub use message::{
    Conversation, ERROR_PREFIX, Message, MessageStatus, NO_RESPONSE_TEXT, error_text,
};
pub use state::{CommitOutcome, CommitTarget, ConversationState};
pub use throttle::{
    FLUSH_CHUNK_THRESHOLD, FLUSH_INTERVAL_MS, FlushDecision, FlushPolicy, StreamBuffer,
};
