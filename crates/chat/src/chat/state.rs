use std::sync::Arc;

use tokio::sync::watch;

use super::message::{Conversation, Message, MessageStatus};

/// Fixed address of the in-flight assistant entry for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitTarget {
    pub generation: u64,
    pub index: usize,
}

/// Result of writing buffered text into the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// Text and status already matched; observers were not notified.
    Unchanged,
    /// The conversation was cleared after the target was issued.
    Stale,
}

/// Observable conversation plus busy flag.
///
/// Cloning is cheap and every clone refers to the same state. All writes go
/// through `watch` senders, so every mutation is published as a whole new
/// snapshot and observers never see a half-applied change.
#[derive(Debug, Clone)]
pub struct ConversationState {
    messages: Arc<watch::Sender<Conversation>>,
    loading: Arc<watch::Sender<bool>>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        let (messages, _) = watch::channel(Conversation::default());
        let (loading, _) = watch::channel(false);
        Self {
            messages: Arc::new(messages),
            loading: Arc::new(loading),
        }
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Conversation> {
        self.messages.subscribe()
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    pub fn snapshot(&self) -> Conversation {
        self.messages.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.borrow()
    }

    /// Raises the busy flag. Returns `false` when it was already raised.
    pub fn try_begin(&self) -> bool {
        self.loading.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        })
    }

    pub fn finish(&self) {
        self.loading.send_if_modified(|busy| std::mem::replace(busy, false));
    }

    /// Appends one message and returns its address.
    pub fn append(&self, message: Message) -> CommitTarget {
        let mut target = CommitTarget {
            generation: 0,
            index: 0,
        };
        self.messages.send_modify(|conversation| {
            let messages = Arc::make_mut(&mut conversation.messages);
            messages.push(message);
            target = CommitTarget {
                generation: conversation.generation,
                index: messages.len() - 1,
            };
        });
        target
    }

    /// Replaces the text and status at `target` with `text`.
    ///
    /// Always a full replace, never an append, so re-running a commit is harmless.
    pub fn commit(&self, target: CommitTarget, text: &str, status: MessageStatus) -> CommitOutcome {
        let mut outcome = CommitOutcome::Stale;
        self.messages.send_if_modified(|conversation| {
            if conversation.generation != target.generation {
                return false;
            }
            let Some(current) = conversation.messages.get(target.index) else {
                return false;
            };
            if current.text == text && current.status == status {
                outcome = CommitOutcome::Unchanged;
                return false;
            }

            let messages = Arc::make_mut(&mut conversation.messages);
            let message = &mut messages[target.index];
            message.text.clear();
            message.text.push_str(text);
            message.status = status;
            outcome = CommitOutcome::Applied;
            true
        });
        outcome
    }

    /// Empties the conversation and invalidates every outstanding target.
    pub fn clear(&self) {
        self.messages.send_modify(|conversation| {
            conversation.generation = conversation.generation.wrapping_add(1);
            conversation.messages = Arc::new(Vec::new());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_flag_can_only_be_raised_once() {
        let state = ConversationState::new();
        assert!(state.try_begin());
        assert!(!state.try_begin());
        state.finish();
        assert!(!state.is_loading());
        assert!(state.try_begin());
    }

    #[test]
    fn commit_replaces_text_in_place() {
        let state = ConversationState::new();
        state.append(Message::user("Hi"));
        let target = state.append(Message::placeholder());
        assert_eq!(target.index, 1);

        assert_eq!(
            state.commit(target, "Hel", MessageStatus::Streaming),
            CommitOutcome::Applied
        );
        assert_eq!(
            state.commit(target, "Hello!", MessageStatus::Streaming),
            CommitOutcome::Applied
        );
        assert_eq!(
            state.commit(target, "Hello!", MessageStatus::Streaming),
            CommitOutcome::Unchanged
        );

        let snapshot = state.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.messages[1].text, "Hello!");
        assert_eq!(snapshot.messages[0].text, "Hi");
    }

    #[test]
    fn snapshots_are_not_mutated_by_later_commits() {
        let state = ConversationState::new();
        let target = state.append(Message::placeholder());
        let before = state.snapshot();

        state.commit(target, "later", MessageStatus::Done);

        assert_eq!(before.messages[0].text, "");
        assert_eq!(state.snapshot().messages[0].text, "later");
    }

    #[test]
    fn commit_after_clear_is_stale() {
        let state = ConversationState::new();
        let target = state.append(Message::placeholder());
        state.clear();

        assert_eq!(
            state.commit(target, "late", MessageStatus::Done),
            CommitOutcome::Stale
        );
        assert!(state.snapshot().is_empty());

        // Same index in a fresh conversation must not be overwritten either.
        state.append(Message::user("new"));
        assert_eq!(
            state.commit(target, "late", MessageStatus::Done),
            CommitOutcome::Stale
        );
        assert_eq!(state.snapshot().messages[0].text, "new");
    }

    #[tokio::test]
    async fn every_mutation_notifies_observers() {
        let state = ConversationState::new();
        let mut messages = state.subscribe_messages();

        let target = state.append(Message::placeholder());
        assert!(messages.has_changed().expect("sender alive"));
        messages.borrow_and_update();

        state.commit(target, "text", MessageStatus::Streaming);
        assert!(messages.has_changed().expect("sender alive"));
        messages.borrow_and_update();

        state.commit(target, "text", MessageStatus::Streaming);
        assert!(!messages.has_changed().expect("sender alive"));

        state.clear();
        assert!(messages.has_changed().expect("sender alive"));
        assert!(messages.borrow_and_update().is_empty());
    }
}
