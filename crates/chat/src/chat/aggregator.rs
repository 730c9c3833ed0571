use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::OptionFuture;
use geminichat_llm::{
    LlmProvider, ProviderEventStream, ProviderMessage, StreamEventPayload, StreamRequest,
    StreamSessionId,
};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::message::{Conversation, Message, MessageStatus, NO_RESPONSE_TEXT, error_text};
use super::state::{CommitOutcome, CommitTarget, ConversationState};
use super::throttle::{FlushDecision, FlushPolicy, StreamBuffer};

pub const STREAM_CLOSED_EARLY: &str = "provider stream ended before a terminal event";
pub const SESSION_ABORTED: &str = "reply session aborted unexpectedly";

/// How replies are requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    #[default]
    Streaming,
    /// One request, one commit when the full reply arrives.
    Single,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub model_id: String,
    pub mode: ReplyMode,
    pub policy: FlushPolicy,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl AggregatorConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            mode: ReplyMode::default(),
            policy: FlushPolicy::default(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_mode(mut self, mode: ReplyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: FlushPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Result of [`ReplyAggregator::send_message`].
#[derive(Debug)]
pub enum SendOutcome {
    /// Blank input; nothing changed.
    Ignored,
    /// Another reply is still in flight; nothing changed.
    Busy,
    /// The turn was recorded and the reply task spawned.
    Started(JoinHandle<()>),
}

/// How a stream session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Terminal {
    Done,
    Failed(String),
    Cancelled,
}

struct ActiveStop {
    session_id: StreamSessionId,
    stop_tx: oneshot::Sender<()>,
}

type StopSlot = Arc<Mutex<Option<ActiveStop>>>;

/// Per-session context shared by both reply modes.
///
/// Dropping a session lowers the busy flag, however the session ends. A
/// session dropped before any terminal commit (a panic in the reply task, or
/// the task being aborted) resolves its entry to [`SESSION_ABORTED`] first.
struct Session {
    state: ConversationState,
    target: CommitTarget,
    session_id: StreamSessionId,
    stop_slot: StopSlot,
    settled: bool,
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.settled {
            tracing::error!(
                session_id = ?self.session_id,
                panicking = std::thread::panicking(),
                "reply session ended without a terminal commit"
            );
            self.commit(&error_text(SESSION_ABORTED), MessageStatus::Error);
        }

        let mut slot = self.stop_slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|active| active.session_id == self.session_id)
        {
            *slot = None;
        }
        drop(slot);

        self.state.finish();
    }
}

impl Session {
    fn commit(&self, text: &str, status: MessageStatus) {
        if self.state.commit(self.target, text, status) == CommitOutcome::Stale {
            tracing::debug!(
                session_id = ?self.session_id,
                index = self.target.index,
                "conversation was cleared; dropping commit"
            );
        }
    }

    fn finish(&mut self, terminal: Terminal, buffered: &str) {
        self.settled = true;
        match terminal {
            Terminal::Done => self.commit(buffered, MessageStatus::Done),
            Terminal::Cancelled => self.commit(buffered, MessageStatus::Cancelled),
            Terminal::Failed(message) => {
                tracing::warn!(
                    session_id = ?self.session_id,
                    error = %message,
                    buffered_len = buffered.len(),
                    "reply failed"
                );
                self.commit(&error_text(&message), MessageStatus::Error);
            }
        }
    }

    async fn consume_stream(
        &self,
        policy: FlushPolicy,
        mut stream: ProviderEventStream,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> (Terminal, String) {
        let mut buffer = StreamBuffer::new(policy, Instant::now());
        let mut stop_armed = true;

        let terminal = loop {
            let deferred = OptionFuture::from(buffer.pending_flush().map(sleep_until));

            tokio::select! {
                biased;
                stop = &mut stop_rx, if stop_armed => {
                    if stop.is_ok() {
                        stream.cancel();
                        break Terminal::Cancelled;
                    }
                    stop_armed = false;
                }
                event = stream.recv() => {
                    let Some(event) = event else {
                        break Terminal::Failed(STREAM_CLOSED_EARLY.to_string());
                    };
                    if event.session_id != self.session_id {
                        // Events from another session must never leak into this target.
                        tracing::warn!(
                            expected = ?self.session_id,
                            received = ?event.session_id,
                            "ignoring stream event for a different session"
                        );
                        continue;
                    }

                    match event.payload {
                        StreamEventPayload::Delta(delta) => {
                            let now = Instant::now();
                            if buffer.push(&delta, now) == FlushDecision::Now {
                                self.commit(buffer.text(), MessageStatus::Streaming);
                                buffer.mark_flushed(now);
                            }
                        }
                        StreamEventPayload::Done => break Terminal::Done,
                        StreamEventPayload::Error(message) => break Terminal::Failed(message),
                    }
                }
                Some(()) = deferred => {
                    self.commit(buffer.text(), MessageStatus::Streaming);
                    buffer.mark_flushed(Instant::now());
                }
            }
        };

        tracing::debug!(
            session_id = ?self.session_id,
            chunk_count = buffer.chunk_count(),
            text_len = buffer.text().len(),
            ?terminal,
            "stream session ended"
        );
        (terminal, buffer.text().to_string())
    }
}

/// Turns provider replies into throttled, ordered conversation updates.
pub struct ReplyAggregator {
    provider: Arc<dyn LlmProvider>,
    runtime: Handle,
    config: AggregatorConfig,
    state: ConversationState,
    next_session_id: AtomicU64,
    stop_slot: StopSlot,
}

impl ReplyAggregator {
    pub fn new(provider: Arc<dyn LlmProvider>, config: AggregatorConfig, runtime: Handle) -> Self {
        Self {
            provider,
            runtime,
            config,
            state: ConversationState::new(),
            next_session_id: AtomicU64::new(1),
            stop_slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn messages(&self) -> watch::Receiver<Conversation> {
        self.state.subscribe_messages()
    }

    pub fn is_loading(&self) -> watch::Receiver<bool> {
        self.state.subscribe_loading()
    }

    /// Records a user turn and starts the reply in the background.
    ///
    /// The user entry and the empty assistant placeholder are both in the
    /// conversation before this returns; the provider is only contacted from
    /// the spawned task.
    pub fn send_message(&self, user_text: &str) -> SendOutcome {
        if user_text.trim().is_empty() {
            tracing::debug!("ignoring blank message");
            return SendOutcome::Ignored;
        }

        if !self.state.try_begin() {
            // Single-stream rule: the placeholder index is only stable while one session runs.
            tracing::debug!("ignoring message while a reply is in flight");
            return SendOutcome::Busy;
        }

        let session_id = StreamSessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        self.state.append(Message::user(user_text));
        let history = self.state.snapshot().to_provider_messages();
        let target = self.state.append(Message::placeholder());
        let session = Session {
            state: self.state.clone(),
            target,
            session_id,
            stop_slot: Arc::clone(&self.stop_slot),
            settled: false,
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(ActiveStop {
            session_id,
            stop_tx,
        });

        let request = self.build_request(session_id, history);
        let provider = Arc::clone(&self.provider);
        let runtime = self.runtime.clone();
        let mode = self.config.mode;
        let policy = self.config.policy;

        tracing::debug!(
            session_id = ?session_id,
            provider_id = %provider.id(),
            model_id = %request.model_id,
            turn_count = request.messages.len(),
            target_index = target.index,
            ?mode,
            "starting reply session"
        );

        let task = self.runtime.spawn(async move {
            match mode {
                ReplyMode::Streaming => {
                    Self::run_streaming(session, provider, request, policy, stop_rx, runtime).await
                }
                ReplyMode::Single => Self::run_single(session, provider, request, stop_rx).await,
            }
        });

        SendOutcome::Started(task)
    }

    /// Empties the conversation. Commits from a session that is still running
    /// afterwards are dropped.
    pub fn clear_chat(&self) {
        if self.state.is_loading() {
            tracing::debug!("clearing conversation while a reply is in flight");
        }
        self.state.clear();
    }

    /// Stops the reply in flight, keeping whatever text was buffered.
    ///
    /// Returns `false` when nothing was running.
    pub fn stop_generation(&self) -> bool {
        let active = self
            .stop_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match active {
            Some(active) => {
                tracing::debug!(session_id = ?active.session_id, "stopping reply session");
                active.stop_tx.send(()).is_ok()
            }
            None => false,
        }
    }

    fn build_request(
        &self,
        session_id: StreamSessionId,
        history: Vec<ProviderMessage>,
    ) -> StreamRequest {
        let mut request = StreamRequest::new(session_id, self.config.model_id.clone(), history);
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    async fn run_streaming(
        mut session: Session,
        provider: Arc<dyn LlmProvider>,
        request: StreamRequest,
        policy: FlushPolicy,
        stop_rx: oneshot::Receiver<()>,
        runtime: Handle,
    ) {
        let handle = match provider.stream_chat(request) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::error!(
                    session_id = ?session.session_id,
                    provider_id = %provider.id(),
                    error = %error,
                    "failed to open reply stream"
                );
                session.finish(Terminal::Failed(error.to_string()), "");
                return;
            }
        };

        tracing::debug!(
            session_id = ?session.session_id,
            stream_session_id = ?handle.stream.session_id(),
            "reply stream opened"
        );
        runtime.spawn(handle.worker);
        let (terminal, buffered) = session.consume_stream(policy, handle.stream, stop_rx).await;
        session.finish(terminal, &buffered);
    }

    async fn run_single(
        mut session: Session,
        provider: Arc<dyn LlmProvider>,
        request: StreamRequest,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut stop_armed = true;
        let completion = provider.complete(request);
        tokio::pin!(completion);

        let result = loop {
            tokio::select! {
                biased;
                stop = &mut stop_rx, if stop_armed => {
                    if stop.is_ok() {
                        session.finish(Terminal::Cancelled, "");
                        return;
                    }
                    stop_armed = false;
                }
                result = &mut completion => break result,
            }
        };

        match result {
            Ok(Some(text)) => session.finish(Terminal::Done, &text),
            Ok(None) => session.finish(Terminal::Done, NO_RESPONSE_TEXT),
            Err(error) => session.finish(Terminal::Failed(error.to_string()), ""),
        }
    }
}
