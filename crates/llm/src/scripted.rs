use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::provider::{
    BoxFuture, LlmProvider, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEventMapped, StreamRequest, StreamSessionId, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "echo";
pub const SCRIPTED_MODEL: &str = "echo";

/// One step replayed by [`ScriptedProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Delta { text: String, delay: Duration },
    Fail { message: String, delay: Duration },
}

impl ScriptStep {
    pub fn delta(text: impl Into<String>, delay: Duration) -> Self {
        Self::Delta {
            text: text.into(),
            delay,
        }
    }

    pub fn fail(message: impl Into<String>, delay: Duration) -> Self {
        Self::Fail {
            message: message.into(),
            delay,
        }
    }
}

#[derive(Debug, Clone)]
enum Script {
    Fixed(Vec<ScriptStep>),
    /// Repeats the latest user turn one word per step.
    Echo { delay: Duration },
}

/// Offline provider that replays deltas with fixed pacing.
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    script: Script,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Script::Fixed(steps),
        }
    }

    pub fn echo(delay: Duration) -> Self {
        Self {
            script: Script::Echo { delay },
        }
    }

    fn steps_for(&self, request: &StreamRequest) -> Vec<ScriptStep> {
        match &self.script {
            Script::Fixed(steps) => steps.clone(),
            Script::Echo { delay } => {
                let text = request.last_user_text().unwrap_or_default();
                text.split_inclusive(char::is_whitespace)
                    .map(|word| ScriptStep::delta(word, *delay))
                    .collect()
            }
        }
    }

    async fn run_stream_worker(
        session_id: StreamSessionId,
        steps: Vec<ScriptStep>,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in steps {
            let (delay, event) = match step {
                ScriptStep::Delta { text, delay } => {
                    (delay, StreamEventMapped::delta(session_id, text))
                }
                ScriptStep::Fail { message, delay } => {
                    (delay, StreamEventMapped::error(session_id, message))
                }
            };

            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(session_id = ?session_id, "scripted stream cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let terminal = event.is_terminal();
            if event_tx.send(event).is_err() || terminal {
                return;
            }
        }

        let _ = event_tx.send(StreamEventMapped::done(session_id));
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn default_model(&self) -> &str {
        SCRIPTED_MODEL
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let steps = self.steps_for(&request);
        let (event_tx, stream, cancel_rx) = make_event_stream(request.session_id);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            request.session_id,
            steps,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }

    fn complete<'a>(
        &'a self,
        request: StreamRequest,
    ) -> BoxFuture<'a, ProviderResult<Option<String>>> {
        let steps = self.steps_for(&request);
        Box::pin(async move {
            let mut text = String::new();
            for step in steps {
                match step {
                    ScriptStep::Delta { text: delta, delay } => {
                        tokio::time::sleep(delay).await;
                        text.push_str(&delta);
                    }
                    ScriptStep::Fail { message, delay } => {
                        tokio::time::sleep(delay).await;
                        return Err(ProviderError::Scripted {
                            stage: "scripted-complete",
                            message,
                        });
                    }
                }
            }

            Ok(if text.is_empty() { None } else { Some(text) })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderMessage, StreamEventPayload};

    fn request(text: &str) -> StreamRequest {
        StreamRequest::new(
            StreamSessionId::new(9),
            SCRIPTED_MODEL,
            vec![ProviderMessage::user(text)],
        )
    }

    async fn drain(provider: &ScriptedProvider, text: &str) -> Vec<StreamEventPayload> {
        let handle = provider.stream_chat(request(text)).expect("scripted stream opens");
        let mut stream = handle.stream;
        tokio::spawn(handle.worker);

        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            assert_eq!(event.session_id, StreamSessionId::new(9));
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test(start_paused = true)]
    async fn echo_replays_last_user_turn_word_by_word() {
        let provider = ScriptedProvider::echo(Duration::from_millis(20));
        let payloads = drain(&provider, "hello brave world").await;

        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("hello ".into()),
                StreamEventPayload::Delta("brave ".into()),
                StreamEventPayload::Delta("world".into()),
                StreamEventPayload::Done,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_step_ends_stream_without_done() {
        let provider = ScriptedProvider::new(vec![
            ScriptStep::delta("Hel", Duration::ZERO),
            ScriptStep::fail("network down", Duration::from_millis(5)),
            ScriptStep::delta("never", Duration::ZERO),
        ]);
        let payloads = drain(&provider, "ignored").await;

        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("Hel".into()),
                StreamEventPayload::Error("network down".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn complete_concatenates_or_reports_nothing() {
        let provider = ScriptedProvider::echo(Duration::from_millis(1));
        assert_eq!(
            provider.complete(request("a b")).await.expect("no failure"),
            Some("a b".to_string())
        );
        assert_eq!(provider.complete(request("")).await.expect("no failure"), None);
    }
}
