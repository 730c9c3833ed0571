use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::message::AssistantContent;
use rig::prelude::CompletionClient;
use rig::providers::gemini;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped, StreamRequest,
    StreamSessionId, make_event_stream,
};

pub const RIG_GEMINI_PROVIDER_ID: &str = "gemini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

pub struct RigGeminiAdapter {
    config: ProviderConfig,
}

impl RigGeminiAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    /// Converts history into rig turns and splits off the prompt.
    ///
    /// Blank turns are dropped here because the API rejects empty parts; an
    /// empty placeholder from an earlier reply would otherwise fail the request.
    fn split_prompt(
        request: &StreamRequest,
        stage: &'static str,
    ) -> ProviderResult<(RigMessage, Vec<RigMessage>)> {
        let mut messages = request
            .messages
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                session_id = ?request.session_id,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot build request because no non-empty turns remain"
            );
            return EmptyMessageSetSnafu {
                stage,
                session_id: request.session_id,
            }
            .fail();
        };

        Ok((prompt, messages))
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Model => RigMessage::assistant(message.content.clone()),
        }
    }

    fn completion_text(choice: impl IntoIterator<Item = AssistantContent>) -> Option<String> {
        let text = choice
            .into_iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<String>();

        if text.is_empty() { None } else { Some(text) }
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        session_id: StreamSessionId,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped::error(session_id, error.to_string()));
    }

    fn map_stream_item<R>(
        session_id: StreamSessionId,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventMapped::delta(session_id, text.text))
            }
            // Reasoning and tool traffic never reaches the visible transcript.
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let session_id = request.session_id;
        let opened = async {
            let client = Self::build_client(&config)?;
            let model = client.completion_model(request.model_id.clone());
            let (prompt, history) = Self::split_prompt(&request, "open-stream-split-prompt")?;

            let mut builder = model.completion_request(prompt).messages(history);
            if let Some(temperature) = request.temperature {
                builder = builder.temperature(temperature);
            }
            if let Some(max_tokens) = request.max_tokens {
                builder = builder.max_tokens(max_tokens);
            }

            builder.stream().await.context(CompletionsFailedSnafu {
                stage: "open-stream",
            })
        };

        let mut stream = match opened.await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    session_id = ?session_id,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, session_id, error);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(session_id = ?session_id, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(session_id, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                session_id = ?session_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, session_id, error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(StreamEventMapped::done(session_id));
    }
}

impl LlmProvider for RigGeminiAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn default_model(&self) -> &str {
        DEFAULT_GEMINI_MODEL
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                session_id: request.session_id,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.session_id);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }

    fn complete<'a>(
        &'a self,
        request: StreamRequest,
    ) -> BoxFuture<'a, ProviderResult<Option<String>>> {
        Box::pin(async move {
            let client = Self::build_client(&self.config)?;
            let model = client.completion_model(request.model_id.clone());
            let (prompt, history) = Self::split_prompt(&request, "complete-split-prompt")?;

            let mut builder = model.completion_request(prompt).messages(history);
            if let Some(temperature) = request.temperature {
                builder = builder.temperature(temperature);
            }
            if let Some(max_tokens) = request.max_tokens {
                builder = builder.max_tokens(max_tokens);
            }

            let response = builder.send().await.context(CompletionsFailedSnafu {
                stage: "complete",
            })?;

            Ok(Self::completion_text(response.choice))
        })
    }
}
