use std::sync::Arc;
use std::time::Duration;

mod provider;
mod rig_adapter;
mod scripted;

pub use provider::{
    BoxFuture, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped,
    StreamEventPayload, StreamRequest, StreamSessionId, make_event_stream,
};
pub use rig_adapter::{DEFAULT_GEMINI_MODEL, RIG_GEMINI_PROVIDER_ID, RigGeminiAdapter};
pub use scripted::{SCRIPTED_MODEL, SCRIPTED_PROVIDER_ID, ScriptStep, ScriptedProvider};

/// Word pacing used by the offline echo provider.
pub const ECHO_WORD_DELAY: Duration = Duration::from_millis(60);

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_GEMINI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "gemini" | "rig-gemini" | "google" => {
            config.provider_id = RIG_GEMINI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigGeminiAdapter::new(config)?))
        }
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(ScriptedProvider::echo(ECHO_WORD_DELAY))),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
