use std::process::ExitCode;

use geminichat::app;
use geminichat::chat::ReplyAggregator;
use geminichat::settings::SettingsStore;
use geminichat_llm::create_provider;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so they never interleave with the streamed transcript.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut store = SettingsStore::load();

    if std::env::args().skip(1).any(|arg| arg == "--init") {
        return match store.init_defaults() {
            Ok(()) => {
                println!("wrote default settings to {}", store.config_path().display());
                ExitCode::SUCCESS
            }
            Err(error) => {
                eprintln!("{error}");
                ExitCode::FAILURE
            }
        };
    }

    let settings = store.settings().clone();
    let provider = match create_provider(settings.to_provider_config()) {
        Ok(provider) => provider,
        Err(error) => {
            tracing::error!("failed to initialize provider: {error}");
            eprintln!(
                "Provider error: {error}. Set GEMINI_API_KEY, or provider_id = \"echo\" in {}",
                store.config_path().display()
            );
            return ExitCode::FAILURE;
        }
    };

    let config = settings.aggregator_config(provider.default_model());
    tracing::info!(
        provider_id = %provider.id(),
        model_id = %config.model_id,
        streaming = settings.streaming,
        "starting chat"
    );

    let aggregator = ReplyAggregator::new(provider, config, Handle::current());
    match app::run(aggregator).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}
