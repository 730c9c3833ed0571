use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use geminichat_llm::{ProviderConfig, RIG_GEMINI_PROVIDER_ID};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{
    AggregatorConfig, FLUSH_CHUNK_THRESHOLD, FLUSH_INTERVAL_MS, FlushPolicy, ReplyMode,
};

pub const SETTINGS_DIRECTORY_NAME: &str = "geminichat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "GEMINICHAT_";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushSettings {
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            chunk_threshold: default_chunk_threshold(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl FlushSettings {
    pub fn policy(&self) -> FlushPolicy {
        FlushPolicy::new(self.chunk_threshold, Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Overrides the provider base URL when non-empty.
    #[serde(default)]
    pub endpoint: String,
    /// Empty selects the provider's default model.
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    #[serde(default)]
    pub flush: FlushSettings,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: String::new(),
            model: String::new(),
            streaming: default_streaming(),
            flush: FlushSettings::default(),
            max_tokens: None,
            temperature: None,
        }
    }
}

impl ChatSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
    }

    pub fn reply_mode(&self) -> ReplyMode {
        if self.streaming {
            ReplyMode::Streaming
        } else {
            ReplyMode::Single
        }
    }

    pub fn aggregator_config(&self, default_model: &str) -> AggregatorConfig {
        let model_id = if self.model.is_empty() {
            default_model
        } else {
            self.model.as_str()
        };
        let mut config = AggregatorConfig::new(model_id)
            .with_mode(self.reply_mode())
            .with_policy(self.flush.policy());
        config.temperature = self.temperature;
        config.max_tokens = self.max_tokens;
        config
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model = self.model.trim().to_string();
        self.flush.chunk_threshold = self.flush.chunk_threshold.max(1);

        self
    }

    /// Falls back to `GEMINI_API_KEY` when no key was configured.
    fn with_env_credential(mut self) -> Self {
        if self.api_key.trim().is_empty()
            && let Some(key) = std::env::var(API_KEY_ENV)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        {
            self.api_key = key;
        }
        self
    }
}

pub struct SettingsStore {
    settings: ChatSettings,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".geminichat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings,
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Defaults, then the JSON file when given, then `GEMINICHAT_*` variables.
    fn layered(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if let Some(path) = file {
            figment = figment.merge(Json::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        let file = if path.exists() {
            Some(path)
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
            None
        };

        let settings = match Self::layered(file).extract::<ChatSettings>() {
            Ok(settings) => settings,
            Err(error) if file.is_some() => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults and environment",
                    path,
                    error
                );
                Self::layered(None)
                    .extract::<ChatSettings>()
                    .unwrap_or_else(|error| {
                        tracing::warn!("failed to parse settings environment: {}. using defaults", error);
                        ChatSettings::default()
                    })
            }
            Err(error) => {
                tracing::warn!("failed to parse settings environment: {}. using defaults", error);
                ChatSettings::default()
            }
        };

        settings.with_env_credential().normalized()
    }

    /// Writes default settings, refusing to replace an existing file.
    pub fn init_defaults(&mut self) -> Result<(), SettingsError> {
        if self.config_path.exists() {
            return AlreadyExistsSnafu {
                stage: "init-default-settings",
                path: self.config_path.clone(),
            }
            .fail();
        }
        self.save(ChatSettings::default())
    }

    /// Writes `settings` atomically and makes them current.
    pub fn save(&mut self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings = normalized_settings;
        Ok(())
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("settings file already exists at {path:?}; not overwriting on `{stage}`"))]
    AlreadyExists { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_provider_id() -> String {
    RIG_GEMINI_PROVIDER_ID.to_string()
}

fn default_streaming() -> bool {
    true
}

fn default_chunk_threshold() -> u32 {
    FLUSH_CHUNK_THRESHOLD
}

fn default_interval_ms() -> u64 {
    FLUSH_INTERVAL_MS
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use geminichat_llm::DEFAULT_GEMINI_MODEL;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let store = SettingsStore::new(jail.directory().join("absent.json"));
            let settings = store.settings();

            assert_eq!(settings.provider_id, RIG_GEMINI_PROVIDER_ID);
            assert!(settings.model.is_empty());
            assert_eq!(
                settings.aggregator_config(DEFAULT_GEMINI_MODEL).model_id,
                DEFAULT_GEMINI_MODEL
            );
            assert!(settings.streaming);
            assert_eq!(settings.flush, FlushSettings::default());
            assert!(settings.api_key.is_empty());
            Ok(())
        });
    }

    #[test]
    fn file_then_environment_layers_apply() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "settings.json",
                r#"{ "model": " gemini-2.5-pro ", "streaming": false, "flush": { "chunk_threshold": 0 } }"#,
            )?;
            jail.set_env("GEMINICHAT_FLUSH__INTERVAL_MS", "40");
            jail.set_env(API_KEY_ENV, "  from-env ");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();

            assert_eq!(settings.model, "gemini-2.5-pro");
            assert_eq!(settings.reply_mode(), ReplyMode::Single);
            assert_eq!(settings.flush.chunk_threshold, 1);
            assert_eq!(settings.flush.interval_ms, 40);
            assert_eq!(settings.api_key, "from-env");

            let config = settings.aggregator_config(DEFAULT_GEMINI_MODEL);
            assert_eq!(config.model_id, "gemini-2.5-pro");
            assert_eq!(config.policy.interval(), Duration::from_millis(40));
            assert_eq!(config.mode, ReplyMode::Single);
            Ok(())
        });
    }

    #[test]
    fn configured_key_wins_over_environment() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("settings.json", r#"{ "api_key": "from-file" }"#)?;
            jail.set_env(API_KEY_ENV, "from-env");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(store.settings().api_key, "from-file");
            Ok(())
        });
    }

    #[test]
    fn unparseable_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("settings.json", r#"{ "streaming": "sometimes" }"#)?;

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(store.settings(), &ChatSettings::default());
            Ok(())
        });
    }

    #[test]
    fn unparseable_file_keeps_environment_overrides() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("settings.json", r#"{ "streaming": "sometimes" }"#)?;
            jail.set_env("GEMINICHAT_PROVIDER_ID", "echo");
            jail.set_env("GEMINICHAT_MODEL", "gemini-2.5-pro");
            jail.set_env(API_KEY_ENV, "from-env");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();

            assert_eq!(settings.provider_id, "echo");
            assert_eq!(settings.model, "gemini-2.5-pro");
            assert_eq!(settings.api_key, "from-env");
            assert!(settings.streaming);
            Ok(())
        });
    }

    #[test]
    fn init_refuses_to_overwrite_existing_file() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let existing = r#"{ "api_key": "keep-me" }"#;
            jail.create_file("settings.json", existing)?;
            let path = jail.directory().join("settings.json");
            let mut store = SettingsStore::new(path.clone());

            let error = store.init_defaults().expect_err("existing file is kept");
            assert!(matches!(error, SettingsError::AlreadyExists { .. }));
            assert_eq!(std::fs::read_to_string(&path).expect("file readable"), existing);
            assert_eq!(store.settings().api_key, "keep-me");
            Ok(())
        });
    }

    #[test]
    fn init_writes_defaults_when_absent() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let path = jail.directory().join("fresh").join("settings.json");
            let mut store = SettingsStore::new(path.clone());

            store.init_defaults().expect("defaults written");
            assert!(path.exists());
            assert_eq!(SettingsStore::new(path).settings(), &ChatSettings::default());
            Ok(())
        });
    }

    #[test]
    fn save_round_trips_through_disk() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let path = jail.directory().join("nested").join("settings.json");
            let mut store = SettingsStore::new(path.clone());

            let settings = ChatSettings {
                provider_id: "echo".into(),
                max_tokens: Some(256),
                ..ChatSettings::default()
            };
            store.save(settings.clone()).expect("settings persist");

            assert!(path.exists());
            assert!(!path.with_extension("json.tmp").exists());
            assert_eq!(SettingsStore::new(path).settings(), &settings);
            Ok(())
        });
    }
}
