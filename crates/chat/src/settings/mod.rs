pub mod state;

pub use state::{
    API_KEY_ENV, ChatSettings, ENV_PREFIX, FlushSettings, SettingsError, SettingsStore,
};
