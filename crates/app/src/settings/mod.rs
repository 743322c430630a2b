pub mod state;

pub use state::{
    DEFAULT_BASE_URL, MemoryPreferences, Preferences, PreferencesProvider, SettingsError,
    SettingsStore, keys,
};
