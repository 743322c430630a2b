use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chatline_llm::{BackendConfig, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "chatline";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
/// Environment variables with this prefix override the settings file, e.g. `CHATLINE_BASE_URL`.
pub const SETTINGS_ENV_PREFIX: &str = "CHATLINE_";

/// Well-known preference keys, as written to the settings file.
pub mod keys {
    pub const SELECTED_MODEL: &str = "selected_model";
    pub const MAX_TOKENS: &str = "max_tokens";
    pub const TEMPERATURE: &str = "temperature";
    pub const BASE_URL: &str = "base_url";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REQUEST_TIMEOUT_SECS: &str = "request_timeout_secs";
}

const MAX_TEMPERATURE: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default = "default_model")]
    pub selected_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Whole-request deadline for backend calls, streaming included. Unset means none.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            selected_model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            base_url: default_base_url(),
            access_token: None,
            request_timeout_secs: None,
        }
    }
}

impl Preferences {
    pub fn normalized(mut self) -> Self {
        self.selected_model = self.selected_model.trim().to_string();
        if self.selected_model.is_empty() {
            self.selected_model = default_model();
        }
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        if !self.temperature.is_finite() {
            self.temperature = default_temperature();
        }
        self.temperature = self.temperature.clamp(0.0, MAX_TEMPERATURE);
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if self.base_url.is_empty() {
            self.base_url = default_base_url();
        }
        self.access_token = self
            .access_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        self.request_timeout_secs = self.request_timeout_secs.filter(|secs| *secs > 0);
        self
    }

    pub fn is_signed_in(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn to_backend_config(&self) -> BackendConfig {
        let config = BackendConfig::new(&self.base_url, self.access_token.clone());
        match self.request_timeout_secs {
            Some(secs) => config.with_request_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }
}

/// Injected key-value preference store.
///
/// Sessions read it once when constructed and write through on every change.
pub trait PreferencesProvider: Send + Sync {
    fn load(&self) -> Arc<Preferences>;
    fn save(&self, preferences: Preferences) -> Result<(), SettingsError>;
}

/// Preferences persisted as JSON in the user's config directory.
pub struct SettingsStore {
    preferences: Arc<ArcSwap<Preferences>>,
    config_path: PathBuf,
}

impl SettingsStore {
    /// Per-user config directory, or `.chatline` in the working directory when the
    /// platform has none.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chatline"))
    }

    /// `settings.json` inside [`Self::default_config_dir`].
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads preferences from `config_path` layered over defaults and `CHATLINE_*`
    /// environment overrides.
    ///
    /// A missing or unparsable file never fails; defaults are used instead and
    /// the file is only created on the first save.
    pub fn new(config_path: PathBuf) -> Self {
        let preferences = Self::load_from_disk(&config_path);
        Self {
            preferences: Arc::new(ArcSwap::from_pointee(preferences)),
            config_path,
        }
    }

    /// Opens the store at [`Self::default_config_path`].
    pub fn open_default() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Path that saves are written to.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn load_from_disk(path: &Path) -> Preferences {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(Preferences::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<Preferences>() {
            Ok(preferences) => preferences.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Preferences::default()
            }
        }
    }

    /// Writes to a sibling temp file and renames it over the settings file.
    fn persist(&self, preferences: &Preferences) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(preferences).context(SerializeConfigSnafu {
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

impl PreferencesProvider for SettingsStore {
    fn load(&self) -> Arc<Preferences> {
        self.preferences.load_full()
    }

    fn save(&self, preferences: Preferences) -> Result<(), SettingsError> {
        let normalized = preferences.normalized();
        self.persist(&normalized)?;
        self.preferences.store(Arc::new(normalized));
        Ok(())
    }
}

/// Process-local preferences for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryPreferences {
    preferences: ArcSwap<Preferences>,
}

impl MemoryPreferences {
    pub fn new(preferences: Preferences) -> Self {
        Self {
            preferences: ArcSwap::from_pointee(preferences.normalized()),
        }
    }
}

impl PreferencesProvider for MemoryPreferences {
    fn load(&self) -> Arc<Preferences> {
        self.preferences.load_full()
    }

    fn save(&self, preferences: Preferences) -> Result<(), SettingsError> {
        self.preferences.store(Arc::new(preferences.normalized()));
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
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

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
