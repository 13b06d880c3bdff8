use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use murmur_llm::{DEFAULT_GEMINI_MODEL, ProviderConfig, RIG_GEMINI_PROVIDER_ID};

pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DEFAULT_DATABASE_FILE_NAME: &str = "murmur.db";

pub const API_KEY_ENVIRONMENT_VARIABLE: &str = "GEMINI_API_KEY";
pub const MODEL_ENVIRONMENT_VARIABLE: &str = "GEMINI_MODEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// SQLite file location; resolved under the data directory when unset.
    #[serde(default)]
    pub database_path: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            model_name: default_model_name(),
            database_path: None,
        }
    }
}

impl AppSettings {
    fn normalized(mut self) -> Self {
        self.provider_id = self.provider_id.trim().to_string();
        if self.provider_id.is_empty() {
            self.provider_id = default_provider_id();
        }

        self.api_key = self.api_key.trim().to_string();

        self.model_name = self.model_name.trim().to_string();
        if self.model_name.is_empty() {
            self.model_name = default_model_name();
        }

        self.database_path = self
            .database_path
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty());

        self
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            Some(self.model_name.clone()),
        ))
    }

    /// Resolves the SQLite location, defaulting to the per-user data
    /// directory when no explicit path is configured.
    pub fn database_location(&self) -> String {
        if let Some(path) = &self.database_path {
            return path.clone();
        }

        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join(SETTINGS_DIRECTORY_NAME)
            .join(DEFAULT_DATABASE_FILE_NAME)
            .display()
            .to_string()
    }
}

/// Builds a provider config from environment variables.
///
/// Used as a fallback when the settings file is absent or carries no key,
/// so a freshly-checked-out workspace still talks to the provider.
pub fn environment_provider_config() -> Option<ProviderConfig> {
    let api_key = std::env::var(API_KEY_ENVIRONMENT_VARIABLE)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let model_name = std::env::var(MODEL_ENVIRONMENT_VARIABLE)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());

    Some(ProviderConfig::new(
        RIG_GEMINI_PROVIDER_ID,
        api_key,
        Some(model_name),
    ))
}

/// Live settings handle with atomic on-disk persistence.
#[derive(Debug)]
pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join(SETTINGS_DIRECTORY_NAME).join(SETTINGS_FILE_NAME)
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &PathBuf) -> AppSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
            return AppSettings::default();
        }

        let figment =
            Figment::from(Serialized::defaults(AppSettings::default())).merge(Json::file(path));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
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

fn default_model_name() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}
