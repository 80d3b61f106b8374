use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use quill_llm::{DEFAULT_OLLAMA_BASE_URL, Model, ProviderConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u64 = 2_000;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You're a friendly assistant delivering clear, concise answers. \
Keep replies brief and use tables where they help.";
pub const SETTINGS_DIRECTORY_NAME: &str = "quill";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "QUILL_";

/// Base URL used when a provider entry leaves `api_base` blank.
pub fn default_api_base(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "https://api.openai.com/v1",
        ProviderKind::Groq => "https://api.groq.com/openai/v1",
        ProviderKind::Together => "https://api.together.xyz/v1",
        ProviderKind::Fireworks => "https://api.fireworks.ai/inference/v1",
        ProviderKind::Ollama => DEFAULT_OLLAMA_BASE_URL,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub available_models: Vec<Model>,
    #[serde(default)]
    pub custom_models: Vec<Model>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            id: DEFAULT_PROVIDER_ID.to_string(),
            name: "OpenAI Default".to_string(),
            kind: ProviderKind::OpenAi,
            api_key: String::new(),
            api_base: default_api_base(ProviderKind::OpenAi).to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            available_models: Vec::new(),
            custom_models: Vec::new(),
        }
    }
}

impl ProviderSettings {
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            api_base: default_api_base(kind).to_string(),
            system_prompt: String::new(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_models(mut self, models: Vec<Model>) -> Self {
        self.available_models = models;
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.kind.requires_api_key() || !self.api_key.trim().is_empty()
    }

    /// True when the model is in the fetched or the user-added list.
    pub fn offers_model(&self, model_id: &str) -> bool {
        self.available_models
            .iter()
            .chain(self.custom_models.iter())
            .any(|model| model.id == model_id)
    }

    /// Returns `None` when the provider needs a key and has none.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if !self.has_credentials() {
            return None;
        }

        let config = ProviderConfig::new(&self.id, self.kind, &self.api_key, &self.api_base);
        Some(if self.timeout_ms > 0 {
            config.with_request_timeout(Duration::from_millis(self.timeout_ms))
        } else {
            config
        })
    }

    fn normalized(mut self) -> Option<Self> {
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            return None;
        }

        self.name = if self.name.trim().is_empty() {
            self.id.clone()
        } else {
            self.name.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.api_base = if self.api_base.trim().is_empty() {
            default_api_base(self.kind).to_string()
        } else {
            self.api_base.trim().to_string()
        };
        self.available_models.retain(|model| !model.id.trim().is_empty());
        self.custom_models.retain(|model| !model.id.trim().is_empty());

        Some(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSettings {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderSettings>,
    #[serde(default)]
    pub default_provider_id: Option<String>,
    #[serde(default)]
    pub default_chat_model_id: Option<String>,
    #[serde(default)]
    pub conversation: ConversationSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            default_provider_id: Some(DEFAULT_PROVIDER_ID.to_string()),
            default_chat_model_id: None,
            conversation: ConversationSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn provider(&self, provider_id: &str) -> Option<&ProviderSettings> {
        self.providers
            .iter()
            .find(|provider| provider.id == provider_id)
    }

    /// The first provider listing `model_id`.
    pub fn provider_for_model(&self, model_id: &str) -> Option<&ProviderSettings> {
        self.providers
            .iter()
            .find(|provider| provider.offers_model(model_id))
    }

    pub fn default_provider(&self) -> Option<&ProviderSettings> {
        self.default_provider_id
            .as_deref()
            .and_then(|provider_id| self.provider(provider_id))
    }

    pub fn history_limit(&self) -> usize {
        self.conversation.history_limit
    }

    pub fn normalized(mut self) -> Self {
        let mut providers: Vec<ProviderSettings> = Vec::with_capacity(self.providers.len());
        for provider in self.providers.into_iter().filter_map(ProviderSettings::normalized) {
            // First entry wins on duplicate ids.
            if providers.iter().all(|existing| existing.id != provider.id) {
                providers.push(provider);
            }
        }
        self.providers = providers;

        self.default_chat_model_id = normalize_optional(self.default_chat_model_id);
        self.default_provider_id = normalize_optional(self.default_provider_id)
            .filter(|provider_id| self.providers.iter().any(|p| &p.id == provider_id))
            .or_else(|| self.providers.first().map(|provider| provider.id.clone()));
        self.conversation.history_limit = self.conversation.history_limit.max(1);

        self
    }
}

/// Read side of the settings used by the dispatcher.
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> Arc<AppSettings>;
}

impl SettingsSource for ArcSwap<AppSettings> {
    fn snapshot(&self) -> Arc<AppSettings> {
        self.load_full()
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".quill"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

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

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    /// Shared handle for components that only read settings.
    pub fn source(&self) -> Arc<ArcSwap<AppSettings>> {
        self.settings.clone()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    %error,
                    "failed to parse settings, using defaults"
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
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

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

impl SettingsSource for SettingsStore {
    fn snapshot(&self) -> Arc<AppSettings> {
        self.settings()
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

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_providers() -> Vec<ProviderSettings> {
    vec![ProviderSettings::default()]
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}
