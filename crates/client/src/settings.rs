use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::auth::StaticToken;
use crate::consumer::ResponseShape;
use crate::request::ProfileHint;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const SETTINGS_DIRECTORY_NAME: &str = "collegegpt";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "COLLEGEGPT_";

/// Free-text keys. `Env` would parse `12345` as a number, so these are read verbatim.
const TEXT_KEYS: [&str; 3] = ["base_url", "display_name", "access_token"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub response_shape: ResponseShape,
    /// Unset means wait for the response headers indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Unset means wait for each body chunk indefinitely.
    #[serde(default)]
    pub stream_idle_timeout_secs: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            display_name: None,
            access_token: None,
            response_shape: ResponseShape::default(),
            request_timeout_secs: None,
            stream_idle_timeout_secs: None,
        }
    }
}

impl ClientSettings {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".collegegpt"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Layers defaults, the JSON file at `path` (when present) and `COLLEGEGPT_*` variables.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).ignore(&TEXT_KEYS));
        for key in TEXT_KEYS {
            let variable = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&variable) {
                figment = figment.merge(Serialized::default(key, value));
            }
        }

        figment
            .extract::<Self>()
            .map(Self::normalized)
            .context(ExtractSnafu {
                stage: "extract-client-settings",
                path: path.to_path_buf(),
            })
    }

    pub fn load_default() -> Result<Self, SettingsError> {
        Self::load(&Self::default_config_path())
    }

    pub fn normalized(mut self) -> Self {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if self.base_url.is_empty() {
            self.base_url = default_base_url();
        }
        self.display_name = non_blank(self.display_name);
        self.access_token = non_blank(self.access_token);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.stream_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn profile_hint(&self) -> ProfileHint {
        ProfileHint::new(self.display_name.clone())
    }

    pub fn token_provider(&self) -> StaticToken {
        StaticToken::from_setting(self.access_token.as_deref())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to load settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
