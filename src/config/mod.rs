//! Configuration reading and data directory paths.

pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::controller::ControllerOptions;
use crate::tutor::live::{DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_VOICE};
use crate::tutor::{Language, LiveConfig, DEFAULT_CONTEXT_CHAR_LIMIT};

use paths::get_data_dir;

/// Environment variables consulted for the API key, highest priority first.
const API_KEY_ENV: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// tutor_config.json shape. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TutorConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice_name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
    #[serde(default)]
    pub output_volume: Option<f32>,
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default)]
    pub context_char_limit: Option<usize>,
    /// 0 disables the handshake timeout.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl TutorConfig {
    /// Let the environment supply or override the API key.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in API_KEY_ENV {
            if let Some(key) = lookup(name).filter(|k| !k.trim().is_empty()) {
                debug!(var = name, "API key taken from environment");
                self.api_key = Some(key);
                return;
            }
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    pub fn language(&self) -> Language {
        self.language.unwrap_or_default()
    }

    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            api_key: self.api_key.clone(),
            model: non_empty(&self.model).unwrap_or(DEFAULT_MODEL).to_string(),
            voice_name: non_empty(&self.voice_name).unwrap_or(DEFAULT_VOICE).to_string(),
            endpoint: non_empty(&self.endpoint).unwrap_or(DEFAULT_ENDPOINT).to_string(),
            context_char_limit: self
                .context_char_limit
                .unwrap_or(DEFAULT_CONTEXT_CHAR_LIMIT),
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        let secs = self
            .connect_timeout_secs
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        ControllerOptions {
            connect_timeout: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Read tutor_config.json from the data directory, then apply env overrides.
pub fn load_config() -> TutorConfig {
    let mut config: TutorConfig = read_json_file(&get_config_path()).unwrap_or_default();
    config.apply_env(|name| std::env::var(name).ok());
    config
}

/// Path to tutor_config.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("tutor_config.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                warn!("No config at {}, using defaults", path.display());
            } else {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
