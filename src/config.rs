use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

/// A configured synthetic occupant. Immutable after load; the core only ever
/// reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Skin reference, opaque to the core; handed through to the presence
    /// protocol as-is.
    pub texture: String,
    pub signature: String,
    #[serde(default = "default_personality")]
    pub personality: String,
    #[serde(default = "default_text_style", rename = "text-style")]
    pub text_style: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_personality() -> String {
    "cynical".to_string()
}

fn default_text_style() -> String {
    "perfect".to_string()
}

fn default_model() -> String {
    "deepseek/deepseek-r1-distill-llama-70b:free".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Occupancy budget: the advertised capacity real + fake counts are
    /// measured against.
    #[serde(default = "default_max_players")]
    pub max_players: usize,

    #[serde(default)]
    pub enable_chat: bool,

    // Completion provider (OpenAI-compatible chat completions)
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,

    /// Models tried in order when an occupant's preferred model is disabled.
    #[serde(default = "default_fallback_models")]
    pub fallback_models: Vec<String>,

    /// Disclaimer/refusal markers, matched case-insensitively. Best-effort
    /// and model-version sensitive, hence configurable.
    #[serde(default = "default_refusal_phrases")]
    pub refusal_phrases: Vec<String>,

    #[serde(default = "default_occupants")]
    pub occupants: BTreeMap<String, Identity>,
}

fn default_max_players() -> usize {
    69
}

fn default_api_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_fallback_models() -> Vec<String> {
    vec![
        "deepseek/deepseek-r1-distill-llama-70b:free".to_string(),
        // Not free, but the free usage cap is the usual reason we get here.
        "meta-llama/llama-3.2-3b-instruct".to_string(),
    ]
}

fn default_refusal_phrases() -> Vec<String> {
    [
        "i cannot generate a response",
        "i cannot provide",
        "i cannot generate",
        "i cannot comply",
        "i refuse to",
        "i cannot do that",
        "as an ai",
        "is there anything else i can help you with",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_occupants() -> BTreeMap<String, Identity> {
    let mut occupants = BTreeMap::new();
    occupants.insert(
        "Steve".to_string(),
        Identity {
            texture: "defaultTexture".to_string(),
            signature: "defaultSignature".to_string(),
            personality: "caustic".to_string(),
            text_style: default_text_style(),
            model: default_model(),
        },
    );
    occupants
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_players: default_max_players(),
            enable_chat: false,
            api_url: default_api_url(),
            api_key: String::new(),
            fallback_models: default_fallback_models(),
            refusal_phrases: default_refusal_phrases(),
            occupants: default_occupants(),
        }
    }
}

impl Config {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("throng_config.toml")
    }

    /// Load config from throng_config.toml, falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(budget) = env::var("THRONG_MAX_PLAYERS") {
            if let Ok(value) = budget.parse() {
                config.max_players = value;
            }
        }

        if let Ok(enabled) = env::var("THRONG_ENABLE_CHAT") {
            let enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
            config.enable_chat = enabled;
        }

        if let Ok(url) = env::var("THRONG_API_URL") {
            config.api_url = url;
        }

        if let Ok(key) = env::var("THRONG_API_KEY") {
            config.api_key = key;
        }

        config
    }
}
