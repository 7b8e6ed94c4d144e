use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // LLM configuration (OpenAI-compatible: LM Studio, Ollama, vLLM, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Generation budgets
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    // Generation lane
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    // Context assembly
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,

    // Long-term memory
    #[serde(default = "default_consolidation_interval")]
    pub consolidation_interval: u32,
    #[serde(default = "default_memory_enabled")]
    pub memory_enabled_default: bool,

    // Persistence
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Telegram transport
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub telegram_allowed_chat_id: Option<i64>,
    #[serde(default = "default_poll_timeout_secs")]
    pub telegram_poll_timeout_secs: u64,
}

fn default_llm_url() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_llm_model() -> String {
    "local-model".to_string()
}

fn default_max_response_tokens() -> u32 {
    512
}

fn default_request_timeout_secs() -> u64 {
    90
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    2
}

fn default_queue_capacity() -> usize {
    32
}

fn default_max_history_messages() -> usize {
    40
}

fn default_consolidation_interval() -> u32 {
    15
}

fn default_memory_enabled() -> bool {
    true
}

fn default_database_path() -> String {
    "reverie_memory.db".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            max_response_tokens: default_max_response_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            queue_capacity: default_queue_capacity(),
            max_history_messages: default_max_history_messages(),
            consolidation_interval: default_consolidation_interval(),
            memory_enabled_default: default_memory_enabled(),
            database_path: default_database_path(),
            telegram_bot_token: None,
            telegram_allowed_chat_id: None,
            telegram_poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl BotConfig {
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

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("reverie_config.toml")
    }

    /// Load config from reverie_config.toml (next to executable), falling
    /// back to environment variables and defaults.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<BotConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
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

    /// Build a config purely from environment variables and defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment overrides on top of whatever was loaded.
    ///
    /// Secrets (bot token, API key) are expected from the environment even
    /// when a config file exists, so the file can be checked in safely.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            self.llm_api_key = Some(key);
        }

        if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram_bot_token = Some(token.trim().to_string());
            }
        }

        if let Ok(chat_id) = env::var("TELEGRAM_CHAT_ID") {
            if let Ok(parsed) = chat_id.trim().parse() {
                self.telegram_allowed_chat_id = Some(parsed);
            }
        }

        if let Ok(path) = env::var("REVERIE_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(capacity) = env::var("REVERIE_QUEUE_CAPACITY") {
            if let Ok(parsed) = capacity.parse() {
                self.queue_capacity = parsed;
            }
        }

        if let Ok(interval) = env::var("REVERIE_CONSOLIDATION_INTERVAL") {
            if let Ok(parsed) = interval.parse() {
                self.consolidation_interval = parsed;
            }
        }

        if let Ok(enabled) = env::var("REVERIE_MEMORY_DEFAULT") {
            let enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
            self.memory_enabled_default = enabled;
        }

        self
    }
}
