use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub exam: ExamSettings,
}

/// Token-budget scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Reset values strictly below this are relative seconds, anything at or
    /// above it is an absolute epoch-millisecond timestamp.
    pub reset_threshold: i64,
    /// Window assumed when the provider sends a quota without a reset value.
    pub default_reset_secs: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reset_threshold: 300_000,
            default_reset_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_size: usize,
    pub max_retries: u32,
    pub ttl_secs: u64,
    pub storage_key: String,
    /// Payload field used to collapse writes targeting the same record.
    pub identity_field: String,
    pub sync_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_retries: 5,
            ttl_secs: 7 * 24 * 60 * 60,
            storage_key: "offline_quiz_queue".to_string(),
            identity_field: "record_id".to_string(),
            sync_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_structured_retries: u32,
    pub max_revision_rounds: u32,
    pub max_revision_retries: u32,
    pub system_prompt_prefix: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            api_key: None,
            provider: "cerebras".to_string(),
            model: "llama-3.3-70b".to_string(),
            temperature: 0.1,
            max_structured_retries: 2,
            max_revision_rounds: 2,
            max_revision_retries: 2,
            system_prompt_prefix: None,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExamSettings {
    pub default_total: u32,
}

impl Default for ExamSettings {
    fn default() -> Self {
        Self { default_total: 20 }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then the crate-local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env_name = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        let mongo_uri = env::var("MONGO_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017/assessment".to_string());
        let redis_uri =
            env::var("REDIS_URI").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let mongo_database = env::var("MONGO_DATABASE").unwrap_or_else(|_| "assessment".to_string());
        let generator_url = env::var("GENERATOR_API_URL")
            .unwrap_or_else(|_| GenerationSettings::default().api_url);

        // config/*.toml, then APP__ overrides; plain env vars act as defaults
        let settings = config::Config::builder()
            .set_default("mongo_uri", mongo_uri)?
            .set_default("redis_uri", redis_uri)?
            .set_default("mongo_database", mongo_database)?
            .set_default("generation.api_url", generator_url)?
            .add_source(config::File::with_name(&format!("config/{}", env_name)).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
