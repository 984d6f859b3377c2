//! Configuration for the pharmaq command-line front end
//!
//! Loads configuration from:
//! 1. config.yaml - operational settings (database, models, pipeline, logging)
//! 2. .env file - secrets (API keys)
//!
//! Environment variables always override config.yaml values.

use pharmaq_core::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnvVar { var: &'static str, value: String },

    #[error(transparent)]
    Pipeline(#[from] pharmaq_core::config::ConfigError),
}

/// DuckDB database settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub read_only: bool,
    pub memory_limit_mb: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "drugcentral.duckdb".to_string(),
            pool_size: 4,
            acquire_timeout_ms: 5_000,
            read_only: true,
            memory_limit_mb: None,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            other => Err(format!("unknown provider `{}`", other)),
        }
    }
}

impl Provider {
    pub fn api_key_var(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

/// Language model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: Provider,

    /// Model for SQL generation (use best reasoning model)
    pub sql_model: Option<String>,

    /// Model for answer generation (use fast/cheap model)
    pub answer_model: Option<String>,

    /// Alternate endpoint, e.g. an OpenAI-compatible gateway
    pub api_base: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            sql_model: None,
            answer_model: None,
            api_base: None,
        }
    }
}

impl LlmConfig {
    pub fn sql_model(&self) -> &str {
        match (&self.sql_model, self.provider) {
            (Some(model), _) => model,
            (None, Provider::Anthropic) => "claude-sonnet-4-5",
            (None, Provider::OpenAi) => "gpt-4o",
        }
    }

    pub fn answer_model(&self) -> &str {
        match (&self.answer_model, self.provider) {
            (Some(model), _) => model,
            (None, Provider::Anthropic) => "claude-haiku-4-5",
            (None, Provider::OpenAi) => "gpt-4o-mini",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub path: String,
    /// Check the described views against the database before answering
    pub verify_on_startup: bool,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            path: "schema/drugcentral.yaml".to_string(),
            verify_on_startup: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub schema: SchemaConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_env()?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file falls back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env()?;
        config.pipeline.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var("PHARMAQ_DB_PATH") {
            self.database.path = path;
        }
        if let Some(size) = parse_env("PHARMAQ_POOL_SIZE")? {
            self.database.pool_size = size;
        }

        if let Ok(provider) = std::env::var("PHARMAQ_LLM_PROVIDER") {
            self.llm.provider = provider.parse().map_err(|_| ConfigError::InvalidEnvVar {
                var: "PHARMAQ_LLM_PROVIDER",
                value: provider,
            })?;
        }
        if let Ok(model) = std::env::var("PHARMAQ_SQL_MODEL") {
            self.llm.sql_model = Some(model);
        }
        if let Ok(model) = std::env::var("PHARMAQ_ANSWER_MODEL") {
            self.llm.answer_model = Some(model);
        }
        if let Ok(base) = std::env::var("PHARMAQ_LLM_API_BASE") {
            self.llm.api_base = Some(base);
        }

        if let Ok(path) = std::env::var("PHARMAQ_SCHEMA_PATH") {
            self.schema.path = path;
        }

        if let Some(n) = parse_env("PHARMAQ_MAX_ATTEMPTS")? {
            self.pipeline.max_attempts = n;
        }
        if let Some(n) = parse_env("PHARMAQ_MAX_ROWS")? {
            self.pipeline.max_rows = n;
        }
        if let Some(ms) = parse_env("PHARMAQ_STATEMENT_TIMEOUT_MS")? {
            self.pipeline.statement_timeout_ms = ms;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }

        Ok(())
    }

    /// API key for the configured provider (must be in the environment or .env)
    pub fn api_key(&self) -> Result<String, ConfigError> {
        let var = self.llm.provider.api_key_var();
        std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
    }

    /// Set logging environment variables for the logging module
    pub fn apply_logging_env(&self) {
        std::env::set_var("RUST_LOG", &self.logging.level);
        std::env::set_var("LOG_FORMAT", &self.logging.format);
        std::env::set_var("LOG_OUTPUT", &self.logging.output);
        std::env::set_var("LOG_DIR", &self.logging.directory);
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests touching process environment run one at a time
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.path, "drugcentral.duckdb");
        assert!(config.database.read_only);
        assert_eq!(config.llm.provider, Provider::Anthropic);
        assert_eq!(config.llm.sql_model(), "claude-sonnet-4-5");
        assert_eq!(config.llm.answer_model(), "claude-haiku-4-5");
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.logging.output, "stdout");
    }

    #[test]
    fn test_partial_yaml() {
        let _env = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
database:
  path: /data/drugcentral.duckdb
llm:
  provider: openai
pipeline:
  max_rows: 200
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database.path, "/data/drugcentral.duckdb");
        assert_eq!(config.database.pool_size, 4);
        assert_eq!(config.llm.provider, Provider::OpenAi);
        assert_eq!(config.llm.sql_model(), "gpt-4o");
        assert_eq!(config.pipeline.max_rows, 200);
        assert_eq!(config.pipeline.row_limit_ceiling, 1000);
    }

    #[test]
    fn test_env_var_override() {
        let _env = ENV_LOCK.lock().unwrap();
        std::env::set_var("PHARMAQ_POOL_SIZE", "8");
        std::env::set_var("PHARMAQ_SQL_MODEL", "claude-opus-4-1");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "database:\n  pool_size: 2\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database.pool_size, 8); // Overridden
        assert_eq!(config.llm.sql_model(), "claude-opus-4-1"); // Overridden

        std::env::remove_var("PHARMAQ_POOL_SIZE");
        std::env::remove_var("PHARMAQ_SQL_MODEL");
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let _env = ENV_LOCK.lock().unwrap();
        std::env::set_var("PHARMAQ_MAX_ATTEMPTS", "many");
        let err = Config::load_or_default("/nonexistent/config.yaml").unwrap_err();
        std::env::remove_var("PHARMAQ_MAX_ATTEMPTS");

        assert!(matches!(
            err,
            ConfigError::InvalidEnvVar { var: "PHARMAQ_MAX_ATTEMPTS", .. }
        ));
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let _env = ENV_LOCK.lock().unwrap();
        let path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config.yaml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.database, DatabaseConfig::default());
        assert_eq!(config.schema, SchemaConfig::default());
    }

    #[test]
    fn test_invalid_pipeline_settings_fail_load() {
        let _env = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "pipeline:\n  max_rows: 5000\n").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Pipeline(_))));
    }
}
