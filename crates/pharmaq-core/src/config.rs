//! Pipeline settings consumed by the core
//!
//! Durations are stored as milliseconds so the YAML stays flat; the accessors
//! hand out [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid pipeline setting `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest LIMIT the guard lets through; missing limits are set to this
    pub row_limit_ceiling: u64,

    /// Rows kept by the executor; anything beyond marks the result truncated
    pub max_rows: usize,

    pub statement_timeout_ms: u64,

    /// Translate/guard/execute rounds before giving up
    pub max_attempts: u32,

    /// Per-call timeout for every language-model request
    pub llm_timeout_ms: u64,

    /// Whole-invocation deadline
    pub request_deadline_ms: u64,

    /// Base delay before retrying a transient translation failure; doubles per attempt
    pub retry_backoff_ms: u64,

    /// Rows embedded in the formatter prompt
    pub prompt_rows: usize,

    pub max_question_chars: usize,

    pub sql_max_tokens: u32,

    pub answer_max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            row_limit_ceiling: 1000,
            max_rows: 500,
            statement_timeout_ms: 10_000,
            max_attempts: 3,
            llm_timeout_ms: 30_000,
            request_deadline_ms: 60_000,
            retry_backoff_ms: 250,
            prompt_rows: 20,
            max_question_chars: 500,
            sql_max_tokens: 2048,
            answer_max_tokens: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1 << shift))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.max_rows == 0 {
            return Err(invalid("max_rows", "must be at least 1"));
        }
        // The executor needs one row past its cap to notice truncation.
        if self.max_rows as u64 >= self.row_limit_ceiling {
            return Err(invalid(
                "max_rows",
                format!(
                    "must be below row_limit_ceiling ({}), got {}",
                    self.row_limit_ceiling, self.max_rows
                ),
            ));
        }
        for (field, value) in [
            ("statement_timeout_ms", self.statement_timeout_ms),
            ("llm_timeout_ms", self.llm_timeout_ms),
            ("request_deadline_ms", self.request_deadline_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.max_question_chars == 0 {
            return Err(invalid("max_question_chars", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}
