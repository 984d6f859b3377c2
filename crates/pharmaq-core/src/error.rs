//! Error taxonomy for the query pipeline
//!
//! Component errors carry enough detail for logs and for the translator's
//! retry prompt. Only [`PipelineFailed`] is meant for the caller, and its
//! `reason` is always one of the fixed sentences in [`FailureKind::reason`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    /// The model call failed or timed out; retrying may succeed
    #[error("translation failed (transient): {0}")]
    Transient(String),

    /// The model answered, but not with anything usable as SQL
    #[error("translation failed (malformed): {0}")]
    Malformed(String),
}

impl TranslationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TranslationError::Transient(_))
    }
}

/// Why the guard refused a candidate statement
///
/// The `Display` text is sent back to the model on the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("multi-statement: found {count} statements, only a single SELECT is allowed")]
    MultiStatement { count: usize },

    #[error("write-operation: `{keyword}` is not allowed, only read-only SELECT queries may run")]
    WriteOperation { keyword: String },

    #[error("unknown-object: `{name}` is not one of the available views")]
    UnknownObject { name: String },

    #[error("none-of-the-above: {detail}")]
    Other { detail: String },
}

impl GuardViolation {
    pub fn code(&self) -> &'static str {
        match self {
            GuardViolation::MultiStatement { .. } => "multi-statement",
            GuardViolation::WriteOperation { .. } => "write-operation",
            GuardViolation::UnknownObject { .. } => "unknown-object",
            GuardViolation::Other { .. } => "none-of-the-above",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionErrorKind {
    /// Parser, binder or other query-level errors; a better query may fix it
    Syntax,
    Timeout,
    Permission,
    Connection,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionErrorKind::Syntax => "syntax",
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::Permission => "permission",
            ExecutionErrorKind::Connection => "connection",
        };
        f.write_str(s)
    }
}

/// Failure while running accepted SQL
///
/// `detail` may hold raw database text. It goes to logs and to the
/// translator, never to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution failed ({kind}): {detail}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub detail: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn syntax(detail: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Syntax, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Timeout, detail)
    }

    pub fn permission(detail: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Permission, detail)
    }

    pub fn connection(detail: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Connection, detail)
    }

    /// Only query-level errors are worth another translation attempt
    pub fn is_retryable(&self) -> bool {
        self.kind == ExecutionErrorKind::Syntax
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormattingError {
    #[error("formatting failed (transient): {0}")]
    Transient(String),

    #[error("formatting failed (malformed): {0}")]
    Malformed(String),
}

/// Terminal failure categories reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    InvalidQuestion,
    TranslationTransient,
    TranslationMalformed,
    MultiStatement,
    WriteOperation,
    UnknownObject,
    GuardOther,
    Syntax,
    Timeout,
    Permission,
    Connection,
    Cancelled,
}

impl FailureKind {
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::InvalidQuestion => "invalid-question",
            FailureKind::TranslationTransient => "translation-transient",
            FailureKind::TranslationMalformed => "translation-malformed",
            FailureKind::MultiStatement => "multi-statement",
            FailureKind::WriteOperation => "write-operation",
            FailureKind::UnknownObject => "unknown-object",
            FailureKind::GuardOther => "none-of-the-above",
            FailureKind::Syntax => "syntax",
            FailureKind::Timeout => "timeout",
            FailureKind::Permission => "permission",
            FailureKind::Connection => "connection",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Caller-facing sentence; never includes database or provider text
    pub fn reason(&self) -> &'static str {
        match self {
            FailureKind::InvalidQuestion => "Please enter a shorter, non-empty question.",
            FailureKind::TranslationTransient => {
                "The AI service is currently unavailable. Please try again in a moment."
            }
            FailureKind::TranslationMalformed => {
                "The AI service did not return a usable query. Please try rephrasing your question."
            }
            FailureKind::MultiStatement => {
                "Query rejected for security reasons. Only a single SELECT statement is allowed."
            }
            FailureKind::WriteOperation => {
                "Query rejected for security reasons. Only SELECT queries are allowed."
            }
            FailureKind::UnknownObject => {
                "Query rejected because it referenced data outside the available drug views."
            }
            FailureKind::GuardOther => {
                "Unable to produce a valid query. Please try rephrasing your question."
            }
            FailureKind::Syntax => {
                "Unable to execute query. Please try rephrasing your question."
            }
            FailureKind::Timeout => {
                "Your query took too long to execute. Try asking a more specific question."
            }
            FailureKind::Permission => "The database refused to run this query.",
            FailureKind::Connection => "Database connection error. Please try again.",
            FailureKind::Cancelled => "The request was cancelled before an answer was ready.",
        }
    }
}

impl From<&GuardViolation> for FailureKind {
    fn from(violation: &GuardViolation) -> Self {
        match violation {
            GuardViolation::MultiStatement { .. } => FailureKind::MultiStatement,
            GuardViolation::WriteOperation { .. } => FailureKind::WriteOperation,
            GuardViolation::UnknownObject { .. } => FailureKind::UnknownObject,
            GuardViolation::Other { .. } => FailureKind::GuardOther,
        }
    }
}

impl From<&TranslationError> for FailureKind {
    fn from(err: &TranslationError) -> Self {
        match err {
            TranslationError::Transient(_) => FailureKind::TranslationTransient,
            TranslationError::Malformed(_) => FailureKind::TranslationMalformed,
        }
    }
}

impl From<&ExecutionError> for FailureKind {
    fn from(err: &ExecutionError) -> Self {
        match err.kind {
            ExecutionErrorKind::Syntax => FailureKind::Syntax,
            ExecutionErrorKind::Timeout => FailureKind::Timeout,
            ExecutionErrorKind::Permission => FailureKind::Permission,
            ExecutionErrorKind::Connection => FailureKind::Connection,
        }
    }
}

/// Structured terminal failure of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{reason} ({attempts} attempt(s), {})", kind.code())]
pub struct PipelineFailed {
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
    /// Last SQL the translator proposed, kept for diagnosis
    pub last_sql: Option<String>,
}

impl PipelineFailed {
    pub fn new(kind: FailureKind, attempts: u32, last_sql: Option<String>) -> Self {
        Self {
            kind,
            reason: kind.reason().to_string(),
            attempts,
            last_sql,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_codes() {
        let v = GuardViolation::WriteOperation {
            keyword: "delete".to_string(),
        };
        assert_eq!(v.code(), "write-operation");
        assert!(v.to_string().contains("`delete`"));
        assert_eq!(FailureKind::from(&v), FailureKind::WriteOperation);
    }

    #[test]
    fn test_only_syntax_errors_retry() {
        assert!(ExecutionError::syntax("Binder Error").is_retryable());
        assert!(!ExecutionError::timeout("interrupted").is_retryable());
        assert!(!ExecutionError::connection("io").is_retryable());
        assert!(!ExecutionError::permission("read-only").is_retryable());
    }

    #[test]
    fn test_failure_reason_hides_detail() {
        let err =
            ExecutionError::syntax("Catalog Error: Table with name secret_table does not exist!");
        let failed = PipelineFailed::new(FailureKind::from(&err), 3, None);
        assert!(!failed.reason.contains("secret_table"));
        assert_eq!(failed.kind.code(), "syntax");
    }
}
