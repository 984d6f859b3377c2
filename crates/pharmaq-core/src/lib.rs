//! pharmaq - natural-language questions over the DrugCentral views
//!
//! The crate implements the query-translation pipeline: a language model turns
//! a question into SQL, a deterministic guard vets that SQL, DuckDB runs it in a
//! rolled-back transaction, and a second model call turns the rows into prose.

pub mod config;
pub mod error;
pub mod executor;
pub mod formatter;
pub mod guard;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod schema;
pub mod translator;

#[doc(hidden)]
pub use tracing;

pub use config::PipelineConfig;
pub use error::{
    ExecutionError, ExecutionErrorKind, FailureKind, FormattingError, GuardViolation,
    PipelineFailed, TranslationError,
};
pub use executor::{DuckExecutor, QueryExecutor};
pub use guard::{AcceptedSql, GuardVerdict, LimitCorrection, SqlGuard};
pub use llm::{AnthropicModel, LanguageModel, OpenAiModel, ScriptedModel};
pub use metrics::PipelineMetrics;
pub use model::{Answer, CandidateSql, QueryRequest, QueryResult, TokenUsage};
pub use pipeline::QueryPipeline;
pub use pool::ConnectionPool;
pub use schema::{SchemaContext, SchemaDescriptor, SchemaError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::executor::{DuckExecutor, QueryExecutor};
    pub use crate::formatter::ResultFormatter;
    pub use crate::guard::{GuardVerdict, SqlGuard};
    pub use crate::llm::LanguageModel;
    pub use crate::pipeline::QueryPipeline;
    pub use crate::pool::ConnectionPool;
    pub use crate::schema::SchemaContext;
    pub use crate::translator::Translator;
}
