//! Orchestration of translate, guard, execute and format
//!
//! One call to [`QueryPipeline::answer`] walks an explicit state machine:
//!
//! ```text
//! Translating -> Guarding -> Executing -> Formatting -> Done
//!      ^            |            |
//!      |            v            v
//!      +-------- Retrying <------+        (up to max_attempts)
//! ```
//!
//! Executor timeouts, permission and connection errors fail immediately. A
//! formatter failure still yields an answer, just without prose.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::{ConfigError, PipelineConfig};
use crate::error::{
    ExecutionError, FailureKind, GuardViolation, PipelineFailed, TranslationError,
};
use crate::executor::QueryExecutor;
use crate::formatter::ResultFormatter;
use crate::guard::{AcceptedSql, GuardVerdict, SqlGuard};
use crate::llm::LanguageModel;
use crate::log_event;
use crate::metrics::PipelineMetrics;
use crate::model::{Answer, CandidateSql, QueryRequest, QueryResult, TokenUsage};
use crate::schema::SchemaContext;
use crate::translator::Translator;

pub struct QueryPipeline {
    schema: Arc<SchemaContext>,
    translator: Translator,
    guard: SqlGuard,
    executor: Arc<dyn QueryExecutor>,
    formatter: ResultFormatter,
    config: PipelineConfig,
    metrics: Option<PipelineMetrics>,
}

enum State {
    Translating { attempt: u32, feedback: Option<String> },
    Guarding { candidate: CandidateSql },
    Executing { accepted: AcceptedSql },
    Formatting { accepted: AcceptedSql, result: QueryResult },
    Retrying { attempt: u32, failure: AttemptFailure },
    Done(Answer),
    Failed(PipelineFailed),
}

/// Why one attempt did not produce rows
enum AttemptFailure {
    Translation(TranslationError),
    Rejected(GuardViolation),
    Execution(ExecutionError),
}

impl AttemptFailure {
    fn kind(&self) -> FailureKind {
        match self {
            AttemptFailure::Translation(e) => e.into(),
            AttemptFailure::Rejected(v) => v.into(),
            AttemptFailure::Execution(e) => e.into(),
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, AttemptFailure::Translation(e) if e.is_transient())
    }

    /// Text shown to the model on the next attempt
    fn feedback(&self) -> Option<String> {
        match self {
            AttemptFailure::Translation(TranslationError::Transient(_)) => None,
            AttemptFailure::Translation(TranslationError::Malformed(_)) => {
                Some("the reply did not contain a SQL query".to_string())
            }
            AttemptFailure::Rejected(violation) => Some(violation.to_string()),
            AttemptFailure::Execution(err) => {
                Some(format!("the database reported an error: {}", err.detail))
            }
        }
    }
}

/// What the caller gets back if the deadline fires mid-flight
#[derive(Default)]
struct Progress {
    attempts: AtomicU32,
    last_sql: Mutex<Option<String>>,
}

impl Progress {
    fn set_attempt(&self, attempt: u32) {
        self.attempts.store(attempt, Ordering::SeqCst);
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn set_sql(&self, sql: &str) {
        if let Ok(mut last) = self.last_sql.lock() {
            *last = Some(sql.to_string());
        }
    }

    fn last_sql(&self) -> Option<String> {
        self.last_sql.lock().ok().and_then(|s| s.clone())
    }
}

impl QueryPipeline {
    pub fn new(
        schema: Arc<SchemaContext>,
        sql_model: Arc<dyn LanguageModel>,
        answer_model: Arc<dyn LanguageModel>,
        executor: Arc<dyn QueryExecutor>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let translator = Translator::new(
            sql_model,
            config.sql_max_tokens,
            config.llm_timeout(),
            config.row_limit_ceiling,
        );
        let formatter = ResultFormatter::new(
            answer_model,
            config.answer_max_tokens,
            config.llm_timeout(),
            config.prompt_rows,
        );

        Ok(Self {
            schema,
            translator,
            guard: SqlGuard::new(config.row_limit_ceiling),
            executor,
            formatter,
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn answer(
        &self,
        question: &str,
        prior_context: Option<&str>,
    ) -> Result<Answer, PipelineFailed> {
        let mut request = QueryRequest::new(question);
        request.prior_context = prior_context.map(str::to_string);
        self.answer_request(request).await
    }

    #[tracing::instrument(name = "answer", skip_all, fields(request_id = %request.id))]
    pub async fn answer_request(&self, request: QueryRequest) -> Result<Answer, PipelineFailed> {
        let outcome = match self.validate(&request) {
            Err(failed) => Err(failed),
            Ok(()) => {
                let progress = Progress::default();
                let deadline = self.config.request_deadline();
                match tokio::time::timeout(deadline, self.run(&request, &progress)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::warn!(
                            deadline_ms = self.config.request_deadline_ms,
                            attempts = progress.attempts(),
                            "Request deadline reached, cancelling"
                        );
                        Err(PipelineFailed::new(
                            FailureKind::Cancelled,
                            progress.attempts(),
                            progress.last_sql(),
                        ))
                    }
                }
            }
        };

        self.record(&outcome);
        outcome
    }

    fn validate(&self, request: &QueryRequest) -> Result<(), PipelineFailed> {
        let chars = request.question.trim().chars().count();
        if chars == 0 || chars > self.config.max_question_chars {
            let mut failed = PipelineFailed::new(FailureKind::InvalidQuestion, 0, None);
            failed.reason = format!(
                "Please enter a question between 1 and {} characters.",
                self.config.max_question_chars
            );
            return Err(failed);
        }
        Ok(())
    }

    async fn run(
        &self,
        request: &QueryRequest,
        progress: &Progress,
    ) -> Result<Answer, PipelineFailed> {
        let mut usage = TokenUsage::default();
        let mut state = State::Translating {
            attempt: 1,
            feedback: None,
        };

        loop {
            state = match state {
                State::Translating { attempt, feedback } => {
                    progress.set_attempt(attempt);
                    match self
                        .translator
                        .translate(request, &self.schema, attempt, feedback.as_deref())
                        .await
                    {
                        Ok(candidate) => {
                            usage.add(candidate.usage);
                            progress.set_sql(&candidate.sql);
                            tracing::debug!(attempt, sql = %candidate.sql, "Candidate SQL");
                            State::Guarding { candidate }
                        }
                        Err(err) => {
                            tracing::warn!(attempt, error = %err, "Translation failed");
                            State::Retrying {
                                attempt,
                                failure: AttemptFailure::Translation(err),
                            }
                        }
                    }
                }

                State::Guarding { candidate } => match self.guard.check(&candidate, &self.schema) {
                    GuardVerdict::Accepted(accepted) => {
                        if accepted.sql() != candidate.sql {
                            progress.set_sql(accepted.sql());
                        }
                        State::Executing { accepted }
                    }
                    GuardVerdict::Rejected(violation) => {
                        log_event!(
                            level: tracing::Level::WARN,
                            event: "sql_rejected",
                            reason: violation.code(),
                            attempt: candidate.attempt
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_rejection(violation.code());
                        }
                        State::Retrying {
                            attempt: candidate.attempt,
                            failure: AttemptFailure::Rejected(violation),
                        }
                    }
                },

                State::Executing { accepted } => {
                    let started = Instant::now();
                    let outcome = self.executor.execute(&accepted).await;
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_execution(started.elapsed());
                    }

                    match outcome {
                        Ok(result) => {
                            log_event!(
                                level: tracing::Level::INFO,
                                event: "query_executed",
                                attempt: accepted.attempt(),
                                rows: result.row_count,
                                truncated: result.truncated,
                                elapsed_ms: result.elapsed_ms
                            );
                            State::Formatting { accepted, result }
                        }
                        Err(err) if err.is_retryable() => {
                            tracing::warn!(
                                attempt = accepted.attempt(),
                                error = %err,
                                "Query failed, will retry"
                            );
                            State::Retrying {
                                attempt: accepted.attempt(),
                                failure: AttemptFailure::Execution(err),
                            }
                        }
                        Err(err) => {
                            tracing::error!(
                                attempt = accepted.attempt(),
                                error = %err,
                                "Query failed"
                            );
                            State::Failed(PipelineFailed::new(
                                (&err).into(),
                                accepted.attempt(),
                                Some(accepted.sql().to_string()),
                            ))
                        }
                    }
                }

                State::Formatting { accepted, result } => {
                    let formatted = self
                        .formatter
                        .format(&request.question, accepted.sql(), &result)
                        .await;
                    let prose = match formatted {
                        Ok(prose) => {
                            usage.add(prose.usage);
                            Some(prose.text)
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "Formatting failed, returning data only");
                            None
                        }
                    };

                    State::Done(Answer {
                        request_id: request.id,
                        question: request.question.clone(),
                        prose,
                        sql: accepted.sql().to_string(),
                        data: result,
                        attempt_count: accepted.attempt(),
                        usage,
                    })
                }

                State::Retrying { attempt, failure } => {
                    if attempt >= self.config.max_attempts {
                        tracing::error!(
                            attempts = attempt,
                            reason = failure.kind().code(),
                            "Giving up after final attempt"
                        );
                        State::Failed(PipelineFailed::new(
                            failure.kind(),
                            attempt,
                            progress.last_sql(),
                        ))
                    } else {
                        if failure.is_transient() {
                            tokio::time::sleep(self.config.backoff_after(attempt)).await;
                        }
                        tracing::info!(
                            next_attempt = attempt + 1,
                            reason = failure.kind().code(),
                            "Retrying"
                        );
                        State::Translating {
                            attempt: attempt + 1,
                            feedback: failure.feedback(),
                        }
                    }
                }

                State::Done(answer) => return Ok(answer),
                State::Failed(failed) => return Err(failed),
            };
        }
    }

    fn record(&self, outcome: &Result<Answer, PipelineFailed>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match outcome {
            Ok(answer) if answer.is_degraded() => {
                metrics.record_outcome("degraded", answer.attempt_count)
            }
            Ok(answer) => metrics.record_outcome("answered", answer.attempt_count),
            Err(failed) => metrics.record_outcome(failed.kind.code(), failed.attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::{ScriptedModel, Step};
    use crate::schema::{ColumnDescriptor, SchemaDescriptor};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct StaticExecutor {
        calls: AtomicU32,
        outcomes: Mutex<Vec<Result<QueryResult, ExecutionError>>>,
    }

    impl StaticExecutor {
        fn new(outcomes: Vec<Result<QueryResult, ExecutionError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                outcomes: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl QueryExecutor for StaticExecutor {
        async fn execute(&self, _sql: &AcceptedSql) -> Result<QueryResult, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().remove(0)
        }
    }

    fn rows(n: usize) -> QueryResult {
        QueryResult {
            columns: vec!["drug_name".to_string()],
            rows: (0..n).map(|i| vec![json!(format!("drug_{i}"))]).collect(),
            row_count: n,
            truncated: false,
            elapsed_ms: 1,
        }
    }

    fn schema() -> Arc<SchemaContext> {
        Arc::new(
            SchemaContext::from_descriptors(vec![SchemaDescriptor {
                name: "drug_info".to_string(),
                description: String::new(),
                columns: vec![ColumnDescriptor {
                    name: "drug_name".to_string(),
                    data_type: "VARCHAR".to_string(),
                    description: String::new(),
                }],
                usage_hint: String::new(),
                examples: vec![],
            }])
            .unwrap(),
        )
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn pipeline(sql: Arc<ScriptedModel>, executor: Arc<StaticExecutor>) -> QueryPipeline {
        let answers = Arc::new(ScriptedModel::repeating("Two drugs matched."));
        QueryPipeline::new(schema(), sql, answers, executor, config()).unwrap()
    }

    #[tokio::test]
    async fn test_syntax_error_feeds_next_attempt() {
        let sql = Arc::new(ScriptedModel::new([
            "SELECT drug_nam FROM drug_info LIMIT 5",
            "SELECT drug_name FROM drug_info LIMIT 5",
        ]));
        let executor = StaticExecutor::new(vec![
            Err(ExecutionError::syntax("Binder Error: column drug_nam not found")),
            Ok(rows(2)),
        ]);

        let answer = pipeline(sql.clone(), executor.clone()).answer("drugs?", None).await.unwrap();
        assert_eq!(answer.attempt_count, 2);
        assert_eq!(answer.prose.as_deref(), Some("Two drugs matched."));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert!(sql.prompts()[1].contains("column drug_nam not found"));
    }

    #[tokio::test]
    async fn test_connection_error_is_not_retried() {
        let sql = Arc::new(ScriptedModel::repeating("SELECT drug_name FROM drug_info LIMIT 5"));
        let executor = StaticExecutor::new(vec![Err(ExecutionError::connection("IO Error"))]);

        let failed = pipeline(sql.clone(), executor).answer("drugs?", None).await.unwrap_err();
        assert_eq!(failed.kind, FailureKind::Connection);
        assert_eq!(failed.attempts, 1);
        assert_eq!(sql.calls(), 1);
        assert!(!failed.reason.contains("IO Error"));
    }

    #[tokio::test]
    async fn test_transient_translation_recovers() {
        let sql = Arc::new(ScriptedModel::from_steps(vec![
            Step::Fail("503 Service Unavailable".to_string()),
            Step::Reply("SELECT drug_name FROM drug_info LIMIT 5".to_string()),
        ]));
        let executor = StaticExecutor::new(vec![Ok(rows(2))]);

        let answer = pipeline(sql.clone(), executor).answer("drugs?", None).await.unwrap();
        assert_eq!(answer.attempt_count, 2);
        // transient failures carry no feedback
        assert!(!sql.prompts()[1].contains("previous query"));
    }

    #[tokio::test]
    async fn test_rejects_invalid_questions_without_model_calls() {
        let sql = Arc::new(ScriptedModel::repeating("SELECT 1"));
        let p = pipeline(sql.clone(), StaticExecutor::new(vec![]));

        let failed = p.answer("   ", None).await.unwrap_err();
        assert_eq!(failed.kind, FailureKind::InvalidQuestion);
        assert_eq!(failed.attempts, 0);

        let long = "a".repeat(501);
        let failed = p.answer(&long, None).await.unwrap_err();
        assert_eq!(failed.kind, FailureKind::InvalidQuestion);
        assert!(failed.reason.contains("500"));
        assert_eq!(sql.calls(), 0);
    }

    #[tokio::test]
    async fn test_deadline_cancels() {
        let sql = Arc::new(
            ScriptedModel::repeating("SELECT drug_name FROM drug_info LIMIT 5")
                .with_delay(Duration::from_millis(500)),
        );
        let answers = Arc::new(ScriptedModel::repeating("unused"));
        let cfg = PipelineConfig {
            request_deadline_ms: 50,
            ..config()
        };
        let executor = StaticExecutor::new(vec![]);
        let p = QueryPipeline::new(schema(), sql, answers, executor, cfg).unwrap();

        let failed = p.answer("drugs?", None).await.unwrap_err();
        assert_eq!(failed.kind, FailureKind::Cancelled);
        assert_eq!(failed.attempts, 1);
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let cfg = PipelineConfig {
            max_attempts: 0,
            ..Default::default()
        };
        let model = Arc::new(ScriptedModel::repeating("SELECT 1"));
        let executor = StaticExecutor::new(vec![]);
        let result = QueryPipeline::new(schema(), model.clone(), model, executor, cfg);
        assert!(result.is_err());
    }
}
