//! Question to candidate SQL via a language model

use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::TranslationError;
use crate::llm::{complete_with_timeout, LanguageModel};
use crate::model::{CandidateSql, QueryRequest};
use crate::schema::SchemaContext;

pub struct Translator {
    model: Arc<dyn LanguageModel>,
    max_tokens: u32,
    call_timeout: Duration,
    row_limit_ceiling: u64,
}

impl Translator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        max_tokens: u32,
        call_timeout: Duration,
        row_limit_ceiling: u64,
    ) -> Self {
        Self {
            model,
            max_tokens,
            call_timeout,
            row_limit_ceiling,
        }
    }

    /// Ask the model for SQL answering `request`
    ///
    /// `prior_failure` is the reason the previous attempt was refused; it is
    /// shown to the model so the next proposal can avoid it.
    pub async fn translate(
        &self,
        request: &QueryRequest,
        schema: &SchemaContext,
        attempt: u32,
        prior_failure: Option<&str>,
    ) -> Result<CandidateSql, TranslationError> {
        let prompt = self.build_prompt(request, schema, prior_failure);

        tracing::debug!(
            request_id = %request.id,
            attempt,
            provider = self.model.provider_name(),
            model = self.model.model_name(),
            "Requesting SQL from model"
        );

        let completion = complete_with_timeout(
            self.model.as_ref(),
            &prompt,
            self.max_tokens,
            self.call_timeout,
        )
        .await
        .map_err(|e| {
            if e.is_malformed() {
                TranslationError::Malformed(e.to_string())
            } else {
                TranslationError::Transient(e.to_string())
            }
        })?;

        let sql = extract_sql(&completion.text);
        if sql.is_empty() {
            return Err(TranslationError::Malformed(
                "model returned no SQL".to_string(),
            ));
        }

        Ok(CandidateSql {
            sql,
            attempt,
            request_id: request.id,
            usage: completion.usage,
        })
    }

    fn build_prompt(
        &self,
        request: &QueryRequest,
        schema: &SchemaContext,
        prior_failure: Option<&str>,
    ) -> String {
        let mut prompt = format!(
            "You are a DuckDB SQL expert. Generate a SQL query for the following question.\n\n\
             Database: {dataset}\n\
             Schema information:\n{schema}\n",
            dataset = schema.dataset(),
            schema = schema.render_prompt(),
        );

        if let Some(context) = request.prior_context.as_deref().filter(|c| !c.trim().is_empty()) {
            prompt.push_str("\nPrevious conversation context:\n");
            prompt.push_str(context.trim());
            prompt.push('\n');
        }

        prompt.push_str(&format!("\nUser question: {}\n", request.question.trim()));

        if let Some(reason) = prior_failure {
            prompt.push_str(&format!(
                "\nYour previous query was not usable: {}\nWrite a corrected query.\n",
                reason
            ));
        }

        prompt.push_str(&format!(
            "\nInstructions:\n\
             - Return ONLY a single read-only DuckDB SELECT query\n\
             - Query only the views described above\n\
             - Do not include explanations or markdown formatting\n\
             - Limit results to {} rows with a LIMIT clause\n\
             - Return the SQL query directly without any wrapper text\n\n\
             SQL Query:",
            self.row_limit_ceiling
        ));

        prompt
    }
}

fn fenced_block() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?is)```(?:sql)?\s*(.*?)\s*```").expect("fence pattern is valid")
    })
}

/// Pull the statement out of a model reply
///
/// Handles fenced code blocks, a leading `SQL:` label and trailing semicolons.
pub fn extract_sql(text: &str) -> String {
    let body = fenced_block()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
        .trim();

    let body = match body.get(..4) {
        Some(label) if label.eq_ignore_ascii_case("sql:") => body[4..].trim_start(),
        _ => body,
    };

    body.trim_end().trim_end_matches(';').trim_end().to_string()
}
