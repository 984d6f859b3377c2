//! Query results to a short prose answer

use std::sync::Arc;
use std::time::Duration;

use crate::error::FormattingError;
use crate::llm::{complete_with_timeout, LanguageModel};
use crate::model::{QueryResult, TokenUsage};

const EMPTY_ANSWER: &str = "No matching records were found in the database for your question. \
                            Try rephrasing it or using a broader term.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prose {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

pub struct ResultFormatter {
    model: Arc<dyn LanguageModel>,
    max_tokens: u32,
    call_timeout: Duration,
    prompt_rows: usize,
}

impl ResultFormatter {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        max_tokens: u32,
        call_timeout: Duration,
        prompt_rows: usize,
    ) -> Self {
        Self {
            model,
            max_tokens,
            call_timeout,
            prompt_rows,
        }
    }

    pub async fn format(
        &self,
        question: &str,
        sql: &str,
        result: &QueryResult,
    ) -> Result<Prose, FormattingError> {
        if result.is_empty() {
            return Ok(Prose {
                text: EMPTY_ANSWER.to_string(),
                usage: None,
            });
        }

        let prompt = self.build_prompt(question, sql, result);
        let completion = complete_with_timeout(
            self.model.as_ref(),
            &prompt,
            self.max_tokens,
            self.call_timeout,
        )
        .await
        .map_err(|e| {
            if e.is_malformed() {
                FormattingError::Malformed(e.to_string())
            } else {
                FormattingError::Transient(e.to_string())
            }
        })?;

        let mut text = completion.text.trim().to_string();
        if text.is_empty() {
            return Err(FormattingError::Malformed(
                "model returned an empty answer".to_string(),
            ));
        }

        if result.truncated {
            text.push_str(&format!(
                " Note: only the first {} matching rows are shown; \
                 more rows matched than could be displayed.",
                result.row_count
            ));
        }

        Ok(Prose {
            text,
            usage: completion.usage,
        })
    }

    fn build_prompt(&self, question: &str, sql: &str, result: &QueryResult) -> String {
        let shown = self.prompt_rows.min(result.rows.len());

        let mut results = format!("Number of results: {}", result.row_count);
        if result.truncated {
            results.push_str(" (truncated; more rows matched)");
        }
        results.push_str("\n\n");
        results.push_str(&format!("Columns: {}\n\nResults:\n", result.columns.join(", ")));

        for (i, row) in result.rows.iter().take(shown).enumerate() {
            let fields: Vec<String> = result
                .columns
                .iter()
                .zip(row)
                .map(|(col, value)| format!("{}: {}", col, value))
                .collect();
            results.push_str(&format!("{}. {{{}}}\n", i + 1, fields.join(", ")));
        }

        if result.row_count > shown {
            results.push_str(&format!("\n... and {} more results", result.row_count - shown));
        }

        format!(
            "You are a helpful assistant explaining database query results to a user.\n\n\
             User's Question: {question}\n\n\
             SQL Query Executed:\n{sql}\n\n\
             Query Results:\n{results}\n\n\
             Instructions:\n\
             - Provide a BRIEF answer (2-3 sentences maximum) \
               based ONLY on the query results above\n\
             - State the number of results found and provide a high-level summary\n\
             - If multiple results exist, do NOT list individual items - \
               instead tell the user to \"view the complete list in the table below\"\n\
             - For single results, you may briefly describe the finding\n\
             - Do NOT provide information not present in the query results\n\
             - Do NOT provide medical advice or recommendations\n\
             - Do NOT speculate beyond the data provided\n\
             - Do NOT use markdown formatting (no asterisks, no bold, no italics) - \
               write in plain text only\n\
             - Keep your answer SHORT and direct the user to the detailed results table below\n\n\
             Answer:"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use serde_json::json;

    fn result(n: usize, truncated: bool) -> QueryResult {
        QueryResult {
            columns: vec!["drug_name".to_string()],
            rows: (0..n).map(|i| vec![json!(format!("drug_{i}"))]).collect(),
            row_count: n,
            truncated,
            elapsed_ms: 1,
        }
    }

    fn formatter(model: Arc<ScriptedModel>) -> ResultFormatter {
        ResultFormatter::new(model, 128, Duration::from_millis(200), 20)
    }

    #[tokio::test]
    async fn test_empty_result_skips_model() {
        let model = Arc::new(ScriptedModel::repeating("unused"));
        let prose = formatter(model.clone())
            .format("q", "SELECT 1", &result(0, false))
            .await
            .unwrap();
        assert_eq!(prose.text, EMPTY_ANSWER);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_prompt_caps_rows() {
        let model = Arc::new(ScriptedModel::repeating("Found 25 drugs."));
        let prose = formatter(model.clone())
            .format(
                "Which drugs?",
                "SELECT drug_name FROM drug_info LIMIT 1000",
                &result(25, false),
            )
            .await
            .unwrap();
        assert_eq!(prose.text, "Found 25 drugs.");

        let prompts = model.prompts();
        let prompt = &prompts[0];
        assert!(prompt.contains("Number of results: 25"));
        assert!(prompt.contains("20. {drug_name: \"drug_19\"}"));
        assert!(!prompt.contains("drug_20"));
        assert!(prompt.contains("... and 5 more results"));
        assert!(prompt.contains("SELECT drug_name FROM drug_info LIMIT 1000"));
    }

    #[tokio::test]
    async fn test_truncation_is_disclosed() {
        let model = Arc::new(ScriptedModel::repeating("Many drugs matched."));
        let prose = formatter(model).format("q", "SELECT 1", &result(30, true)).await.unwrap();
        assert!(prose.text.starts_with("Many drugs matched."));
        assert!(prose.text.contains("only the first 30 matching rows"));
    }

    #[tokio::test]
    async fn test_failures() {
        let err = formatter(Arc::new(ScriptedModel::failing("503")))
            .format("q", "SELECT 1", &result(1, false))
            .await
            .unwrap_err();
        assert!(matches!(err, FormattingError::Transient(_)));

        let err = formatter(Arc::new(ScriptedModel::repeating("   ")))
            .format("q", "SELECT 1", &result(1, false))
            .await
            .unwrap_err();
        assert!(matches!(err, FormattingError::Malformed(_)));

        let err = formatter(Arc::new(ScriptedModel::from_steps(vec![])))
            .format("q", "SELECT 1", &result(1, false))
            .await
            .unwrap_err();
        assert!(matches!(err, FormattingError::Malformed(_)));
    }
}
