//! Values that flow through one pipeline invocation

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One inbound question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub id: Uuid,
    pub question: String,
    /// Free-text summary of the previous turn, if the caller keeps one
    #[serde(default)]
    pub prior_context: Option<String>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.into(),
            prior_context: None,
        }
    }

    pub fn with_prior_context(mut self, context: impl Into<String>) -> Self {
        self.prior_context = Some(context.into());
        self
    }
}

/// Token counts reported by a model provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Option<TokenUsage>) {
        if let Some(other) = other {
            self.input_tokens += other.input_tokens;
            self.output_tokens += other.output_tokens;
        }
    }
}

/// SQL proposed by the translator, not yet vetted
#[derive(Debug, Clone)]
pub struct CandidateSql {
    pub sql: String,
    pub attempt: u32,
    pub request_id: Uuid,
    pub usage: Option<TokenUsage>,
}

/// Rows returned by the executor; also the caller's data table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    /// More rows matched than were kept
    pub truncated: bool,
    pub elapsed_ms: u64,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as column-name keyed objects
    pub fn to_json(&self) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (col, value) in self.columns.iter().zip(row) {
                    obj.insert(col.clone(), value.clone());
                }
                serde_json::Value::Object(obj)
            })
            .collect();

        serde_json::json!({
            "columns": self.columns,
            "rows": rows,
            "row_count": self.row_count,
            "truncated": self.truncated,
        })
    }
}

/// Final artifact handed back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub request_id: Uuid,
    pub question: String,
    /// `None` when the formatter failed and only the data table is available
    pub prose: Option<String>,
    pub sql: String,
    pub data: QueryResult,
    pub attempt_count: u32,
    pub usage: TokenUsage,
}

impl Answer {
    pub fn is_degraded(&self) -> bool {
        self.prose.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_to_json() {
        let result = QueryResult {
            columns: vec!["drug_name".to_string(), "atc_code".to_string()],
            rows: vec![
                vec![json!("sumatriptan"), json!("N02CC01")],
                vec![json!("zolmitriptan"), json!("N02CC03")],
            ],
            row_count: 2,
            truncated: false,
            elapsed_ms: 3,
        };

        let value = result.to_json();
        assert_eq!(value["row_count"], 2);
        assert_eq!(value["rows"][1]["drug_name"], "zolmitriptan");
        assert_eq!(value["truncated"], false);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(Some(TokenUsage { input_tokens: 10, output_tokens: 4 }));
        usage.add(None);
        usage.add(Some(TokenUsage { input_tokens: 1, output_tokens: 1 }));
        assert_eq!(usage.total(), 16);
    }
}
