//! Command-line arguments and output rendering

use clap::{Args, Parser, Subcommand};
use pharmaq_core::{Answer, GuardVerdict, PipelineFailed, QueryResult};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pharmaq",
    version,
    about = "Ask questions about DrugCentral in plain English"
)]
pub struct Cli {
    /// Path to config.yaml (defaults are used if it does not exist)
    #[arg(long, global = true, default_value = "config.yaml", env = "PHARMAQ_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer a question
    Ask(AskArgs),
    /// Print the schema context given to the model
    Schema,
    /// Run the SQL guard on a statement without executing it
    Check {
        sql: String,
    },
}

#[derive(Args, Debug)]
pub struct AskArgs {
    pub question: String,

    /// Summary of the previous turn, for follow-up questions
    #[arg(long)]
    pub context: Option<String>,

    /// Print the answer as JSON
    #[arg(long)]
    pub json: bool,

    /// Print Prometheus metrics after answering
    #[arg(long)]
    pub metrics: bool,

    /// Rows shown in the text table
    #[arg(long, default_value_t = 20)]
    pub show_rows: usize,
}

pub fn render_answer(answer: &Answer, show_rows: usize) -> String {
    let mut out = String::new();
    match &answer.prose {
        Some(prose) => out.push_str(prose),
        None => out.push_str("(No summary available; showing the raw results.)"),
    }
    out.push_str("\n\n");
    out.push_str(&render_table(&answer.data, show_rows));
    out.push_str(&format!(
        "\nSQL: {}\nAttempts: {}  Tokens: {} in / {} out\n",
        answer.sql, answer.attempt_count, answer.usage.input_tokens, answer.usage.output_tokens
    ));
    out
}

/// JSON document printed by `ask --json`
pub fn render_json(answer: &Answer) -> serde_json::Value {
    serde_json::json!({
        "request_id": answer.request_id,
        "question": answer.question,
        "answer": answer.prose,
        "sql": answer.sql,
        "attempts": answer.attempt_count,
        "usage": answer.usage,
        "data": answer.data.to_json(),
    })
}

pub fn render_failure(failed: &PipelineFailed) -> String {
    let mut out = format!("Error: {}\n", failed.reason);
    if let Some(sql) = &failed.last_sql {
        out.push_str(&format!("Last SQL: {}\n", sql));
    }
    out
}

pub fn render_verdict(verdict: &GuardVerdict) -> String {
    match verdict {
        GuardVerdict::Accepted(accepted) => {
            let mut out = format!("accepted: {}\n", accepted.sql());
            if let Some(correction) = accepted.correction() {
                out.push_str(&format!("correction: {}\n", correction.code()));
            }
            out
        }
        GuardVerdict::Rejected(violation) => format!("rejected: {}\n", violation),
    }
}

/// Plain-text table of the first `limit` rows
pub fn render_table(result: &QueryResult, limit: usize) -> String {
    if result.columns.is_empty() {
        return String::new();
    }

    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .take(limit)
        .map(|row| row.iter().map(cell).collect())
        .collect();

    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            cells
                .iter()
                .filter_map(|r| r.get(i))
                .map(|c| c.chars().count())
                .chain(std::iter::once(col.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: &[String]| -> String {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<width$}", v, width = *w))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    out.push_str(&line(&result.columns));
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.push('\n');
    for row in &cells {
        out.push_str(&line(row));
        out.push('\n');
    }

    let hidden = result.row_count.saturating_sub(cells.len());
    if hidden > 0 || result.truncated {
        out.push_str(&format!(
            "({} of {} rows shown{})\n",
            cells.len(),
            result.row_count,
            if result.truncated { ", result truncated" } else { "" }
        ));
    }
    out
}

fn cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
