//! Runs guard-approved SQL against DuckDB
//!
//! Every statement runs inside a transaction that is always rolled back, on a
//! pooled connection, under a statement timeout. On timeout or cancellation the
//! running query is interrupted.

use async_trait::async_trait;
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::{Connection, InterruptHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ExecutionError;
use crate::guard::AcceptedSql;
use crate::model::QueryResult;
use crate::pool::ConnectionPool;

/// Days between 0001-01-01 (CE day 1) and 1970-01-01
const UNIX_EPOCH_FROM_CE: i32 = 719_163;

/// Anything that can run accepted SQL
///
/// Taking [`AcceptedSql`] rather than a string means only guard-approved
/// statements reach an implementation.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &AcceptedSql) -> Result<QueryResult, ExecutionError>;
}

pub struct DuckExecutor {
    pool: ConnectionPool,
    statement_timeout: Duration,
    max_rows: usize,
}

impl DuckExecutor {
    pub fn new(pool: ConnectionPool, statement_timeout: Duration, max_rows: usize) -> Self {
        Self {
            pool,
            statement_timeout,
            max_rows,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn run(&self, sql: &str) -> Result<QueryResult, ExecutionError> {
        let started = Instant::now();
        let mut conn = self.pool.acquire().await?;

        let mut interrupt = InterruptGuard::new(conn.interrupt_handle());
        let sql_owned = sql.to_string();
        let max_rows = self.max_rows;

        let task = tokio::task::spawn_blocking(move || {
            let outcome = run_in_rollback(&mut conn, &sql_owned, max_rows);
            drop(conn);
            outcome
        });

        let outcome = match tokio::time::timeout(self.statement_timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => {
                return Err(ExecutionError::connection(format!("query task failed: {}", join)))
            }
            Err(_) => {
                // guard drop interrupts the statement
                return Err(ExecutionError::timeout(format!(
                    "statement exceeded {} ms",
                    self.statement_timeout.as_millis()
                )));
            }
        };
        interrupt.disarm();

        let (columns, rows, truncated) = outcome.map_err(classify)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::debug!(
            rows = rows.len(),
            truncated,
            elapsed_ms,
            "Query executed"
        );

        Ok(QueryResult {
            columns,
            row_count: rows.len(),
            rows,
            truncated,
            elapsed_ms,
        })
    }
}

#[async_trait]
impl QueryExecutor for DuckExecutor {
    async fn execute(&self, sql: &AcceptedSql) -> Result<QueryResult, ExecutionError> {
        self.run(sql.sql()).await
    }
}

/// Interrupts the in-flight statement unless disarmed
struct InterruptGuard {
    handle: Arc<InterruptHandle>,
    armed: bool,
}

impl InterruptGuard {
    fn new(handle: Arc<InterruptHandle>) -> Self {
        Self { handle, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Interrupting running statement");
            self.handle.interrupt();
        }
    }
}

type Rows = (Vec<String>, Vec<Vec<serde_json::Value>>, bool);

fn run_in_rollback(
    conn: &mut Connection,
    sql: &str,
    max_rows: usize,
) -> Result<Rows, duckdb::Error> {
    let tx = conn.transaction()?;
    let outcome = collect_rows(&tx, sql, max_rows);
    let rolled_back = tx.rollback();
    let rows = outcome?;
    rolled_back?;
    Ok(rows)
}

fn collect_rows(conn: &Connection, sql: &str, max_rows: usize) -> Result<Rows, duckdb::Error> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    // Column names are only known once the statement has run
    let columns: Vec<String> = rows
        .as_ref()
        .map(|s| s.column_names())
        .unwrap_or_default();

    let mut out = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows.next()? {
        if out.len() == max_rows {
            truncated = true;
            break;
        }
        let mut json_row = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            json_row.push(to_json(row.get_ref(i)?));
        }
        out.push(json_row);
    }

    Ok((columns, out, truncated))
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    use serde_json::Value;

    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(i) => Value::from(i),
            Err(_) => Value::String(i.to_string()),
        },
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => float(f as f64),
        ValueRef::Double(f) => float(f),
        ValueRef::Decimal(d) => Value::String(d.to_string()),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
        ValueRef::Date32(days) => {
            chrono::NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_FROM_CE)
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null)
        }
        ValueRef::Timestamp(unit, value) => {
            chrono::DateTime::from_timestamp_micros(to_micros(unit, value))
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or(Value::Null)
        }
        other => Value::String(format!("{:?}", other)),
    }
}

fn float(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Map a DuckDB error onto the pipeline's execution categories
fn classify(err: duckdb::Error) -> ExecutionError {
    let message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("interrupt") {
        ExecutionError::timeout(message)
    } else if lower.contains("read-only")
        || lower.contains("read only")
        || lower.contains("permission")
    {
        ExecutionError::permission(message)
    } else if lower.contains("io error")
        || lower.contains("connection")
        || lower.contains("invalidated")
        || lower.contains("database has been closed")
    {
        ExecutionError::connection(message)
    } else {
        ExecutionError::syntax(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionErrorKind;

    fn executor(max_rows: usize) -> DuckExecutor {
        let root = Connection::open_in_memory().unwrap();
        root.execute_batch(
            "CREATE TABLE drug_info
                (drug_id INTEGER, drug_name VARCHAR, molecular_weight DOUBLE, approved DATE);
             INSERT INTO drug_info VALUES
                (1, 'sumatriptan', 295.4, DATE '1992-12-28'),
                (2, 'zolmitriptan', 287.4, DATE '1997-11-25'),
                (3, 'aspirin', 180.16, NULL);",
        )
        .unwrap();
        let pool = ConnectionPool::from_connection(root, 2, Duration::from_secs(1)).unwrap();
        DuckExecutor::new(pool, Duration::from_secs(5), max_rows)
    }

    #[tokio::test]
    async fn test_returns_columns_and_typed_values() {
        let exec = executor(100);
        let result = exec
            .execute(&AcceptedSql::unchecked(
                "SELECT drug_id, drug_name, molecular_weight, approved \
                 FROM drug_info ORDER BY drug_id LIMIT 10",
            ))
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["drug_id", "drug_name", "molecular_weight", "approved"]);
        assert_eq!(result.row_count, 3);
        assert!(!result.truncated);
        assert_eq!(result.rows[0][1], "sumatriptan");
        assert_eq!(result.rows[0][3], "1992-12-28");
        assert_eq!(result.rows[2][3], serde_json::Value::Null);
        assert_eq!(result.rows[2][2], serde_json::json!(180.16));
    }

    #[tokio::test]
    async fn test_marks_truncation_past_cap() {
        let exec = executor(2);
        let result = exec
            .execute(&AcceptedSql::unchecked("SELECT drug_name FROM drug_info LIMIT 1000"))
            .await
            .unwrap();
        assert_eq!(result.row_count, 2);
        assert!(result.truncated);

        let exact = executor(3)
            .execute(&AcceptedSql::unchecked("SELECT drug_name FROM drug_info LIMIT 1000"))
            .await
            .unwrap();
        assert!(!exact.truncated);
    }

    #[tokio::test]
    async fn test_write_is_rolled_back() {
        // Bypasses the guard on purpose: the transaction alone must undo it.
        let exec = executor(10);
        exec.run("DELETE FROM drug_info WHERE drug_name = 'aspirin'")
            .await
            .unwrap();

        let result = exec
            .run("SELECT count(*) AS n FROM drug_info")
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], 3);
    }

    #[tokio::test]
    async fn test_unknown_column_is_syntax_error() {
        let err = executor(10)
            .run("SELECT no_such_column FROM drug_info LIMIT 1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Syntax);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_statement_times_out() {
        let root = Connection::open_in_memory().unwrap();
        let pool = ConnectionPool::from_connection(root, 1, Duration::from_secs(1)).unwrap();
        let exec = DuckExecutor::new(pool, Duration::from_millis(50), 10);

        let err = exec
            .run("SELECT sum(a.range * b.range) FROM range(100000000) a, range(100000) b")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Timeout);

        // The interrupted connection is recycled and usable again
        let ok = exec.run("SELECT 42 AS answer").await.unwrap();
        assert_eq!(ok.rows[0][0], 42);
    }

    #[test]
    fn test_classify() {
        let kind = |msg: &str| classify(duckdb::Error::InvalidParameterName(msg.to_string())).kind;
        assert_eq!(kind("INTERRUPT Error: Interrupted!"), ExecutionErrorKind::Timeout);
        assert_eq!(
            kind(
                "Invalid Input Error: Cannot execute statement of type \"DELETE\" \
                 on database which is attached in read-only mode!"
            ),
            ExecutionErrorKind::Permission
        );
        assert_eq!(kind("IO Error: could not open file"), ExecutionErrorKind::Connection);
        assert_eq!(
            kind("Binder Error: Referenced column \"x\" not found"),
            ExecutionErrorKind::Syntax
        );
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(to_json(ValueRef::HugeInt(7)), serde_json::json!(7));
        assert_eq!(to_json(ValueRef::HugeInt(i128::MAX)), serde_json::json!(i128::MAX.to_string()));
        assert_eq!(to_json(ValueRef::Double(f64::NAN)), serde_json::Value::Null);
        assert_eq!(to_json(ValueRef::Blob(&[1, 2, 3])), serde_json::json!("<blob 3 bytes>"));
        assert_eq!(to_json(ValueRef::Date32(0)), serde_json::json!("1970-01-01"));
        assert_eq!(
            to_json(ValueRef::Timestamp(TimeUnit::Second, 0)),
            serde_json::json!("1970-01-01T00:00:00+00:00")
        );
    }
}
