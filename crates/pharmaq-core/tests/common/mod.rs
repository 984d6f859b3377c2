//! Shared fixtures: a small DrugCentral-shaped database and test doubles
#![allow(dead_code)]

use async_trait::async_trait;
use duckdb::Connection;
use pharmaq_core::prelude::*;
use pharmaq_core::{AcceptedSql, ExecutionError, QueryResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SCHEMA_YAML: &str = r#"
dataset: DrugCentral
notes:
  - Always use ILIKE for case-insensitive text matching
views:
  - name: drug_classes
    description: Therapeutic classification of drugs
    usage_hint: Questions about what a drug treats or which class it belongs to.
    columns:
      - { name: drug_id, type: INTEGER }
      - { name: drug_name, type: VARCHAR }
      - { name: atc_code, type: VARCHAR }
      - { name: therapeutic_group, type: VARCHAR }
  - name: drug_info
    description: Core chemical facts per drug
    columns:
      - { name: drug_id, type: INTEGER }
      - { name: drug_name, type: VARCHAR }
      - { name: molecular_weight, type: DOUBLE }
  - name: drug_search_all
    description: Name and synonym search
    columns:
      - { name: drug_id, type: INTEGER }
      - { name: primary_name, type: VARCHAR }
      - { name: all_synonyms, type: VARCHAR }
"#;

pub fn schema() -> Arc<SchemaContext> {
    Arc::new(SchemaContext::from_yaml(SCHEMA_YAML).unwrap())
}

/// In-memory database with the described views plus a hidden table
pub fn database(extra_drugs: usize) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE structures (id INTEGER, name VARCHAR);
         INSERT INTO structures VALUES (1, 'aspirin'), (2, 'sumatriptan');

         CREATE TABLE drug_classes
            (drug_id INTEGER, drug_name VARCHAR, atc_code VARCHAR, therapeutic_group VARCHAR);
         INSERT INTO drug_classes VALUES
            (2, 'sumatriptan', 'N02CC01', 'ANTIMIGRAINE PREPARATIONS'),
            (3, 'zolmitriptan', 'N02CC03', 'ANTIMIGRAINE PREPARATIONS'),
            (4, 'rizatriptan', 'N02CC04', 'ANTIMIGRAINE PREPARATIONS'),
            (1, 'aspirin', 'N02BA01', 'ANALGESICS');

         CREATE TABLE drug_info (drug_id INTEGER, drug_name VARCHAR, molecular_weight DOUBLE);
         INSERT INTO drug_info VALUES (1, 'aspirin', 180.16), (2, 'sumatriptan', 295.4);

         CREATE TABLE drug_search_all (drug_id INTEGER, primary_name VARCHAR, all_synonyms VARCHAR);
         INSERT INTO drug_search_all VALUES (1, 'aspirin', 'acetylsalicylic acid; ASA');",
    )
    .unwrap();

    if extra_drugs > 0 {
        conn.execute_batch(&format!(
            "INSERT INTO drug_info SELECT range + 100, 'compound_' || range, 100.0 FROM range({});",
            extra_drugs
        ))
        .unwrap();
    }
    conn
}

pub fn duck_executor(conn: Connection, max_rows: usize) -> DuckExecutor {
    let pool = ConnectionPool::from_connection(conn, 2, Duration::from_secs(2)).unwrap();
    DuckExecutor::new(pool, Duration::from_secs(5), max_rows)
}

/// Wraps an executor and counts what reaches it
pub struct RecordingExecutor {
    inner: Option<Arc<dyn QueryExecutor>>,
    failure: Option<ExecutionError>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn wrap(inner: impl QueryExecutor + 'static) -> Arc<Self> {
        Arc::new(Self {
            inner: Some(Arc::new(inner)),
            failure: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(err: ExecutionError) -> Arc<Self> {
        Arc::new(Self {
            inner: None,
            failure: Some(err),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn execute(&self, sql: &AcceptedSql) -> Result<QueryResult, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(sql.sql().to_string());
        match (&self.inner, &self.failure) {
            (_, Some(err)) => Err(err.clone()),
            (Some(inner), None) => inner.execute(sql).await,
            (None, None) => Err(ExecutionError::connection("no executor configured")),
        }
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        retry_backoff_ms: 1,
        ..Default::default()
    }
}
