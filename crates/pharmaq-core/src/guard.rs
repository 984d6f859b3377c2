//! Static checks applied to every candidate statement before execution
//!
//! Rules run in a fixed order and the first failure wins:
//! 1. exactly one statement
//! 2. no write or side-effecting keyword, and the statement parses as a query
//! 3. every relation is an allowlisted view or a CTE in scope at that point
//! 4. the outer query has a numeric LIMIT at or below the ceiling (fixed up,
//!    never rejected)
//!
//! The guard is pure: no network, no database, same input same verdict.

use sqlparser::ast::{Expr, Function, ObjectName, Query, Statement, Value, Visit, Visitor};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::ops::ControlFlow;

use crate::error::GuardViolation;
use crate::model::CandidateSql;
use crate::schema::SchemaContext;

/// Unquoted words that never appear in a read-only query
const WRITE_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "truncate", "grant", "create",
    // DuckDB statements with side effects outside the transaction
    "merge", "copy", "attach", "detach", "install", "load", "pragma", "call", "set",
    "vacuum", "checkpoint", "export", "import", "into", "revoke",
];

/// Function name prefixes that reach files, settings or catalogs
const DENIED_FUNCTION_PREFIXES: &[&str] = &["read_", "pg_", "duckdb_", "sqlite_"];

const DENIED_FUNCTIONS: &[&str] = &["getenv", "glob", "current_setting", "query", "query_table"];

const PERMITTED_SCHEMAS: &[&str] = &["main", "public"];

/// How the guard adjusted the row limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitCorrection {
    /// No LIMIT was present; one was added
    Injected { limit: u64 },
    /// LIMIT was above the ceiling or not a plain number
    Clamped { requested: String, limit: u64 },
}

impl LimitCorrection {
    pub fn code(&self) -> &'static str {
        match self {
            LimitCorrection::Injected { .. } => "missing-limit-corrected",
            LimitCorrection::Clamped { .. } => "limit-clamped",
        }
    }
}

/// SQL that passed every guard rule
///
/// Only the guard can build one, so holding an `AcceptedSql` is proof the
/// statement was vetted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedSql {
    sql: String,
    attempt: u32,
    correction: Option<LimitCorrection>,
}

impl AcceptedSql {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn correction(&self) -> Option<&LimitCorrection> {
        self.correction.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn unchecked(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            attempt: 1,
            correction: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Accepted(AcceptedSql),
    Rejected(GuardViolation),
}

impl GuardVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GuardVerdict::Accepted(_))
    }

    pub fn violation(&self) -> Option<&GuardViolation> {
        match self {
            GuardVerdict::Rejected(v) => Some(v),
            GuardVerdict::Accepted(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlGuard {
    ceiling: u64,
}

impl SqlGuard {
    pub fn new(row_limit_ceiling: u64) -> Self {
        Self {
            ceiling: row_limit_ceiling,
        }
    }

    pub fn check(&self, candidate: &CandidateSql, schema: &SchemaContext) -> GuardVerdict {
        let verdict = self.check_sql(&candidate.sql, candidate.attempt, schema);
        match &verdict {
            GuardVerdict::Accepted(accepted) => {
                if let Some(correction) = accepted.correction() {
                    tracing::debug!(
                        request_id = %candidate.request_id,
                        correction = correction.code(),
                        "Guard corrected row limit"
                    );
                }
            }
            GuardVerdict::Rejected(violation) => {
                tracing::warn!(
                    request_id = %candidate.request_id,
                    attempt = candidate.attempt,
                    reason = violation.code(),
                    "Guard rejected candidate SQL: {}",
                    violation
                );
            }
        }
        verdict
    }

    pub fn check_sql(&self, sql: &str, attempt: u32, schema: &SchemaContext) -> GuardVerdict {
        match self.evaluate(sql, schema) {
            Ok((sql, correction)) => GuardVerdict::Accepted(AcceptedSql {
                sql,
                attempt,
                correction,
            }),
            Err(violation) => GuardVerdict::Rejected(violation),
        }
    }

    fn evaluate(
        &self,
        sql: &str,
        schema: &SchemaContext,
    ) -> Result<(String, Option<LimitCorrection>), GuardViolation> {
        let dialect = DuckDbDialect {};

        let tokens = Tokenizer::new(&dialect, sql)
            .tokenize()
            .map_err(|e| other(format!("SQL could not be tokenized: {}", e)))?;

        // single statement
        let count = count_statements(&tokens);
        if count == 0 {
            return Err(other("no SQL statement found".to_string()));
        }
        if count > 1 {
            return Err(GuardViolation::MultiStatement { count });
        }

        // Comments are whitespace tokens and literals are single tokens,
        // so only real keywords are inspected.
        if let Some(keyword) = find_write_keyword(&tokens) {
            return Err(GuardViolation::WriteOperation { keyword });
        }

        let mut statements = Parser::parse_sql(&dialect, sql)
            .map_err(|e| other(format!("SQL could not be parsed: {}", e)))?;
        if statements.len() != 1 {
            return Err(GuardViolation::MultiStatement {
                count: statements.len(),
            });
        }

        // only plain queries
        let mut query = match statements.remove(0) {
            Statement::Query(query) => query,
            _ => {
                return Err(GuardViolation::WriteOperation {
                    keyword: leading_keyword(&tokens),
                })
            }
        };

        // every relation and function must be allowlisted
        if let ControlFlow::Break(violation) = query.visit(&mut ReferenceCheck::new(schema)) {
            return Err(violation);
        }

        // outermost LIMIT
        let original_limit = query.limit.clone();
        let had_fetch = query.fetch.is_some();
        let correction = self.enforce_limit(&mut query);

        let sql = if correction.is_none() && !had_fetch && original_limit == query.limit {
            trim_statement(sql)
        } else {
            Statement::Query(query).to_string()
        };

        Ok((sql, correction))
    }

    fn enforce_limit(&self, query: &mut Query) -> Option<LimitCorrection> {
        // FETCH FIRST n ROWS is folded into LIMIT so only one clause remains.
        let fetch_quantity = query.fetch.take().map(|fetch| {
            if fetch.percent {
                None
            } else {
                Some(fetch.quantity.unwrap_or_else(|| number(1)))
            }
        });

        let existing = match (query.limit.take(), fetch_quantity) {
            (Some(limit), _) => Some(limit),
            (None, Some(Some(quantity))) => Some(quantity),
            (None, Some(None)) => Some(Expr::Value(Value::Null)),
            (None, None) => None,
        };

        let (limit, correction) = match existing {
            None => (
                self.ceiling,
                Some(LimitCorrection::Injected {
                    limit: self.ceiling,
                }),
            ),
            Some(expr) => match numeric_limit(&expr) {
                Some(n) if n <= self.ceiling => (n, None),
                _ => (
                    self.ceiling,
                    Some(LimitCorrection::Clamped {
                        requested: expr.to_string(),
                        limit: self.ceiling,
                    }),
                ),
            },
        };

        query.limit = Some(number(limit));
        correction
    }
}

fn other(detail: String) -> GuardViolation {
    GuardViolation::Other { detail }
}

fn number(n: u64) -> Expr {
    Expr::Value(Value::Number(n.to_string(), false))
}

fn numeric_limit(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        _ => None,
    }
}

fn count_statements(tokens: &[Token]) -> usize {
    let mut count = 0;
    let mut in_statement = false;
    for token in tokens {
        match token {
            Token::Whitespace(_) | Token::EOF => {}
            Token::SemiColon => in_statement = false,
            _ => {
                if !in_statement {
                    count += 1;
                    in_statement = true;
                }
            }
        }
    }
    count
}

fn find_write_keyword(tokens: &[Token]) -> Option<String> {
    tokens.iter().find_map(|token| match token {
        Token::Word(word) if word.quote_style.is_none() => {
            let lower = word.value.to_lowercase();
            WRITE_KEYWORDS.contains(&lower.as_str()).then_some(lower)
        }
        _ => None,
    })
}

fn leading_keyword(tokens: &[Token]) -> String {
    tokens
        .iter()
        .find_map(|token| match token {
            Token::Word(word) => Some(word.value.to_lowercase()),
            _ => None,
        })
        .unwrap_or_else(|| "statement".to_string())
}

fn trim_statement(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim_end().to_string()
}

/// CTE names declared by one query, in declaration order
struct CteScope {
    names: Vec<String>,
    recursive: bool,
    /// Prefix of `names` the code currently being walked can see
    visible: usize,
    /// Direct child queries entered so far; the first `names.len()` are CTE bodies
    children: usize,
}

/// Checks every relation and function call against the allowlist while
/// tracking which CTE names are in scope
struct ReferenceCheck<'a> {
    schema: &'a SchemaContext,
    scopes: Vec<CteScope>,
}

impl<'a> ReferenceCheck<'a> {
    fn new(schema: &'a SchemaContext) -> Self {
        Self {
            schema,
            scopes: Vec::new(),
        }
    }

    fn cte_in_scope(&self, name: &str) -> bool {
        self.scopes
            .iter()
            .any(|scope| scope.names[..scope.visible].iter().any(|n| n == name))
    }
}

impl Visitor for ReferenceCheck<'_> {
    type Break = GuardViolation;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        // A CTE body sees the siblings declared before it (and itself when recursive)
        if let Some(parent) = self.scopes.last_mut() {
            let index = parent.children;
            parent.children += 1;
            if index < parent.names.len() {
                parent.visible = if parent.recursive { index + 1 } else { index };
            }
        }

        let (names, recursive) = match &query.with {
            Some(with) => (
                with.cte_tables
                    .iter()
                    .map(|cte| cte.alias.name.value.to_lowercase())
                    .collect(),
                with.recursive,
            ),
            None => (Vec::new(), false),
        };
        self.scopes.push(CteScope {
            names,
            recursive,
            visible: 0,
            children: 0,
        });
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.scopes.pop();
        if let Some(parent) = self.scopes.last_mut() {
            parent.visible = parent.children.min(parent.names.len());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let parts: Vec<String> = relation.0.iter().map(|i| i.value.to_lowercase()).collect();
        let allowed = match parts.as_slice() {
            [name] => self.cte_in_scope(name) || self.schema.allows(name),
            [qualifier, name] => {
                PERMITTED_SCHEMAS.contains(&qualifier.as_str()) && self.schema.allows(name)
            }
            _ => false,
        };
        if allowed {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(GuardViolation::UnknownObject {
                name: relation.to_string(),
            })
        }
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        let Expr::Function(Function { name, .. }) = expr else {
            return ControlFlow::Continue(());
        };
        let last = name
            .0
            .last()
            .map(|i| i.value.to_lowercase())
            .unwrap_or_default();
        let denied = name.0.len() > 1
            || DENIED_FUNCTIONS.contains(&last.as_str())
            || DENIED_FUNCTION_PREFIXES.iter().any(|p| last.starts_with(p));
        if denied {
            ControlFlow::Break(GuardViolation::UnknownObject {
                name: name.to_string(),
            })
        } else {
            ControlFlow::Continue(())
        }
    }
}
