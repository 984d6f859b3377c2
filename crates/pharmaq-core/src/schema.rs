//! Curated schema context for the DrugCentral views
//!
//! Descriptors are hand-written in `schema/drugcentral.yaml` and loaded once at
//! startup. Any load or validation error is fatal.

use duckdb::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse schema YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid schema context: {0}")]
    Invalid(String),

    #[error("Schema does not match database: {0}")]
    Mismatch(String),

    #[error("Database error while verifying schema: {0}")]
    Database(#[from] duckdb::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleQuery {
    pub question: String,
    pub sql: String,
}

/// One queryable view as the translator sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub usage_hint: String,
    #[serde(default)]
    pub examples: Vec<ExampleQuery>,
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    #[serde(default = "default_dataset")]
    dataset: String,
    #[serde(default)]
    notes: Vec<String>,
    views: Vec<SchemaDescriptor>,
}

fn default_dataset() -> String {
    "DrugCentral".to_string()
}

#[derive(Debug, Clone)]
pub struct SchemaContext {
    dataset: String,
    notes: Vec<String>,
    views: Vec<SchemaDescriptor>,
    allowlist: HashSet<String>,
}

impl SchemaContext {
    /// Load descriptors from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_yaml::from_str(contents)?;
        let mut context = Self::from_descriptors(file.views)?;
        context.dataset = file.dataset;
        context.notes = file.notes;
        Ok(context)
    }

    pub fn from_descriptors(views: Vec<SchemaDescriptor>) -> Result<Self, SchemaError> {
        if views.is_empty() {
            return Err(SchemaError::Invalid("no views described".to_string()));
        }

        let mut allowlist = HashSet::new();
        for view in &views {
            check_identifier(&view.name)?;
            if !allowlist.insert(view.name.to_lowercase()) {
                return Err(SchemaError::Invalid(format!(
                    "view `{}` is described twice",
                    view.name
                )));
            }
            if view.columns.is_empty() {
                return Err(SchemaError::Invalid(format!(
                    "view `{}` has no columns",
                    view.name
                )));
            }
            let mut seen = HashSet::new();
            for column in &view.columns {
                check_identifier(&column.name)?;
                if !seen.insert(column.name.to_lowercase()) {
                    return Err(SchemaError::Invalid(format!(
                        "column `{}` appears twice in view `{}`",
                        column.name, view.name
                    )));
                }
            }
        }

        Ok(Self {
            dataset: default_dataset(),
            notes: Vec::new(),
            views,
            allowlist,
        })
    }

    /// Descriptors in file order
    pub fn describe(&self) -> &[SchemaDescriptor] {
        &self.views
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Case-insensitive allowlist lookup on an unqualified name
    pub fn allows(&self, name: &str) -> bool {
        self.allowlist.contains(&name.to_lowercase())
    }

    /// Format the context as markdown for the translator prompt
    pub fn render_prompt(&self) -> String {
        let mut md = String::new();

        md.push_str(&format!("# {} views\n\n", self.dataset));
        md.push_str("Only the views below may be queried.\n\n");

        for view in &self.views {
            md.push_str(&format!("## View: `{}`\n\n", view.name));
            if !view.description.is_empty() {
                md.push_str(&format!("{}\n\n", view.description.trim()));
            }
            if !view.usage_hint.is_empty() {
                md.push_str(&format!("**When to use:** {}\n\n", view.usage_hint.trim()));
            }

            md.push_str("| Column | Type | Description |\n");
            md.push_str("|--------|------|-------------|\n");
            for col in &view.columns {
                md.push_str(&format!(
                    "| `{}` | {} | {} |\n",
                    col.name, col.data_type, col.description
                ));
            }
            md.push('\n');

            for example in &view.examples {
                md.push_str(&format!(
                    "-- {}\n```sql\n{}\n```\n\n",
                    example.question,
                    example.sql.trim()
                ));
            }
        }

        if !self.notes.is_empty() {
            md.push_str("## Important notes\n\n");
            for note in &self.notes {
                md.push_str(&format!("- {}\n", note));
            }
        }

        md
    }

    /// Check that every described view and column exists in the database
    pub fn verify_against(&self, conn: &Connection) -> Result<(), SchemaError> {
        let mut stmt = conn.prepare(
            "SELECT column_name FROM information_schema.columns \
             WHERE lower(table_name) = lower(?) \
             ORDER BY ordinal_position",
        )?;

        for view in &self.views {
            let actual: HashSet<String> = stmt
                .query_map([view.name.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|c| c.to_lowercase())
                .collect();

            if actual.is_empty() {
                return Err(SchemaError::Mismatch(format!(
                    "view `{}` does not exist",
                    view.name
                )));
            }

            let missing: Vec<&str> = view
                .columns
                .iter()
                .filter(|c| !actual.contains(&c.name.to_lowercase()))
                .map(|c| c.name.as_str())
                .collect();
            if !missing.is_empty() {
                return Err(SchemaError::Mismatch(format!(
                    "view `{}` is missing columns: {}",
                    view.name,
                    missing.join(", ")
                )));
            }
        }

        tracing::debug!(views = self.views.len(), "Schema context verified against database");
        Ok(())
    }
}

fn check_identifier(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SchemaError::Invalid(format!(
            "`{}` is not a plain SQL identifier",
            name
        )))
    }
}
