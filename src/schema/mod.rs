//! Database schema catalog.
//!
//! Loads a Spider-style `tables.json` (an array of database descriptions) and
//! renders one database's schema as prompt context. The SQLite file of a
//! database is expected at `<db_root>/<db_id>/<db_id>.sqlite`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors that can occur while loading or querying the schema catalog.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Schema file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Unknown database '{0}'")]
    UnknownDatabase(String),

    #[error("Invalid schema for '{db_id}': {message}")]
    Invalid { db_id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A primary key entry: a single column index, or several for composite keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Single(i64),
    Composite(Vec<i64>),
}

impl PrimaryKey {
    fn contains(&self, column: usize) -> bool {
        let column = column as i64;
        match self {
            PrimaryKey::Single(idx) => *idx == column,
            PrimaryKey::Composite(cols) => cols.contains(&column),
        }
    }
}

/// One database description in Spider format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// Database identifier.
    pub db_id: String,

    /// Table names as they appear in the database.
    pub table_names_original: Vec<String>,

    /// `(table index, column name)` pairs. Index `-1` is the `*` pseudo-column.
    pub column_names_original: Vec<(i64, String)>,

    /// Column types, parallel to `column_names_original`.
    pub column_types: Vec<String>,

    /// Primary key column indices.
    #[serde(default)]
    pub primary_keys: Vec<PrimaryKey>,

    /// `(column index, referenced column index)` pairs.
    #[serde(default)]
    pub foreign_keys: Vec<(usize, usize)>,
}

impl DatabaseSchema {
    /// Checks index consistency so formatting never reads out of bounds.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |message: String| SchemaError::Invalid {
            db_id: self.db_id.clone(),
            message,
        };

        if self.column_types.len() != self.column_names_original.len() {
            return Err(invalid(format!(
                "{} column types for {} columns",
                self.column_types.len(),
                self.column_names_original.len()
            )));
        }
        let tables = self.table_names_original.len() as i64;
        if let Some((idx, name)) = self
            .column_names_original
            .iter()
            .find(|(idx, _)| *idx < -1 || *idx >= tables)
        {
            return Err(invalid(format!(
                "column '{}' references table index {}",
                name, idx
            )));
        }
        let columns = self.column_names_original.len();
        if let Some((from, to)) = self
            .foreign_keys
            .iter()
            .find(|(from, to)| *from >= columns || *to >= columns)
        {
            return Err(invalid(format!(
                "foreign key {} -> {} is out of range",
                from, to
            )));
        }
        Ok(())
    }

    fn is_primary_key(&self, column: usize) -> bool {
        self.primary_keys.iter().any(|pk| pk.contains(column))
    }

    fn column_table(&self, column: usize) -> Option<usize> {
        self.column_names_original
            .get(column)
            .and_then(|(idx, _)| usize::try_from(*idx).ok())
    }

    /// Renders the schema as prompt context: tables, typed columns with
    /// primary-key marks, and outgoing foreign keys.
    pub fn format_for_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[CONTEXT: DATABASE SCHEMA]");
        let _ = writeln!(out, "Database: {}", self.db_id);
        out.push('\n');

        for (table_idx, table_name) in self.table_names_original.iter().enumerate() {
            let _ = writeln!(out, "Table: {}", table_name);
            out.push_str("Columns:\n");
            for (col_idx, (_, col_name)) in self
                .column_names_original
                .iter()
                .enumerate()
                .filter(|(i, _)| self.column_table(*i) == Some(table_idx))
            {
                let col_type = self
                    .column_types
                    .get(col_idx)
                    .map(String::as_str)
                    .unwrap_or("unknown");
                let pk = if self.is_primary_key(col_idx) {
                    " (primary key)"
                } else {
                    ""
                };
                let _ = writeln!(out, "  - {} ({}){}", col_name, col_type, pk);
            }

            let fks: Vec<String> = self
                .foreign_keys
                .iter()
                .filter(|(from, _)| self.column_table(*from) == Some(table_idx))
                .filter_map(|(from, to)| {
                    let (_, from_col) = self.column_names_original.get(*from)?;
                    let (_, to_col) = self.column_names_original.get(*to)?;
                    let to_table = self.table_names_original.get(self.column_table(*to)?)?;
                    Some(format!("  - {} references {}.{}", from_col, to_table, to_col))
                })
                .collect();
            if !fks.is_empty() {
                out.push_str("Foreign keys:\n");
                out.push_str(&fks.join("\n"));
                out.push('\n');
            }
            out.push('\n');
        }

        out.push_str("Constraint: every statement must use only this schema.\n");
        out
    }
}

/// All known database schemas, indexed by `db_id`.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, DatabaseSchema>,
}

impl SchemaCatalog {
    /// Builds a catalog, validating every schema.
    pub fn from_schemas(schemas: Vec<DatabaseSchema>) -> Result<Self, SchemaError> {
        let mut catalog = Self::default();
        for schema in schemas {
            schema.validate()?;
            catalog.schemas.insert(schema.db_id.clone(), schema);
        }
        Ok(catalog)
    }

    /// Loads a Spider-style schema file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SchemaError::FileNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).await?;
        let schemas: Vec<DatabaseSchema> = serde_json::from_str(&content)?;
        let catalog = Self::from_schemas(schemas)?;
        tracing::info!(path = %path.display(), databases = catalog.len(), "Loaded schema catalog");
        Ok(catalog)
    }

    pub fn get(&self, db_id: &str) -> Result<&DatabaseSchema, SchemaError> {
        self.schemas
            .get(db_id)
            .ok_or_else(|| SchemaError::UnknownDatabase(db_id.to_string()))
    }

    /// Renders the schema of `db_id` as prompt context.
    pub fn format_for_prompt(&self, db_id: &str) -> Result<String, SchemaError> {
        self.get(db_id).map(DatabaseSchema::format_for_prompt)
    }

    pub fn db_ids(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Location of a database's SQLite file under `db_root`.
pub fn database_path(db_root: &Path, db_id: &str) -> PathBuf {
    db_root.join(db_id).join(format!("{}.sqlite", db_id))
}
