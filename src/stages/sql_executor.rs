//! SQLite execution stage.
//!
//! Runs the statement from the latest generation message against a
//! read-only SQLite database and reports the outcome as text. Statement
//! failures are reported in-band with an `ERROR:` prefix so the router can
//! send them to refinement; only infrastructure failures are stage errors.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row};
use std::path::{Path, PathBuf};

use super::{Capability, Stage, StageError};
use crate::conversation::{ConversationState, Role, DEFAULT_ERROR_MARKER};
use crate::utils::extract_sql_from_response;

/// Default number of rows rendered in the stage output.
pub const DEFAULT_MAX_ROWS: usize = 20;

const CAPABILITIES: &[Capability] = &[Capability::ExecuteSql];

/// Result of running one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The statement ran. `rows` holds at most the configured row limit.
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
        total: usize,
    },
    /// The database rejected the statement, or there was nothing to run.
    Error(String),
}

impl ExecutionOutcome {
    /// Renders the outcome as stage output.
    pub fn render(&self) -> String {
        match self {
            ExecutionOutcome::Error(message) => format!("{} {}", DEFAULT_ERROR_MARKER, message),
            ExecutionOutcome::Rows {
                columns,
                rows,
                total,
            } => {
                let noun = if *total == 1 { "row" } else { "rows" };
                let mut out = format!("OK: {} {}", total, noun);
                if !columns.is_empty() {
                    out.push('\n');
                    out.push_str(&columns.join(" | "));
                }
                for row in rows {
                    out.push('\n');
                    out.push_str(&row.join(" | "));
                }
                if *total > rows.len() {
                    out.push_str(&format!("\n... ({} more rows)", total - rows.len()));
                }
                out
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionOutcome::Error(_))
    }
}

/// Executes generated SQL against one SQLite database file.
pub struct SqliteExecutionStage {
    name: String,
    db_path: PathBuf,
    max_rows: usize,
}

impl SqliteExecutionStage {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            name: Role::Execution.as_str().to_string(),
            db_path: db_path.into(),
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Runs `sql` and collects up to `max_rows` rendered rows.
    pub async fn execute(&self, sql: &str) -> Result<ExecutionOutcome, StageError> {
        if !self.db_path.exists() {
            return Ok(ExecutionOutcome::Error(format!(
                "database file not found: {}",
                self.db_path.display()
            )));
        }

        let mut conn = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .read_only(true)
            .create_if_missing(false)
            .connect()
            .await?;

        let result = sqlx::query(sql).fetch_all(&mut conn).await;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Failed to close SQLite connection");
        }

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => return Ok(ExecutionOutcome::Error(describe_query_error(&e))),
        };

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let total = rows.len();
        let rendered = rows
            .iter()
            .take(self.max_rows)
            .map(|row| (0..row.len()).map(|i| render_value(row, i)).collect())
            .collect();

        Ok(ExecutionOutcome::Rows {
            columns,
            rows: rendered,
            total,
        })
    }

    /// The statement to run: from the last generation message, else the
    /// last message of any sender.
    fn statement(conversation: &ConversationState) -> Option<String> {
        let generation = Role::Generation.as_str();
        conversation
            .messages()
            .iter()
            .rev()
            .find(|m| m.sender == generation)
            .or_else(|| conversation.last())
            .and_then(|m| extract_sql_from_response(&m.content))
    }
}

#[async_trait]
impl Stage for SqliteExecutionStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn invoke(&self, conversation: &ConversationState) -> Result<String, StageError> {
        let outcome = match Self::statement(conversation) {
            Some(sql) => {
                tracing::debug!(db = %self.db_path.display(), sql = %sql, "Executing SQL");
                self.execute(&sql).await?
            }
            None => ExecutionOutcome::Error("no SQL statement found in the last message".into()),
        };

        if outcome.is_error() {
            tracing::info!(db = %self.db_path.display(), outcome = %outcome.render(), "SQL execution reported an error");
        }
        Ok(outcome.render())
    }
}

fn describe_query_error(error: &sqlx::Error) -> String {
    match error {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

/// Renders one cell, trying the SQLite storage classes in turn.
fn render_value(row: &SqliteRow, index: usize) -> String {
    fn show<T: ToString>(value: Option<T>) -> String {
        value.map_or_else(|| "NULL".to_string(), |v| v.to_string())
    }

    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return show(v);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return show(v);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return show(v);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return show(v.map(|bytes| format!("<{} bytes>", bytes.len())));
    }
    "?".to_string()
}
