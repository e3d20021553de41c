//! Database source agent (§4.12).
//!
//! Runs one configured SQL query against `source_url` (a connection
//! string) and turns each row into a document of `"col: value"` lines.
//! Only Postgres is wired up — it's the only `sqlx` driver feature this
//! platform depends on; MySQL/SQLite are accepted in config but reported
//! as a missing dependency rather than silently no-op'd.

use sqlx::{postgres::PgPoolOptions, Column, Row};

use crate::error::{RagError, Result};
use crate::models::{AgentConfig, Document};

pub async fn run(config: &AgentConfig) -> Result<Vec<Document>> {
    let query = config
        .options
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RagError::ConfigInvalid("database agent requires options.query".to_string()))?;

    let driver = config.options.get("driver").and_then(|v| v.as_str()).unwrap_or("postgres");
    if driver != "postgres" {
        return Err(RagError::MissingDependency(format!(
            "database agent driver '{driver}' has no backing sqlx feature compiled in"
        )));
    }

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.source_url)
        .await
        .map_err(|e| RagError::RemoteUnavailable(format!("failed to connect to database: {e}")))?;

    let rows = sqlx::query(query)
        .fetch_all(&pool)
        .await
        .map_err(|e| RagError::Transport(format!("database query failed: {e}")))?;

    let id_column = config.options.get("id_column").and_then(|v| v.as_str());

    let mut docs = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let mut lines = Vec::with_capacity(row.columns().len());
        let mut row_id = None;
        for column in row.columns() {
            let name = column.name();
            let rendered = render_column(row, name);
            if Some(name) == id_column {
                row_id = Some(rendered.clone());
            }
            lines.push(format!("{name}: {rendered}"));
        }
        let id = row_id.unwrap_or_else(|| idx.to_string());
        docs.push(Document::new(format!("db:{}:{id}", config.agent_id), lines.join("\n")));
    }

    if let Some(max) = config.max_items {
        docs.truncate(max);
    }
    Ok(docs)
}

/// Render one column value as text without knowing its SQL type ahead of
/// time, trying the common scalar types in turn.
fn render_column(row: &sqlx::postgres::PgRow, name: &str) -> String {
    if let Ok(v) = row.try_get::<String, _>(name) {
        return v;
    }
    if let Ok(v) = row.try_get::<i64, _>(name) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<i32, _>(name) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<f64, _>(name) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<bool, _>(name) {
        return v.to_string();
    }
    if let Ok(v) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(name) {
        return v.to_rfc3339();
    }
    if let Ok(v) = row.try_get::<serde_json::Value, _>(name) {
        return v.to_string();
    }
    "<unreadable>".to_string()
}
