//! `execute_sql_query`: read-only analytics over the plant database.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use iiot_assistant_core::capability::TOOL_EXECUTE_SQL;
use iiot_assistant_core::models::PushEvent;
use serde_json::{json, Map, Value};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use super::{required_str, Tool, ToolContext};

pub struct SqlQueryTool {
    pool: Option<SqlitePool>,
    max_rows: usize,
}

impl SqlQueryTool {
    /// `pool` should be opened read-only (see [`crate::db::connect_read_only`]).
    pub fn new(pool: Option<SqlitePool>, max_rows: usize) -> Self {
        Self {
            pool,
            max_rows: max_rows.max(1),
        }
    }

    async fn run(&self, pool: &SqlitePool, sql: &str) -> Result<(Vec<Value>, bool)> {
        let mut rows = sqlx::query(sql).fetch(pool);
        let mut out = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.try_next().await? {
            if out.len() == self.max_rows {
                truncated = true;
                break;
            }
            out.push(row_to_json(&row));
        }
        Ok((out, truncated))
    }
}

/// Accept exactly one SELECT (or WITH … SELECT) statement.
pub fn check_read_only(sql: &str) -> Result<&str> {
    let statement = sql.trim().trim_end_matches(';').trim();
    if statement.is_empty() {
        return Err(anyhow!("empty statement"));
    }
    if statement.contains(';') {
        return Err(anyhow!("only a single statement is allowed"));
    }
    let first = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if first != "select" && first != "with" {
        return Err(anyhow!("only SELECT queries are allowed"));
    }
    Ok(statement)
}

fn row_to_json(row: &SqliteRow) -> Value {
    let mut object = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), cell_to_json(row, i));
    }
    Value::Object(object)
}

fn cell_to_json(row: &SqliteRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
        Err(_) => return Value::Null,
    };
    match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => row
            .try_get::<i64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" | "NUMERIC" | "FLOAT" | "DOUBLE" => row
            .try_get::<f64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|bytes| json!(format!("<{} bytes>", bytes.len())))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

#[async_trait]
impl Tool for SqlQueryTool {
    fn name(&self) -> &str {
        TOOL_EXECUTE_SQL
    }

    fn description(&self) -> &str {
        "Run a SQL SELECT statement against the plant database to fetch live or historical statistics."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sqlQuery": { "type": "string", "description": "A valid SQL SELECT statement built from the user's request" }
            },
            "required": ["sqlQuery"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
        let sql = required_str(&params, "sqlQuery")?;
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| anyhow!("no database configured (tools.database_url)"))?;

        ctx.push
            .broadcast(PushEvent::text(format!("Running data query:\n{sql}")));

        let statement = match check_read_only(sql) {
            Ok(statement) => statement,
            Err(e) => {
                return Ok(format!(
                    "SQL rejected: {e}. Generate a single SELECT statement and call this tool again."
                ))
            }
        };

        match self.run(pool, statement).await {
            Ok((rows, _)) if rows.is_empty() => {
                Ok("Query succeeded but no rows matched.".to_string())
            }
            Ok((rows, truncated)) => {
                tracing::debug!(rows = rows.len(), truncated, "sql query returned rows");
                let mut text = format!("Query result (JSON): {}.", Value::Array(rows));
                if truncated {
                    text.push_str(&format!(
                        " Only the first {} rows are shown.",
                        self.max_rows
                    ));
                }
                Ok(text)
            }
            Err(e) => Ok(format!(
                "SQL failed: {e}. Check the SQL syntax and call this tool again."
            )),
        }
    }
}
