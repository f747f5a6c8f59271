//! Destination preparation for TimescaleDB hypertables.
//!
//! Given a discovered definition, either creates a matching hypertable
//! or validates that an existing table already matches it. Column
//! validation is by name and type; extra destination columns are
//! rejected so positional inserts stay aligned.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row as _;
use tracing::{debug, info};

use super::SchemaManager;
use crate::config::DestinationConfig;
use crate::error::{Error, Result};
use crate::model::{DataSetDefinition, DataType};

/// Prepares hypertables in one destination database.
pub struct TimescaleSchemaManager {
    pool: PgPool,
    schema: Option<String>,
    chunk_time_interval: String,
}

impl TimescaleSchemaManager {
    /// Creates a schema manager over `pool` for the configured target.
    pub fn new(pool: PgPool, config: &DestinationConfig) -> Self {
        Self {
            pool,
            schema: config.schema.clone(),
            chunk_time_interval: config.chunk_time_interval.clone(),
        }
    }

    async fn existing_columns(&self, table: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = $1 AND table_schema = COALESCE($2, current_schema()) \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .bind(self.schema.as_deref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("column_name"), row.get("data_type")))
            .collect())
    }
}

fn validate_existing(def: &DataSetDefinition, existing: &[(String, String)]) -> Result<()> {
    if existing.len() != def.columns.len() {
        return Err(Error::SchemaMismatch(format!(
            "table '{}' has {} columns, the discovered schema has {}",
            def.name,
            existing.len(),
            def.columns.len()
        )));
    }
    for column in &def.columns {
        let expected = information_schema_type(column.data_type);
        match existing.iter().find(|(name, _)| name == &column.name) {
            Some((_, actual)) if actual == expected => {}
            Some((_, actual)) => {
                return Err(Error::SchemaMismatch(format!(
                    "column '{}' of table '{}' is '{}', expected '{}'",
                    column.name, def.name, actual, expected
                )));
            }
            None => {
                return Err(Error::SchemaMismatch(format!(
                    "table '{}' is missing column '{}'",
                    def.name, column.name
                )));
            }
        }
    }
    Ok(())
}

fn quoted_table(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("\"{schema}\".\"{name}\""),
        None => format!("\"{name}\""),
    }
}

fn create_table_sql(schema: Option<&str>, def: &DataSetDefinition) -> String {
    let columns = def
        .columns
        .iter()
        .map(|c| format!("\"{}\" {}", c.name, postgres_type(c.data_type)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quoted_table(schema, &def.name),
        columns
    )
}

fn create_hypertable_sql(
    schema: Option<&str>,
    def: &DataSetDefinition,
    chunk_time_interval: &str,
) -> Result<String> {
    let time_column = def.time_column().ok_or_else(|| {
        Error::SchemaMismatch(format!("data set '{}' has no time column", def.name))
    })?;
    let relation = match schema {
        Some(schema) => format!("{}.{}", schema, def.name),
        None => def.name.clone(),
    };
    Ok(format!(
        "SELECT create_hypertable('{}', '{}', chunk_time_interval => INTERVAL '{}', if_not_exists => TRUE)",
        relation, time_column.name, chunk_time_interval
    ))
}

const fn postgres_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Integer => "bigint",
        DataType::Float => "double precision",
        DataType::Boolean => "boolean",
        DataType::Text => "text",
        DataType::Timestamp => "timestamptz",
    }
}

const fn information_schema_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Integer => "bigint",
        DataType::Float => "double precision",
        DataType::Boolean => "boolean",
        DataType::Text => "text",
        DataType::Timestamp => "timestamp with time zone",
    }
}

#[async_trait]
impl SchemaManager for TimescaleSchemaManager {
    async fn fetch_data_set(&self, series: &str) -> Result<DataSetDefinition> {
        Err(Error::Usage(format!(
            "the destination schema manager cannot discover data set '{series}'"
        )))
    }

    async fn prepare_data_set(&self, def: &DataSetDefinition) -> Result<()> {
        let existing = self.existing_columns(&def.name).await?;
        if !existing.is_empty() {
            debug!("table '{}' already exists, validating", def.name);
            return validate_existing(def, &existing);
        }

        info!("creating hypertable for '{}'", def.name);
        sqlx::query(&create_table_sql(self.schema.as_deref(), def))
            .execute(&self.pool)
            .await?;
        sqlx::query(&create_hypertable_sql(
            self.schema.as_deref(),
            def,
            &self.chunk_time_interval,
        )?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
