//! Bulk ingestion into TimescaleDB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use super::DataSink;
use crate::error::{Error, Result};
use crate::model::{Bundle, ColumnInfo, DataSetDefinition, DataType, FieldValue, Row};

/// Upper bound on rows per multi-row insert.
const MAX_BATCH_ROWS: usize = 1_000;

/// The server caps bind parameters per statement at `u16::MAX`.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Writes rows into the destination hypertables in batched multi-row
/// inserts.
pub struct TimescaleSink {
    pool: PgPool,
    schema: Option<String>,
}

impl TimescaleSink {
    /// Creates a sink writing through `pool`, optionally into `schema`.
    pub fn new(pool: PgPool, schema: Option<String>) -> Self {
        Self { pool, schema }
    }

    async fn write_batch(
        &self,
        prefix: &str,
        columns: &[ColumnInfo],
        batch: &[Row],
    ) -> Result<()> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(prefix);
        builder.push_values(batch, |mut values, row| {
            for (column, value) in columns.iter().zip(row) {
                match value {
                    FieldValue::Integer(v) => {
                        values.push_bind(*v);
                    }
                    FieldValue::Float(v) => {
                        values.push_bind(*v);
                    }
                    FieldValue::Boolean(v) => {
                        values.push_bind(*v);
                    }
                    FieldValue::Text(v) => {
                        values.push_bind(v.clone());
                    }
                    FieldValue::Timestamp(v) => {
                        values.push_bind(*v);
                    }
                    FieldValue::Null => push_typed_null(&mut values, column.data_type),
                }
            }
        });
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Loading(format!("bulk insert failed: {e}")))?;
        Ok(())
    }
}

/// Binds a NULL carrying the column's parameter type, so the statement
/// still prepares against typed destination columns.
fn push_typed_null(
    values: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    data_type: DataType,
) {
    match data_type {
        DataType::Integer => {
            values.push_bind(Option::<i64>::None);
        }
        DataType::Float => {
            values.push_bind(Option::<f64>::None);
        }
        DataType::Boolean => {
            values.push_bind(Option::<bool>::None);
        }
        DataType::Text => {
            values.push_bind(Option::<String>::None);
        }
        DataType::Timestamp => {
            values.push_bind(Option::<DateTime<Utc>>::None);
        }
    }
}

/// Rows per insert, keeping the statement under the bind parameter cap.
fn batch_rows(column_count: usize) -> usize {
    MAX_BATCH_ROWS.min(MAX_BIND_PARAMS / column_count.max(1))
}

fn insert_prefix(schema: Option<&str>, def: &DataSetDefinition) -> String {
    let table = match schema {
        Some(schema) => format!("\"{}\".\"{}\"", schema, def.name),
        None => format!("\"{}\"", def.name),
    };
    let columns = def
        .columns
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {table} ({columns}) ")
}

#[async_trait]
impl DataSink for TimescaleSink {
    async fn consume(&self, bundle: Bundle, progress: &ProgressBar) -> Result<u64> {
        let Bundle { data_def, mut rows } = bundle;
        let prefix = insert_prefix(self.schema.as_deref(), &data_def);
        let batch_size = batch_rows(data_def.columns.len());

        let mut batch: Vec<Row> = Vec::with_capacity(batch_size);
        let mut total = 0u64;
        while let Some(row) = rows.recv().await {
            batch.push(row);
            if batch.len() >= batch_size {
                self.write_batch(&prefix, &data_def.columns, &batch).await?;
                total += batch.len() as u64;
                progress.inc(batch.len() as u64);
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.write_batch(&prefix, &data_def.columns, &batch).await?;
            total += batch.len() as u64;
            progress.inc(batch.len() as u64);
        }

        debug!("wrote {total} rows into '{}'", data_def.name);
        Ok(total)
    }
}
