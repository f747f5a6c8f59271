//! Conversion of raw source value rows into canonical rows.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{DataSetDefinition, DataType, FieldValue, Row};

/// Converts the positional value rows of one series into rows aligned
/// to its discovered definition.
#[derive(Debug, Clone)]
pub struct RowConverter {
    data_def: Arc<DataSetDefinition>,
}

impl RowConverter {
    /// Creates a converter for `data_def`.
    #[must_use]
    pub fn new(data_def: Arc<DataSetDefinition>) -> Self {
        Self { data_def }
    }

    /// Decodes one raw value row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extraction`] if the row length does not match
    /// the definition or a value does not decode as its column's type.
    pub fn convert(&self, raw: &[Value]) -> Result<Row> {
        let columns = &self.data_def.columns;
        if raw.len() != columns.len() {
            return Err(Error::Extraction(format!(
                "row of series '{}' has {} values, expected {}",
                self.data_def.name,
                raw.len(),
                columns.len()
            )));
        }

        columns
            .iter()
            .zip(raw)
            .map(|(column, value)| {
                convert_value(value, column.data_type).map_err(|reason| {
                    Error::Extraction(format!(
                        "column '{}' of series '{}': {reason}",
                        column.name, self.data_def.name
                    ))
                })
            })
            .collect()
    }
}

fn convert_value(value: &Value, data_type: DataType) -> std::result::Result<FieldValue, String> {
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    match data_type {
        DataType::Integer => value
            .as_i64()
            .map(FieldValue::Integer)
            .ok_or_else(|| format!("expected an integer, got {value}")),
        DataType::Float => value
            .as_f64()
            .map(FieldValue::Float)
            .ok_or_else(|| format!("expected a float, got {value}")),
        DataType::Boolean => value
            .as_bool()
            .map(FieldValue::Boolean)
            .ok_or_else(|| format!("expected a boolean, got {value}")),
        DataType::Text => value
            .as_str()
            .map(|text| FieldValue::Text(text.to_string()))
            .ok_or_else(|| format!("expected a string, got {value}")),
        DataType::Timestamp => convert_timestamp(value),
    }
}

/// The source renders timestamps as RFC 3339 strings by default, or as
/// epoch nanoseconds when an epoch precision was requested.
fn convert_timestamp(value: &Value) -> std::result::Result<FieldValue, String> {
    if let Some(text) = value.as_str() {
        return DateTime::parse_from_rfc3339(text)
            .map(|ts| FieldValue::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|e| format!("invalid timestamp '{text}': {e}"));
    }
    if let Some(nanos) = value.as_i64() {
        return Ok(FieldValue::Timestamp(Utc.timestamp_nanos(nanos)));
    }
    Err(format!("expected a timestamp, got {value}"))
}
