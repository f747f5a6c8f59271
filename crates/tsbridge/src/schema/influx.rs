//! Series discovery against the InfluxDB metadata queries.
//!
//! Tags come from `SHOW TAG KEYS`, fields and their native types from
//! `SHOW FIELD KEYS`. A field reported with more than one native type
//! across shards is a conflict; the only supported resolution is the
//! configured integer-to-float widening.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use super::SchemaManager;
use crate::error::{Error, Result};
use crate::model::{ColumnInfo, ColumnRole, DataSetDefinition, DataType};
use crate::source::{QueryResponse, SourceClient, SourceQuery};

const TIME_COLUMN: &str = "time";

/// Discovers series definitions in one source database.
pub struct InfluxSchemaManager {
    client: Box<dyn SourceClient>,
    database: String,
    retention_policy: Option<String>,
    coerce_int_to_float: bool,
}

impl InfluxSchemaManager {
    /// Creates a schema manager over `client` for `database`.
    pub fn new(
        client: Box<dyn SourceClient>,
        database: impl Into<String>,
        retention_policy: Option<String>,
        coerce_int_to_float: bool,
    ) -> Self {
        Self {
            client,
            database: database.into(),
            retention_policy,
            coerce_int_to_float,
        }
    }

    async fn metadata_query(&self, command: String, series: &str) -> Result<QueryResponse> {
        let query = SourceQuery::new(command, self.database.clone(), self.retention_policy.clone());
        let response = self.client.query(&query).await.map_err(|e| {
            Error::SchemaDiscovery(format!("could not reach the source for '{series}': {e}"))
        })?;
        if let Some(message) = response.results.iter().find_map(|r| r.error.as_deref()) {
            return Err(Error::SchemaDiscovery(format!("series '{series}': {message}")));
        }
        Ok(response)
    }

    async fn discover_tags(&self, series: &str) -> Result<Vec<ColumnInfo>> {
        let response = self
            .metadata_query(format!("SHOW TAG KEYS FROM \"{series}\""), series)
            .await?;

        let mut tags = Vec::new();
        for row in series_values(&response) {
            let Some(name) = row.first().and_then(serde_json::Value::as_str) else {
                return Err(Error::SchemaDiscovery(format!(
                    "malformed tag key row for series '{series}'"
                )));
            };
            tags.push(ColumnInfo::new(name, DataType::Text, ColumnRole::Tag));
        }
        Ok(tags)
    }

    async fn discover_fields(&self, series: &str) -> Result<Vec<ColumnInfo>> {
        let response = self
            .metadata_query(format!("SHOW FIELD KEYS FROM \"{series}\""), series)
            .await?;

        // One row per (key, native type); a key repeats when shards
        // disagree about its type.
        let mut order: Vec<String> = Vec::new();
        let mut types: HashMap<String, DataType> = HashMap::new();
        for row in series_values(&response) {
            let name = row.first().and_then(serde_json::Value::as_str);
            let native = row.get(1).and_then(serde_json::Value::as_str);
            let (Some(name), Some(native)) = (name, native) else {
                return Err(Error::SchemaDiscovery(format!(
                    "malformed field key row for series '{series}'"
                )));
            };
            let data_type = field_type(series, native)?;
            match types.entry(name.to_string()) {
                Entry::Vacant(slot) => {
                    order.push(name.to_string());
                    slot.insert(data_type);
                }
                Entry::Occupied(mut slot) => {
                    let resolved = self.resolve_conflict(series, name, *slot.get(), data_type)?;
                    slot.insert(resolved);
                }
            }
        }

        if order.is_empty() {
            return Err(Error::SchemaDiscovery(format!(
                "series '{series}' not found or has no fields"
            )));
        }

        Ok(order
            .into_iter()
            .map(|name| {
                let data_type = types[&name];
                ColumnInfo::new(name, data_type, ColumnRole::Field)
            })
            .collect())
    }

    fn resolve_conflict(
        &self,
        series: &str,
        field: &str,
        existing: DataType,
        incoming: DataType,
    ) -> Result<DataType> {
        if existing == incoming {
            return Ok(existing);
        }
        let int_float_pair = matches!(
            (existing, incoming),
            (DataType::Integer, DataType::Float) | (DataType::Float, DataType::Integer)
        );
        if self.coerce_int_to_float && int_float_pair {
            debug!("field '{field}' of series '{series}' widened to float");
            return Ok(DataType::Float);
        }
        Err(Error::SchemaDiscovery(format!(
            "field '{field}' of series '{series}' has conflicting types {existing} and {incoming}"
        )))
    }
}

fn field_type(series: &str, native: &str) -> Result<DataType> {
    match native {
        "integer" => Ok(DataType::Integer),
        "float" => Ok(DataType::Float),
        "boolean" => Ok(DataType::Boolean),
        "string" => Ok(DataType::Text),
        other => Err(Error::SchemaDiscovery(format!(
            "series '{series}' has a field of unsupported type '{other}'"
        ))),
    }
}

fn series_values(response: &QueryResponse) -> impl Iterator<Item = &Vec<serde_json::Value>> {
    response
        .results
        .iter()
        .flat_map(|result| result.series.iter())
        .flat_map(|series| series.values.iter())
}

#[async_trait]
impl SchemaManager for InfluxSchemaManager {
    async fn fetch_data_set(&self, series: &str) -> Result<DataSetDefinition> {
        debug!("discovering schema for series '{series}'");
        let tags = self.discover_tags(series).await?;
        let fields = self.discover_fields(series).await?;

        let mut columns = Vec::with_capacity(1 + tags.len() + fields.len());
        columns.push(ColumnInfo::new(
            TIME_COLUMN,
            DataType::Timestamp,
            ColumnRole::Time,
        ));
        columns.extend(tags);
        columns.extend(fields);

        Ok(DataSetDefinition {
            name: series.to_string(),
            columns,
        })
    }

    async fn prepare_data_set(&self, def: &DataSetDefinition) -> Result<()> {
        Err(Error::Usage(format!(
            "the source schema manager cannot prepare data set '{}'",
            def.name
        )))
    }
}

#[cfg(test)]
#[path = "influx_tests.rs"]
mod tests;
