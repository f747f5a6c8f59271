//! Schema discovery and destination preparation.
//!
//! Both sides of a migration expose the same capability set: discover
//! what a series looks like, or make an engine ready to receive one.
//! The concrete implementation is chosen by [`create_schema_manager`]
//! from the engine role.

pub mod influx;
pub mod timescale;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::config::DestinationConfig;
use crate::error::Result;
use crate::model::DataSetDefinition;
use crate::source::SourceClient;

/// Capability set over one engine's schema.
#[async_trait]
pub trait SchemaManager: Send + Sync {
    /// Discovers the definition of `series` in the managed engine.
    async fn fetch_data_set(&self, series: &str) -> Result<DataSetDefinition>;

    /// Validates or creates a destination structure matching `def`.
    async fn prepare_data_set(&self, def: &DataSetDefinition) -> Result<()>;
}

/// Role-specific dependencies for building a schema manager.
pub enum EngineRole {
    /// Discover series definitions in the source engine.
    Source {
        /// Client for the source query API.
        client: Box<dyn SourceClient>,
        /// Database the series live in.
        database: String,
        /// Optional retention policy qualifier.
        retention_policy: Option<String>,
        /// Widen integer/float field conflicts to float instead of failing.
        coerce_int_to_float: bool,
    },
    /// Prepare hypertables in the destination engine.
    Destination {
        /// Destination connection pool.
        pool: PgPool,
        /// Destination table configuration.
        config: DestinationConfig,
    },
}

/// Creates the schema manager implementation for `role`.
#[must_use]
pub fn create_schema_manager(role: EngineRole) -> Box<dyn SchemaManager> {
    match role {
        EngineRole::Source {
            client,
            database,
            retention_policy,
            coerce_int_to_float,
        } => Box::new(influx::InfluxSchemaManager::new(
            client,
            database,
            retention_policy,
            coerce_int_to_float,
        )),
        EngineRole::Destination { pool, config } => Box::new(
            timescale::TimescaleSchemaManager::new(pool, &config),
        ),
    }
}
