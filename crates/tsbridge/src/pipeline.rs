//! Migration pipeline orchestration.
//!
//! One extraction unit runs per measure, all sharing a single error
//! bus: the first fatal failure halts every sibling at its next chunk
//! boundary. The pipeline wires discovery, destination preparation,
//! extraction and ingestion together and reports aggregate statistics.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::bus::ErrorBroadcaster;
use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::schema::{create_schema_manager, EngineRole, SchemaManager};
use crate::sink::timescale::TimescaleSink;
use crate::sink::{DataSink, DiscardSink};
use crate::source::influx::HttpClientFactory;
use crate::source::ClientFactory;

/// Migration statistics.
#[derive(Debug, Default, Clone)]
pub struct MigrationStats {
    /// Measures migrated.
    pub measures: u64,
    /// Rows written to (or, in a dry run, drained toward) the destination.
    pub rows: u64,
    /// Duration in seconds.
    pub duration_secs: f64,
}

impl MigrationStats {
    /// Rows per second over the whole migration.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.rows as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Migration pipeline.
pub struct Pipeline {
    config: MigrationConfig,
}

impl Pipeline {
    /// Creates a pipeline for a validated configuration.
    #[must_use]
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Runs the migration to completion.
    ///
    /// # Errors
    ///
    /// Returns the first error surfaced by any measure: discovery or
    /// destination preparation failure, a broadcast extraction failure,
    /// or a destination write failure.
    pub async fn run(&self) -> Result<MigrationStats> {
        let start = std::time::Instant::now();
        info!(
            "starting migration of {} measures from '{}'",
            self.config.measures.len(),
            self.config.source.database
        );

        let bus = Arc::new(ErrorBroadcaster::new());
        let connections: Arc<dyn ClientFactory> = Arc::new(HttpClientFactory);

        let (sink, destination): (Arc<dyn DataSink>, Option<Box<dyn SchemaManager>>) =
            if self.config.options.dry_run {
                info!("dry run mode - not writing to the destination");
                (Arc::new(DiscardSink), None)
            } else {
                let pool = PgPool::connect(&self.config.destination.connection_string)
                    .await
                    .map_err(|e| Error::DestinationConnection(e.to_string()))?;
                let sink = Arc::new(TimescaleSink::new(
                    pool.clone(),
                    self.config.destination.schema.clone(),
                ));
                let manager = create_schema_manager(EngineRole::Destination {
                    pool,
                    config: self.config.destination.clone(),
                });
                (sink, Some(manager))
            };
        let destination = destination.as_deref();

        let progress = MultiProgress::new();
        let jobs = self.config.measures.iter().map(|measure| {
            let bus = Arc::clone(&bus);
            let connections = Arc::clone(&connections);
            let sink = Arc::clone(&sink);
            let bar = progress.add(measure_progress_bar(measure));
            async move {
                self.migrate_measure(measure, bus, connections, destination, sink, bar)
                    .await
            }
        });

        let rows: Vec<u64> = stream::iter(jobs)
            .buffer_unordered(self.config.options.workers)
            .try_collect()
            .await?;

        let stats = MigrationStats {
            measures: rows.len() as u64,
            rows: rows.iter().sum(),
            duration_secs: start.elapsed().as_secs_f64(),
        };
        info!(
            "migration complete: {} rows across {} measures in {:.2}s ({:.0} rows/sec)",
            stats.rows,
            stats.measures,
            stats.duration_secs,
            stats.throughput()
        );
        Ok(stats)
    }

    async fn migrate_measure(
        &self,
        measure: &str,
        bus: Arc<ErrorBroadcaster>,
        connections: Arc<dyn ClientFactory>,
        destination: Option<&dyn SchemaManager>,
        sink: Arc<dyn DataSink>,
        progress: ProgressBar,
    ) -> Result<u64> {
        let params = self.config.source.connection_params();
        let discovery_client = connections.connect(&params).await?;
        let schema_manager = create_schema_manager(EngineRole::Source {
            client: discovery_client,
            database: self.config.source.database.clone(),
            retention_policy: self.config.source.retention_policy.clone(),
            coerce_int_to_float: self.config.options.coerce_int_to_float,
        });

        let mut extractor = Extractor::new(
            self.config.extraction_config(measure),
            params,
            schema_manager,
            connections,
        );

        let bundle = extractor.prepare().await?;
        if let Some(destination) = destination {
            destination.prepare_data_set(&bundle.data_def).await?;
        }

        let producer = tokio::spawn(async move {
            let result = extractor.start(&bus).await;
            if let Err(e) = &result {
                warn!("{}: {e}", extractor.id());
            }
            result
        });

        let rows = sink.consume(bundle, &progress).await?;
        producer
            .await
            .map_err(|e| Error::Extraction(format!("extraction task panicked: {e}")))??;

        progress.finish_with_message(format!("{measure}: {rows} rows"));
        Ok(rows)
    }
}

fn measure_progress_bar(measure: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg} {pos} rows")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(measure.to_string());
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_stats_throughput() {
        let stats = MigrationStats {
            measures: 2,
            rows: 1_000,
            duration_secs: 2.0,
        };
        assert!((stats.throughput() - 500.0).abs() < 0.001);
    }

    #[test]
    fn test_migration_stats_zero_duration() {
        let stats = MigrationStats::default();
        assert_eq!(stats.throughput(), 0.0);
    }
}
