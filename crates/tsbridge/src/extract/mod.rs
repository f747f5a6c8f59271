//! Extraction units: schema discovery followed by chunked streaming.
//!
//! An [`Extractor`] has a two-phase lifecycle. [`Extractor::prepare`]
//! discovers the measure's schema and allocates the bundle channel;
//! [`Extractor::start`] builds the select statement from the cached
//! column order and delegates to the producer until it reaches a
//! terminal state.

pub mod convert;
pub mod producer;
pub mod query;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::ErrorBroadcaster;
use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::model::{Bundle, DataSetDefinition, Row};
use crate::schema::SchemaManager;
use crate::source::{ClientFactory, SourceParams, SourceQuery};
use self::convert::RowConverter;
use self::producer::{DataProducer, FetchOutcome, ProducerArgs};
use self::query::build_select;

/// One extraction unit, bound to a single measure.
pub struct Extractor {
    config: ExtractionConfig,
    params: SourceParams,
    schema_manager: Box<dyn SchemaManager>,
    producer: DataProducer,
    cached: Option<CachedBundle>,
}

/// Writing side of the bundle handed out by [`Extractor::prepare`].
struct CachedBundle {
    data_def: Arc<DataSetDefinition>,
    sender: mpsc::Sender<Row>,
}

impl Extractor {
    /// Wires an extraction unit from its collaborators.
    pub fn new(
        config: ExtractionConfig,
        params: SourceParams,
        schema_manager: Box<dyn SchemaManager>,
        connections: Arc<dyn ClientFactory>,
    ) -> Self {
        let producer = DataProducer::new(config.extractor_id.clone(), connections);
        Self {
            config,
            params,
            schema_manager,
            producer,
            cached: None,
        }
    }

    /// Identifier used for logging and error reporting.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.extractor_id
    }

    /// Discovers the measure's schema and allocates the bundle channel.
    ///
    /// Calling this again before [`Extractor::start`] re-runs discovery
    /// and replaces the previous bundle; the replaced channel closes
    /// without ever carrying a row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaDiscovery`] wrapping the schema manager's
    /// failure.
    pub async fn prepare(&mut self) -> Result<Bundle> {
        let measure = &self.config.measure;
        debug!("{}: discovering schema for measure '{measure}'", self.id());

        let data_def = self
            .schema_manager
            .fetch_data_set(measure)
            .await
            .map_err(|e| {
                Error::SchemaDiscovery(format!(
                    "{}: could not fetch data set definition for measure '{measure}': {e}",
                    self.id()
                ))
            })?;
        info!("{}: discovered {data_def}", self.id());

        let data_def = Arc::new(data_def);
        let (sender, rows) = mpsc::channel(self.config.data_buffer_size);
        self.cached = Some(CachedBundle {
            data_def: Arc::clone(&data_def),
            sender,
        });

        Ok(Bundle { data_def, rows })
    }

    /// Streams the measure through the producer until it reaches a
    /// terminal state.
    ///
    /// Returns `Ok` both on completion and on a halt caused by a
    /// sibling's broadcast failure; the failing extraction surfaces the
    /// job error itself. Consumes the prepared bundle, so another
    /// `prepare` is required before starting again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Usage`] when called without a prepared bundle,
    /// or the producer's fatal error after it was broadcast.
    pub async fn start(&mut self, bus: &ErrorBroadcaster) -> Result<()> {
        let Some(cached) = self.cached.take() else {
            return Err(Error::Usage(format!(
                "{}: prepare was not called before start",
                self.id()
            )));
        };

        let command = build_select(&self.config, &cached.data_def.columns);
        let query = SourceQuery::new(
            command,
            self.config.database.clone(),
            self.config.retention_policy.clone(),
        )
        .chunked(self.config.chunk_size);
        info!(
            "{}: extracting from database '{}' in chunks of {}",
            self.id(),
            self.config.database,
            self.config.chunk_size
        );
        debug!("{}: {}", self.id(), query.command);

        let args = ProducerArgs {
            params: self.params.clone(),
            query,
            sender: cached.sender,
            converter: RowConverter::new(cached.data_def),
        };
        match self.producer.fetch(args, bus).await? {
            FetchOutcome::Completed => info!("{}: extraction complete", self.id()),
            FetchOutcome::Aborted => {
                warn!("{}: extraction aborted by a sibling failure", self.id());
            }
        }
        Ok(())
    }
}
