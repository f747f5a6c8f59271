//! Chunked streaming of one select statement into a bounded row channel.
//!
//! The producer is the only writer and the only closer of its bundle
//! channel. It cooperates with the error bus: before requesting each
//! chunk it polls its private notification channel without blocking, so
//! a sibling failure halts it within one chunk. Its own fatal failures
//! are broadcast exactly once.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::convert::RowConverter;
use crate::bus::{ErrorBroadcaster, ErrorReceiver};
use crate::error::{Error, Result};
use crate::model::Row;
use crate::source::{ChunkStream, ClientFactory, SourceClient, SourceParams, SourceQuery};

/// Terminal state of one successful producer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The source delivered its end-of-stream signal. Zero rows is a
    /// valid completion.
    Completed,
    /// A sibling extraction failed; this one halted at a chunk boundary
    /// without broadcasting anything itself.
    Aborted,
}

/// Inputs wired by the coordinator for one fetch invocation.
pub struct ProducerArgs {
    /// Source connection parameters.
    pub params: SourceParams,
    /// The chunked select statement to execute.
    pub query: SourceQuery,
    /// Sending side of the bundle channel. Dropped (and thereby closed)
    /// exactly once, on every exit path.
    pub sender: mpsc::Sender<Row>,
    /// Converter aligned to the discovered definition.
    pub converter: RowConverter,
}

/// Executes a chunked query and pipes converted rows into the bundle
/// channel.
pub struct DataProducer {
    extractor_id: String,
    connections: Arc<dyn ClientFactory>,
}

impl DataProducer {
    /// Creates a producer identified as `extractor_id` on the error bus.
    pub fn new(extractor_id: impl Into<String>, connections: Arc<dyn ClientFactory>) -> Self {
        Self {
            extractor_id: extractor_id.into(),
            connections,
        }
    }

    /// Streams the query until a terminal state is reached.
    ///
    /// The bundle channel is closed and the bus subscription released on
    /// every exit path. A fatal local condition is broadcast once, with
    /// this extraction's identifier embedded, before it is returned.
    ///
    /// # Errors
    ///
    /// Returns the fatal condition that halted the stream: connection or
    /// query failure, a malformed or multi-series response, a decode
    /// failure, or a duplicate identifier on the bus.
    pub async fn fetch(&self, args: ProducerArgs, bus: &ErrorBroadcaster) -> Result<FetchOutcome> {
        let ProducerArgs {
            params,
            query,
            sender,
            converter,
        } = args;

        let mut notifications = match bus.subscribe(&self.extractor_id) {
            Ok(rx) => rx,
            Err(e) => {
                let message = format!(
                    "extractor '{}' could not subscribe for errors: {e}",
                    self.extractor_id
                );
                bus.broadcast(&self.extractor_id, Arc::new(Error::Extraction(message.clone())));
                return Err(Error::Extraction(message));
            }
        };

        let result = self
            .run(&mut notifications, &params, &query, sender, &converter)
            .await;
        bus.unsubscribe(&self.extractor_id);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!("extractor '{}' failed: {err}", self.extractor_id);
                let err = Arc::new(err);
                bus.broadcast(&self.extractor_id, Arc::clone(&err));
                Err(Error::Shared(err))
            }
        }
    }

    async fn run(
        &self,
        notifications: &mut ErrorReceiver,
        params: &SourceParams,
        query: &SourceQuery,
        sender: mpsc::Sender<Row>,
        converter: &RowConverter,
    ) -> Result<FetchOutcome> {
        let mut client = self.connections.connect(params).await.map_err(|e| {
            Error::SourceConnection(format!(
                "extractor '{}' could not connect to the source: {e}",
                self.extractor_id
            ))
        })?;

        let outcome = self
            .stream(notifications, client.as_mut(), query, sender, converter)
            .await;
        if let Err(e) = client.close().await {
            debug!("extractor '{}': client close failed: {e}", self.extractor_id);
        }
        outcome
    }

    async fn stream(
        &self,
        notifications: &mut ErrorReceiver,
        client: &mut dyn SourceClient,
        query: &SourceQuery,
        sender: mpsc::Sender<Row>,
        converter: &RowConverter,
    ) -> Result<FetchOutcome> {
        let mut chunks = client.query_chunked(query).await.map_err(|e| {
            Error::SourceConnection(format!(
                "extractor '{}' could not execute a chunked query: {e}",
                self.extractor_id
            ))
        })?;

        let outcome = self
            .drain(notifications, chunks.as_mut(), sender, converter)
            .await;
        if let Err(e) = chunks.close().await {
            debug!("extractor '{}': stream close failed: {e}", self.extractor_id);
        }
        outcome
    }

    async fn drain(
        &self,
        notifications: &mut ErrorReceiver,
        chunks: &mut dyn ChunkStream,
        sender: mpsc::Sender<Row>,
        converter: &RowConverter,
    ) -> Result<FetchOutcome> {
        let id = &self.extractor_id;
        let mut total_rows: u64 = 0;

        loop {
            // A sibling failure only needs to be noticed once per chunk.
            if notifications.try_recv().is_ok() {
                debug!("extractor '{id}' halting: a sibling extraction failed");
                return Ok(FetchOutcome::Aborted);
            }

            let response = match chunks.next_response().await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    debug!("extractor '{id}' drained the source, {total_rows} rows total");
                    return Ok(FetchOutcome::Completed);
                }
                Err(e) => {
                    return Err(Error::Extraction(format!(
                        "extractor '{id}': error decoding response: {e}"
                    )));
                }
            };

            if let Some(message) = &response.error {
                return Err(Error::Extraction(format!(
                    "extractor '{id}': server reported an error: {message}"
                )));
            }
            if response.results.len() != 1 {
                return Err(Error::Extraction(format!(
                    "extractor '{id}': server did not return a proper response"
                )));
            }
            let result = &response.results[0];
            if let Some(message) = &result.error {
                return Err(Error::Extraction(format!(
                    "extractor '{id}': server reported an error: {message}"
                )));
            }
            if result.series.len() > 1 {
                return Err(Error::Extraction(format!(
                    "extractor '{id}': response contained more than one series"
                )));
            }
            let Some(series) = result.series.first() else {
                // An empty result denotes "no more data".
                debug!("extractor '{id}' drained the source, {total_rows} rows total");
                return Ok(FetchOutcome::Completed);
            };

            for raw in &series.values {
                let row = match converter.convert(raw) {
                    Ok(row) => row,
                    Err(e) => {
                        return Err(Error::Extraction(format!("extractor '{id}': {e}")));
                    }
                };
                // Backpressure boundary: blocks until the ingest side
                // drains capacity.
                if sender.send(row).await.is_err() {
                    return Err(Error::Extraction(format!(
                        "extractor '{id}': output channel closed before extraction finished"
                    )));
                }
            }
            total_rows += series.values.len() as u64;
            debug!("extractor '{id}': extracted {total_rows} rows");
        }
    }
}

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;
