//! Source-side client abstractions over the InfluxDB 1.x query API.
//!
//! The traits here are the seam between the extraction pipeline and the
//! wire protocol: production code talks to [`influx::HttpInfluxClient`],
//! tests substitute scripted fakes.

pub mod influx;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// Connection parameters for the source server.
#[derive(Debug, Clone)]
pub struct SourceParams {
    /// Server URL, e.g. `http://localhost:8086`.
    pub url: String,
    /// Optional basic-auth username.
    pub username: Option<String>,
    /// Optional basic-auth password.
    pub password: Option<String>,
}

/// One InfluxQL statement plus its execution context.
#[derive(Debug, Clone)]
pub struct SourceQuery {
    /// The statement text.
    pub command: String,
    /// Database the statement runs against.
    pub database: String,
    /// Optional retention policy qualifier.
    pub retention_policy: Option<String>,
    /// Rows per chunk when issued as a chunked request.
    pub chunk_size: u32,
}

impl SourceQuery {
    /// Creates a query with no chunking configured.
    pub fn new(
        command: impl Into<String>,
        database: impl Into<String>,
        retention_policy: Option<String>,
    ) -> Self {
        Self {
            command: command.into(),
            database: database.into(),
            retention_policy,
            chunk_size: 0,
        }
    }

    /// Sets the chunk size used by [`SourceClient::query_chunked`].
    #[must_use]
    pub fn chunked(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Top-level body of a query response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    /// One result block per statement in the request.
    #[serde(default)]
    pub results: Vec<StatementResult>,
    /// Request-level error reported by the server.
    #[serde(default)]
    pub error: Option<String>,
}

/// Result block for one statement.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatementResult {
    /// Series returned by the statement.
    #[serde(default)]
    pub series: Vec<SeriesPayload>,
    /// Statement-level error reported by the server.
    #[serde(default)]
    pub error: Option<String>,
    /// Whether more chunks follow for this statement.
    #[serde(default)]
    pub partial: bool,
}

/// One result series: column names plus positional value rows.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesPayload {
    /// Series name.
    #[serde(default)]
    pub name: String,
    /// Column names, in projection order.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Value rows, positionally aligned to `columns`.
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

/// Client capable of issuing queries against one source server.
#[async_trait]
pub trait SourceClient: Send + Sync + std::fmt::Debug {
    /// Runs `query` and returns the fully decoded response.
    async fn query(&self, query: &SourceQuery) -> Result<QueryResponse>;

    /// Issues `query` as a chunked request and returns the response
    /// stream. The stream must be closed by the caller on every path.
    async fn query_chunked(&self, query: &SourceQuery) -> Result<Box<dyn ChunkStream>>;

    /// Releases the underlying connection.
    async fn close(&mut self) -> Result<()>;
}

/// Sequential reader over the chunk responses of one chunked query.
#[async_trait]
pub trait ChunkStream: Send {
    /// Returns the next response, or `None` once the source is drained.
    async fn next_response(&mut self) -> Result<Option<QueryResponse>>;

    /// Closes the stream, discarding any responses not yet read.
    async fn close(&mut self) -> Result<()>;
}

/// Creates clients for a configured source. Injected into the producer
/// so each extraction acquires and releases its own connection.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Connects to the source described by `params`.
    async fn connect(&self, params: &SourceParams) -> Result<Box<dyn SourceClient>>;
}
