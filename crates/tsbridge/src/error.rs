//! Error types for tsbridge.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for tsbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a migration.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle misuse, e.g. starting an extraction that was never prepared.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Series absent, unresolved type conflict, or the source was
    /// unreachable while discovering a schema.
    #[error("Schema discovery failed: {0}")]
    SchemaDiscovery(String),

    /// An existing destination table does not match the discovered schema.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Source connection error.
    #[error("Source connection error: {0}")]
    SourceConnection(String),

    /// Malformed response, decode failure, or another fatal extraction
    /// condition.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// The identifier is already registered on the error bus.
    #[error("'{0}' is already subscribed for error notifications")]
    AlreadySubscribed(String),

    /// Destination connection error.
    #[error("Destination connection error: {0}")]
    DestinationConnection(String),

    /// Writing rows to the destination failed.
    #[error("Loading error: {0}")]
    Loading(String),

    /// An error shared with sibling extractions over the broadcast bus.
    #[error(transparent)]
    Shared(#[from] Arc<Error>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration file parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Destination database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
