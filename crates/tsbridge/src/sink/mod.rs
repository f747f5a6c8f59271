//! Destination-side ingestion of extracted rows.
//!
//! A sink is the sole reader of a bundle's channel: it drains rows until
//! the producer closes the channel. Whether the rows it saw form a
//! complete extraction is decided by the extraction's own result, not by
//! the channel closing.

pub mod timescale;

use async_trait::async_trait;
use indicatif::ProgressBar;

use crate::error::Result;
use crate::model::Bundle;

/// Consumes the rows of one bundle and writes them to the destination.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Drains `bundle` until its channel closes, returning the number of
    /// rows written. `progress` is advanced as rows are consumed.
    async fn consume(&self, bundle: Bundle, progress: &ProgressBar) -> Result<u64>;
}

/// Sink for dry runs: drains and counts rows without writing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

#[async_trait]
impl DataSink for DiscardSink {
    async fn consume(&self, bundle: Bundle, progress: &ProgressBar) -> Result<u64> {
        let mut rows = bundle.rows;
        let mut total = 0u64;
        while rows.recv().await.is_some() {
            total += 1;
            progress.inc(1);
        }
        Ok(total)
    }
}
