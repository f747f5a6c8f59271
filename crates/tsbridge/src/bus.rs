//! Fail-fast error fan-out shared by the extractions of one migration job.
//!
//! Every running extraction subscribes under its identifier. When one of
//! them hits a fatal condition it broadcasts once; each sibling notices
//! the notification at its next chunk boundary and halts. One instance
//! is constructed per job and injected where needed, never shared across
//! jobs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// Receiving side of one subscription.
pub type ErrorReceiver = mpsc::Receiver<Arc<Error>>;

/// Broadcasts a failure from any subscribed extraction to all of its
/// siblings.
#[derive(Debug, Default)]
pub struct ErrorBroadcaster {
    subscribers: Mutex<HashMap<String, mpsc::Sender<Arc<Error>>>>,
}

impl ErrorBroadcaster {
    /// Creates an empty broadcaster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns its private notification channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySubscribed`] if `id` is currently
    /// registered.
    pub fn subscribe(&self, id: &str) -> Result<ErrorReceiver> {
        let mut subscribers = self.subscribers.lock();
        if subscribers.contains_key(id) {
            return Err(Error::AlreadySubscribed(id.to_string()));
        }
        // Capacity one: a subscriber only ever needs to learn that some
        // failure happened, not how many.
        let (tx, rx) = mpsc::channel(1);
        subscribers.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Removes the registration for `id`. Safe to call repeatedly or
    /// for an identifier that was never subscribed.
    pub fn unsubscribe(&self, id: &str) {
        self.subscribers.lock().remove(id);
    }

    /// Delivers `err` to every subscriber except `id` itself.
    ///
    /// Never blocks: a recipient whose buffer is full already has a
    /// pending notification, and one whose receiver is gone is already
    /// tearing down.
    pub fn broadcast(&self, id: &str, err: Arc<Error>) {
        let targets: Vec<(String, mpsc::Sender<Arc<Error>>)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|(subscriber, _)| subscriber.as_str() != id)
                .map(|(subscriber, tx)| (subscriber.clone(), tx.clone()))
                .collect()
        };

        for (subscriber, tx) in targets {
            if tx.try_send(Arc::clone(&err)).is_err() {
                debug!("subscriber '{subscriber}' not notified (already pending or gone)");
            }
        }
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
