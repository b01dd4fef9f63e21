//! Stage-scoped arena of client connections.
//!
//! Connections are registered during stage setup and each worker leases its
//! own slot. [`ResourceRegistry::release_all`] is the single cleanup pass: it
//! visits every slot whether the worker succeeded, failed, was interrupted
//! or was aborted, and one failed close never prevents the remaining ones.

use crate::error::Error;
use crate::store::StoreClient;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One registered connection. Exactly one worker leases it.
pub struct Slot<C> {
    inner: Arc<Mutex<Option<C>>>,
}

impl<C> Slot<C> {
    /// Exclusive access for the owning worker. `None` once released.
    pub async fn lease(self) -> OwnedMutexGuard<Option<C>> {
        self.inner.lock_owned().await
    }
}

pub struct ResourceRegistry<C> {
    slots: Vec<Arc<Mutex<Option<C>>>>,
}

impl<C: StoreClient> ResourceRegistry<C> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    pub fn register(&mut self, client: C) {
        self.slots.push(Arc::new(Mutex::new(Some(client))));
    }

    /// Hands out a lease handle for every registered connection, in
    /// registration order.
    pub fn slots(&self) -> Vec<Slot<C>> {
        self.slots
            .iter()
            .map(|inner| Slot {
                inner: Arc::clone(inner),
            })
            .collect()
    }

    /// Closes every connection still held. Returns the close failures, which
    /// have already been logged.
    pub async fn release_all(self) -> Vec<Error> {
        let mut failures = Vec::new();
        let mut closed = 0;
        for (id, slot) in self.slots.into_iter().enumerate() {
            let Some(mut client) = slot.lock().await.take() else {
                continue;
            };
            match client.close().await {
                Ok(()) => closed += 1,
                Err(err) => {
                    tracing::error!(connection = id, "{err}");
                    failures.push(err);
                }
            }
        }
        tracing::debug!("Released {closed} connections ({} failed)", failures.len());
        failures
    }
}
