//! Periodic removal of documents whose TTL-indexed field has passed.

use crate::clock::{Clock, SystemClock};
use crate::data_store::DataStore;
use crate::error::StoreResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default time between sweeps. Expired documents disappear at most this long
/// (plus one sweep) after their expiry time.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ExpiryReaper {
    store: Arc<dyn DataStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(store: Arc<dyn DataStore>, interval: Duration) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            interval,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long after its expiry time a document may still be stored.
    pub fn latency_bound(&self) -> Duration {
        self.interval
    }

    /// One sweep over every TTL index. Returns the number of removed documents.
    pub fn reap_once(&self) -> StoreResult<usize> {
        let removed = self.store.reap_expired(self.clock.now())?;
        if removed > 0 {
            info!("Reaped {} expired documents", removed);
        } else {
            debug!("Nothing to reap");
        }
        Ok(removed)
    }

    /// Sweeps on every tick until `shutdown` is cancelled. Failed sweeps are logged
    /// and retried on the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Expiry reaper started, sweeping every {:?}",
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let reaper = self.clone();
            match tokio::task::spawn_blocking(move || reaper.reap_once()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Expiry sweep failed: {}", e),
                Err(e) => error!("Expiry sweep task panicked: {}", e),
            }
        }
        info!("Expiry reaper stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
