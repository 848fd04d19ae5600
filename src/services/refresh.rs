//! Pool refresh service
//!
//! Periodically revalidates the whole pool and reloads the sources when too few relays survive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::proxy::manager::ProxyManager;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Time between revalidation passes
    pub interval: Duration,
    /// Reload the sources when fewer relays than this pass revalidation
    pub min_working: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            min_working: 1,
        }
    }
}

/// Background revalidation of a [`ProxyManager`]
pub struct PoolRefresher {
    manager: Arc<ProxyManager>,
    config: RefreshConfig,
    cycles: AtomicU64,
}

impl PoolRefresher {
    pub fn new(manager: Arc<ProxyManager>, config: RefreshConfig) -> Self {
        Self {
            manager,
            config,
            cycles: AtomicU64::new(0),
        }
    }

    /// Completed refresh passes
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting pool refresher (interval: {}s)",
            self.config.interval.as_secs()
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool refresher shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn refresh(&self) {
        let outcome = self.manager.revalidate_all().await;

        if outcome.validated.len() < self.config.min_working {
            info!(
                working = outcome.validated.len(),
                min_working = self.config.min_working,
                "Too few working relays, reloading sources"
            );
            let report = self.manager.load_all_proxies().await;
            debug!(candidates = report.entries.len(), "Sources reloaded");
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle for stopping the pool refresher
pub struct RefresherHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl RefresherHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for RefresherHandle {
    fn default() -> Self {
        Self::new().0
    }
}
