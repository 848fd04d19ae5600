//! Proxy pool orchestrator
//!
//! Owns the pool and answers "give me a working relay". Construction is cheap and performs no
//! I/O; [`ProxyManager::initialize`] loads the pool from the cache, the sources or the built-in
//! profiles, in that order.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{PoolError, Result};
use crate::models::{PoolEntry, ProxyConfig, ProxyRecord};
use crate::proxy::cache::ProxyCache;
use crate::proxy::health::HttpProbe;
use crate::proxy::loader::{HttpFetcher, LoadReport, PremiumKeys, SourceConfig, SourceLoader};
use crate::proxy::pool::Pool;
use crate::proxy::profiles::RegionProfiles;
use crate::proxy::rate_limit::RateLimiter;
use crate::proxy::retry::RetryExecutor;
use crate::proxy::scoring;
use crate::proxy::validator::{BatchOutcome, ProxyValidator, DEFAULT_MAX_CONCURRENT};

/// Default rounds of [`ProxyManager::get_working_proxy`]
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Lifecycle of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Loading,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Candidates validated at once
    pub max_concurrent: usize,
    /// Default rounds of `get_working_proxy`
    pub max_retries: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

pub struct ProxyManager {
    pool: RwLock<Pool>,
    current: ArcSwapOption<ProxyRecord>,
    state: RwLock<PoolState>,
    /// Serialises `initialize` so loading happens once
    init_lock: Mutex<()>,
    cache: ProxyCache,
    loader: SourceLoader,
    sources: Vec<SourceConfig>,
    validator: ProxyValidator,
    limiter: Arc<RateLimiter>,
    fallback: Vec<ProxyRecord>,
    settings: PoolSettings,
}

impl ProxyManager {
    pub fn new(
        cache: ProxyCache,
        loader: SourceLoader,
        validator: ProxyValidator,
        limiter: Arc<RateLimiter>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            pool: RwLock::new(Pool::new()),
            current: ArcSwapOption::empty(),
            state: RwLock::new(PoolState::Uninitialized),
            init_lock: Mutex::new(()),
            cache,
            loader,
            sources: Vec::new(),
            validator,
            limiter,
            fallback: Vec::new(),
            settings,
        }
    }

    /// Wire the production components from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let executor = Arc::new(RetryExecutor::new(
            config.retry,
            config.timeouts,
            limiter.clone(),
        ));

        let probe = Arc::new(HttpProbe::new(config.timeouts));
        let validator = ProxyValidator::new(
            executor.clone(),
            probe,
            config.pool.validation_endpoints.clone(),
        );

        let fetcher = Arc::new(HttpFetcher::new(config.pool.fetch_timeout)?);
        let premium = PremiumKeys::load(config.pool.premium_config.as_deref());
        let loader = SourceLoader::new(fetcher, executor, premium);

        let cache = ProxyCache::new(config.pool.cache_path.clone(), config.pool.cache_freshness);
        let fallback = RegionProfiles::load_or_default(config.pool.profiles_file.as_deref()).records();

        Ok(
            Self::new(cache, loader, validator, limiter, config.pool_settings())
                .with_sources(config.sources()?)
                .with_fallback(fallback),
        )
    }

    pub fn with_sources(mut self, sources: Vec<SourceConfig>) -> Self {
        self.sources = sources;
        self
    }

    /// Relays used when the cache and every source come back empty
    pub fn with_fallback(mut self, fallback: Vec<ProxyRecord>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    pub fn len(&self) -> usize {
        self.pool.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.read().is_empty()
    }

    /// Copy of every entry, in insertion order
    pub fn snapshot(&self) -> Vec<PoolEntry> {
        self.pool.read().snapshot()
    }

    /// The relay most recently handed out
    pub fn current(&self) -> Option<ProxyRecord> {
        self.current.load_full().map(|record| (*record).clone())
    }

    /// Configuration of the current relay for a browsing session
    pub fn get_proxy_config(&self) -> Option<ProxyConfig> {
        self.current.load().as_deref().map(ProxyRecord::to_config)
    }

    /// Load the pool once.
    ///
    /// Concurrent callers wait for the first one and then observe `Ready`. Fails only when
    /// the cache, every source and the fallback set all come back empty.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.state() == PoolState::Ready {
            return Ok(());
        }
        *self.state.write() = PoolState::Loading;

        match self.cache.load().await {
            Ok(entries) if !entries.is_empty() => {
                let added = self.pool.write().merge(entries);
                info!(count = added, "Pool loaded from cache");
            }
            Ok(_) => debug!("Cache empty or stale"),
            Err(e) if e.is_local() => warn!(error = %e, "Cache unavailable, continuing without it"),
            Err(e) => error!(error = %e, "Cache load failed, continuing without it"),
        }

        if self.is_empty() {
            self.load_all_proxies().await;
        }

        if self.is_empty() && !self.fallback.is_empty() {
            let added = self
                .pool
                .write()
                .merge(self.fallback.iter().cloned().map(PoolEntry::new));
            warn!(count = added, "No relays from cache or sources, using built-in profiles");
        }

        *self.state.write() = PoolState::Ready;

        let (count, working) = {
            let pool = self.pool.read();
            (pool.len(), pool.working_count())
        };
        if count == 0 {
            warn!("Pool is empty after initialization");
            return Err(PoolError::NoProxiesAvailable);
        }
        info!(count, working, "Proxy pool ready");
        Ok(())
    }

    /// Fetch every configured source, merge the candidates and persist the pool
    #[instrument(skip(self), fields(sources = self.sources.len()))]
    pub async fn load_all_proxies(&self) -> LoadReport {
        let report = self.loader.load_all(&self.sources).await;

        let added = self.pool.write().merge(report.entries.iter().cloned());
        info!(
            added,
            malformed = report.malformed(),
            failed_sources = report.failed_sources(),
            "Merged source candidates"
        );

        if added > 0 {
            self.persist().await;
        }
        report
    }

    /// Find a working relay, optionally restricted to `region`.
    ///
    /// Each round first re-checks relays that already work (fastest first), then validates the
    /// rest of the pool in score order, one bounded batch at a time. Returns `None` when
    /// `max_retries` rounds produce nothing.
    #[instrument(skip(self))]
    pub async fn get_working_proxy(
        &self,
        region: Option<&str>,
        max_retries: u32,
    ) -> Option<ProxyRecord> {
        if self.state() != PoolState::Ready {
            if let Err(e) = self.initialize().await {
                warn!(error = %e, "Pool initialization yielded no relays");
            }
        }

        for round in 1..=max_retries {
            self.limiter.admit().await;

            let mut tried = HashSet::new();
            if let Some(record) = self.recheck_working(region, &mut tried).await {
                return Some(record);
            }
            if let Some(record) = self.validate_candidates(region, &tried).await {
                return Some(record);
            }

            debug!(round, max_retries, "No working relay in this round");
        }

        warn!(region = ?region, "No working relay found after {} rounds", max_retries);
        None
    }

    /// Validate the whole pool in bounded batches and persist the result
    #[instrument(skip(self))]
    pub async fn revalidate_all(&self) -> BatchOutcome {
        if self.state() != PoolState::Ready {
            if let Err(e) = self.initialize().await {
                warn!(error = %e, "Pool initialization yielded no relays");
            }
        }

        let records = self.records();
        if records.is_empty() {
            return BatchOutcome::default();
        }

        let results = self
            .validator
            .validate_batch(&records, self.settings.max_concurrent)
            .await;

        let mut outcome = BatchOutcome::default();
        {
            let mut pool = self.pool.write();
            for validation in &results {
                match pool.apply(validation) {
                    Some(entry) if validation.is_working() => {
                        outcome.validated.push(entry.record.clone())
                    }
                    _ => outcome.failed += 1,
                }
            }
        }
        self.persist().await;

        if let Some(current) = self.current.load_full() {
            if !outcome.validated.iter().any(|r| r.address == current.address) {
                self.current.store(None);
                info!(address = %current.address, "Current relay failed revalidation");
            }
        }

        info!(
            validated = outcome.validated.len(),
            failed = outcome.failed,
            "Pool revalidated"
        );
        outcome
    }

    /// Zero every status and forget the current relay
    pub fn reset(&self) {
        self.pool.write().reset();
        self.current.store(None);
        info!("Proxy pool reset");
    }

    /// Persist a final snapshot
    pub async fn shutdown(&self) {
        self.persist().await;
        info!(count = self.len(), "Proxy pool shut down");
    }

    /// Records of every entry, in insertion order
    fn records(&self) -> Vec<ProxyRecord> {
        self.pool
            .read()
            .entries()
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    async fn recheck_working(
        &self,
        region: Option<&str>,
        tried: &mut HashSet<String>,
    ) -> Option<ProxyRecord> {
        let working: Vec<ProxyRecord> = {
            let pool = self.pool.read();
            scoring::by_latency(pool.entries(), region)
                .into_iter()
                .map(|entry| entry.record.clone())
                .collect()
        };

        for record in working {
            tried.insert(record.address.clone());
            let validation = self.validator.validate(&record).await;
            let live = self
                .pool
                .write()
                .apply(&validation)
                .map(|entry| entry.record.clone());

            if let Some(record) = live.filter(|_| validation.is_working()) {
                self.persist().await;
                self.set_current(&record);
                return Some(record);
            }
        }
        None
    }

    /// Validate non-working candidates in rank order, one bounded batch at a time.
    ///
    /// The first candidate in rank order that passes wins, even if a later one in the same
    /// batch answered faster.
    async fn validate_candidates(
        &self,
        region: Option<&str>,
        tried: &HashSet<String>,
    ) -> Option<ProxyRecord> {
        let candidates: Vec<ProxyRecord> = {
            let pool = self.pool.read();
            scoring::rank(pool.entries(), region)
                .into_iter()
                .filter(|entry| !entry.status.is_working() && !tried.contains(entry.address()))
                .map(|entry| entry.record.clone())
                .collect()
        };

        let batch_size = self.settings.max_concurrent.max(1);
        for batch in candidates.chunks(batch_size) {
            let results = self.validator.validate_batch(batch, batch_size).await;

            let mut first = None;
            {
                let mut pool = self.pool.write();
                for validation in &results {
                    let live = pool.apply(validation);
                    if first.is_none() && validation.is_working() {
                        first = live.map(|entry| entry.record.clone());
                    }
                }
            }
            self.persist().await;

            if let Some(record) = first {
                self.set_current(&record);
                return Some(record);
            }
        }
        None
    }

    fn set_current(&self, record: &ProxyRecord) {
        let previous = self.current.swap(Some(Arc::new(record.clone())));
        match previous {
            Some(previous) if previous.address == record.address => {}
            Some(previous) => info!(from = %previous, to = %record, "Relay rotated"),
            None => info!(relay = %record, region = ?record.region, "Relay selected"),
        }
    }

    async fn persist(&self) {
        let snapshot = self.snapshot();
        match self.cache.save(&snapshot).await {
            Ok(()) => {}
            Err(e) if e.is_local() => warn!(error = %e, "Failed to persist proxy cache"),
            Err(e) => error!(error = %e, "Proxy cache persistence failed unexpectedly"),
        }
    }
}
