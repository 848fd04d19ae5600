//! Validation engine
//!
//! Checks candidates against live echo endpoints through the shared retry executor. Each check
//! yields a [`Validation`] that the caller applies to the pooled entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{PoolError, Result};
use crate::models::{PoolEntry, ProxyRecord};
use crate::proxy::health::{LivenessProbe, ProbeResponse};
use crate::proxy::retry::RetryExecutor;

/// Default number of candidates validated at once
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Working {
        response_time: Duration,
        /// Region reported by the echo endpoint
        region: Option<String>,
    },
    Failed(String),
}

/// Outcome of checking one relay, applied to the pool entry afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub address: String,
    pub checked_at: DateTime<Utc>,
    pub verdict: Verdict,
}

impl Validation {
    pub fn is_working(&self) -> bool {
        matches!(self.verdict, Verdict::Working { .. })
    }

    /// Record this outcome in `entry`'s status.
    ///
    /// A reported region only fills a record that has none.
    pub fn apply_to(&self, entry: &mut PoolEntry) {
        match &self.verdict {
            Verdict::Working {
                response_time,
                region,
            } => {
                entry.status.record_success(*response_time, self.checked_at);
                if entry.record.region.is_none() {
                    entry.record.region = region.clone();
                }
            }
            Verdict::Failed(cause) => entry.status.record_failure(cause.clone(), self.checked_at),
        }
    }
}

/// Result of validating a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Records whose validation succeeded, in input order
    pub validated: Vec<ProxyRecord>,
    pub failed: usize,
}

pub struct ProxyValidator {
    executor: Arc<RetryExecutor>,
    probe: Arc<dyn LivenessProbe>,
    endpoints: Vec<Url>,
}

impl ProxyValidator {
    pub fn new(executor: Arc<RetryExecutor>, probe: Arc<dyn LivenessProbe>, endpoints: Vec<Url>) -> Self {
        Self {
            executor,
            probe,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Check one relay through the retry executor
    #[instrument(skip(self, record), fields(address = %record.address))]
    pub async fn validate(&self, record: &ProxyRecord) -> Validation {
        let result = self
            .executor
            .execute(&record.address, || self.check_endpoints(record))
            .await;

        let verdict = match result {
            Ok((elapsed, response)) => {
                debug!(
                    response_ms = elapsed.as_millis() as u64,
                    region = ?response.region,
                    "Relay validated"
                );
                Verdict::Working {
                    response_time: elapsed,
                    region: response.region,
                }
            }
            Err(e) => {
                let cause = e.root_cause().to_string();
                debug!(error = %cause, "Relay failed validation");
                Verdict::Failed(cause)
            }
        };

        Validation {
            address: record.address.clone(),
            checked_at: Utc::now(),
            verdict,
        }
    }

    /// Check relays in chunks of `max_concurrent`; one chunk finishes before the next starts.
    ///
    /// Results keep input order.
    pub async fn validate_batch(
        &self,
        records: &[ProxyRecord],
        max_concurrent: usize,
    ) -> Vec<Validation> {
        let mut results = Vec::with_capacity(records.len());

        for chunk in records.chunks(max_concurrent.max(1)) {
            results.extend(join_all(chunk.iter().map(|record| self.validate(record))).await);
        }

        if !records.is_empty() {
            let working = results.iter().filter(|v| v.is_working()).count();
            info!(
                validated = working,
                failed = results.len() - working,
                "Validation batch complete"
            );
        }

        results
    }

    /// One attempt: the first endpoint that answers successfully wins
    async fn check_endpoints(&self, record: &ProxyRecord) -> Result<(Duration, ProbeResponse)> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            let started = Instant::now();
            match self.probe.probe(record, endpoint).await {
                Ok(response) => return Ok((started.elapsed(), response)),
                Err(e) => {
                    warn!(address = %record.address, endpoint = %endpoint, error = %e, "Endpoint check failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => PoolError::ValidationFailure(format!("all endpoints failed, last: {}", e)),
            None => PoolError::ValidationFailure("no validation endpoints configured".to_string()),
        })
    }
}
