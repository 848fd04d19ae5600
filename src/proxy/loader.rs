//! Source loading
//!
//! Fetches every configured source, adapts its body and merges the results. A failing source
//! is reported and skipped; it never aborts the load.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{PoolError, Result};
use crate::models::{PoolEntry, Protocol};
use crate::proxy::retry::RetryExecutor;
use crate::proxy::source::{SourceAdapter, SourceKind};

/// Default timeout for source fetches in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;

const FETCH_USER_AGENT: &str = concat!("relay-pool/", env!("CARGO_PKG_VERSION"));

/// Placeholder replaced with the premium API key
const API_KEY_PLACEHOLDER: &str = "{api_key}";

/// One configured source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    pub kind: SourceKind,
    /// Protocol of line entries that do not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Premium service whose API key is substituted into the URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium: Option<String>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind,
            protocol: None,
            premium: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_premium(mut self, service: impl Into<String>) -> Self {
        self.premium = Some(service.into());
        self
    }

    /// Public line-based feeds used when no sources file is configured
    pub fn default_sources() -> Vec<Self> {
        const SPEEDX: &str = "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master";
        const MONOSANS: &str = "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies";

        vec![
            Self::new("speedx-http", format!("{}/http.txt", SPEEDX), SourceKind::LineBased)
                .with_protocol(Protocol::Http),
            Self::new("speedx-socks4", format!("{}/socks4.txt", SPEEDX), SourceKind::LineBased)
                .with_protocol(Protocol::Socks4),
            Self::new("speedx-socks5", format!("{}/socks5.txt", SPEEDX), SourceKind::LineBased)
                .with_protocol(Protocol::Socks5),
            Self::new("monosans-http", format!("{}/http.txt", MONOSANS), SourceKind::LineBased)
                .with_protocol(Protocol::Http),
            Self::new("monosans-socks5", format!("{}/socks5.txt", MONOSANS), SourceKind::LineBased)
                .with_protocol(Protocol::Socks5),
        ]
    }

    /// Read a JSON array of sources
    pub fn load_file(path: &Path) -> Result<Vec<Self>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::InvalidConfig(format!("cannot read sources file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            PoolError::InvalidConfig(format!("invalid sources file {}: {}", path.display(), e))
        })
    }
}

/// API keys of premium sources, by service name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PremiumKeys {
    keys: HashMap<String, String>,
}

impl PremiumKeys {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    /// Keys from a `service -> key` JSON object; a missing or unreadable file means no keys
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let parsed = std::fs::read_to_string(path)
            .map_err(PoolError::from)
            .and_then(|content| Ok(serde_json::from_str::<HashMap<String, String>>(&content)?));
        match parsed {
            Ok(keys) => {
                debug!(path = %path.display(), services = keys.len(), "Loaded premium source keys");
                Self::new(keys)
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No premium source keys");
                Self::default()
            }
        }
    }

    /// URL to fetch for `source`, or `None` when a premium source has no key
    pub fn resolve(&self, source: &SourceConfig) -> Option<String> {
        match &source.premium {
            None => Some(source.url.clone()),
            Some(service) => self
                .keys
                .get(service)
                .filter(|key| !key.is_empty())
                .map(|key| source.url.replace(API_KEY_PLACEHOLDER, key)),
        }
    }
}

/// Retrieves the raw body of a source
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Fetches sources over HTTP(S); `file://` URLs are read from disk
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(FETCH_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        if url.starts_with("file://") {
            let path = Url::parse(url)?
                .to_file_path()
                .map_err(|_| PoolError::Http(format!("{} is not a local path", url)))?;
            return Ok(tokio::fs::read_to_string(path).await?);
        }

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PoolError::Http(format!("{} answered {}", url, status)));
        }
        Ok(response.text().await?)
    }
}

/// Outcome of one source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceReport {
    pub name: String,
    pub loaded: usize,
    pub malformed: usize,
    pub skipped: bool,
    pub error: Option<String>,
}

/// Outcome of loading every source
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Merged entries, first occurrence of each address wins
    pub entries: Vec<PoolEntry>,
    pub sources: Vec<SourceReport>,
}

impl LoadReport {
    pub fn malformed(&self) -> usize {
        self.sources.iter().map(|s| s.malformed).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }
}

pub struct SourceLoader {
    fetcher: Arc<dyn SourceFetcher>,
    executor: Arc<RetryExecutor>,
    premium: PremiumKeys,
}

impl SourceLoader {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, executor: Arc<RetryExecutor>, premium: PremiumKeys) -> Self {
        Self {
            fetcher,
            executor,
            premium,
        }
    }

    /// Load every source; results keep source order
    pub async fn load_all(&self, sources: &[SourceConfig]) -> LoadReport {
        let results = join_all(sources.iter().map(|source| self.load_source(source))).await;

        let mut report = LoadReport::default();
        let mut seen = HashSet::new();

        for (source, result) in sources.iter().zip(results) {
            let mut source_report = SourceReport {
                name: source.name.clone(),
                ..Default::default()
            };

            match result {
                Ok(None) => {
                    debug!(source = %source.name, "Skipping premium source without API key");
                    source_report.skipped = true;
                }
                Ok(Some((entries, malformed))) => {
                    source_report.loaded = entries.len();
                    source_report.malformed = malformed;
                    if malformed > 0 {
                        warn!(source = %source.name, malformed, "Skipped malformed source entries");
                    }
                    info!(source = %source.name, loaded = entries.len(), "Loaded source");

                    for entry in entries {
                        if seen.insert(entry.address().to_string()) {
                            report.entries.push(entry);
                        }
                    }
                }
                Err(e) => {
                    warn!(source = %source.name, error = %e, "Source failed, skipping");
                    source_report.error = Some(e.to_string());
                }
            }

            report.sources.push(source_report);
        }

        info!(
            sources = sources.len(),
            failed = report.failed_sources(),
            malformed = report.malformed(),
            candidates = report.entries.len(),
            "Source load complete"
        );

        report
    }

    /// Fetch and adapt one source. `Ok(None)` means it was skipped.
    async fn load_source(&self, source: &SourceConfig) -> Result<Option<(Vec<PoolEntry>, usize)>> {
        let Some(url) = self.premium.resolve(source) else {
            return Ok(None);
        };

        let fetch_error = |reason: String| PoolError::SourceFetch {
            source_name: source.name.clone(),
            reason,
        };

        let retry_key = format!("source:{}", source.name);
        let body = self
            .executor
            .execute(&retry_key, || self.fetcher.fetch(&url))
            .await
            .map_err(|e| fetch_error(e.root_cause().to_string()))?;

        let adapter = SourceAdapter::new(source.kind).with_protocol_hint(source.protocol);
        let adapted = adapter
            .adapt_body(&body)
            .map_err(|e| fetch_error(e.to_string()))?;

        Ok(Some(adapted))
    }
}
