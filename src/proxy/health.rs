//! Live reachability checks through a relay
//!
//! A probe sends one `GET` to an echo endpoint through the relay and reports the status and,
//! when the endpoint reveals it, the region the relay exits from.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONNECTION, HOST, PROXY_AUTHORIZATION, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{PoolError, Result};
use crate::models::ProxyRecord;
use crate::proxy::retry::TimeoutPolicy;
use crate::proxy::transport::ProxyTransport;

/// Echo endpoints used when none are configured
pub const DEFAULT_VALIDATION_ENDPOINTS: &[&str] = &["http://ip-api.com/json", "http://httpbin.org/ip"];

const PROBE_USER_AGENT: &str = concat!("relay-pool/", env!("CARGO_PKG_VERSION"));

/// JSON keys that carry a country or region code
const REGION_KEYS: &[&str] = &["countryCode", "country_code", "country"];

/// Outcome of one successful probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub region: Option<String>,
}

/// One liveness check of a relay against one endpoint.
///
/// Implementations return `Ok` only for a success status; anything else is an error that the
/// caller records as the relay's last failure.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, record: &ProxyRecord, endpoint: &Url) -> Result<ProbeResponse>;
}

/// Probe speaking HTTP/1.1 through the relay
pub struct HttpProbe {
    timeouts: TimeoutPolicy,
}

impl HttpProbe {
    pub fn new(timeouts: TimeoutPolicy) -> Self {
        Self { timeouts }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(TimeoutPolicy::default())
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    #[instrument(skip(self, record), fields(address = %record.address, endpoint = %endpoint))]
    async fn probe(&self, record: &ProxyRecord, endpoint: &Url) -> Result<ProbeResponse> {
        if endpoint.scheme() != "http" {
            return Err(PoolError::UnsupportedProtocol(format!(
                "validation endpoint must be http://, got {}",
                endpoint.scheme()
            )));
        }

        let host = endpoint
            .host_str()
            .ok_or_else(|| PoolError::ValidationFailure(format!("endpoint {} has no host", endpoint)))?;
        let port = endpoint.port_or_known_default().unwrap_or(80);

        let stream = ProxyTransport::connect(record, host, port, self.timeouts.connect).await?;

        // HTTP relays get the absolute URI, SOCKS tunnels reach the origin directly.
        let target = if ProxyTransport::uses_absolute_form(record) {
            endpoint.as_str().to_string()
        } else {
            match endpoint.query() {
                Some(query) => format!("{}?{}", endpoint.path(), query),
                None => endpoint.path().to_string(),
            }
        };
        let host_header = match endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(target)
            .header(HOST, host_header)
            .header(USER_AGENT, PROBE_USER_AGENT)
            .header(ACCEPT, "application/json, */*")
            .header(CONNECTION, "close");
        if let Some(auth) = ProxyTransport::proxy_authorization(record) {
            builder = builder.header(PROXY_AUTHORIZATION, auth);
        }
        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::Http(format!("Failed to build request: {}", e)))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| PoolError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Probe connection ended: {}", e);
            }
        });

        let read_timeout = self.timeouts.read;
        let response = tokio::time::timeout(read_timeout, sender.send_request(request))
            .await
            .map_err(|_| PoolError::Timeout(read_timeout))?
            .map_err(|e| PoolError::ProxyConnectionFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PoolError::ValidationFailure(format!(
                "{} answered {}",
                endpoint, status
            )));
        }

        let body = tokio::time::timeout(read_timeout, response.into_body().collect())
            .await
            .map_err(|_| PoolError::Timeout(read_timeout))?
            .map_err(|e| PoolError::ProxyConnectionFailed(format!("Failed to read response: {}", e)))?
            .to_bytes();

        Ok(ProbeResponse {
            status: status.as_u16(),
            region: region_from_body(&body),
        })
    }
}

/// Pull a region code out of an echo endpoint's JSON body
pub fn region_from_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    REGION_KEYS.iter().find_map(|key| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
