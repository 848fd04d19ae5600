use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "socks4" => Some(Protocol::Socks4),
            "socks5" => Some(Protocol::Socks5),
            _ => None,
        }
    }

    /// Infer the protocol of a relay from its listening port.
    ///
    /// Well-known SOCKS ports map to their protocol, everything else is treated as HTTP.
    pub fn infer_from_port(port: u16) -> Self {
        match port {
            1080 | 4145 | 4153 => Protocol::Socks5,
            1081 | 4144 => Protocol::Socks4,
            8080 | 8888 | 3128 => Protocol::Http,
            _ => Protocol::Http,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, Protocol::Socks4 | Protocol::Socks5)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Relay authentication credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Build credentials only when a username is present
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match username {
            Some(user) if !user.is_empty() => Some(Self::new(user, password.unwrap_or_default())),
            _ => None,
        }
    }
}

/// One relay, keyed by its `host:port` address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyRecord {
    pub address: String,
    pub protocol: Protocol,
    pub credentials: Option<Credentials>,
    pub region: Option<String>,
}

impl ProxyRecord {
    /// Create a record, rejecting addresses that are not `host:port` with a non-zero port
    pub fn new(address: impl Into<String>, protocol: Protocol) -> Result<Self> {
        let address = address.into().trim().to_string();
        parse_host_port(&address)?;

        Ok(Self {
            address,
            protocol,
            credentials: None,
            region: None,
        })
    }

    /// Create a record from separate host and port parts
    pub fn from_host_port(host: &str, port: u16, protocol: Protocol) -> Result<Self> {
        Self::new(format_host_port(host.trim(), port), protocol)
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        self
    }

    /// Split the address into host and port
    pub fn host_port(&self) -> Result<(String, u16)> {
        parse_host_port(&self.address)
    }

    /// Case-insensitive region match; records without a region never match
    pub fn in_region(&self, region: &str) -> bool {
        self.region
            .as_deref()
            .map(|r| r.eq_ignore_ascii_case(region.trim()))
            .unwrap_or(false)
    }

    /// The configuration handed to a browsing session
    pub fn to_config(&self) -> ProxyConfig {
        ProxyConfig {
            server: self.address.clone(),
            protocol: self.protocol,
            username: self.credentials.as_ref().map(|c| c.username.clone()),
            password: self.credentials.as_ref().map(|c| c.password.clone()),
            region: self.region.clone(),
        }
    }
}

impl std::fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

/// Health record of one relay, mutated only by validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyStatus {
    pub last_checked: Option<DateTime<Utc>>,
    pub response_time: Option<Duration>,
    pub success_count: u64,
    pub fail_count: u64,
    pub last_error: Option<String>,
}

impl ProxyStatus {
    pub fn record_success(&mut self, response_time: Duration, at: DateTime<Utc>) {
        self.last_checked = Some(at);
        self.response_time = Some(response_time);
        self.success_count += 1;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.last_checked = Some(at);
        self.fail_count += 1;
        self.last_error = Some(error.into());
    }

    pub fn attempts(&self) -> u64 {
        self.success_count + self.fail_count
    }

    /// Fraction of successful validations (0 when never validated)
    pub fn success_rate(&self) -> f64 {
        match self.attempts() {
            0 => 0.0,
            total => self.success_count as f64 / total as f64,
        }
    }

    /// Whether the most recent validation succeeded
    pub fn is_working(&self) -> bool {
        self.success_count > 0 && self.last_error.is_none()
    }
}

/// A record together with its health, as stored in the pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolEntry {
    pub record: ProxyRecord,
    pub status: ProxyStatus,
}

impl PoolEntry {
    pub fn new(record: ProxyRecord) -> Self {
        Self {
            record,
            status: ProxyStatus::default(),
        }
    }

    pub fn with_status(record: ProxyRecord, status: ProxyStatus) -> Self {
        Self { record, status }
    }

    pub fn address(&self) -> &str {
        &self.record.address
    }
}

/// Consumer-facing relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: String,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Parse `host:port`, including bracketed IPv6 such as `[::1]:8080`
pub fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    if addr.trim().is_empty() {
        return Err(PoolError::InvalidProxyAddress("empty address".to_string()));
    }

    let url = url::Url::parse(&format!("http://{}", addr.trim())).map_err(|e| {
        PoolError::InvalidProxyAddress(format!("Invalid address '{}': {}", addr, e))
    })?;

    if !(url.path().is_empty() || url.path() == "/")
        || url.query().is_some()
        || !url.username().is_empty()
    {
        return Err(PoolError::InvalidProxyAddress(format!(
            "Invalid address '{}': expected host:port",
            addr
        )));
    }

    let host = url.host_str().ok_or_else(|| {
        PoolError::InvalidProxyAddress(format!("Invalid address '{}': missing host", addr))
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    // `Url::port` hides the scheme default, so port 80 has to be read back from the input.
    let port = match url.port() {
        Some(p) => p,
        None if addr.trim().ends_with(":80") => 80,
        None => {
            return Err(PoolError::InvalidProxyAddress(format!(
                "Invalid address '{}': missing port",
                addr
            )))
        }
    };

    if port == 0 {
        return Err(PoolError::InvalidProxyAddress(format!(
            "Invalid address '{}': port must be in 1..=65535",
            addr
        )));
    }

    Ok((host.to_string(), port))
}

/// Format host and port, bracketing bare IPv6 hosts
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
