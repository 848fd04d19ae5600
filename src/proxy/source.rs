//! Source adapters
//!
//! Each adapter turns one external representation of a relay into a [`ProxyRecord`].
//! A bad entry yields [`PoolError::MalformedSourceRecord`]; callers count it and move on.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PoolError, Result};
use crate::models::{Credentials, PoolEntry, Protocol, ProxyRecord, ProxyStatus};

/// Declared shape of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// JSON objects with an explicit protocol
    Standard,
    /// JSON objects with only host and port; protocol inferred from the port
    Raw,
    /// JSON objects carrying a previously recorded status (cache re-import)
    Working,
    /// Plain text, one `host:port[:protocol]` per line
    #[serde(alias = "line", alias = "text")]
    LineBased,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Standard => "standard",
            SourceKind::Raw => "raw",
            SourceKind::Working => "working",
            SourceKind::LineBased => "linebased",
        }
    }

    pub fn is_json(&self) -> bool {
        !matches!(self, SourceKind::LineBased)
    }
}

/// Port given either as a number or as a numeric string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(i64),
    Text(String),
}

impl PortField {
    fn to_port(&self) -> Result<u16> {
        let port = match self {
            PortField::Number(n) => *n,
            PortField::Text(s) => s.trim().parse::<i64>().map_err(|_| {
                PoolError::MalformedSourceRecord(format!("port '{}' is not a number", s))
            })?,
        };

        if (1..=65535).contains(&port) {
            Ok(port as u16)
        } else {
            Err(PoolError::MalformedSourceRecord(format!(
                "port {} out of range",
                port
            )))
        }
    }
}

/// Protocol given either as a single name or as a list (first element wins)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ProtocolField {
    One(String),
    Many(Vec<String>),
}

impl ProtocolField {
    fn first(&self) -> Option<&str> {
        match self {
            ProtocolField::One(s) => Some(s.as_str()),
            ProtocolField::Many(list) => list.first().map(|s| s.as_str()),
        }
    }
}

/// Structured source entry as found in JSON feeds
#[derive(Debug, Clone, Deserialize)]
struct FeedEntry {
    #[serde(alias = "ip_address", alias = "host")]
    ip: Option<String>,
    port: Option<PortField>,
    #[serde(alias = "protocols", alias = "type")]
    protocol: Option<ProtocolField>,
    username: Option<String>,
    password: Option<String>,
    #[serde(alias = "country", alias = "countryCode", alias = "country_code")]
    region: Option<String>,
}

impl FeedEntry {
    fn host_and_port(&self) -> Result<(&str, u16)> {
        let host = self
            .ip
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PoolError::MalformedSourceRecord("missing host".to_string()))?;
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| PoolError::MalformedSourceRecord("missing port".to_string()))?
            .to_port()?;
        Ok((host, port))
    }

    fn into_record(self, protocol: Protocol, host: &str, port: u16) -> Result<ProxyRecord> {
        let record = ProxyRecord::from_host_port(host, port, protocol)
            .map_err(|e| PoolError::MalformedSourceRecord(e.to_string()))?;
        Ok(record
            .with_credentials(Credentials::from_parts(self.username, self.password))
            .with_region(self.region))
    }
}

/// One relay as persisted in the cache file; also the shape of a "working" source entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub address: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Snapshot one pool entry, stamped with `cached_at`
    pub fn from_entry(entry: &PoolEntry, cached_at: DateTime<Utc>) -> Self {
        let record = &entry.record;
        let status = &entry.status;
        Self {
            address: record.address.clone(),
            protocol: record.protocol,
            username: record.credentials.as_ref().map(|c| c.username.clone()),
            password: record.credentials.as_ref().map(|c| c.password.clone()),
            region: record.region.clone(),
            last_checked: status.last_checked,
            response_time: status.response_time.map(|d| d.as_secs_f64()),
            success_count: status.success_count,
            fail_count: status.fail_count,
            last_error: status.last_error.clone(),
            cached_at: Some(cached_at),
        }
    }

    /// Age reference: the last validation, or the write for entries never validated.
    ///
    /// Entries without any timestamp have no age.
    pub fn stamped_at(&self) -> Option<DateTime<Utc>> {
        self.last_checked.or(self.cached_at)
    }

    /// Convert back into a pool entry
    pub fn into_entry(self) -> Result<PoolEntry> {
        let record = ProxyRecord::new(self.address, self.protocol)
            .map_err(|e| PoolError::MalformedSourceRecord(e.to_string()))?
            .with_credentials(Credentials::from_parts(self.username, self.password))
            .with_region(self.region);

        let response_time = match self.response_time {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
            Some(secs) => {
                return Err(PoolError::MalformedSourceRecord(format!(
                    "invalid response_time {}",
                    secs
                )))
            }
            None => None,
        };

        let mut status = ProxyStatus {
            last_checked: self.last_checked,
            response_time,
            success_count: self.success_count,
            fail_count: self.fail_count,
            last_error: self.last_error,
        };

        // Older snapshots only recorded the last successful check.
        if status.attempts() == 0 && status.last_checked.is_some() {
            if status.response_time.is_some() {
                status.success_count = 1;
            } else {
                status.fail_count = 1;
            }
        }

        Ok(PoolEntry::with_status(record, status))
    }
}

/// Adapter dispatch over the fixed set of source shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceAdapter {
    kind: SourceKind,
    protocol_hint: Option<Protocol>,
}

impl SourceAdapter {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            protocol_hint: None,
        }
    }

    /// Protocol for line entries that do not name one, instead of port inference
    pub fn with_protocol_hint(mut self, protocol: Option<Protocol>) -> Self {
        self.protocol_hint = protocol;
        self
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Adapt one structured entry
    pub fn adapt_value(&self, raw: Value) -> Result<PoolEntry> {
        match self.kind {
            SourceKind::Standard => adapt_standard(raw).map(PoolEntry::new),
            SourceKind::Raw => adapt_raw(raw).map(PoolEntry::new),
            SourceKind::Working => adapt_working(raw),
            SourceKind::LineBased => match raw {
                Value::String(line) => adapt_line_with(&line, self.protocol_hint)?
                    .map(PoolEntry::new)
                    .ok_or_else(|| PoolError::MalformedSourceRecord("no host:port".to_string())),
                other => Err(PoolError::MalformedSourceRecord(format!(
                    "expected a text line, got {}",
                    other
                ))),
            },
        }
    }

    /// Adapt a whole source body.
    ///
    /// Returns the adapted entries and the number of malformed ones. Only a body that cannot
    /// be read as a list at all is an error.
    pub fn adapt_body(&self, body: &str) -> Result<(Vec<PoolEntry>, usize)> {
        let mut entries = Vec::new();
        let mut malformed = 0;

        if self.kind == SourceKind::LineBased {
            for line in body.lines() {
                match adapt_line_with(line, self.protocol_hint) {
                    Ok(Some(record)) => entries.push(PoolEntry::new(record)),
                    Ok(None) => {}
                    Err(_) => malformed += 1,
                }
            }
            return Ok((entries, malformed));
        }

        let items: Vec<Value> = match serde_json::from_str(body)? {
            Value::Array(items) => items,
            other => {
                return Err(PoolError::MalformedSourceRecord(format!(
                    "expected a JSON array, got {}",
                    json_type(&other)
                )))
            }
        };

        for item in items {
            match self.adapt_value(item) {
                Ok(entry) => entries.push(entry),
                Err(_) => malformed += 1,
            }
        }

        Ok((entries, malformed))
    }
}

/// Structured record with an explicit protocol
pub fn adapt_standard(raw: Value) -> Result<ProxyRecord> {
    let entry: FeedEntry = parse_entry(raw)?;
    let (host, port) = entry.host_and_port()?;
    let name = entry
        .protocol
        .as_ref()
        .and_then(|p| p.first())
        .ok_or_else(|| PoolError::MalformedSourceRecord("missing protocol".to_string()))?;
    let protocol = Protocol::from_str(name).ok_or_else(|| {
        PoolError::MalformedSourceRecord(format!("unknown protocol '{}'", name))
    })?;

    let host = host.to_string();
    entry.into_record(protocol, &host, port)
}

/// Structured record with host and port only
pub fn adapt_raw(raw: Value) -> Result<ProxyRecord> {
    let entry: FeedEntry = parse_entry(raw)?;
    let (host, port) = entry.host_and_port()?;

    let host = host.to_string();
    entry.into_record(Protocol::infer_from_port(port), &host, port)
}

/// Structured record with a previously recorded status
pub fn adapt_working(raw: Value) -> Result<PoolEntry> {
    let entry: CacheEntry = parse_entry(raw)?;
    entry.into_entry()
}

/// One `host:port[:protocol[:username:password]]` line.
///
/// Blank lines, comments and lines without a colon yield `Ok(None)`.
pub fn adapt_line(line: &str) -> Result<Option<ProxyRecord>> {
    adapt_line_with(line, None)
}

/// Like [`adapt_line`], using `hint` when the line names no known protocol
pub fn adapt_line_with(line: &str, hint: Option<Protocol>) -> Result<Option<ProxyRecord>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || !line.contains(':') {
        return Ok(None);
    }

    let (host, rest) = split_host(line)?;
    if host.is_empty() {
        return Err(PoolError::MalformedSourceRecord(format!(
            "missing host in '{}'",
            line
        )));
    }

    let mut fields = rest.split(':').map(str::trim);
    let port = PortField::Text(fields.next().unwrap_or_default().to_string()).to_port()?;
    let protocol = fields
        .next()
        .and_then(Protocol::from_str)
        .or(hint)
        .unwrap_or_else(|| Protocol::infer_from_port(port));
    let credentials = match (fields.next(), fields.next()) {
        (Some(user), pass) => {
            Credentials::from_parts(Some(user.to_string()), pass.map(|p| p.to_string()))
        }
        _ => None,
    };

    ProxyRecord::from_host_port(host, port, protocol)
        .map(|r| Some(r.with_credentials(credentials)))
        .map_err(|e| PoolError::MalformedSourceRecord(e.to_string()))
}

/// Split off the host, keeping a bracketed IPv6 host such as `[::1]` whole
fn split_host(line: &str) -> Result<(&str, &str)> {
    let Some(bracketed) = line.strip_prefix('[') else {
        return Ok(line
            .split_once(':')
            .map_or((line, ""), |(host, rest)| (host.trim(), rest)));
    };

    let (host, rest) = bracketed.split_once(']').ok_or_else(|| {
        PoolError::MalformedSourceRecord(format!("unclosed '[' in '{}'", line))
    })?;
    let rest = rest.trim_start().strip_prefix(':').ok_or_else(|| {
        PoolError::MalformedSourceRecord(format!("missing port in '{}'", line))
    })?;
    Ok((host.trim(), rest))
}

fn parse_entry<T: serde::de::DeserializeOwned>(raw: Value) -> Result<T> {
    serde_json::from_value(raw).map_err(|e| PoolError::MalformedSourceRecord(e.to_string()))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_line_protocol_inference() {
        let record = adapt_line("h.example:8080").unwrap().unwrap();
        assert_eq!(record.protocol, Protocol::Http);

        let record = adapt_line("h.example:1080").unwrap().unwrap();
        assert_eq!(record.protocol, Protocol::Socks5);

        let record = adapt_line("h.example:4144").unwrap().unwrap();
        assert_eq!(record.protocol, Protocol::Socks4);
    }

    #[test]
    fn test_line_explicit_protocol_and_credentials() {
        let record = adapt_line("10.0.0.1:8080:socks5").unwrap().unwrap();
        assert_eq!(record.protocol, Protocol::Socks5);
        assert_eq!(record.address, "10.0.0.1:8080");

        let record = adapt_line("10.0.0.1:1080:bogus").unwrap().unwrap();
        assert_eq!(record.protocol, Protocol::Socks5);

        let record = adapt_line("10.0.0.1:3128:http:user:pass").unwrap().unwrap();
        assert_eq!(record.credentials, Some(Credentials::new("user", "pass")));
    }

    #[test]
    fn test_line_bracketed_ipv6() {
        let record = adapt_line("[::1]:8080").unwrap().unwrap();
        assert_eq!(record.address, "[::1]:8080");
        assert_eq!(record.protocol, Protocol::Http);

        let record = adapt_line("[2001:db8::1]:1080:socks5:user:pass").unwrap().unwrap();
        assert_eq!(record.address, "[2001:db8::1]:1080");
        assert_eq!(record.protocol, Protocol::Socks5);
        assert_eq!(record.credentials, Some(Credentials::new("user", "pass")));
        assert_eq!(
            record.host_port().unwrap(),
            ("2001:db8::1".to_string(), 1080)
        );

        assert!(matches!(
            adapt_line("[::1:8080"),
            Err(PoolError::MalformedSourceRecord(_))
        ));
        assert!(matches!(
            adapt_line("[::1]8080"),
            Err(PoolError::MalformedSourceRecord(_))
        ));
    }

    #[test]
    fn test_line_skips_and_rejects() {
        assert!(adapt_line("").unwrap().is_none());
        assert!(adapt_line("   ").unwrap().is_none());
        assert!(adapt_line("# comment: with colon").unwrap().is_none());
        assert!(adapt_line("no-colon-here").unwrap().is_none());

        assert!(matches!(
            adapt_line("10.0.0.1:notaport"),
            Err(PoolError::MalformedSourceRecord(_))
        ));
        assert!(matches!(
            adapt_line("10.0.0.1:0"),
            Err(PoolError::MalformedSourceRecord(_))
        ));
        assert!(matches!(
            adapt_line(":8080"),
            Err(PoolError::MalformedSourceRecord(_))
        ));
    }

    #[test]
    fn test_standard_adapter_uses_first_protocol() {
        let record = adapt_standard(json!({
            "ip": "1.2.3.4",
            "port": 8000,
            "protocol": ["socks4", "http"],
            "username": "u",
            "password": "p"
        }))
        .unwrap();

        assert_eq!(record.address, "1.2.3.4:8000");
        assert_eq!(record.protocol, Protocol::Socks4);
        assert_eq!(record.credentials, Some(Credentials::new("u", "p")));
    }

    #[test]
    fn test_standard_adapter_requires_known_protocol() {
        assert!(matches!(
            adapt_standard(json!({"ip": "1.2.3.4", "port": 8000})),
            Err(PoolError::MalformedSourceRecord(_))
        ));
        assert!(matches!(
            adapt_standard(json!({"ip": "1.2.3.4", "port": 8000, "protocol": "ftp"})),
            Err(PoolError::MalformedSourceRecord(_))
        ));
        assert!(matches!(
            adapt_standard(json!({"ip": "1.2.3.4", "port": 8000, "protocol": []})),
            Err(PoolError::MalformedSourceRecord(_))
        ));
    }

    #[test]
    fn test_raw_adapter_infers_protocol() {
        let record = adapt_raw(json!({"ip_address": "5.6.7.8", "port": "4145"})).unwrap();
        assert_eq!(record.protocol, Protocol::Socks5);
        assert_eq!(record.address, "5.6.7.8:4145");

        let record = adapt_raw(json!({"ip": "5.6.7.8", "port": 1081})).unwrap();
        assert_eq!(record.protocol, Protocol::Socks4);

        let record = adapt_raw(json!({"ip": "5.6.7.8", "port": 9000, "country": "DE"})).unwrap();
        assert_eq!(record.protocol, Protocol::Http);
        assert_eq!(record.region.as_deref(), Some("DE"));

        assert!(adapt_raw(json!({"ip": "5.6.7.8"})).is_err());
        assert!(adapt_raw(json!({"port": 80})).is_err());
        assert!(adapt_raw(json!({"ip": "5.6.7.8", "port": 70000})).is_err());
        assert!(adapt_raw(json!("5.6.7.8:80")).is_err());
    }

    #[test]
    fn test_working_adapter_restores_status() {
        let entry = adapt_working(json!({
            "address": "9.9.9.9:3128",
            "protocol": "http",
            "region": "US",
            "last_checked": "2024-05-01T12:00:00Z",
            "response_time": 0.25
        }))
        .unwrap();

        assert_eq!(entry.record.region.as_deref(), Some("US"));
        assert_eq!(entry.status.response_time, Some(Duration::from_millis(250)));
        assert_eq!(entry.status.success_count, 1);
        assert!(entry.status.is_working());

        assert!(adapt_working(json!({"address": "9.9.9.9", "protocol": "http"})).is_err());
        assert!(adapt_working(json!({"address": "9.9.9.9:80", "protocol": "gopher"})).is_err());
    }

    #[test]
    fn test_adapt_body_counts_malformed_entries() {
        let adapter = SourceAdapter::new(SourceKind::Raw);
        let body = r#"[
            {"ip": "1.1.1.1", "port": 8080},
            {"ip": "1.1.1.2"},
            {"ip": "1.1.1.3", "port": 1080}
        ]"#;

        let (entries, malformed) = adapter.adapt_body(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(malformed, 1);
    }

    #[test]
    fn test_adapt_body_line_based() {
        let adapter = SourceAdapter::new(SourceKind::LineBased);
        let body = "1.1.1.1:8080\n\n# header\n1.1.1.2:bad\n1.1.1.3:1080:socks5\njunk\n";

        let (entries, malformed) = adapter.adapt_body(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(malformed, 1);
    }

    #[test]
    fn test_line_protocol_hint() {
        let adapter = SourceAdapter::new(SourceKind::LineBased).with_protocol_hint(Some(Protocol::Socks4));
        let (entries, _) = adapter.adapt_body("1.1.1.1:8080\n1.1.1.2:8080:http\n").unwrap();

        assert_eq!(entries[0].record.protocol, Protocol::Socks4);
        assert_eq!(entries[1].record.protocol, Protocol::Http);
    }

    #[test]
    fn test_adapt_body_rejects_non_array_json() {
        let adapter = SourceAdapter::new(SourceKind::Standard);
        assert!(adapter.adapt_body(r#"{"ip": "1.1.1.1"}"#).is_err());
        assert!(adapter.adapt_body("not json").is_err());
    }

    #[test]
    fn test_source_kind_serde_names() {
        let kind: SourceKind = serde_json::from_str("\"line\"").unwrap();
        assert_eq!(kind, SourceKind::LineBased);
        let kind: SourceKind = serde_json::from_str("\"raw\"").unwrap();
        assert_eq!(kind, SourceKind::Raw);
        assert!(!SourceKind::LineBased.is_json());
    }
}
