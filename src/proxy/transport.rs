//! Proxy transport layer for HTTP and SOCKS relays
//!
//! Opens a TCP stream that reaches a target through one relay.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::net::TcpStream;
use tokio_socks::tcp::socks4::Socks4Stream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{PoolError, Result};
use crate::models::{format_host_port, Protocol, ProxyRecord};

/// Relay transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Open a stream to `target_host:target_port` through `record`.
    ///
    /// HTTP relays are dialled directly: the caller speaks absolute-form HTTP to the relay
    /// (see [`ProxyTransport::proxy_authorization`]). SOCKS relays complete their handshake
    /// here and return a stream already connected to the target.
    #[instrument(skip(record), fields(relay = %record.address, target = %target_host))]
    pub async fn connect(
        record: &ProxyRecord,
        target_host: &str,
        target_port: u16,
        connect_timeout: Duration,
    ) -> Result<TcpStream> {
        let connecting = async {
            match record.protocol {
                Protocol::Http | Protocol::Https => Self::connect_http(record).await,
                Protocol::Socks4 => Self::connect_socks4(record, target_host, target_port).await,
                Protocol::Socks5 => Self::connect_socks5(record, target_host, target_port).await,
            }
        };

        tokio::time::timeout(connect_timeout, connecting)
            .await
            .map_err(|_| {
                PoolError::ProxyConnectionFailed(format!(
                    "connect to {} timed out after {:?}",
                    record.address, connect_timeout
                ))
            })?
    }

    /// Whether requests through this relay must use absolute-form targets
    pub fn uses_absolute_form(record: &ProxyRecord) -> bool {
        record.protocol.is_http()
    }

    /// `Proxy-Authorization` header value for HTTP relays with credentials
    pub fn proxy_authorization(record: &ProxyRecord) -> Option<String> {
        if !record.protocol.is_http() {
            return None;
        }
        record.credentials.as_ref().map(|creds| {
            let raw = format!("{}:{}", creds.username, creds.password);
            format!("Basic {}", BASE64.encode(raw.as_bytes()))
        })
    }

    async fn dial(record: &ProxyRecord) -> Result<TcpStream> {
        let (host, port) = record.host_port()?;
        TcpStream::connect(format_host_port(&host, port))
            .await
            .map_err(|e| PoolError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))
    }

    async fn connect_http(record: &ProxyRecord) -> Result<TcpStream> {
        debug!("Connecting to HTTP relay at {}", record.address);
        Self::dial(record).await
    }

    /// SOCKS4, or SOCKS4a when the target is a hostname
    async fn connect_socks4(
        record: &ProxyRecord,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS4 relay at {}", record.address);
        let socket = Self::dial(record).await?;

        let stream = match &record.credentials {
            Some(creds) => {
                Socks4Stream::connect_with_userid_and_socket(
                    socket,
                    (target_host, target_port),
                    &creds.username,
                )
                .await
            }
            None => Socks4Stream::connect_with_socket(socket, (target_host, target_port)).await,
        }
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("SOCKS4 connect failed: {}", e)))?;

        debug!("SOCKS4 connection established");
        Ok(stream.into_inner())
    }

    async fn connect_socks5(
        record: &ProxyRecord,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 relay at {}", record.address);
        let socket = Self::dial(record).await?;

        let stream = match &record.credentials {
            Some(creds) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    (target_host, target_port),
                    &creds.username,
                    &creds.password,
                )
                .await
            }
            None => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await,
        }
        .map_err(|e| PoolError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }
}
