use std::time::Duration;

use thiserror::Error;

/// Unified error type for the relay pool
#[derive(Error, Debug)]
pub enum PoolError {
    // Source errors
    #[error("Malformed source record: {0}")]
    MalformedSourceRecord(String),

    #[error("Source '{source_name}' could not be fetched: {reason}")]
    SourceFetch { source_name: String, reason: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("Operation '{key}' failed after {attempts} attempts: {source}")]
    ExhaustedRetries {
        key: String,
        attempts: u32,
        #[source]
        source: Box<PoolError>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // Proxy errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Cache errors
    #[error("Cache persistence failed: {0}")]
    CachePersistence(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for relay pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Whether this failure is confined to one candidate, one source or one cache access.
    ///
    /// Local failures are recovered by skipping and continuing; only the remaining
    /// (systemic) failures may reach a caller of the pool.
    pub fn is_local(&self) -> bool {
        match self {
            PoolError::MalformedSourceRecord(_)
            | PoolError::SourceFetch { .. }
            | PoolError::ValidationFailure(_)
            | PoolError::ExhaustedRetries { .. }
            | PoolError::Timeout(_)
            | PoolError::ProxyConnectionFailed(_)
            | PoolError::InvalidProxyAddress(_)
            | PoolError::UnsupportedProtocol(_)
            | PoolError::CachePersistence(_)
            | PoolError::Http(_) => true,

            PoolError::NoProxiesAvailable
            | PoolError::InvalidConfig(_)
            | PoolError::Io(_)
            | PoolError::Json(_) => false,
        }
    }

    /// Walk through retry wrappers to the failure that was last observed
    pub fn root_cause(&self) -> &PoolError {
        match self {
            PoolError::ExhaustedRetries { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for PoolError {
    fn from(err: hyper::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}

// Convert from reqwest errors
impl From<reqwest::Error> for PoolError {
    fn from(err: reqwest::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::InvalidProxyAddress(err.to_string())
    }
}
