//! Relay Pool - validated proxy relays on demand
//!
//! Gathers candidate relays from public feeds, premium services and a local cache, checks them
//! through the relay itself, and hands out the best working one for a region.
//!
//! ## Features
//!
//! - JSON and line-based source feeds, fetched concurrently with retries
//! - HTTP, HTTPS, SOCKS4 and SOCKS5 relay validation
//! - Latency and success-rate scoring with region filtering
//! - Sliding-window rate limiting and exponential backoff with jitter
//! - JSON cache with a freshness window, written atomically

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{PoolError, Result};
pub use proxy::ProxyManager;
