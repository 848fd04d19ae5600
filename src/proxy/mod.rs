//! Relay pool internals
//!
//! - Candidate acquisition from sources and the freshness-bounded cache
//! - Liveness probing through HTTP and SOCKS relays
//! - Scoring, rate limiting and retries
//! - The [`ProxyManager`] orchestrator

pub mod cache;
pub mod health;
pub mod loader;
pub mod manager;
pub mod pool;
pub mod profiles;
pub mod rate_limit;
pub mod retry;
pub mod scoring;
pub mod source;
pub mod transport;
pub mod validator;

pub use cache::ProxyCache;
pub use health::{HttpProbe, LivenessProbe, ProbeResponse};
pub use loader::{HttpFetcher, LoadReport, PremiumKeys, SourceConfig, SourceFetcher, SourceLoader};
pub use manager::{PoolSettings, PoolState, ProxyManager};
pub use pool::Pool;
pub use profiles::RegionProfiles;
pub use rate_limit::{RateLimitPolicy, RateLimiter};
pub use retry::{RetryExecutor, RetryPolicy, TimeoutPolicy};
pub use source::{SourceAdapter, SourceKind};
pub use transport::ProxyTransport;
pub use validator::{BatchOutcome, ProxyValidator, Validation, Verdict};
