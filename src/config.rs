use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{PoolError, Result};
use crate::proxy::cache::DEFAULT_FRESHNESS;
use crate::proxy::health::DEFAULT_VALIDATION_ENDPOINTS;
use crate::proxy::loader::{SourceConfig, DEFAULT_FETCH_TIMEOUT_SECS};
use crate::proxy::manager::PoolSettings;
use crate::proxy::rate_limit::RateLimitPolicy;
use crate::proxy::retry::{RetryPolicy, TimeoutPolicy};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Pool, cache and source configuration
    pub pool: PoolConfig,
    /// Retry policy shared by every outbound operation
    pub retry: RetryPolicy,
    /// Sliding-window rate limit
    pub rate_limit: RateLimitPolicy,
    /// Connect/read/total timeouts
    pub timeouts: TimeoutPolicy,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cache file (default: data/proxy_cache.json)
    pub cache_path: PathBuf,
    /// Maximum age of cached entries
    pub cache_freshness: Duration,
    /// JSON sources file; built-in feeds when unset
    pub sources_file: Option<PathBuf>,
    /// Premium API keys file
    pub premium_config: Option<PathBuf>,
    /// Region profiles file; built-in profiles when unset
    pub profiles_file: Option<PathBuf>,
    /// Preferred region for the relay requested at startup
    pub region: Option<String>,
    /// Candidates validated at once
    pub max_concurrent: usize,
    /// Rounds of `get_working_proxy`
    pub max_retries: u32,
    /// Interval between full revalidations
    pub refresh_interval: Duration,
    /// Timeout of a single source fetch
    pub fetch_timeout: Duration,
    /// Echo endpoints probed through each relay
    pub validation_endpoints: Vec<Url>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let retry = RetryPolicy {
            max_attempts: parse_env("RETRY_MAX_ATTEMPTS", "3")?,
            base_delay: Duration::from_millis(parse_env("RETRY_BASE_DELAY_MS", "1000")?),
            max_delay: Duration::from_millis(parse_env("RETRY_MAX_DELAY_MS", "10000")?),
            exponential_base: parse_env("RETRY_EXPONENTIAL_BASE", "2.0")?,
            jitter: parse_env("RETRY_JITTER", "0.1")?,
        };
        if retry.max_attempts == 0 {
            return Err(PoolError::InvalidConfig(
                "RETRY_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if retry.exponential_base.is_nan() || retry.exponential_base < 1.0 {
            return Err(PoolError::InvalidConfig(
                "RETRY_EXPONENTIAL_BASE must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(PoolError::InvalidConfig(
                "RETRY_JITTER must be between 0.0 and 1.0".into(),
            ));
        }

        let rate_limit = RateLimitPolicy {
            requests_per_window: parse_env("RATE_LIMIT_REQUESTS", "60")?,
            window_size: Duration::from_secs(parse_env("RATE_LIMIT_WINDOW_SECS", "60")?),
        };
        if rate_limit.requests_per_window == 0 {
            return Err(PoolError::InvalidConfig(
                "RATE_LIMIT_REQUESTS must be at least 1".into(),
            ));
        }

        let timeouts = TimeoutPolicy {
            connect: Duration::from_secs(parse_env("TIMEOUT_CONNECT_SECS", "10")?),
            read: Duration::from_secs(parse_env("TIMEOUT_READ_SECS", "30")?),
            total: Duration::from_secs(parse_env("TIMEOUT_TOTAL_SECS", "60")?),
        };

        let max_concurrent: usize = parse_env("POOL_MAX_CONCURRENT", "10")?;
        if max_concurrent == 0 {
            return Err(PoolError::InvalidConfig(
                "POOL_MAX_CONCURRENT must be at least 1".into(),
            ));
        }

        Ok(Config {
            pool: PoolConfig {
                cache_path: PathBuf::from(get_env_or("POOL_CACHE_PATH", "data/proxy_cache.json")),
                cache_freshness: Duration::from_secs(parse_env(
                    "POOL_CACHE_FRESHNESS_SECS",
                    &DEFAULT_FRESHNESS.as_secs().to_string(),
                )?),
                sources_file: get_env_path("POOL_SOURCES_FILE"),
                premium_config: get_env_path("POOL_PREMIUM_CONFIG"),
                profiles_file: get_env_path("POOL_PROFILES_FILE"),
                region: Some(get_env_or("POOL_REGION", ""))
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty()),
                max_concurrent,
                max_retries: parse_env("POOL_MAX_RETRIES", "5")?,
                refresh_interval: Duration::from_secs(parse_env("POOL_REFRESH_INTERVAL_SECS", "300")?),
                fetch_timeout: Duration::from_secs(parse_env(
                    "POOL_FETCH_TIMEOUT_SECS",
                    &DEFAULT_FETCH_TIMEOUT_SECS.to_string(),
                )?),
                validation_endpoints: parse_endpoints()?,
            },
            retry,
            rate_limit,
            timeouts,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Configured sources, or the built-in feeds when no sources file is set
    pub fn sources(&self) -> Result<Vec<SourceConfig>> {
        match &self.pool.sources_file {
            Some(path) => SourceConfig::load_file(path),
            None => Ok(SourceConfig::default_sources()),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_concurrent: self.pool.max_concurrent,
            max_retries: self.pool.max_retries,
        }
    }
}

fn parse_endpoints() -> Result<Vec<Url>> {
    let raw = get_env_or("POOL_VALIDATION_ENDPOINTS", "");
    let raw: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let raw = if raw.is_empty() {
        DEFAULT_VALIDATION_ENDPOINTS.to_vec()
    } else {
        raw
    };

    raw.into_iter()
        .map(|endpoint| {
            let url = Url::parse(endpoint).map_err(|e| {
                PoolError::InvalidConfig(format!(
                    "POOL_VALIDATION_ENDPOINTS entry '{}' is not a valid URL: {}",
                    endpoint, e
                ))
            })?;
            if url.scheme() != "http" {
                return Err(PoolError::InvalidConfig(format!(
                    "POOL_VALIDATION_ENDPOINTS entry '{}' must use http://",
                    endpoint
                )));
            }
            Ok(url)
        })
        .collect()
}

/// Parse an environment variable, falling back to `default` when unset
fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = get_env_or(key, default);
    raw.trim().parse().map_err(|_| {
        PoolError::InvalidConfig(format!("{} must be a valid number, got '{}'", key, raw))
    })
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "POOL_CACHE_PATH",
        "POOL_CACHE_FRESHNESS_SECS",
        "POOL_SOURCES_FILE",
        "POOL_PREMIUM_CONFIG",
        "POOL_PROFILES_FILE",
        "POOL_REGION",
        "POOL_MAX_CONCURRENT",
        "POOL_MAX_RETRIES",
        "POOL_REFRESH_INTERVAL_SECS",
        "POOL_FETCH_TIMEOUT_SECS",
        "POOL_VALIDATION_ENDPOINTS",
        "RETRY_MAX_ATTEMPTS",
        "RETRY_BASE_DELAY_MS",
        "RETRY_MAX_DELAY_MS",
        "RETRY_EXPONENTIAL_BASE",
        "RETRY_JITTER",
        "RATE_LIMIT_REQUESTS",
        "RATE_LIMIT_WINDOW_SECS",
        "TIMEOUT_CONNECT_SECS",
        "TIMEOUT_READ_SECS",
        "TIMEOUT_TOTAL_SECS",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.rate_limit, RateLimitPolicy::default());
        assert_eq!(config.timeouts, TimeoutPolicy::default());

        assert_eq!(config.pool.cache_path, PathBuf::from("data/proxy_cache.json"));
        assert_eq!(config.pool.cache_freshness, Duration::from_secs(3600));
        assert_eq!(config.pool.max_concurrent, 10);
        assert_eq!(config.pool.max_retries, 5);
        assert!(config.pool.region.is_none());
        assert!(config.pool.sources_file.is_none());
        assert_eq!(config.pool.validation_endpoints.len(), 2);
        assert_eq!(config.log.format, "json");

        assert_eq!(config.sources().unwrap(), SourceConfig::default_sources());
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_REGION", " EU ");
        env::set_var("POOL_MAX_CONCURRENT", "4");
        env::set_var("RETRY_MAX_ATTEMPTS", "5");
        env::set_var("RETRY_BASE_DELAY_MS", "250");
        env::set_var("RATE_LIMIT_REQUESTS", "3");
        env::set_var("TIMEOUT_TOTAL_SECS", "15");
        env::set_var(
            "POOL_VALIDATION_ENDPOINTS",
            "http://echo.example/json, http://echo.example/ip",
        );

        let config = Config::from_env().unwrap();

        assert_eq!(config.pool.region.as_deref(), Some("EU"));
        assert_eq!(config.pool_settings().max_concurrent, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.rate_limit.requests_per_window, 3);
        assert_eq!(config.timeouts.total, Duration::from_secs(15));
        assert_eq!(
            config.pool.validation_endpoints[1].as_str(),
            "http://echo.example/ip"
        );
    }

    #[test]
    fn test_config_from_env_invalid_numbers() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("RETRY_MAX_ATTEMPTS", "three");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            PoolError::InvalidConfig(_)
        ));

        env::set_var("RETRY_MAX_ATTEMPTS", "3");
        env::set_var("RETRY_JITTER", "1.5");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            PoolError::InvalidConfig(_)
        ));

        env::remove_var("RETRY_JITTER");
        env::set_var("POOL_MAX_CONCURRENT", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            PoolError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_config_from_env_rejects_https_endpoint() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_VALIDATION_ENDPOINTS", "https://echo.example/json");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            PoolError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_config_sources_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "feed", "url": "http://feed.example/list.txt", "kind": "line"}}]"#
        )
        .unwrap();
        env::set_var("POOL_SOURCES_FILE", file.path());

        let config = Config::from_env().unwrap();
        let sources = config.sources().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "feed");
    }
}
