//! Region profiles: the built-in fallback relay set
//!
//! Used when neither the cache nor any source yields a candidate, so the pool is never empty.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PoolError, Result};
use crate::models::{parse_host_port, Credentials, Protocol, ProxyRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileProxy {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionProfile {
    pub proxies: Vec<ProfileProxy>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Relays grouped by region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionProfiles {
    pub regions: BTreeMap<String, RegionProfile>,
}

impl Default for RegionProfiles {
    fn default() -> Self {
        let region = |prefix: &str, weight: f64| RegionProfile {
            proxies: (1..=2)
                .map(|i| ProfileProxy {
                    server: format!("{}-proxy{}.example.com:8080", prefix, i),
                    username: None,
                    password: None,
                })
                .collect(),
            weight,
        };

        let mut regions = BTreeMap::new();
        regions.insert("US".to_string(), region("us", 0.3));
        regions.insert("EU".to_string(), region("eu", 0.3));
        regions.insert("ASIA".to_string(), region("asia", 0.2));
        Self { regions }
    }
}

impl RegionProfiles {
    /// Read a profiles file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let profiles: Self = serde_json::from_str(&content)?;
        if profiles.regions.is_empty() {
            return Err(PoolError::InvalidConfig(format!(
                "{} defines no regions",
                path.display()
            )));
        }
        Ok(profiles)
    }

    /// Profiles from `path` when given and readable, otherwise the built-in set
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::from_file(path) {
            Ok(profiles) => {
                debug!(path = %path.display(), regions = profiles.regions.len(), "Loaded region profiles");
                profiles
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load region profiles, using built-in set");
                Self::default()
            }
        }
    }

    /// Every profile relay as a record tagged with its region, heaviest region first.
    ///
    /// Protocols are inferred from the port; invalid servers are skipped.
    pub fn records(&self) -> Vec<ProxyRecord> {
        let mut regions: Vec<(&String, &RegionProfile)> = self.regions.iter().collect();
        regions.sort_by(|a, b| b.1.weight.total_cmp(&a.1.weight));

        let mut records = Vec::new();
        for (name, profile) in regions {
            for proxy in &profile.proxies {
                let record = parse_host_port(&proxy.server)
                    .and_then(|(host, port)| {
                        ProxyRecord::from_host_port(&host, port, Protocol::infer_from_port(port))
                    });
                match record {
                    Ok(record) => records.push(
                        record
                            .with_credentials(Credentials::from_parts(
                                proxy.username.clone(),
                                proxy.password.clone(),
                            ))
                            .with_region(Some(name.clone())),
                    ),
                    Err(e) => warn!(server = %proxy.server, error = %e, "Skipping invalid profile relay"),
                }
            }
        }
        records
    }
}
