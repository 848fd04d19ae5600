//! Scoring and ranking of validated relays
//!
//! `score = success_rate / (response_time_secs + 1)`. Ordering is stable, so equal scores
//! keep insertion order and identical inputs always rank identically.

use std::cmp::Ordering;
use std::time::Duration;

use crate::models::{PoolEntry, ProxyStatus};

/// Reliability weighted by latency; zero for relays that never succeeded
pub fn score(status: &ProxyStatus) -> f64 {
    let success_rate = status.success_rate();
    if success_rate == 0.0 {
        return 0.0;
    }
    let latency = status.response_time.map(|d| d.as_secs_f64()).unwrap_or(0.0);
    success_rate * (1.0 / (latency + 1.0))
}

/// Keep entries in `region` (when given), best score first
pub fn rank<'a, I>(entries: I, region: Option<&str>) -> Vec<&'a PoolEntry>
where
    I: IntoIterator<Item = &'a PoolEntry>,
{
    let mut ranked: Vec<(f64, &PoolEntry)> = entries
        .into_iter()
        .filter(|entry| region.map_or(true, |r| entry.record.in_region(r)))
        .map(|entry| (score(&entry.status), entry))
        .collect();

    // sort_by is stable
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.into_iter().map(|(_, entry)| entry).collect()
}

/// Working entries in `region` (when given), fastest first
pub fn by_latency<'a, I>(entries: I, region: Option<&str>) -> Vec<&'a PoolEntry>
where
    I: IntoIterator<Item = &'a PoolEntry>,
{
    let mut working: Vec<&PoolEntry> = entries
        .into_iter()
        .filter(|entry| entry.status.is_working())
        .filter(|entry| region.map_or(true, |r| entry.record.in_region(r)))
        .collect();

    working.sort_by(|a, b| latency_cmp(a.status.response_time, b.status.response_time));
    working
}

fn latency_cmp(a: Option<Duration>, b: Option<Duration>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Protocol, ProxyRecord};
    use chrono::Utc;

    fn status(success: u64, fail: u64, response_ms: Option<u64>) -> ProxyStatus {
        ProxyStatus {
            last_checked: Some(Utc::now()),
            response_time: response_ms.map(Duration::from_millis),
            success_count: success,
            fail_count: fail,
            last_error: None,
        }
    }

    fn entry(address: &str, region: Option<&str>, status: ProxyStatus) -> PoolEntry {
        PoolEntry::with_status(
            ProxyRecord::new(address, Protocol::Http)
                .unwrap()
                .with_region(region.map(str::to_string)),
            status,
        )
    }

    #[test]
    fn test_score_formula() {
        let cases = [(3, 1, 500), (1, 0, 0), (5, 5, 2000), (7, 3, 120)];
        for (s, f, ms) in cases {
            let expected = (s as f64 / (s + f) as f64) * (1.0 / (ms as f64 / 1000.0 + 1.0));
            let actual = score(&status(s, f, Some(ms)));
            assert!((actual - expected).abs() < 1e-12, "s={} f={} ms={}", s, f, ms);
        }
    }

    #[test]
    fn test_score_zero_without_success() {
        assert_eq!(score(&ProxyStatus::default()), 0.0);
        assert_eq!(score(&status(0, 4, Some(100))), 0.0);
    }

    #[test]
    fn test_rank_filters_region_case_insensitively() {
        let entries = vec![
            entry("10.0.0.1:8080", Some("eu"), status(1, 0, Some(200))),
            entry("10.0.0.2:8080", Some("US"), status(1, 0, Some(10))),
            entry("10.0.0.3:8080", None, status(1, 0, Some(10))),
            entry("10.0.0.4:8080", Some("EU"), status(1, 0, Some(50))),
        ];

        let ranked = rank(&entries, Some("EU"));
        let addresses: Vec<&str> = ranked.iter().map(|e| e.address()).collect();
        assert_eq!(addresses, vec!["10.0.0.4:8080", "10.0.0.1:8080"]);

        assert_eq!(rank(&entries, None).len(), 4);
    }

    #[test]
    fn test_rank_ties_keep_insertion_order() {
        let entries = vec![
            entry("10.0.0.1:8080", None, ProxyStatus::default()),
            entry("10.0.0.2:8080", None, status(2, 0, Some(100))),
            entry("10.0.0.3:8080", None, ProxyStatus::default()),
            entry("10.0.0.4:8080", None, status(2, 0, Some(100))),
        ];

        let first: Vec<&str> = rank(&entries, None).iter().map(|e| e.address()).collect();
        let second: Vec<&str> = rank(&entries, None).iter().map(|e| e.address()).collect();

        assert_eq!(
            first,
            vec!["10.0.0.2:8080", "10.0.0.4:8080", "10.0.0.1:8080", "10.0.0.3:8080"]
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_by_latency_only_working_fastest_first() {
        let mut failed = status(3, 1, Some(5));
        failed.last_error = Some("timeout".to_string());

        let entries = vec![
            entry("10.0.0.1:8080", Some("EU"), status(1, 0, Some(200))),
            entry("10.0.0.2:8080", Some("EU"), failed),
            entry("10.0.0.3:8080", Some("EU"), status(1, 0, Some(50))),
            entry("10.0.0.4:8080", Some("US"), status(1, 0, Some(20))),
        ];

        let fastest: Vec<&str> = by_latency(&entries, Some("eu"))
            .iter()
            .map(|e| e.address())
            .collect();
        assert_eq!(fastest, vec!["10.0.0.3:8080", "10.0.0.1:8080"]);
    }
}
