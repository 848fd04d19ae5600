//! The pool aggregate: relays keyed by address, in insertion order

use std::collections::HashMap;

use crate::models::{PoolEntry, ProxyStatus};
use crate::proxy::validator::Validation;

#[derive(Debug, Clone, Default)]
pub struct Pool {
    entries: Vec<PoolEntry>,
    index: HashMap<String, usize>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    /// Add a candidate unless its address is already present. Returns whether it was added.
    pub fn insert_candidate(&mut self, entry: PoolEntry) -> bool {
        if self.index.contains_key(entry.address()) {
            return false;
        }
        self.index.insert(entry.address().to_string(), self.entries.len());
        self.entries.push(entry);
        true
    }

    /// Record a validation outcome on the live entry.
    ///
    /// Counters accumulate on top of whatever the entry holds now. Returns `None` when the
    /// address is no longer pooled.
    pub fn apply(&mut self, validation: &Validation) -> Option<&PoolEntry> {
        let i = *self.index.get(&validation.address)?;
        let entry = &mut self.entries[i];
        validation.apply_to(entry);
        Some(entry)
    }

    /// Merge candidates in order; returns how many were new
    pub fn merge(&mut self, entries: impl IntoIterator<Item = PoolEntry>) -> usize {
        let mut added = 0;
        for entry in entries {
            if self.insert_candidate(entry) {
                added += 1;
            }
        }
        added
    }

    /// Owned copy for validation outside the lock or for persisting
    pub fn snapshot(&self) -> Vec<PoolEntry> {
        self.entries.clone()
    }

    /// Entries whose last validation succeeded
    pub fn working_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status.is_working()).count()
    }

    /// Zero every status; records are kept
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.status = ProxyStatus::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Protocol, ProxyRecord};
    use crate::proxy::validator::Verdict;
    use chrono::Utc;
    use std::time::Duration;

    fn entry(address: &str) -> PoolEntry {
        PoolEntry::new(ProxyRecord::new(address, Protocol::Http).unwrap())
    }

    #[test]
    fn test_addresses_are_unique_first_wins() {
        let mut first = entry("10.0.0.1:8080");
        first.record.region = Some("EU".to_string());

        let mut pool = Pool::new();
        assert!(pool.insert_candidate(first));
        assert!(!pool.insert_candidate(entry("10.0.0.1:8080")));
        assert_eq!(pool.merge(vec![entry("10.0.0.1:8080"), entry("10.0.0.2:8080")]), 1);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.entries()[0].record.region.as_deref(), Some("EU"));
    }

    fn pool(addresses: &[&str]) -> Pool {
        let mut pool = Pool::new();
        pool.merge(addresses.iter().map(|a| entry(a)));
        pool
    }

    fn working(address: &str, response_ms: u64) -> Validation {
        Validation {
            address: address.to_string(),
            checked_at: Utc::now(),
            verdict: Verdict::Working {
                response_time: Duration::from_millis(response_ms),
                region: Some("DE".to_string()),
            },
        }
    }

    #[test]
    fn test_apply_accumulates_on_live_entry() {
        let mut pool = pool(&["10.0.0.1:8080", "10.0.0.2:8080"]);

        pool.apply(&working("10.0.0.2:8080", 40)).unwrap();
        let entry = pool.apply(&working("10.0.0.2:8080", 60)).unwrap();
        assert_eq!(entry.status.success_count, 2);
        assert_eq!(entry.status.response_time, Some(Duration::from_millis(60)));
        assert_eq!(entry.record.region.as_deref(), Some("DE"));

        let failed = Validation {
            address: "10.0.0.2:8080".to_string(),
            checked_at: Utc::now(),
            verdict: Verdict::Failed("refused".to_string()),
        };
        let entry = pool.apply(&failed).unwrap();
        assert_eq!(entry.status.success_count, 2);
        assert_eq!(entry.status.fail_count, 1);

        let order: Vec<&str> = pool.entries().iter().map(|e| e.address()).collect();
        assert_eq!(order, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
        assert_eq!(pool.working_count(), 0);
    }

    #[test]
    fn test_apply_ignores_unknown_address() {
        let mut pool = pool(&["10.0.0.1:8080"]);

        assert!(pool.apply(&working("10.0.0.9:8080", 40)).is_none());
        assert_eq!(pool.len(), 1);
        assert!(pool.entries().iter().all(|e| e.address() != "10.0.0.9:8080"));
    }

    #[test]
    fn test_reset_zeroes_counters_only() {
        let mut pool = pool(&["10.0.0.1:8080"]);
        pool.apply(&working("10.0.0.1:8080", 40));

        pool.reset();

        let entry = &pool.entries()[0];
        assert_eq!(entry.status, ProxyStatus::default());
        assert_eq!(entry.record.region.as_deref(), Some("DE"));
        assert_eq!(pool.len(), 1);
    }
}
