//! Chain Tracker
//!
//! Watermark table recording, for every chain, the newest commit seen. A
//! replica's own table is sent to a peer as its greeting; the copy received
//! from a peer is that peer's have-map, used to decide which commits it still
//! needs.

use std::collections::BTreeMap;

use crate::cw_interface::{ChainKey, CommitInfo, Muid, Timestamp};
use crate::cw_wire::{Greeting, GreetingEntry};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainTracker {
    seen: BTreeMap<ChainKey, CommitInfo>,
}

impl ChainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `info` if it is newer than what has been seen on its chain.
    ///
    /// Returns false and leaves the table alone for anything at or below the
    /// current watermark.
    pub fn mark_if_novel(&mut self, info: &CommitInfo) -> bool {
        let chain = info.chain();
        if let Some(current) = self.seen.get(&chain) {
            if info.timestamp <= current.timestamp {
                return false;
            }
        }
        self.seen.insert(chain, info.clone());
        true
    }

    /// Greeting listing every chain and how far it has been seen, sorted by chain.
    pub fn construct_greeting(&self) -> Greeting {
        Greeting {
            entries: self
                .seen
                .iter()
                .map(|(chain, info)| GreetingEntry {
                    medallion: chain.medallion,
                    chain_start: chain.chain_start,
                    seen_through: info.timestamp,
                })
                .collect(),
        }
    }

    /// Rebuild a peer's have-map from its greeting.
    ///
    /// A greeting carries only watermarks, so the prior time and comment of
    /// each entry are unknown.
    pub fn from_greeting(greeting: &Greeting) -> Self {
        let mut tracker = Self::new();
        for entry in &greeting.entries {
            tracker.mark_if_novel(&CommitInfo {
                timestamp: entry.seen_through,
                medallion: entry.medallion,
                chain_start: entry.chain_start,
                prior_time: None,
                comment: None,
            });
        }
        tracker
    }

    pub fn get_commit_info(&self, chain: &ChainKey) -> Option<&CommitInfo> {
        self.seen.get(chain)
    }

    pub fn get_chains(&self) -> Vec<ChainKey> {
        self.seen.keys().copied().collect()
    }

    /// Watermark for `chain`, zero when nothing is known.
    pub fn get_seen_to(&self, chain: &ChainKey) -> Timestamp {
        self.seen.get(chain).map(|info| info.timestamp).unwrap_or(0)
    }

    /// True when the commit described by `info` is at or below its chain's watermark.
    pub fn has(&self, info: &CommitInfo) -> bool {
        info.timestamp <= self.get_seen_to(&info.chain())
    }

    /// True when some chain of the address's medallion covers the address.
    pub fn has_address(&self, address: &Muid) -> bool {
        let start = ChainKey::new(address.medallion, 0);
        let end = ChainKey::new(address.medallion, address.timestamp);
        self.seen
            .range(start..=end)
            .any(|(_, info)| info.timestamp >= address.timestamp)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(medallion: u64, chain_start: u64, timestamp: u64) -> CommitInfo {
        CommitInfo {
            timestamp,
            medallion,
            chain_start,
            prior_time: None,
            comment: None,
        }
    }

    #[test]
    fn test_mark_if_novel_is_monotonic() {
        let mut tracker = ChainTracker::new();
        assert!(tracker.mark_if_novel(&info(7, 100, 100)));
        assert!(!tracker.mark_if_novel(&info(7, 100, 100)));
        assert!(tracker.mark_if_novel(&info(7, 100, 150)));
        assert!(!tracker.mark_if_novel(&info(7, 100, 120)));
        assert_eq!(tracker.get_seen_to(&ChainKey::new(7, 100)), 150);

        // another chain of the same medallion is tracked separately
        assert!(tracker.mark_if_novel(&info(7, 200, 200)));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_greeting_is_sorted_and_restorable() {
        let mut tracker = ChainTracker::new();
        tracker.mark_if_novel(&info(9, 5, 40));
        tracker.mark_if_novel(&info(3, 8, 30));
        tracker.mark_if_novel(&info(3, 2, 10));

        let greeting = tracker.construct_greeting();
        let chains: Vec<(u64, u64)> = greeting
            .entries
            .iter()
            .map(|e| (e.medallion, e.chain_start))
            .collect();
        assert_eq!(chains, vec![(3, 2), (3, 8), (9, 5)]);

        let restored = ChainTracker::from_greeting(&greeting);
        assert_eq!(restored.get_chains(), tracker.get_chains());
        assert_eq!(restored.get_seen_to(&ChainKey::new(9, 5)), 40);
    }

    #[test]
    fn test_has_and_has_address() {
        let mut tracker = ChainTracker::new();
        tracker.mark_if_novel(&info(7, 100, 150));

        assert!(tracker.has(&info(7, 100, 120)));
        assert!(!tracker.has(&info(7, 100, 151)));
        assert!(!tracker.has(&info(8, 100, 1)));

        assert!(tracker.has_address(&Muid::new(130, 7, 2)));
        assert!(!tracker.has_address(&Muid::new(160, 7, 2)));
        assert!(!tracker.has_address(&Muid::new(90, 7, 2)));
        assert!(!tracker.has_address(&Muid::new(130, 8, 2)));
    }
}
