//! Quantized record digests and the accumulating seen-set used for
//! exactly-once alerting on at-least-once trade feeds.
//!
//! A fingerprint is a readable string so the persisted set can be inspected
//! by hand: `"{entity}|{market}|{outcome}|{price:.4}|{bucket}"`, where
//! `bucket` is the timestamp rounded down to the bucket width. Volatile
//! fields are quantized, so re-fetching an unchanged trade never yields a
//! new fingerprint.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Record;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest of one record. Missing timestamps land in bucket 0.
    pub fn of(entity_id: &str, record: &Record, bucket_secs: i64) -> Self {
        let ts = record.sort_timestamp();
        let bucket = if bucket_secs > 0 {
            ts.div_euclid(bucket_secs).saturating_mul(bucket_secs)
        } else {
            ts
        };
        Fingerprint(format!(
            "{entity_id}|{}|{}|{:.4}|{bucket}",
            record.market, record.outcome, record.price
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Fingerprint(s)
    }
}

/// Fingerprints already alerted on, each tagged with the cycle it was last
/// observed in.
///
/// With `retention_cycles = None` the set only grows. Otherwise `prune`
/// drops fingerprints not observed for more than `retention_cycles` cycles.
#[derive(Debug, Default)]
pub struct SeenSet {
    last_seen: HashMap<Fingerprint, u64>,
    retention_cycles: Option<u64>,
    dirty: bool,
}

impl SeenSet {
    pub fn new(retention_cycles: Option<u64>) -> Self {
        Self {
            last_seen: HashMap::new(),
            retention_cycles,
            dirty: false,
        }
    }

    /// Rebuild from the persisted flat list. Restored entries count as
    /// observed in cycle 0.
    pub fn restore(fingerprints: Vec<Fingerprint>, retention_cycles: Option<u64>) -> Self {
        Self {
            last_seen: fingerprints.into_iter().map(|fp| (fp, 0)).collect(),
            retention_cycles,
            dirty: false,
        }
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.last_seen.contains_key(fp)
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Whether anything changed since the last `mark_saved`.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    /// Mark fingerprints as observed in `cycle`. Returns how many were new.
    pub fn observe<'a>(&mut self, fps: impl IntoIterator<Item = &'a Fingerprint>, cycle: u64) -> usize {
        let mut inserted = 0;
        for fp in fps {
            match self.last_seen.get_mut(fp) {
                Some(seen) => {
                    if *seen != cycle {
                        *seen = cycle;
                        // Touches only matter for retention.
                        if self.retention_cycles.is_some() {
                            self.dirty = true;
                        }
                    }
                }
                None => {
                    self.last_seen.insert(fp.clone(), cycle);
                    self.dirty = true;
                    inserted += 1;
                }
            }
        }
        inserted
    }

    /// Drop fingerprints last observed more than `retention_cycles` before
    /// `current_cycle`. Returns how many were dropped.
    pub fn prune(&mut self, current_cycle: u64) -> usize {
        let Some(retention) = self.retention_cycles else {
            return 0;
        };
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, seen| current_cycle.saturating_sub(*seen) <= retention);
        let dropped = before - self.last_seen.len();
        if dropped > 0 {
            self.dirty = true;
        }
        dropped
    }

    /// Flat, sorted list for persistence.
    pub fn to_vec(&self) -> Vec<Fingerprint> {
        let mut fps: Vec<Fingerprint> = self.last_seen.keys().cloned().collect();
        fps.sort();
        fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use crate::types::test_support::activity;

    // ── Fingerprint::of ────────────────────────────────────────────

    #[test]
    fn fingerprint_format() {
        let r = activity("Will it rain?", Side::Buy, 0.5, Some(1_700_000_015));
        let fp = Fingerprint::of("whale-1", &r, 30);
        assert_eq!(fp.as_str(), "whale-1|Will it rain?|Yes|0.5000|1700000010");
    }

    #[test]
    fn timestamps_in_same_bucket_collide() {
        let a = activity("M", Side::Buy, 0.42, Some(1_000_020));
        let b = activity("M", Side::Buy, 0.42, Some(1_000_029));
        assert_eq!(Fingerprint::of("w", &a, 30), Fingerprint::of("w", &b, 30));
    }

    #[test]
    fn timestamps_across_buckets_differ() {
        let a = activity("M", Side::Buy, 0.42, Some(1_000_019));
        let b = activity("M", Side::Buy, 0.42, Some(1_000_020));
        assert_ne!(Fingerprint::of("w", &a, 30), Fingerprint::of("w", &b, 30));
    }

    #[test]
    fn price_quantized_to_four_places() {
        let a = activity("M", Side::Buy, 0.420_01, Some(60));
        let b = activity("M", Side::Buy, 0.420_04, Some(60));
        assert_eq!(Fingerprint::of("w", &a, 30), Fingerprint::of("w", &b, 30));
    }

    #[test]
    fn missing_timestamp_is_bucket_zero() {
        let r = activity("M", Side::Buy, 0.1, None);
        assert!(Fingerprint::of("w", &r, 30).as_str().ends_with("|0"));
    }

    #[test]
    fn extreme_timestamps_saturate() {
        let low = activity("M", Side::Buy, 0.1, Some(i64::MIN));
        assert!(Fingerprint::of("w", &low, 30).as_str().ends_with(&format!("|{}", i64::MIN)));

        let high = activity("M", Side::Buy, 0.1, Some(i64::MAX));
        let expected = i64::MAX - i64::MAX.rem_euclid(30);
        assert!(Fingerprint::of("w", &high, 30).as_str().ends_with(&format!("|{expected}")));
    }

    #[test]
    fn entity_is_part_of_identity() {
        let r = activity("M", Side::Buy, 0.1, Some(90));
        assert_ne!(Fingerprint::of("a", &r, 30), Fingerprint::of("b", &r, 30));
    }

    // ── SeenSet ────────────────────────────────────────────────────

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from(s.to_string())
    }

    #[test]
    fn observe_counts_only_new() {
        let mut seen = SeenSet::new(None);
        assert_eq!(seen.observe(&[fp("a"), fp("b")], 1), 2);
        assert_eq!(seen.observe(&[fp("a"), fp("c")], 2), 1);
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&fp("b")));
    }

    #[test]
    fn no_retention_never_prunes() {
        let mut seen = SeenSet::new(None);
        seen.observe(&[fp("a")], 1);
        assert_eq!(seen.prune(1_000_000), 0);
        assert!(seen.contains(&fp("a")));
    }

    #[test]
    fn retention_drops_stale_keeps_touched() {
        let mut seen = SeenSet::new(Some(3));
        seen.observe(&[fp("old"), fp("live")], 1);
        seen.observe(&[fp("live")], 4);
        assert_eq!(seen.prune(5), 1);
        assert!(!seen.contains(&fp("old")));
        assert!(seen.contains(&fp("live")));
    }

    #[test]
    fn dirty_tracks_inserts_and_prunes() {
        let mut seen = SeenSet::restore(vec![fp("a")], Some(2));
        assert!(!seen.is_dirty());
        seen.observe(&[fp("b")], 1);
        assert!(seen.is_dirty());
        seen.mark_saved();
        seen.prune(10);
        assert!(seen.is_dirty());
        assert!(seen.is_empty());
    }

    #[test]
    fn to_vec_is_sorted() {
        let mut seen = SeenSet::new(None);
        seen.observe(&[fp("c"), fp("a"), fp("b")], 0);
        assert_eq!(seen.to_vec(), vec![fp("a"), fp("b"), fp("c")]);
    }
}
