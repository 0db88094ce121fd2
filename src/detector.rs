//! Change detection: decide whether a freshly fetched snapshot is a genuine
//! change relative to the last known one.
//!
//! Detection is pure. It never touches the store; it returns the decision
//! plus what the caller must persist (`Detection::persist`) and which
//! fingerprints it must mark as observed (`Detection::window`).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::fingerprint::{Fingerprint, SeenSet};
use crate::types::{
    ChangeEvent, ChangeReason, Record, Side, Snapshot, TrackedEntity, VolumeShift,
    sort_newest_first,
};

/// Amounts are compared at this many units per share (1e-4 precision).
const AMOUNT_SCALE: f64 = 10_000.0;

/// Equivalence rule for one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorPolicy {
    /// Current holdings: equal iff the multisets of
    /// `(market, outcome, amount)` keys match.
    SnapshotEquality,
    /// Rolling activity window: compare the newest timestamp, then count.
    LatestMarker,
    /// At-least-once trade stream: alert on fingerprints not yet seen.
    FingerprintDedup(FingerprintRule),
    /// Orderbook depth: alert when total bid or ask volume moves by at
    /// least `threshold_pct` percent.
    VolumeShift { threshold_pct: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRule {
    /// Timestamp bucket width in seconds.
    pub bucket_secs: i64,
    /// Only the newest N matching records are considered per cycle.
    pub max_records: usize,
    /// `None` accepts both sides.
    pub side: Option<Side>,
}

impl Default for FingerprintRule {
    fn default() -> Self {
        Self {
            bucket_secs: 30,
            max_records: 2,
            side: Some(Side::Buy),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoChange,
    /// First observation. Establishes state, never alerts.
    Baseline,
    Changed(ChangeEvent),
}

impl Decision {
    pub fn is_change(&self) -> bool {
        matches!(self, Decision::Changed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub decision: Decision,
    /// Snapshot the caller must persist as the entity's new last-known state.
    pub persist: Option<Snapshot>,
    /// Fingerprints the caller must observe in the seen set.
    pub window: Vec<Fingerprint>,
}

impl Detection {
    fn unchanged() -> Self {
        Self {
            decision: Decision::NoChange,
            persist: None,
            window: Vec::new(),
        }
    }

    fn baseline(current: Snapshot) -> Self {
        Self {
            decision: Decision::Baseline,
            persist: Some(current),
            window: Vec::new(),
        }
    }
}

/// Compare `current` against `previous` under `policy`.
pub fn detect(
    policy: &DetectorPolicy,
    entity: &TrackedEntity,
    previous: Option<&Snapshot>,
    current: Snapshot,
    seen: &SeenSet,
) -> Detection {
    match policy {
        DetectorPolicy::SnapshotEquality => detect_holdings(entity, previous, current),
        DetectorPolicy::LatestMarker => detect_latest_marker(entity, previous, current),
        DetectorPolicy::FingerprintDedup(rule) => detect_fingerprints(rule, entity, current, seen),
        DetectorPolicy::VolumeShift { threshold_pct } => {
            detect_volume_shift(*threshold_pct, entity, previous, current)
        }
    }
}

// ── Snapshot equality ──────────────────────────────────────────────

type HoldingKey<'a> = (&'a str, &'a str, i64);

fn holding_key(r: &Record) -> HoldingKey<'_> {
    (
        r.market.as_str(),
        r.outcome.as_str(),
        (r.amount * AMOUNT_SCALE).round() as i64,
    )
}

fn key_counts(records: &[Record]) -> HashMap<HoldingKey<'_>, usize> {
    let mut counts = HashMap::new();
    for r in records {
        *counts.entry(holding_key(r)).or_insert(0) += 1;
    }
    counts
}

/// Order-independent equivalence of two holdings snapshots.
pub fn holdings_equivalent(a: &Snapshot, b: &Snapshot) -> bool {
    a.len() == b.len() && key_counts(&a.records) == key_counts(&b.records)
}

/// Records of `current` not matched one-for-one by a key in `previous`.
fn added_holdings(previous: &[Record], current: &[Record]) -> Vec<Record> {
    let mut remaining = key_counts(previous);
    let mut added = Vec::new();
    for r in current {
        match remaining.get_mut(&holding_key(r)) {
            Some(n) if *n > 0 => *n -= 1,
            _ => added.push(r.clone()),
        }
    }
    added
}

fn detect_holdings(
    entity: &TrackedEntity,
    previous: Option<&Snapshot>,
    current: Snapshot,
) -> Detection {
    let Some(previous) = previous else {
        return Detection::baseline(current);
    };
    if holdings_equivalent(previous, &current) {
        return Detection::unchanged();
    }

    let new_records = added_holdings(&previous.records, &current.records);
    changed(
        entity,
        Some(previous),
        current,
        new_records,
        ChangeReason::PositionsChanged,
    )
}

// ── Latest marker ──────────────────────────────────────────────────

fn detect_latest_marker(
    entity: &TrackedEntity,
    previous: Option<&Snapshot>,
    current: Snapshot,
) -> Detection {
    // An empty rolling window is a feed glitch, not a change.
    if current.is_empty() {
        return Detection::unchanged();
    }
    let Some(previous) = previous else {
        return Detection::baseline(current);
    };

    let old_marker = previous.latest_marker();
    let new_marker = current.latest_marker();
    if new_marker == old_marker && current.len() == previous.len() {
        return Detection::unchanged();
    }

    let mut new_records: Vec<Record> = match old_marker {
        Some(old) => current
            .records
            .iter()
            .filter(|r| r.timestamp.is_some_and(|ts| ts > old))
            .cloned()
            .collect(),
        None => current.records.clone(),
    };
    if new_records.is_empty() {
        new_records = current
            .records
            .iter()
            .filter(|r| r.timestamp == new_marker)
            .cloned()
            .collect();
    }
    sort_newest_first(&mut new_records);

    changed(
        entity,
        Some(previous),
        current,
        new_records,
        ChangeReason::NewActivity,
    )
}

// ── Fingerprint dedup ──────────────────────────────────────────────

/// The newest `max_records` records passing the side filter, newest first.
pub fn fingerprint_candidates(rule: &FingerprintRule, records: &[Record]) -> Vec<Record> {
    let mut candidates: Vec<Record> = records
        .iter()
        .filter(|r| rule.side.is_none() || r.side == rule.side)
        .cloned()
        .collect();
    sort_newest_first(&mut candidates);
    candidates.truncate(rule.max_records);
    candidates
}

/// Fingerprints of the detection window, without any novelty check.
/// Used by the priming pass to seed the seen set.
pub fn fingerprint_window(
    rule: &FingerprintRule,
    entity: &TrackedEntity,
    snapshot: &Snapshot,
) -> Vec<Fingerprint> {
    fingerprint_candidates(rule, &snapshot.records)
        .iter()
        .map(|r| Fingerprint::of(&entity.id, r, rule.bucket_secs))
        .collect()
}

fn detect_fingerprints(
    rule: &FingerprintRule,
    entity: &TrackedEntity,
    current: Snapshot,
    seen: &SeenSet,
) -> Detection {
    let candidates = fingerprint_candidates(rule, &current.records);

    let mut window = Vec::with_capacity(candidates.len());
    let mut fresh: HashSet<Fingerprint> = HashSet::new();
    let mut new_records = Vec::new();
    for record in candidates {
        let fp = Fingerprint::of(&entity.id, &record, rule.bucket_secs);
        if !seen.contains(&fp) && fresh.insert(fp.clone()) {
            new_records.push(record);
        }
        window.push(fp);
    }

    if new_records.is_empty() {
        return Detection {
            decision: Decision::NoChange,
            persist: None,
            window,
        };
    }

    let event = ChangeEvent {
        entity: entity.clone(),
        previous: None,
        current,
        new_records,
        reason: ChangeReason::NewTrades,
    };
    Detection {
        decision: Decision::Changed(event),
        persist: None,
        window,
    }
}

// ── Volume shift ───────────────────────────────────────────────────

fn side_volume(snapshot: &Snapshot, side: Side) -> f64 {
    snapshot
        .records
        .iter()
        .filter(|r| r.side == Some(side))
        .map(|r| r.amount)
        .sum()
}

/// Absolute percentage change, 0 when there is no prior volume.
fn change_pct(before: f64, after: f64) -> f64 {
    if before > 0.0 {
        (after - before).abs() / before * 100.0
    } else {
        0.0
    }
}

fn detect_volume_shift(
    threshold_pct: f64,
    entity: &TrackedEntity,
    previous: Option<&Snapshot>,
    current: Snapshot,
) -> Detection {
    let Some(previous) = previous else {
        return Detection::baseline(current);
    };

    let shifts: Vec<VolumeShift> = [Side::Buy, Side::Sell]
        .into_iter()
        .filter_map(|side| {
            let before = side_volume(previous, side);
            let after = side_volume(&current, side);
            let pct = change_pct(before, after);
            (pct >= threshold_pct && pct > 0.0).then_some(VolumeShift {
                side,
                before,
                after,
                change_pct: pct,
            })
        })
        .collect();

    if shifts.is_empty() {
        // Always roll the reference forward, like a moving comparison.
        return Detection {
            decision: Decision::NoChange,
            persist: Some(current),
            window: Vec::new(),
        };
    }

    let mut new_records: Vec<Record> = current
        .records
        .iter()
        .filter(|r| shifts.iter().any(|s| r.side == Some(s.side)))
        .cloned()
        .collect();
    new_records.sort_by(|a, b| b.amount.total_cmp(&a.amount));

    changed(
        entity,
        Some(previous),
        current,
        new_records,
        ChangeReason::VolumeShift(shifts),
    )
}

fn changed(
    entity: &TrackedEntity,
    previous: Option<&Snapshot>,
    current: Snapshot,
    new_records: Vec<Record>,
    reason: ChangeReason,
) -> Detection {
    let event = ChangeEvent {
        entity: entity.clone(),
        previous: previous.cloned(),
        current: current.clone(),
        new_records,
        reason,
    };
    Detection {
        decision: Decision::Changed(event),
        persist: Some(current),
        window: Vec::new(),
    }
}
