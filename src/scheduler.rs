//! The fetch → detect → notify → persist loop.
//!
//! Entities are processed sequentially within a cycle. A failure for one
//! entity is logged and skipped; nothing in steady state ends the loop
//! except the shutdown signal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alert::format_alert;
use crate::api::SnapshotFetcher;
use crate::config::AppConfig;
use crate::detector::{Decision, DetectorPolicy, FingerprintRule, detect, fingerprint_window};
use crate::error::FetchError;
use crate::fingerprint::SeenSet;
use crate::notifier::Notifier;
use crate::store::StateStore;
use crate::types::{Snapshot, TrackedEntity};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub entity_delay: Duration,
    /// Upper bound on one entity's fetch.
    pub entity_timeout: Duration,
    pub fingerprint_retention: Option<u64>,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.settings.poll_interval(),
            entity_delay: config.settings.entity_delay(),
            entity_timeout: config.settings.fetch_timeout(),
            fingerprint_retention: config.detector.retention(),
        }
    }
}

/// One entity, how to judge it, and where to fetch it from.
pub struct Watch {
    pub entity: TrackedEntity,
    pub policy: DetectorPolicy,
    pub fetcher: Arc<dyn SnapshotFetcher>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityOutcome {
    Baseline,
    Unchanged,
    Alerted { new_records: usize, delivered: bool },
    FetchFailed(String),
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcomes: Vec<(String, EntityOutcome)>,
    pub persist_failures: usize,
}

impl CycleReport {
    pub fn outcome(&self, entity_id: &str) -> Option<&EntityOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == entity_id)
            .map(|(_, o)| o)
    }

    pub fn alerts(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, EntityOutcome::Alerted { .. }))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, EntityOutcome::FetchFailed(_)))
            .count()
    }
}

/// Graceful-shutdown signal, observed at sleeps and between entities.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration`. Returns `false` if shutdown fired first.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Sender gone: no signal can arrive any more.
                        (&mut sleep).await;
                        return true;
                    }
                    if *self.rx.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

pub struct Scheduler {
    watches: Vec<Watch>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    settings: SchedulerSettings,
    /// Last known snapshot per entity. Authoritative over the store.
    last: HashMap<String, Snapshot>,
    /// Entities whose stored snapshot has already been read.
    loaded: HashSet<String>,
    /// Fingerprint watches whose current window has been observed once.
    seeded: HashSet<String>,
    seen: SeenSet,
    cycle: u64,
}

impl Scheduler {
    pub fn new(
        watches: Vec<Watch>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        settings: SchedulerSettings,
    ) -> Self {
        let seen = match store.load_fingerprints() {
            Ok(fps) => {
                if !fps.is_empty() {
                    info!("Restored {} seen fingerprint(s)", fps.len());
                }
                SeenSet::restore(fps, settings.fingerprint_retention)
            }
            Err(e) => {
                warn!("Failed to load seen fingerprints, starting empty: {e}");
                SeenSet::new(settings.fingerprint_retention)
            }
        };
        Self {
            watches,
            store,
            notifier,
            settings,
            last: HashMap::new(),
            loaded: HashSet::new(),
            seeded: HashSet::new(),
            seen,
            cycle: 0,
        }
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn last_snapshot(&self, entity_id: &str) -> Option<&Snapshot> {
        self.last.get(entity_id)
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Prime, then run cycles every `poll_interval` until shutdown.
    pub async fn run(&mut self, mut shutdown: Shutdown) {
        info!("Priming {} watch(es)...", self.watches.len());
        let primed = self.prime(&mut shutdown).await;
        info!(
            "Primed {} watch(es), {} failed",
            primed.outcomes.len() - primed.failures(),
            primed.failures()
        );

        info!(
            "Entering polling loop (interval: {}s). Press Ctrl+C to stop.",
            self.settings.poll_interval.as_secs()
        );
        while shutdown.sleep(self.settings.poll_interval).await {
            self.run_cycle(&mut shutdown).await;
        }
        info!("Shutdown signal received");
    }

    /// Fetch every entity once and record baselines without alerting.
    pub async fn prime(&mut self, shutdown: &mut Shutdown) -> CycleReport {
        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };
        for idx in 0..self.watches.len() {
            if idx > 0 && !shutdown.sleep(self.settings.entity_delay).await {
                break;
            }
            if shutdown.is_triggered() {
                break;
            }
            let (entity, policy, fetcher) = self.watch_parts(idx);
            let outcome = match self.fetch(fetcher.as_ref(), &entity).await {
                Ok(snapshot) => {
                    match &policy {
                        DetectorPolicy::FingerprintDedup(rule) => {
                            self.seed(rule, &entity, &snapshot);
                        }
                        // Same rule as detection: an empty feed is no baseline.
                        DetectorPolicy::LatestMarker if snapshot.is_empty() => {}
                        _ => {
                            if !self.persist(&entity.id, snapshot) {
                                report.persist_failures += 1;
                            }
                        }
                    }
                    debug!("[{}] Baseline established", entity.id);
                    EntityOutcome::Baseline
                }
                Err(e) => {
                    warn!("Priming fetch failed: {e}");
                    EntityOutcome::FetchFailed(e.to_string())
                }
            };
            report.outcomes.push((entity.id, outcome));
        }
        self.flush_fingerprints(&mut report);
        report
    }

    /// One pass over all entities.
    pub async fn run_cycle(&mut self, shutdown: &mut Shutdown) -> CycleReport {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };
        debug!(
            "Cycle {} (seen: {} fingerprints)",
            self.cycle,
            self.seen.len()
        );

        for idx in 0..self.watches.len() {
            if idx > 0 && !shutdown.sleep(self.settings.entity_delay).await {
                break;
            }
            if shutdown.is_triggered() {
                break;
            }
            let (id, outcome) = self.process(idx, &mut report).await;
            report.outcomes.push((id, outcome));
        }

        self.flush_fingerprints(&mut report);
        info!(
            "Cycle {} done: {} watched, {} alert(s), {} fetch failure(s)",
            report.cycle,
            report.outcomes.len(),
            report.alerts(),
            report.failures()
        );
        report
    }

    fn watch_parts(&self, idx: usize) -> (TrackedEntity, DetectorPolicy, Arc<dyn SnapshotFetcher>) {
        let watch = &self.watches[idx];
        (
            watch.entity.clone(),
            watch.policy.clone(),
            Arc::clone(&watch.fetcher),
        )
    }

    async fn process(&mut self, idx: usize, report: &mut CycleReport) -> (String, EntityOutcome) {
        let (entity, policy, fetcher) = self.watch_parts(idx);

        let snapshot = match self.fetch(fetcher.as_ref(), &entity).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Fetch failed, skipping: {e}");
                return (entity.id, EntityOutcome::FetchFailed(e.to_string()));
            }
        };

        // A watch that missed priming baselines on its first good fetch.
        if let DetectorPolicy::FingerprintDedup(rule) = &policy {
            if !self.seeded.contains(&entity.id) {
                self.seed(rule, &entity, &snapshot);
                info!("[{}] Baseline established (late seed)", entity.id);
                return (entity.id, EntityOutcome::Baseline);
            }
        }

        self.ensure_loaded(&entity.id);
        let detection = detect(
            &policy,
            &entity,
            self.last.get(&entity.id),
            snapshot,
            &self.seen,
        );

        let outcome = match detection.decision {
            Decision::NoChange => {
                debug!("[{}] No change", entity.id);
                EntityOutcome::Unchanged
            }
            Decision::Baseline => {
                info!("[{}] Baseline established", entity.id);
                EntityOutcome::Baseline
            }
            Decision::Changed(event) => {
                info!(
                    "[{}] Change detected ({}): {} new record(s)",
                    entity.id,
                    entity.short_key(),
                    event.new_records.len()
                );
                let alert = format_alert(&event);
                let delivered = match self.notifier.send(&alert).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("[{}] Alert delivery failed: {e}", entity.id);
                        false
                    }
                };
                EntityOutcome::Alerted {
                    new_records: event.new_records.len(),
                    delivered,
                }
            }
        };

        if !detection.window.is_empty() {
            self.seen.observe(&detection.window, self.cycle);
        }
        if let Some(snapshot) = detection.persist {
            if !self.persist(&entity.id, snapshot) {
                report.persist_failures += 1;
            }
        }
        (entity.id, outcome)
    }

    async fn fetch(
        &self,
        fetcher: &dyn SnapshotFetcher,
        entity: &TrackedEntity,
    ) -> Result<Snapshot, FetchError> {
        let timeout = self.settings.entity_timeout;
        match tokio::time::timeout(timeout, fetcher.fetch(entity)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                entity: entity.id.clone(),
                after: timeout,
            }),
        }
    }

    /// Observe the current window without alerting.
    fn seed(&mut self, rule: &FingerprintRule, entity: &TrackedEntity, snapshot: &Snapshot) {
        let window = fingerprint_window(rule, entity, snapshot);
        self.seen.observe(&window, self.cycle);
        self.seeded.insert(entity.id.clone());
    }

    /// Pull the stored snapshot into memory the first time an entity is seen.
    fn ensure_loaded(&mut self, entity_id: &str) {
        if self.last.contains_key(entity_id) || !self.loaded.insert(entity_id.to_string()) {
            return;
        }
        match self.store.load(entity_id) {
            Ok(Some(snapshot)) => {
                debug!("[{entity_id}] Loaded stored snapshot ({} records)", snapshot.len());
                self.last.insert(entity_id.to_string(), snapshot);
            }
            Ok(None) => {}
            Err(e) => warn!("[{entity_id}] Ignoring unreadable stored snapshot: {e}"),
        }
    }

    /// Save and adopt `snapshot`. The in-memory copy is updated even if the
    /// write fails. Returns whether the write succeeded.
    fn persist(&mut self, entity_id: &str, snapshot: Snapshot) -> bool {
        self.loaded.insert(entity_id.to_string());
        let ok = match self.store.save(entity_id, &snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!("[{entity_id}] Failed to persist snapshot: {e}");
                false
            }
        };
        self.last.insert(entity_id.to_string(), snapshot);
        ok
    }

    /// Prune, then write the seen set if it changed. Once per cycle.
    fn flush_fingerprints(&mut self, report: &mut CycleReport) {
        let dropped = self.seen.prune(self.cycle);
        if dropped > 0 {
            debug!("Pruned {dropped} stale fingerprint(s)");
        }
        if !self.seen.is_dirty() {
            return;
        }
        match self.store.save_fingerprints(&self.seen.to_vec()) {
            Ok(()) => self.seen.mark_saved(),
            Err(e) => {
                warn!("Failed to persist seen fingerprints: {e}");
                report.persist_failures += 1;
            }
        }
    }
}
