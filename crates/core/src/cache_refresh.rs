//! Background refresh of the locally cached dataset view.
//!
//! Targets move between two queues: `active` targets are refreshed one per
//! active interval; refreshed targets wait in `pending` until `active` drains,
//! then all of them rotate back after the pending interval.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CacheRefreshSettings;
use crate::model::{DatasetDefinition, DatasetEntry};
use crate::remote::ClientProvider;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefreshTarget {
    AllDatasetDefinitions,
    AllDatasetEntries { definition: Uuid },
    LatestDatasetEntry { definition: Uuid },
    IndividualDatasetDefinition { definition: Uuid },
    IndividualDatasetEntry { entry: Uuid },
}

impl fmt::Display for RefreshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllDatasetDefinitions => f.write_str("all_dataset_definitions"),
            Self::AllDatasetEntries { definition } => {
                write!(f, "all_dataset_entries:{definition}")
            }
            Self::LatestDatasetEntry { definition } => {
                write!(f, "latest_dataset_entry:{definition}")
            }
            Self::IndividualDatasetDefinition { definition } => {
                write!(f, "dataset_definition:{definition}")
            }
            Self::IndividualDatasetEntry { entry } => write!(f, "dataset_entry:{entry}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRefreshConfig {
    pub initial_delay: Duration,
    pub active_interval: Duration,
    pub pending_interval: Duration,
}

impl CacheRefreshConfig {
    pub fn new(
        initial_delay: Duration,
        active_interval: Duration,
        pending_interval: Duration,
    ) -> Result<Self> {
        if !(initial_delay < active_interval && active_interval < pending_interval) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "cache refresh requires initial delay ({initial_delay:?}) < active interval \
                     ({active_interval:?}) < pending interval ({pending_interval:?})"
                ),
            });
        }
        Ok(Self {
            initial_delay,
            active_interval,
            pending_interval,
        })
    }

    pub fn from_settings(settings: &CacheRefreshSettings) -> Result<Self> {
        Self::new(
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.active_interval_ms),
            Duration::from_millis(settings.pending_interval_ms),
        )
    }
}

/// Shifts `duration` by 2-3% in either direction.
pub(crate) fn fuzzy(duration: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let amount: f64 = rng.gen_range(0.02..=0.03);
    let factor = if rng.gen_bool(0.5) {
        1.0 + amount
    } else {
        1.0 - amount
    };
    duration.mul_f64(factor)
}

#[derive(Debug, Default)]
struct CachedDatasets {
    definitions: BTreeMap<Uuid, DatasetDefinition>,
    entries: HashMap<Uuid, Vec<DatasetEntry>>,
    latest: HashMap<Uuid, Option<DatasetEntry>>,
    individual_entries: HashMap<Uuid, DatasetEntry>,
}

/// Last known dataset definitions and entries.
#[derive(Debug, Default)]
pub struct DatasetsCache {
    inner: Mutex<CachedDatasets>,
}

impl DatasetsCache {
    fn lock(&self) -> MutexGuard<'_, CachedDatasets> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn definitions(&self) -> Vec<DatasetDefinition> {
        self.lock().definitions.values().cloned().collect()
    }

    pub fn definition(&self, definition: Uuid) -> Option<DatasetDefinition> {
        self.lock().definitions.get(&definition).cloned()
    }

    pub fn entries(&self, definition: Uuid) -> Option<Vec<DatasetEntry>> {
        self.lock().entries.get(&definition).cloned()
    }

    /// `Some(None)` means the definition is known to have no entries yet.
    pub fn latest_entry(&self, definition: Uuid) -> Option<Option<DatasetEntry>> {
        self.lock().latest.get(&definition).cloned()
    }

    pub fn entry(&self, entry: Uuid) -> Option<DatasetEntry> {
        self.lock().individual_entries.get(&entry).cloned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub successes: u64,
    pub failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// `retry` holds targets that failed during the running cycle; they lead
/// `active` once the cycle ends. A target sits in at most one queue.
#[derive(Debug, Default)]
struct Queues {
    active: VecDeque<RefreshTarget>,
    retry: VecDeque<RefreshTarget>,
    pending: VecDeque<RefreshTarget>,
}

impl Queues {
    fn tracks(&self, target: &RefreshTarget) -> bool {
        self.active.contains(target)
            || self.retry.contains(target)
            || self.pending.contains(target)
    }

    fn len(&self) -> usize {
        self.active.len() + self.retry.len() + self.pending.len()
    }

    fn remove(&mut self, target: &RefreshTarget) -> bool {
        let before = self.len();
        self.active.retain(|t| t != target);
        self.retry.retain(|t| t != target);
        self.pending.retain(|t| t != target);
        before != self.len()
    }

    fn push_active(&mut self, target: RefreshTarget) {
        if !self.tracks(&target) {
            self.active.push_back(target);
        }
    }

    fn push_retry(&mut self, target: RefreshTarget) {
        self.remove(&target);
        self.retry.push_back(target);
    }

    fn push_pending(&mut self, target: RefreshTarget) {
        self.remove(&target);
        self.pending.push_back(target);
    }

    /// Failed targets first, then everything that refreshed.
    fn rotate(&mut self) {
        let retry: Vec<RefreshTarget> = self.retry.drain(..).collect();
        let pending: Vec<RefreshTarget> = self.pending.drain(..).collect();
        for target in retry.into_iter().chain(pending) {
            self.push_active(target);
        }
    }

    /// Puts failed targets back in front of whatever the cycle left unrefreshed.
    fn requeue_retries(&mut self) {
        while let Some(target) = self.retry.pop_back() {
            self.active.retain(|t| *t != target);
            self.active.push_front(target);
        }
    }
}

struct HandlerState {
    config: CacheRefreshConfig,
    clients: Arc<dyn ClientProvider>,
    cache: Arc<DatasetsCache>,
    defaults: Vec<RefreshTarget>,
    queues: Mutex<Queues>,
    stats: Mutex<HashMap<RefreshTarget, RefreshStats>>,
}

impl HandlerState {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, HashMap<RefreshTarget, RefreshStats>> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reset(&self) {
        let mut queues = self.queues();
        *queues = Queues::default();
        for target in &self.defaults {
            queues.push_active(*target);
        }
    }

    async fn refresh(&self, target: RefreshTarget) -> Result<()> {
        let result = self.fetch(target).await;
        let mut stats = self.stats();
        let entry = stats.entry(target).or_default();
        match &result {
            Ok(()) => {
                entry.successes += 1;
                entry.last_success = Some(Utc::now());
                debug!(event = "cache.refreshed", target = %target, "cache.refreshed");
            }
            Err(e) => {
                entry.failures += 1;
                entry.last_failure = Some(Utc::now());
                entry.last_error = Some(e.to_string());
                warn!(
                    event = "cache.refresh_failed",
                    target = %target,
                    error = %e,
                    "cache.refresh_failed"
                );
            }
        }
        result
    }

    async fn fetch(&self, target: RefreshTarget) -> Result<()> {
        let api = self.clients.api()?;
        match target {
            RefreshTarget::AllDatasetDefinitions => {
                let definitions = api.dataset_definitions().await?;
                {
                    let mut queues = self.queues();
                    for definition in &definitions {
                        for follow_up in [
                            RefreshTarget::LatestDatasetEntry {
                                definition: definition.id,
                            },
                            RefreshTarget::AllDatasetEntries {
                                definition: definition.id,
                            },
                        ] {
                            queues.push_active(follow_up);
                        }
                    }
                }
                self.cache.lock().definitions =
                    definitions.into_iter().map(|d| (d.id, d)).collect();
            }
            RefreshTarget::AllDatasetEntries { definition } => {
                let entries = api.dataset_entries(definition).await?;
                self.cache.lock().entries.insert(definition, entries);
            }
            RefreshTarget::LatestDatasetEntry { definition } => {
                let latest = api.latest_entry(definition, None).await?;
                self.cache.lock().latest.insert(definition, latest);
            }
            RefreshTarget::IndividualDatasetDefinition { definition } => {
                let fetched = api.dataset_definition(definition).await?;
                self.cache.lock().definitions.insert(definition, fetched);
            }
            RefreshTarget::IndividualDatasetEntry { entry } => {
                let fetched = api.dataset_entry(entry).await?;
                self.cache.lock().individual_entries.insert(entry, fetched);
            }
        }
        Ok(())
    }

    /// Drains `active` once. Failed targets are retried first next cycle.
    async fn run_cycle(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let next = self.queues().active.pop_front();
            let Some(target) = next else {
                break;
            };
            match self.refresh(target).await {
                Ok(()) => self.queues().push_pending(target),
                Err(_) => self.queues().push_retry(target),
            }
            if !sleep_or_cancel(fuzzy(self.config.active_interval), &cancel).await {
                self.queues().requeue_retries();
                return;
            }
        }

        self.queues().rotate();

        let rest = self
            .config
            .pending_interval
            .saturating_sub(self.config.active_interval);
        sleep_or_cancel(fuzzy(rest), &cancel).await;
    }
}

/// `false` when cancelled before the delay elapsed.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

pub struct CacheRefreshHandler {
    state: Arc<HandlerState>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CacheRefreshHandler {
    pub fn new(
        config: CacheRefreshConfig,
        clients: Arc<dyn ClientProvider>,
        cache: Arc<DatasetsCache>,
    ) -> Self {
        let defaults = vec![RefreshTarget::AllDatasetDefinitions];
        let state = Arc::new(HandlerState {
            config,
            clients,
            cache,
            queues: Mutex::new(Queues {
                active: defaults.iter().copied().collect(),
                ..Queues::default()
            }),
            defaults,
            stats: Mutex::new(HashMap::new()),
        });
        Self {
            state,
            task: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> Arc<DatasetsCache> {
        Arc::clone(&self.state.cache)
    }

    fn task(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts the refresh loop; calling it again while running does nothing.
    pub fn start(&self) {
        let mut task = self.task();
        if task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let state = Arc::clone(&self.state);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            info!(event = "cache.refresh_started", "cache.refresh_started");
            if !sleep_or_cancel(state.config.initial_delay, &loop_cancel).await {
                return;
            }
            while !loop_cancel.is_cancelled() {
                let cycle = tokio::spawn(Arc::clone(&state).run_cycle(loop_cancel.clone()));
                if let Err(e) = cycle.await {
                    warn!(
                        event = "cache.refresh_cycle_failed",
                        error = %e,
                        "cache.refresh_cycle_failed"
                    );
                    state.reset();
                }
            }
            info!(event = "cache.refresh_stopped", "cache.refresh_stopped");
        });
        *task = Some((cancel, handle));
    }

    pub async fn stop(&self) {
        let running = self.task().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    /// Refreshes `target` immediately. A target already tracked by the
    /// background loop moves to `pending`.
    pub async fn refresh_now(&self, target: RefreshTarget) -> Result<()> {
        let tracked = self.state.queues().remove(&target);
        let result = self.state.refresh(target).await;
        if tracked {
            self.state.queues().push_pending(target);
        }
        result
    }

    /// Adds a target to the background loop unless it is already tracked.
    pub fn track(&self, target: RefreshTarget) {
        self.state.queues().push_active(target);
    }

    pub fn stats(&self) -> HashMap<RefreshTarget, RefreshStats> {
        self.state.stats().clone()
    }

    /// `(active, pending)`; targets awaiting a retry count as active.
    pub fn queued(&self) -> (Vec<RefreshTarget>, Vec<RefreshTarget>) {
        let queues = self.state.queues();
        (
            queues.retry.iter().chain(&queues.active).copied().collect(),
            queues.pending.iter().copied().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_ordered_intervals() {
        let ms = Duration::from_millis;
        assert!(CacheRefreshConfig::new(ms(1), ms(2), ms(3)).is_ok());
        assert!(CacheRefreshConfig::new(ms(2), ms(2), ms(3)).is_err());
        assert!(CacheRefreshConfig::new(ms(1), ms(3), ms(3)).is_err());
        assert!(CacheRefreshConfig::new(ms(5), ms(2), ms(9)).is_err());
    }

    #[test]
    fn fuzzy_stays_within_three_percent() {
        let base = Duration::from_secs(100);
        for _ in 0..200 {
            let d = fuzzy(base);
            assert!(d >= Duration::from_secs(97) && d <= Duration::from_secs(103));
            assert!(d <= Duration::from_secs(98) || d >= Duration::from_secs(102));
        }
    }

    #[test]
    fn failed_targets_are_tracked_once_and_lead_the_next_cycle() {
        let definition = Uuid::new_v4();
        let latest = RefreshTarget::LatestDatasetEntry { definition };
        let entries = RefreshTarget::AllDatasetEntries { definition };
        let mut queues = Queues::default();
        queues.push_active(RefreshTarget::AllDatasetDefinitions);
        queues.push_active(latest);

        let first = queues.active.pop_front().unwrap();
        queues.push_pending(first);
        let failing = queues.active.pop_front().unwrap();
        queues.push_retry(failing);
        // A definitions refresh in the same cycle sees the failed target.
        queues.push_active(latest);
        queues.push_active(entries);
        assert_eq!(queues.len(), 3);

        queues.active.pop_front();
        queues.push_pending(entries);
        queues.rotate();
        assert_eq!(
            Vec::from(queues.active.clone()),
            vec![latest, RefreshTarget::AllDatasetDefinitions, entries]
        );
        assert!(queues.retry.is_empty() && queues.pending.is_empty());
    }

    #[test]
    fn cancelled_cycle_keeps_failed_targets() {
        let definition = Uuid::new_v4();
        let latest = RefreshTarget::LatestDatasetEntry { definition };
        let mut queues = Queues::default();
        queues.push_active(latest);
        queues.push_active(RefreshTarget::AllDatasetDefinitions);

        let failing = queues.active.pop_front().unwrap();
        queues.push_retry(failing);
        queues.requeue_retries();
        assert_eq!(
            Vec::from(queues.active.clone()),
            vec![latest, RefreshTarget::AllDatasetDefinitions]
        );
        assert!(queues.retry.is_empty());
    }

    #[test]
    fn targets_have_stable_names() {
        let id = Uuid::nil();
        assert_eq!(
            RefreshTarget::AllDatasetDefinitions.to_string(),
            "all_dataset_definitions"
        );
        assert_eq!(
            RefreshTarget::LatestDatasetEntry { definition: id }.to_string(),
            format!("latest_dataset_entry:{id}")
        );
    }
}
