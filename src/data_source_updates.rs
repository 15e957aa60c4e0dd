//! Applying received data to the store and publishing what changed.
//!
//! [`DataSourceUpdates`] sits between the data source and the [`DataStore`]. It orders writes by
//! dependency, keeps the dependency graph current, turns writes into flag change events, and owns
//! the data source status (with outage tracking).
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use chrono::Utc;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};

use crate::broadcaster::{Broadcaster, Listener, ListenerId};
use crate::data_store::{DataStore, TransactionalDataStore};
use crate::dependencies::{
    sort_all_collections, sort_change_set, AffectedItems, DependencyTracker, KindAndKey,
};
use crate::status::{DataSourceState, DataSourceStatus, ErrorInfo, ErrorKind, FlagChangeEvent};
use crate::store_types::{
    ChangeSet, ChangeSetType, DataKind, FullDataSet, ItemDescriptor, KeyedItems,
};
use crate::{Error, Result};

/// Where the data source delivers its results.
pub trait DataSourceUpdateSink: Send + Sync {
    /// Write a change set. Fails only if the store failed as a whole.
    fn apply(&self, change_set: ChangeSet) -> Result<()>;

    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>);
}

type ItemsByKind = HashMap<DataKind, HashMap<String, ItemDescriptor>>;

pub struct DataSourceUpdates {
    store: Arc<dyn DataStore>,
    dependency_tracker: Mutex<DependencyTracker>,
    flag_change_broadcaster: Broadcaster<FlagChangeEvent>,
    status_broadcaster: Broadcaster<DataSourceStatus>,
    status: watch::Sender<DataSourceStatus>,
    outage_tracker: Option<OutageTracker>,
    last_store_update_failed: AtomicBool,
}

impl DataSourceUpdates {
    /// `outage_logging_timeout` of `None` disables outage tracking. The outage timer runs on
    /// `runtime`.
    pub fn new(
        store: Arc<dyn DataStore>,
        runtime: Handle,
        outage_logging_timeout: Option<Duration>,
    ) -> DataSourceUpdates {
        let (status, _) = watch::channel(DataSourceStatus::initializing());
        DataSourceUpdates {
            store,
            dependency_tracker: Mutex::new(DependencyTracker::new()),
            flag_change_broadcaster: Broadcaster::new(),
            status_broadcaster: Broadcaster::new(),
            status,
            outage_tracker: outage_logging_timeout
                .map(|timeout| OutageTracker::new(timeout, runtime)),
            last_store_update_failed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Replace the store contents.
    pub fn init(&self, data: FullDataSet) -> Result<()> {
        let old_data = self.read_old_data(data.data.iter().map(|(kind, _)| kind))?;

        let sorted = sort_all_collections(data);
        let written = sorted.clone();
        self.store_result(self.store.init(sorted))?;

        let changes = self.replace_dependencies(&written.data, old_data);
        self.send_change_events(changes);
        Ok(())
    }

    /// Write a single item if it is newer than the stored one.
    ///
    /// Returns `Ok(false)` if the write was rejected as stale.
    pub fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        let accepted = self.store_result(self.store.upsert(kind, key, item.clone()))?;
        if accepted {
            let changes = {
                let mut tracker = self.lock_tracker();
                tracker.update_dependencies_from(kind, key, Some(&item));
                self.has_flag_change_listeners().then(|| {
                    let mut affected = AffectedItems::new();
                    tracker.add_affected_items(&mut affected, &KindAndKey::new(kind.clone(), key));
                    affected
                })
            };
            self.send_change_events(changes);
        }
        Ok(accepted)
    }

    /// Apply a change set, as a single transaction if the store supports it.
    pub fn apply(&self, change_set: ChangeSet) -> Result<()> {
        match self.store.as_transactional() {
            Some(store) => self.apply_to_transactional_store(store, change_set),
            None => self.apply_to_legacy_store(change_set),
        }
    }

    fn apply_to_transactional_store(
        &self,
        store: &dyn TransactionalDataStore,
        change_set: ChangeSet,
    ) -> Result<()> {
        let change_set = sort_change_set(change_set);
        match change_set.change_set_type {
            ChangeSetType::Full => {
                let old_data = self.read_old_data(change_set.data.iter().map(|(kind, _)| kind))?;
                self.store_result(store.apply(&change_set))?;
                self.update_status(DataSourceState::Valid, None);

                let changes = self.replace_dependencies(&change_set.data, old_data);
                self.send_change_events(changes);
            }
            ChangeSetType::Partial => {
                // Replays the store's version check, so that a stale duplicate later in the same
                // change set is rejected against the write before it.
                let mut versions: HashMap<(&DataKind, &str), Option<u64>> = HashMap::new();
                let mut accepted = Vec::new();
                for (kind, items) in &change_set.data {
                    for (key, item) in items {
                        let current = match versions.get(&(kind, key.as_str())) {
                            Some(version) => *version,
                            None => self.store_result(store.get(kind, key))?.map(|i| i.version),
                        };
                        if current.map_or(true, |version| version < item.version) {
                            versions.insert((kind, key.as_str()), Some(item.version));
                            accepted.push((kind, key, item));
                        } else {
                            versions.insert((kind, key.as_str()), current);
                        }
                    }
                }
                self.store_result(store.apply(&change_set))?;
                self.update_status(DataSourceState::Valid, None);

                let changes = {
                    let mut tracker = self.lock_tracker();
                    let mut affected = self.has_flag_change_listeners().then(AffectedItems::new);
                    for (kind, key, item) in accepted {
                        tracker.update_dependencies_from(kind, key, Some(item));
                        if let Some(affected) = &mut affected {
                            let changed = KindAndKey::new(kind.clone(), key);
                            tracker.add_affected_items(affected, &changed);
                        }
                    }
                    affected
                };
                self.send_change_events(changes);
            }
            ChangeSetType::None => {
                self.update_status(DataSourceState::Valid, None);
            }
        }
        Ok(())
    }

    fn apply_to_legacy_store(&self, change_set: ChangeSet) -> Result<()> {
        match change_set.change_set_type {
            ChangeSetType::Full => self.init(FullDataSet::from(change_set)),
            ChangeSetType::Partial => {
                let change_set = sort_change_set(change_set);
                for (kind, items) in change_set.data {
                    for (key, item) in items {
                        if !self.upsert(&kind, &key, item)? {
                            log::debug!(target: "flagsync", "skipping stale {kind} item {key:?}");
                        }
                    }
                }
                Ok(())
            }
            ChangeSetType::None => Ok(()),
        }
    }

    /// Snapshot of items that may change, if anyone is listening for the changes.
    fn read_old_data<'a>(
        &self,
        kinds: impl Iterator<Item = &'a DataKind>,
    ) -> Result<Option<ItemsByKind>> {
        if !self.has_flag_change_listeners() {
            return Ok(None);
        }
        let mut all_kinds = vec![DataKind::Segments, DataKind::Features];
        for kind in kinds {
            if !all_kinds.contains(kind) {
                all_kinds.push(kind.clone());
            }
        }

        let mut old_data = ItemsByKind::new();
        for kind in all_kinds {
            let items = self.store_result(self.store.get_all(&kind))?;
            old_data.insert(kind, items.into_iter().collect());
        }
        Ok(Some(old_data))
    }

    /// Rebuild the dependency graph from a full data set. If `old_data` is given, returns the
    /// items affected by the difference between the old and the new data.
    fn replace_dependencies(
        &self,
        data: &[(DataKind, KeyedItems)],
        old_data: Option<ItemsByKind>,
    ) -> Option<AffectedItems> {
        let mut tracker = self.lock_tracker();
        tracker.reset();
        for (kind, items) in data {
            for (key, item) in items {
                tracker.update_dependencies_from(kind, key, Some(item));
            }
        }

        let old_data = old_data?;
        let new_data: ItemsByKind = data
            .iter()
            .map(|(kind, items)| (kind.clone(), items.iter().cloned().collect()))
            .collect();
        let empty = HashMap::new();

        let mut affected = AffectedItems::new();
        let mut kinds: Vec<&DataKind> = old_data.keys().chain(new_data.keys()).collect();
        kinds.sort();
        kinds.dedup();
        for kind in kinds {
            let old_items = old_data.get(kind).unwrap_or(&empty);
            let new_items = new_data.get(kind).unwrap_or(&empty);

            let mut keys: Vec<&String> = old_items.keys().chain(new_items.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                // Versions only ever grow, so an equal version means an unchanged item.
                let changed = match (old_items.get(key), new_items.get(key)) {
                    (Some(old), Some(new)) => old.version < new.version,
                    _ => true,
                };
                if changed {
                    tracker.add_affected_items(&mut affected, &KindAndKey::new(kind.clone(), key));
                }
            }
        }
        Some(affected)
    }

    fn send_change_events(&self, affected: Option<AffectedItems>) {
        let Some(affected) = affected else {
            return;
        };
        for key in affected.flag_keys() {
            self.flag_change_broadcaster.broadcast(&FlagChangeEvent {
                key: key.to_owned(),
            });
        }
    }

    /// Pass a store result through, recording whether the store is failing.
    fn store_result<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.last_store_update_failed.store(false, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.report_store_failure(&err);
                Err(err)
            }
        }
    }

    fn report_store_failure(&self, err: &Error) {
        if !self.last_store_update_failed.swap(true, Ordering::Relaxed) {
            log::warn!(target: "flagsync", "unexpected data store error when storing an update: {err}");
        } else {
            log::debug!(target: "flagsync", "data store is still failing: {err}");
        }
        self.update_status(
            DataSourceState::Interrupted,
            Some(ErrorInfo::new(ErrorKind::StoreError).with_message(err.to_string())),
        );
    }

    /// Record a new data source state.
    ///
    /// `Interrupted` while still `Initializing` stays `Initializing`. Listeners are only notified
    /// when the state changed or a new error was given.
    pub fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let mut broadcast = None;
        self.status.send_if_modified(|current| {
            let state = if state == DataSourceState::Interrupted
                && current.state == DataSourceState::Initializing
            {
                DataSourceState::Initializing
            } else {
                state
            };

            if let Some(tracker) = &self.outage_tracker {
                tracker.track(state, error.as_ref());
            }

            if state == current.state && error.is_none() {
                return false;
            }
            if state != current.state {
                current.state = state;
                current.state_since = Utc::now();
            }
            if error.is_some() {
                current.last_error = error;
            }
            broadcast = Some(current.clone());
            true
        });

        if let Some(status) = broadcast {
            log::debug!(target: "flagsync", "data source status is now {:?}", status.state);
            self.status_broadcaster.broadcast(&status);
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.borrow().clone()
    }

    /// Wait until the status reaches `state`.
    ///
    /// Returns `false` on timeout, or if the status becomes `Off` first. A zero `timeout` waits
    /// indefinitely.
    pub async fn wait_for(&self, state: DataSourceState, timeout: Duration) -> bool {
        let mut receiver = self.status.subscribe();
        let wait = receiver.wait_for(|status| {
            status.state == state || status.state == DataSourceState::Off
        });
        let reached = if timeout.is_zero() {
            wait.await.ok().map(|status| status.state)
        } else {
            tokio::time::timeout(timeout, wait)
                .await
                .ok()
                .and_then(|result| result.ok())
                .map(|status| status.state)
        };
        reached == Some(state)
    }

    pub fn add_flag_change_listener(
        &self,
        listener: impl Listener<FlagChangeEvent> + 'static,
    ) -> ListenerId {
        self.flag_change_broadcaster.register(listener)
    }

    pub fn remove_flag_change_listener(&self, id: ListenerId) -> bool {
        self.flag_change_broadcaster.unregister(id)
    }

    pub fn add_status_listener(
        &self,
        listener: impl Listener<DataSourceStatus> + 'static,
    ) -> ListenerId {
        self.status_broadcaster.register(listener)
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.status_broadcaster.unregister(id)
    }

    fn has_flag_change_listeners(&self) -> bool {
        self.flag_change_broadcaster.has_listeners()
    }

    fn lock_tracker(&self) -> std::sync::MutexGuard<'_, DependencyTracker> {
        self.dependency_tracker
            .lock()
            .expect("thread holding dependency tracker lock should not panic")
    }
}

impl DataSourceUpdateSink for DataSourceUpdates {
    fn apply(&self, change_set: ChangeSet) -> Result<()> {
        DataSourceUpdates::apply(self, change_set)
    }

    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        DataSourceUpdates::update_status(self, state, error)
    }
}

/// Keeps track of how long the data source has been failing and why. If it fails for longer than
/// the timeout, logs a single error summarizing the errors seen.
struct OutageTracker {
    timeout: Duration,
    runtime: Handle,
    state: Arc<Mutex<OutageState>>,
}

#[derive(Default)]
struct OutageState {
    in_outage: bool,
    /// Error counts by kind and status code, in order of first occurrence.
    error_counts: Vec<((ErrorKind, Option<u16>), usize)>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    #[cfg(test)]
    reports: Vec<String>,
}

impl OutageTracker {
    fn new(timeout: Duration, runtime: Handle) -> OutageTracker {
        OutageTracker {
            timeout,
            runtime,
            state: Arc::new(Mutex::new(OutageState::default())),
        }
    }

    fn track(&self, state: DataSourceState, error: Option<&ErrorInfo>) {
        let mut outage = lock_outage(&self.state);
        let failing = state == DataSourceState::Interrupted
            || error.is_some()
            || (state == DataSourceState::Initializing && outage.in_outage);

        if !failing {
            if let Some(timer) = outage.timer.take() {
                timer.abort();
            }
            outage.in_outage = false;
            return;
        }

        if !outage.in_outage {
            outage.in_outage = true;
            outage.error_counts.clear();
            outage.generation += 1;

            let generation = outage.generation;
            let shared = self.state.clone();
            let timeout = self.timeout;
            outage.timer = Some(self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                OutageTracker::on_timeout(&shared, generation, timeout);
            }));
        }
        if let Some(error) = error {
            outage.record(error);
        }
    }

    fn on_timeout(shared: &Mutex<OutageState>, generation: u64, timeout: Duration) {
        let mut outage = lock_outage(shared);
        if !outage.in_outage || outage.generation != generation {
            return;
        }
        outage.timer = None;
        let description = outage.describe_errors();
        outage.error_counts.clear();

        log::error!(target: "flagsync",
            "data source has not recovered within {timeout:?} after being interrupted; errors encountered: {description}");
        #[cfg(test)]
        outage.reports.push(description);
    }

    #[cfg(test)]
    fn reports(&self) -> Vec<String> {
        lock_outage(&self.state).reports.clone()
    }
}

impl OutageState {
    fn record(&mut self, error: &ErrorInfo) {
        let key = (error.kind, error.status_code);
        match self.error_counts.iter_mut().find(|(k, _)| *k == key) {
            Some((_, count)) => *count += 1,
            None => self.error_counts.push((key, 1)),
        }
    }

    fn describe_errors(&self) -> String {
        self.error_counts
            .iter()
            .map(|((kind, status_code), count)| {
                let status_code = status_code.map(|code| format!("({code})")).unwrap_or_default();
                let times = if *count == 1 { "time" } else { "times" };
                format!("{kind:?}{status_code} ({count} {times})")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Drop for OutageTracker {
    fn drop(&mut self) {
        if let Some(timer) = lock_outage(&self.state).timer.take() {
            timer.abort();
        }
    }
}

fn lock_outage(state: &Mutex<OutageState>) -> std::sync::MutexGuard<'_, OutageState> {
    state
        .lock()
        .expect("thread holding outage tracker lock should not panic")
}
