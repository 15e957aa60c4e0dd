//! Data store interfaces and a thread-safe in-memory store.
//!
//! [`InMemoryDataStore`] provides concurrent access for readers (e.g., flag evaluation) and writers
//! (the change-application layer). Every write builds a new immutable snapshot and swaps it in, so
//! a reader holding a snapshot is never affected by later writes.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::store_types::{
    ChangeSet, ChangeSetType, DataKind, FullDataSet, ItemDescriptor, KeyedItems, Selector,
};
use crate::Result;

/// Storage of flags and segments.
///
/// Implementations must be `Sync`: the store is read by evaluation code while updates are being
/// written.
pub trait DataStore: Send + Sync {
    /// Replace the whole contents of the store and mark it initialized.
    fn init(&self, data: FullDataSet) -> Result<()>;

    /// Get a single item. Deletion records are returned as-is.
    fn get(&self, kind: &DataKind, key: &str) -> Result<Option<ItemDescriptor>>;

    /// Get every item of `kind`, including deletion records.
    fn get_all(&self, kind: &DataKind) -> Result<KeyedItems>;

    /// Write a single item if its version is newer than the stored one.
    ///
    /// Returns `Ok(false)` when the write was rejected by the version check.
    fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool>;

    fn is_initialized(&self) -> bool;

    /// Stores that can apply change sets directly return themselves here.
    fn as_transactional(&self) -> Option<&dyn TransactionalDataStore> {
        None
    }
}

/// Extension for stores that apply a [`ChangeSet`] as a single transaction and remember the
/// selector it was applied at.
pub trait TransactionalDataStore: DataStore {
    fn apply(&self, change_set: &ChangeSet) -> Result<()>;

    /// Selector of the last applied change set. Empty if data came from [`DataStore::init`].
    fn selector(&self) -> Selector;
}

/// Immutable view of the in-memory store.
#[derive(Debug, Default, Clone)]
pub struct StoreSnapshot {
    items: HashMap<DataKind, HashMap<String, ItemDescriptor>>,
    initialized: bool,
    selector: Selector,
}

impl StoreSnapshot {
    pub fn get(&self, kind: &DataKind, key: &str) -> Option<&ItemDescriptor> {
        self.items.get(kind)?.get(key)
    }

    fn with_full_data(data: &[(DataKind, KeyedItems)], selector: Selector) -> StoreSnapshot {
        let mut items: HashMap<DataKind, HashMap<String, ItemDescriptor>> = HashMap::new();
        for (kind, keyed_items) in data {
            let of_kind = items.entry(kind.clone()).or_default();
            for (key, item) in keyed_items {
                of_kind.insert(key.clone(), item.clone());
            }
        }
        StoreSnapshot {
            items,
            initialized: true,
            selector,
        }
    }

    /// Returns `true` if `item` was written.
    fn upsert(&mut self, kind: &DataKind, key: &str, item: ItemDescriptor) -> bool {
        let of_kind = self.items.entry(kind.clone()).or_default();
        match of_kind.get(key) {
            Some(existing) if existing.version >= item.version => false,
            _ => {
                of_kind.insert(key.to_owned(), item);
                true
            }
        }
    }
}

/// `InMemoryDataStore` is the default store. It supports the transactional extension.
#[derive(Default)]
pub struct InMemoryDataStore {
    snapshot: RwLock<Arc<StoreSnapshot>>,
}

impl InMemoryDataStore {
    /// Create a new empty, uninitialized store.
    pub fn new() -> Self {
        InMemoryDataStore::default()
    }

    /// Get the current snapshot.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        // self.snapshot.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        let snapshot = self
            .snapshot
            .read()
            .expect("thread holding data store lock should not panic");

        snapshot.clone()
    }

    /// Build a new snapshot from the current one and swap it in.
    fn update<R>(&self, f: impl FnOnce(&mut StoreSnapshot) -> R) -> R {
        let mut slot = self
            .snapshot
            .write()
            .expect("thread holding data store lock should not panic");

        let mut next = StoreSnapshot::clone(&slot);
        let result = f(&mut next);
        *slot = Arc::new(next);
        result
    }

    /// Export everything currently stored, including deletion records.
    pub fn export_all(&self) -> FullDataSet {
        let snapshot = self.snapshot();
        let data = snapshot
            .items
            .iter()
            .map(|(kind, items)| {
                let items = items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect();
                (kind.clone(), items)
            })
            .collect();
        FullDataSet::new(data)
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: FullDataSet) -> Result<()> {
        let next = StoreSnapshot::with_full_data(&data.data, Selector::EMPTY);
        self.update(|snapshot| *snapshot = next);
        Ok(())
    }

    fn get(&self, kind: &DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        Ok(self.snapshot().get(kind, key).cloned())
    }

    fn get_all(&self, kind: &DataKind) -> Result<KeyedItems> {
        let snapshot = self.snapshot();
        Ok(snapshot
            .items
            .get(kind)
            .map(|items| {
                items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        Ok(self.update(|snapshot| snapshot.upsert(kind, key, item)))
    }

    fn is_initialized(&self) -> bool {
        self.snapshot().initialized
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalDataStore> {
        Some(self)
    }
}

impl TransactionalDataStore for InMemoryDataStore {
    fn apply(&self, change_set: &ChangeSet) -> Result<()> {
        match change_set.change_set_type {
            ChangeSetType::Full => {
                let next =
                    StoreSnapshot::with_full_data(&change_set.data, change_set.selector.clone());
                self.update(|snapshot| *snapshot = next);
            }
            ChangeSetType::Partial => {
                self.update(|snapshot| {
                    for (kind, items) in &change_set.data {
                        for (key, item) in items {
                            if !snapshot.upsert(kind, key, item.clone()) {
                                log::debug!(target: "flagsync",
                                    "skipping stale {kind} item {key:?} at version {}", item.version);
                            }
                        }
                    }
                    snapshot.selector = change_set.selector.clone();
                });
            }
            ChangeSetType::None => {}
        }
        Ok(())
    }

    fn selector(&self) -> Selector {
        self.snapshot().selector.clone()
    }
}
