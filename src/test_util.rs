//! Scriptable sources, sinks, and stores shared by the unit tests.
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::data_source_updates::DataSourceUpdateSink;
use crate::data_store::{DataStore, InMemoryDataStore, TransactionalDataStore};
use crate::source::{
    Closeable, Initializer, InitializerFactory, PendingResult, ResultSender, SourceResult,
    Synchronizer, SynchronizerFactory,
};
use crate::source_manager::SynchronizerSlot;
use crate::sources::ResultQueue;
use crate::status::{DataSourceState, ErrorInfo};
use crate::store_types::{
    ChangeSet, DataKind, FullDataSet, ItemDescriptor, KeyedItems, Selector,
};
use crate::{Error, Result};

enum InitializerBehavior {
    /// Answer with this result.
    Respond(SourceResult),
    /// Never answer on its own. Closing answers with a shutdown status.
    Hang,
    /// Drop the request.
    Drop,
}

pub struct MockInitializer {
    behavior: Mutex<Option<InitializerBehavior>>,
    sender: Mutex<Option<ResultSender>>,
    runs: AtomicUsize,
    closes: AtomicUsize,
}

impl MockInitializer {
    fn with_behavior(behavior: InitializerBehavior) -> MockInitializer {
        MockInitializer {
            behavior: Mutex::new(Some(behavior)),
            sender: Mutex::new(None),
            runs: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn responding(result: SourceResult) -> MockInitializer {
        MockInitializer::with_behavior(InitializerBehavior::Respond(result))
    }

    pub fn pending() -> MockInitializer {
        MockInitializer::with_behavior(InitializerBehavior::Hang)
    }

    pub fn dropping() -> MockInitializer {
        MockInitializer::with_behavior(InitializerBehavior::Drop)
    }

    /// Factory always handing out this instance.
    pub fn factory(self: &Arc<Self>) -> InitializerFactory {
        let initializer = self.clone();
        Arc::new(move || -> Arc<dyn Initializer> { initializer.clone() })
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Closeable for MockInitializer {
    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(sender) = self.sender.lock().unwrap().take() {
            let _ = sender.send(SourceResult::shutdown());
        }
    }
}

impl Initializer for MockInitializer {
    fn run(&self) -> PendingResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.behavior.lock().unwrap().take() {
            Some(InitializerBehavior::Respond(result)) => PendingResult::ready(result),
            Some(InitializerBehavior::Hang) => {
                let (sender, pending) = PendingResult::channel();
                *self.sender.lock().unwrap() = Some(sender);
                pending
            }
            Some(InitializerBehavior::Drop) | None => PendingResult::channel().1,
        }
    }
}

/// Synchronizer answering `next()` from a queue of results. Once the queue is empty, `next()`
/// waits for the next [`MockSynchronizer::push`].
pub struct MockSynchronizer {
    queue: ResultQueue,
    nexts: AtomicUsize,
    closes: AtomicUsize,
}

impl MockSynchronizer {
    pub fn new() -> MockSynchronizer {
        MockSynchronizer::with_results(Vec::new())
    }

    pub fn with_results(results: Vec<SourceResult>) -> MockSynchronizer {
        let queue = ResultQueue::new();
        for result in results {
            queue.put(result);
        }
        MockSynchronizer {
            queue,
            nexts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, result: SourceResult) -> bool {
        self.queue.put(result)
    }

    pub fn next_count(&self) -> usize {
        self.nexts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Closeable for MockSynchronizer {
    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.queue.close();
    }
}

impl Synchronizer for MockSynchronizer {
    fn next(&self) -> PendingResult {
        self.nexts.fetch_add(1, Ordering::SeqCst);
        self.queue.take()
    }
}

/// Factory of [`MockSynchronizer`]s. The n-th built instance starts with the n-th script; instances
/// beyond the scripts start empty.
#[derive(Clone, Default)]
pub struct SynchronizerPool {
    scripts: Arc<Mutex<Vec<Vec<SourceResult>>>>,
    instances: Arc<Mutex<Vec<Arc<MockSynchronizer>>>>,
}

impl SynchronizerPool {
    pub fn new() -> SynchronizerPool {
        SynchronizerPool::default()
    }

    pub fn scripted(scripts: Vec<Vec<SourceResult>>) -> SynchronizerPool {
        SynchronizerPool {
            scripts: Arc::new(Mutex::new(scripts)),
            instances: Arc::default(),
        }
    }

    pub fn factory(&self) -> SynchronizerFactory {
        let pool = self.clone();
        Arc::new(move || -> Arc<dyn Synchronizer> {
            let mut instances = pool.instances.lock().unwrap();
            let script = pool
                .scripts
                .lock()
                .unwrap()
                .get(instances.len())
                .cloned()
                .unwrap_or_default();
            let synchronizer = Arc::new(MockSynchronizer::with_results(script));
            instances.push(synchronizer.clone());
            synchronizer
        })
    }

    pub fn slot(&self) -> SynchronizerSlot {
        SynchronizerSlot::new(self.factory())
    }

    pub fn built(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn instance(&self, index: usize) -> Option<Arc<MockSynchronizer>> {
        self.instances.lock().unwrap().get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<MockSynchronizer>> {
        self.instances.lock().unwrap().last().cloned()
    }
}

/// Sink recording everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<ChangeSet>>,
    statuses: Mutex<Vec<(DataSourceState, Option<ErrorInfo>)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn apply_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn applied(&self) -> Vec<ChangeSet> {
        self.applied.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<DataSourceState> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(state, _)| *state)
            .collect()
    }

    pub fn last_state(&self) -> Option<DataSourceState> {
        self.states().last().copied()
    }
}

impl DataSourceUpdateSink for RecordingSink {
    fn apply(&self, change_set: ChangeSet) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Store("unavailable".to_owned()));
        }
        self.applied.lock().unwrap().push(change_set);
        Ok(())
    }

    fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        self.statuses.lock().unwrap().push((state, error));
    }
}

/// Store without the transactional extension, counting writes.
#[derive(Default)]
pub struct LegacyStore {
    inner: InMemoryDataStore,
    inits: Mutex<Vec<FullDataSet>>,
    upserts: AtomicUsize,
}

impl LegacyStore {
    pub fn new() -> LegacyStore {
        LegacyStore::default()
    }

    pub fn init_count(&self) -> usize {
        self.inits.lock().unwrap().len()
    }

    pub fn last_init(&self) -> Option<FullDataSet> {
        self.inits.lock().unwrap().last().cloned()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl DataStore for LegacyStore {
    fn init(&self, data: FullDataSet) -> Result<()> {
        self.inits.lock().unwrap().push(data.clone());
        self.inner.init(data)
    }

    fn get(&self, kind: &DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        self.inner.get(kind, key)
    }

    fn get_all(&self, kind: &DataKind) -> Result<KeyedItems> {
        self.inner.get_all(kind)
    }

    fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(kind, key, item)
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }
}

/// Transactional store that fails every operation while `failing` is set (initially set).
pub struct FailingStore {
    inner: InMemoryDataStore,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn new() -> FailingStore {
        FailingStore {
            inner: InMemoryDataStore::new(),
            failing: AtomicBool::new(true),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Store("disk full".to_owned()))
        } else {
            Ok(())
        }
    }
}

impl DataStore for FailingStore {
    fn init(&self, data: FullDataSet) -> Result<()> {
        self.check()?;
        self.inner.init(data)
    }

    fn get(&self, kind: &DataKind, key: &str) -> Result<Option<ItemDescriptor>> {
        self.check()?;
        self.inner.get(kind, key)
    }

    fn get_all(&self, kind: &DataKind) -> Result<KeyedItems> {
        self.check()?;
        self.inner.get_all(kind)
    }

    fn upsert(&self, kind: &DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        self.check()?;
        self.inner.upsert(kind, key, item)
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalDataStore> {
        Some(self)
    }
}

impl TransactionalDataStore for FailingStore {
    fn apply(&self, change_set: &ChangeSet) -> Result<()> {
        self.check()?;
        self.inner.apply(change_set)
    }

    fn selector(&self) -> Selector {
        self.inner.selector()
    }
}

/// Full change set with a single flag.
pub fn full_change_set(selector: Selector, flag_key: &str, version: u64) -> ChangeSet {
    ChangeSet::full(
        selector,
        vec![(
            DataKind::Features,
            vec![(
                flag_key.to_owned(),
                crate::data_model::FeatureFlag::new(flag_key, version).into(),
            )],
        )],
    )
}
