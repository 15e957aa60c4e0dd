//! Acquisition of flag data from a prioritized list of sources.
//!
//! [`DataSource`] first runs the initializers, in order, until one of them delivers data that
//! is anchored to a selector. It then runs the synchronizers, one at a time, for live updates:
//! - a synchronizer that reports a terminal error is blocked for the rest of the run;
//! - a synchronizer that stays interrupted for the fallback timeout is replaced by the next one;
//! - a non-prime synchronizer is replaced by the prime one after the recovery timeout.
//!
//! The run ends when every synchronizer is blocked or when the data source is closed.
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::{runtime::Handle, sync::watch};

use crate::conditions::{Condition, ConditionKind, PendingCondition};
use crate::data_source_updates::DataSourceUpdateSink;
use crate::data_system::DataSystemConfig;
use crate::source::{
    ActiveSource, InitializerFactory, SourceResult, SourceState, Synchronizer, SynchronizerFactory,
};
use crate::source_manager::{SourceManager, SynchronizerSlot};
use crate::status::{DataSourceState, ErrorInfo};
use crate::store_types::ChangeSet;

/// How [`DataSource::start`] completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Data was received and stored.
    Initialized,
    /// Every source failed before any data was received.
    Exhausted,
    /// The data source was closed before any data was received.
    Shutdown,
}

/// Ordered lists of sources to acquire data from.
#[derive(Clone, Default)]
pub struct DataSources {
    initializers: Vec<InitializerFactory>,
    synchronizers: Vec<SynchronizerSlot>,
}

impl DataSources {
    pub fn new() -> DataSources {
        DataSources::default()
    }

    pub fn with_initializer(mut self, factory: InitializerFactory) -> DataSources {
        self.initializers.push(factory);
        self
    }

    pub fn with_synchronizer(mut self, factory: SynchronizerFactory) -> DataSources {
        self.synchronizers.push(SynchronizerSlot::new(factory));
        self
    }

    /// Add a synchronizer that is only used once a source asks the client to fall back to the
    /// FDv1 protocol.
    pub fn with_fdv1_fallback(mut self, factory: SynchronizerFactory) -> DataSources {
        self.synchronizers.push(SynchronizerSlot::fdv1_fallback(factory));
        self
    }
}

pub struct DataSource {
    inner: Arc<Inner>,
}

struct Inner {
    manager: SourceManager,
    sink: Arc<dyn DataSourceUpdateSink>,
    runtime: Handle,
    fallback_timeout: Duration,
    recovery_timeout: Duration,
    started: AtomicBool,
    /// Set while the acquisition task is running.
    running: AtomicBool,
    /// `Off` is reported at most once, by whichever of the task and `close` gets there first.
    off_reported: AtomicBool,
    fdv1_fallback_active: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// Written once.
    outcome: watch::Sender<Option<StartOutcome>>,
}

/// Why the data source stopped consuming a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Switch {
    /// Move on to the next available synchronizer.
    Next,
    /// The synchronizer failed for good.
    Block,
    /// Start over from the prime synchronizer.
    Recover,
    /// Swap in the FDv1 fallback synchronizers.
    Fdv1Fallback,
    Shutdown,
}

/// Whether the run should continue after the initializers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

impl DataSource {
    /// Create a data source. Nothing runs until [`DataSource::start`]. Timers and the acquisition
    /// task run on `runtime`.
    pub fn new(
        sources: DataSources,
        sink: Arc<dyn DataSourceUpdateSink>,
        runtime: Handle,
        config: &DataSystemConfig,
    ) -> DataSource {
        let (shutdown, _) = watch::channel(false);
        let (outcome, _) = watch::channel(None);
        DataSource {
            inner: Arc::new(Inner {
                manager: SourceManager::new(sources.initializers, sources.synchronizers),
                sink,
                runtime,
                fallback_timeout: config.fallback_timeout,
                recovery_timeout: config.recovery_timeout,
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                off_reported: AtomicBool::new(false),
                fdv1_fallback_active: AtomicBool::new(false),
                shutdown,
                outcome,
            }),
        }
    }

    /// Start acquiring data. Only the first call starts anything.
    ///
    /// The returned future completes once data has been stored, all sources have failed, or the
    /// data source was closed. It doesn't need to be polled for acquisition to make progress.
    pub fn start(&self) -> impl Future<Output = StartOutcome> + Send + 'static {
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.running.store(true, Ordering::SeqCst);
            let inner = self.inner.clone();
            self.inner.runtime.spawn(async move { inner.run().await });
        }

        let mut outcome = self.inner.outcome.subscribe();
        async move {
            let outcome = outcome.wait_for(Option::is_some).await.ok().and_then(|o| *o);
            outcome.unwrap_or(StartOutcome::Shutdown)
        }
    }

    /// `true` once data has been received and stored.
    pub fn is_initialized(&self) -> bool {
        *self.inner.outcome.borrow() == Some(StartOutcome::Initialized)
    }

    /// `true` once a source instructed the client to fall back to the FDv1 protocol.
    pub fn is_fdv1_fallback_active(&self) -> bool {
        self.inner.fdv1_fallback_active.load(Ordering::SeqCst)
    }

    /// Stop acquiring data and close the active source. Idempotent, and safe to call from any
    /// thread at any point, including before [`DataSource::start`].
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.shutdown.send_replace(true) {
            return;
        }
        log::debug!(target: "flagsync", "closing data source");
        inner.manager.close();
        if !inner.running.load(Ordering::SeqCst) {
            inner.report_off(None);
        }
        inner.complete(StartOutcome::Shutdown);
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut last_error = None;

        if self.manager.has_initializers()
            && self.run_initializers(&mut shutdown, &mut last_error).await == Flow::Shutdown
        {
            self.finish_shutdown();
            return;
        }

        if self.run_synchronizers(&mut shutdown, &mut last_error).await == Flow::Shutdown {
            self.finish_shutdown();
            return;
        }

        if self.is_initialized() && !self.has_synchronizers() {
            log::debug!(target: "flagsync", "no synchronizers configured, keeping initializer data");
            self.running.store(false, Ordering::SeqCst);
            // `close` may have run before `running` was cleared and left `Off` to this task.
            if self.is_shutdown() {
                self.report_off(None);
            }
            return;
        }
        log::warn!(target: "flagsync", "all data sources failed, giving up");
        self.running.store(false, Ordering::SeqCst);
        self.report_off(last_error);
        self.complete(StartOutcome::Exhausted);
    }

    async fn run_initializers(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        last_error: &mut Option<ErrorInfo>,
    ) -> Flow {
        let mut any_data_received = false;

        while let Some(initializer) = self.manager.next_initializer() {
            if self
                .manager
                .set_active_source(ActiveSource::Initializer(initializer.clone()))
            {
                return Flow::Shutdown;
            }

            let result = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Flow::Shutdown,
                result = initializer.run() => result,
            };

            match result {
                Some(SourceResult::ChangeSet { change_set, .. }) => {
                    let anchored = !change_set.selector.is_empty();
                    if self.apply(change_set) {
                        any_data_received = true;
                        if anchored {
                            log::debug!(target: "flagsync", "initializer delivered data with a selector");
                            self.complete(StartOutcome::Initialized);
                            return Flow::Continue;
                        }
                    }
                }
                Some(SourceResult::Status { status, .. }) => {
                    if status.state == SourceState::Shutdown && self.is_shutdown() {
                        return Flow::Shutdown;
                    }
                    match &status.error {
                        Some(error) => {
                            log::warn!(target: "flagsync", "initializer failed: {error}");
                            *last_error = Some(error.clone());
                        }
                        None => {
                            log::warn!(target: "flagsync", "initializer reported {:?} without data", status.state);
                        }
                    }
                }
                None => {
                    log::warn!(target: "flagsync", "initializer dropped its request");
                }
            }
        }

        if any_data_received {
            // Data without a selector still beats no data at all.
            self.complete(StartOutcome::Initialized);
        }
        Flow::Continue
    }

    async fn run_synchronizers(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        last_error: &mut Option<ErrorInfo>,
    ) -> Flow {
        while let Some(synchronizer) = self.manager.next_available_and_activate() {
            if self
                .manager
                .set_active_source(ActiveSource::Synchronizer(synchronizer.clone()))
            {
                return Flow::Shutdown;
            }

            let conditions = self.attach_conditions();
            let switch = self
                .consume(synchronizer.as_ref(), &conditions, shutdown, last_error)
                .await;
            conditions.close();

            match switch {
                Switch::Next => {
                    log::debug!(target: "flagsync", "falling back to the next synchronizer");
                }
                Switch::Block => {
                    log::warn!(target: "flagsync", "synchronizer failed permanently, it won't be used again");
                    self.manager.block_current();
                }
                Switch::Recover => {
                    log::debug!(target: "flagsync", "recovering to the prime synchronizer");
                    self.manager.reset_index();
                }
                Switch::Fdv1Fallback => {
                    log::warn!(target: "flagsync", "falling back to the FDv1 protocol");
                    self.manager.engage_fdv1_fallback();
                }
                Switch::Shutdown => return Flow::Shutdown,
            }
        }
        if self.is_shutdown() {
            Flow::Shutdown
        } else {
            Flow::Continue
        }
    }

    /// Process results from `synchronizer` until it has to be switched out.
    async fn consume(
        &self,
        synchronizer: &dyn Synchronizer,
        conditions: &AttachedConditions,
        shutdown: &mut watch::Receiver<bool>,
        last_error: &mut Option<ErrorInfo>,
    ) -> Switch {
        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Switch::Shutdown,
                kind = conditions.first_fired() => {
                    return match kind {
                        ConditionKind::Fallback => Switch::Next,
                        ConditionKind::Recovery => Switch::Recover,
                    };
                }
                result = synchronizer.next() => result,
            };

            let Some(result) = result else {
                log::warn!(target: "flagsync", "synchronizer dropped its request");
                return Switch::Next;
            };
            conditions.inform(&result);

            let fdv1_fallback = result.is_fdv1_fallback();
            let mut switch = None;
            match result {
                SourceResult::ChangeSet { change_set, .. } => {
                    if self.apply(change_set) {
                        self.complete(StartOutcome::Initialized);
                    }
                }
                SourceResult::Status { status, .. } => match status.state {
                    SourceState::Valid => {}
                    SourceState::Interrupted => {
                        if let Some(error) = &status.error {
                            log::debug!(target: "flagsync", "synchronizer interrupted: {error}");
                            *last_error = Some(error.clone());
                        }
                        self.sink
                            .update_status(DataSourceState::Interrupted, status.error);
                    }
                    SourceState::TerminalError => {
                        if let Some(error) = &status.error {
                            log::warn!(target: "flagsync", "synchronizer failed: {error}");
                            *last_error = Some(error.clone());
                        }
                        self.sink
                            .update_status(DataSourceState::Interrupted, status.error);
                        switch = Some(Switch::Block);
                    }
                    SourceState::Goodbye => {
                        let reason = status.reason.as_deref().unwrap_or("no reason");
                        log::debug!(target: "flagsync", "synchronizer received goodbye: {reason}");
                    }
                    SourceState::Shutdown => switch = Some(Switch::Shutdown),
                },
            }

            if fdv1_fallback {
                self.fdv1_fallback_active.store(true, Ordering::SeqCst);
                if switch != Some(Switch::Shutdown)
                    && self.manager.has_fdv1_fallback()
                    && !self.manager.is_current_fdv1_fallback()
                {
                    switch = Some(Switch::Fdv1Fallback);
                }
            }
            if let Some(switch) = switch {
                return switch;
            }
        }
    }

    /// With a single available synchronizer there is nowhere to switch to. The prime synchronizer
    /// has nothing to recover to.
    fn attach_conditions(&self) -> AttachedConditions {
        if self.manager.available_count() <= 1 {
            return AttachedConditions::none();
        }
        let fallback = Condition::fallback(self.fallback_timeout, self.runtime.clone());
        let recovery = (!self.manager.is_prime())
            .then(|| Condition::recovery(self.recovery_timeout, self.runtime.clone()));
        AttachedConditions::new(Some(fallback), recovery)
    }

    /// Returns `true` if the change set was stored.
    fn apply(&self, change_set: ChangeSet) -> bool {
        match self.sink.apply(change_set) {
            Ok(()) => {
                self.sink.update_status(DataSourceState::Valid, None);
                true
            }
            Err(err) => {
                log::warn!(target: "flagsync", "failed to store received data: {err}");
                false
            }
        }
    }

    fn finish_shutdown(&self) {
        log::debug!(target: "flagsync", "data source stopped");
        self.running.store(false, Ordering::SeqCst);
        self.report_off(None);
        self.complete(StartOutcome::Shutdown);
    }

    fn report_off(&self, error: Option<ErrorInfo>) {
        if !self.off_reported.swap(true, Ordering::SeqCst) {
            self.sink.update_status(DataSourceState::Off, error);
        }
    }

    fn complete(&self, outcome: StartOutcome) {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    fn is_initialized(&self) -> bool {
        *self.outcome.borrow() == Some(StartOutcome::Initialized)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn has_synchronizers(&self) -> bool {
        self.manager.synchronizer_count() > 0
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens on teardown.
    let _ = shutdown.wait_for(|requested| *requested).await;
}

/// Conditions attached to the current synchronizer.
struct AttachedConditions {
    fallback: Option<(Condition, Arc<PendingCondition>)>,
    recovery: Option<(Condition, Arc<PendingCondition>)>,
}

impl AttachedConditions {
    fn none() -> AttachedConditions {
        AttachedConditions {
            fallback: None,
            recovery: None,
        }
    }

    fn new(fallback: Option<Condition>, recovery: Option<Condition>) -> AttachedConditions {
        let execute = |condition: Condition| {
            let pending = condition.execute();
            (condition, pending)
        };
        AttachedConditions {
            fallback: fallback.map(execute),
            recovery: recovery.map(execute),
        }
    }

    fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.fallback
            .iter()
            .chain(self.recovery.iter())
            .map(|(condition, _)| condition)
    }

    fn inform(&self, result: &SourceResult) {
        for condition in self.conditions() {
            condition.inform(result);
        }
    }

    fn close(&self) {
        for condition in self.conditions() {
            condition.close();
        }
    }

    /// Resolves when any attached condition fires. Never resolves without conditions.
    async fn first_fired(&self) -> ConditionKind {
        async fn fired(condition: &Option<(Condition, Arc<PendingCondition>)>) -> ConditionKind {
            match condition {
                Some((_, pending)) => pending.fired().await,
                None => std::future::pending().await,
            }
        }

        tokio::select! {
            kind = fired(&self.fallback) => kind,
            kind = fired(&self.recovery) => kind,
        }
    }
}
