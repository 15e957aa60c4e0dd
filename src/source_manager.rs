//! Rotation of sources for the data source.
//!
//! [`SourceManager`] owns the ordered initializer and synchronizer factories and hands out fresh
//! instances from them. Synchronizer slots are visited round-robin, skipping blocked slots. The
//! manager also owns the currently active source, so that [`SourceManager::close`] (typically
//! called from the application thread) can close it while the data source is waiting on it.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::source::{
    ActiveSource, Closeable, Initializer, InitializerFactory, Synchronizer, SynchronizerFactory,
};

/// Synchronizer factory registered with the manager.
#[derive(Clone)]
pub struct SynchronizerSlot {
    factory: SynchronizerFactory,
    fdv1_fallback: bool,
}

impl SynchronizerSlot {
    pub fn new(factory: SynchronizerFactory) -> SynchronizerSlot {
        SynchronizerSlot {
            factory,
            fdv1_fallback: false,
        }
    }

    /// Slot used only after the service instructs the client to fall back to FDv1. It starts
    /// blocked.
    pub fn fdv1_fallback(factory: SynchronizerFactory) -> SynchronizerSlot {
        SynchronizerSlot {
            factory,
            fdv1_fallback: true,
        }
    }
}

impl From<SynchronizerFactory> for SynchronizerSlot {
    fn from(factory: SynchronizerFactory) -> Self {
        SynchronizerSlot::new(factory)
    }
}

pub struct SourceManager {
    initializers: Vec<InitializerFactory>,
    /// Immutable after construction.
    synchronizers: Vec<SynchronizerSlot>,
    /// Parallel to `synchronizers`.
    blocked: Vec<AtomicBool>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_initializer: usize,
    /// Position the next synchronizer scan starts at.
    next_synchronizer: usize,
    /// Slot of the most recently handed out synchronizer.
    current: Option<usize>,
    active_source: Option<ActiveSource>,
    shutdown: bool,
}

impl SourceManager {
    pub fn new(
        initializers: Vec<InitializerFactory>,
        synchronizers: Vec<SynchronizerSlot>,
    ) -> Self {
        let blocked = synchronizers
            .iter()
            .map(|slot| AtomicBool::new(slot.fdv1_fallback))
            .collect();
        SourceManager {
            initializers,
            synchronizers,
            blocked,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .expect("thread holding source manager lock should not panic")
    }

    fn is_blocked(&self, index: usize) -> bool {
        self.blocked[index].load(Ordering::Acquire)
    }

    pub fn has_initializers(&self) -> bool {
        !self.initializers.is_empty()
    }

    /// Build the next initializer, in order. Returns `None` once all initializers were used or
    /// after shutdown.
    pub fn next_initializer(&self) -> Option<Arc<dyn Initializer>> {
        let factory = {
            let mut state = self.lock();
            if state.shutdown {
                return None;
            }
            let factory = self.initializers.get(state.next_initializer)?.clone();
            state.next_initializer += 1;
            factory
        };
        Some(factory())
    }

    /// Find the first non-blocked synchronizer slot at or after the scan position (wrapping
    /// once), make it the current slot, and build a synchronizer from it.
    ///
    /// Returns `None` if every slot is blocked, there are no slots, or the manager is shut down.
    /// The returned instance is not registered as the active source; see
    /// [`SourceManager::set_active_source`].
    pub fn next_available_and_activate(&self) -> Option<Arc<dyn Synchronizer>> {
        let factory = {
            let mut state = self.lock();
            if state.shutdown {
                state.current = None;
                return None;
            }
            let len = self.synchronizers.len();
            let found = (0..len)
                .map(|offset| (state.next_synchronizer + offset) % len)
                .find(|&index| !self.is_blocked(index));
            state.current = found;
            let index = found?;
            state.next_synchronizer = (index + 1) % len;
            self.synchronizers[index].factory.clone()
        };
        Some(factory())
    }

    /// `true` if the current slot is the first non-blocked slot.
    pub fn is_prime(&self) -> bool {
        let current = self.lock().current;
        let first_available = (0..self.synchronizers.len()).find(|&index| !self.is_blocked(index));
        current.is_some() && current == first_available
    }

    /// Restart the round-robin scan from the first slot. Blocked slots stay blocked.
    pub fn reset_index(&self) {
        self.lock().next_synchronizer = 0;
    }

    pub fn block(&self, index: usize) {
        if let Some(blocked) = self.blocked.get(index) {
            blocked.store(true, Ordering::Release);
        }
    }

    /// Block the slot of the most recently handed out synchronizer.
    pub fn block_current(&self) {
        if let Some(current) = self.lock().current {
            self.block(current);
        }
    }

    pub fn synchronizer_count(&self) -> usize {
        self.synchronizers.len()
    }

    pub fn available_count(&self) -> usize {
        (0..self.synchronizers.len())
            .filter(|&index| !self.is_blocked(index))
            .count()
    }

    pub fn has_fdv1_fallback(&self) -> bool {
        self.synchronizers.iter().any(|slot| slot.fdv1_fallback)
    }

    pub fn is_current_fdv1_fallback(&self) -> bool {
        self.lock()
            .current
            .is_some_and(|current| self.synchronizers[current].fdv1_fallback)
    }

    /// Block every slot except the FDv1 fallback slots, which get unblocked.
    pub fn engage_fdv1_fallback(&self) {
        for (slot, blocked) in self.synchronizers.iter().zip(&self.blocked) {
            blocked.store(!slot.fdv1_fallback, Ordering::Release);
        }
    }

    /// Make `source` the active source, closing the previous one.
    ///
    /// Returns `true` if the manager has already been shut down; `source` is then closed right
    /// away instead.
    pub fn set_active_source(&self, source: ActiveSource) -> bool {
        // Sources are closed without holding the lock, since closing may call back in here.
        let (previous, rejected) = {
            let mut state = self.lock();
            let previous = state.active_source.take();
            if state.shutdown {
                (previous, Some(source))
            } else {
                state.active_source = Some(source);
                (previous, None)
            }
        };
        if let Some(previous) = previous {
            previous.close();
        }
        match rejected {
            Some(source) => {
                source.close();
                true
            }
            None => false,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Shut down and close the active source. Idempotent.
    pub fn close(&self) {
        let active = {
            let mut state = self.lock();
            state.shutdown = true;
            state.active_source.take()
        };
        if let Some(active) = active {
            active.close();
        }
    }
}
