//! Fallback and recovery conditions.
//!
//! A condition is a one-shot delayed trigger attached to a running synchronizer. The data source
//! races the synchronizer's results against [`PendingCondition::fired`] and switches sources when a
//! condition fires:
//! - [`ConditionKind::Fallback`] fires after the synchronizer has been interrupted for the whole
//!   timeout without delivering data in between;
//! - [`ConditionKind::Recovery`] fires unconditionally, a fixed time after the synchronizer
//!   started, so that rotation can go back to the prime synchronizer.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::{runtime::Handle, sync::watch, task::JoinHandle};

use crate::source::{SourceResult, SourceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    Fallback,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    Idle,
    /// The timer is running.
    Armed,
    Fired,
    /// Terminal. Reached from any state by [`Condition::close`].
    Closed,
}

/// Result of [`Condition::execute`].
///
/// Resolves once the condition fires. If the condition is closed before firing, it never
/// resolves, so waiters must also watch their own cancellation signal.
#[derive(Debug)]
pub struct PendingCondition {
    kind: ConditionKind,
    fired: watch::Receiver<bool>,
}

impl PendingCondition {
    pub fn kind(&self) -> ConditionKind {
        self.kind
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.borrow()
    }

    /// Wait until the condition fires. Returns the kind of the condition, so that a caller racing
    /// several conditions can tell which one it was.
    pub async fn fired(&self) -> ConditionKind {
        let mut fired = self.fired.clone();
        if fired.wait_for(|fired| *fired).await.is_err() {
            // The condition was dropped without firing.
            std::future::pending::<()>().await;
        }
        self.kind
    }
}

pub struct Condition {
    kind: ConditionKind,
    timeout: Duration,
    runtime: Handle,
    shared: Arc<Shared>,
    pending: Arc<PendingCondition>,
}

struct Shared {
    timer: Mutex<Timer>,
    fired: watch::Sender<bool>,
}

struct Timer {
    state: ConditionState,
    /// Bumped whenever a timer is started so that a stale timer task can't fire a newer arming.
    generation: u64,
    task: Option<JoinHandle<()>>,
    executed: bool,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Timer> {
        self.timer
            .lock()
            .expect("thread holding condition lock should not panic")
    }
}

impl Condition {
    pub fn fallback(timeout: Duration, runtime: Handle) -> Condition {
        Condition::new(ConditionKind::Fallback, timeout, runtime)
    }

    pub fn recovery(timeout: Duration, runtime: Handle) -> Condition {
        Condition::new(ConditionKind::Recovery, timeout, runtime)
    }

    fn new(kind: ConditionKind, timeout: Duration, runtime: Handle) -> Condition {
        let (sender, receiver) = watch::channel(false);
        Condition {
            kind,
            timeout,
            runtime,
            shared: Arc::new(Shared {
                timer: Mutex::new(Timer {
                    state: ConditionState::Idle,
                    generation: 0,
                    task: None,
                    executed: false,
                }),
                fired: sender,
            }),
            pending: Arc::new(PendingCondition {
                kind,
                fired: receiver,
            }),
        }
    }

    pub fn kind(&self) -> ConditionKind {
        self.kind
    }

    pub fn state(&self) -> ConditionState {
        self.shared.lock().state
    }

    /// Get the pending result of this condition. Every call returns the same instance.
    ///
    /// The first call starts the recovery timer.
    pub fn execute(&self) -> Arc<PendingCondition> {
        let mut timer = self.shared.lock();
        if !timer.executed {
            timer.executed = true;
            if self.kind == ConditionKind::Recovery {
                self.arm(&mut timer);
            }
        }
        self.pending.clone()
    }

    /// Feed a result of the synchronizer this condition is attached to.
    pub fn inform(&self, result: &SourceResult) {
        if self.kind != ConditionKind::Fallback {
            return;
        }
        let mut timer = self.shared.lock();
        match result {
            SourceResult::Status { status, .. } if status.state == SourceState::Interrupted => {
                self.arm(&mut timer);
            }
            SourceResult::ChangeSet { .. } => {
                if timer.state == ConditionState::Armed {
                    Condition::cancel(&mut timer);
                    timer.state = ConditionState::Idle;
                }
            }
            _ => {}
        }
    }

    /// Cancel the timer. Idempotent. A condition that already fired stays fired.
    pub fn close(&self) {
        let mut timer = self.shared.lock();
        Condition::cancel(&mut timer);
        timer.state = ConditionState::Closed;
    }

    fn arm(&self, timer: &mut Timer) {
        if timer.state != ConditionState::Idle {
            return;
        }
        timer.generation += 1;
        timer.state = ConditionState::Armed;

        let generation = timer.generation;
        let shared = self.shared.clone();
        let timeout = self.timeout;
        let kind = self.kind;
        timer.task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut timer = shared.lock();
            if timer.state == ConditionState::Armed && timer.generation == generation {
                log::debug!(target: "flagsync", "{kind:?} condition fired after {timeout:?}");
                timer.state = ConditionState::Fired;
                timer.task = None;
                shared.fired.send_replace(true);
            }
        }));
    }

    fn cancel(timer: &mut Timer) {
        if let Some(task) = timer.task.take() {
            task.abort();
        }
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        Condition::cancel(&mut self.shared.lock());
    }
}
