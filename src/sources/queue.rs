use std::collections::VecDeque;
use std::sync::Mutex;

use crate::source::{PendingResult, ResultSender, SourceResult};

/// Unbounded queue of source results with a single asynchronous consumer.
///
/// Producers (a polling thread, a stream handler) [`put`](ResultQueue::put) results as they
/// arrive. The consumer calls [`take`](ResultQueue::take), which either returns the oldest queued
/// result or a pending result fulfilled by the next `put`.
#[derive(Debug, Default)]
pub struct ResultQueue {
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    results: VecDeque<SourceResult>,
    waiter: Option<ResultSender>,
    closed: bool,
}

impl ResultQueue {
    pub fn new() -> ResultQueue {
        ResultQueue::default()
    }

    /// Queue `result`, or hand it straight to a waiting consumer.
    ///
    /// Returns `false` if the queue is closed and the result was discarded.
    pub fn put(&self, result: SourceResult) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let result = match state.waiter.take() {
            Some(waiter) => match waiter.send(result) {
                Ok(()) => return true,
                // The consumer stopped waiting. Keep the result for the next take().
                Err(result) => result,
            },
            None => result,
        };
        state.results.push_back(result);
        true
    }

    /// Get the next result.
    ///
    /// A closed queue still drains results queued before it was closed, then answers with a
    /// shutdown status. Only one outstanding take is supported; a second one replaces the first,
    /// which then resolves to `None`.
    pub fn take(&self) -> PendingResult {
        let mut state = self.lock();
        if let Some(result) = state.results.pop_front() {
            return PendingResult::ready(result);
        }
        if state.closed {
            return PendingResult::ready(SourceResult::shutdown());
        }
        let (sender, pending) = PendingResult::channel();
        state.waiter = Some(sender);
        pending
    }

    /// Close the queue. A waiting consumer receives a shutdown status. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.send(SourceResult::shutdown());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .expect("thread holding result queue lock should not panic")
    }
}
