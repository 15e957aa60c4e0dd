//! Interfaces implemented by data sources.
//!
//! There are two kinds of sources:
//! - an [`Initializer`] produces exactly one result and is then discarded (e.g., a one-shot
//!   bulk request);
//! - a [`Synchronizer`] produces a sequence of results, one per [`Synchronizer::next`] call, until
//!   it is closed (e.g., a streaming connection or a polling loop).
//!
//! Results are delivered through [`PendingResult`], a single-use asynchronous slot backed by a
//! oneshot channel. A source that is closed while a request is outstanding either answers it with
//! a [`SourceState::Shutdown`] status or drops the sender, in which case the pending result
//! resolves to `None`.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::status::ErrorInfo;
use crate::store_types::ChangeSet;

/// State reported by a source that has no data to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Still connected and up to date.
    Valid,
    /// Temporarily failing. The source keeps trying on its own.
    Interrupted,
    /// Failed in a way that retrying won't fix.
    TerminalError,
    /// The service asked the client to disconnect. The source is expected to reconnect itself.
    Goodbye,
    /// The source was closed.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceStatus {
    pub state: SourceState,
    pub error: Option<ErrorInfo>,
    /// Reason given by the service, for [`SourceState::Goodbye`].
    pub reason: Option<String>,
}

/// A single result produced by a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceResult {
    ChangeSet {
        change_set: ChangeSet,
        /// The service instructed the client to fall back to the FDv1 protocol.
        fdv1_fallback: bool,
    },
    Status {
        status: SourceStatus,
        fdv1_fallback: bool,
    },
}

impl SourceResult {
    pub fn change_set(change_set: ChangeSet) -> SourceResult {
        SourceResult::ChangeSet {
            change_set,
            fdv1_fallback: false,
        }
    }

    pub fn status(state: SourceState, error: Option<ErrorInfo>) -> SourceResult {
        SourceResult::Status {
            status: SourceStatus {
                state,
                error,
                reason: None,
            },
            fdv1_fallback: false,
        }
    }

    pub fn valid() -> SourceResult {
        SourceResult::status(SourceState::Valid, None)
    }

    pub fn interrupted(error: ErrorInfo) -> SourceResult {
        SourceResult::status(SourceState::Interrupted, Some(error))
    }

    pub fn terminal_error(error: ErrorInfo) -> SourceResult {
        SourceResult::status(SourceState::TerminalError, Some(error))
    }

    pub fn goodbye(reason: impl Into<String>) -> SourceResult {
        SourceResult::Status {
            status: SourceStatus {
                state: SourceState::Goodbye,
                error: None,
                reason: Some(reason.into()),
            },
            fdv1_fallback: false,
        }
    }

    pub fn shutdown() -> SourceResult {
        SourceResult::status(SourceState::Shutdown, None)
    }

    /// Mark this result as carrying the FDv1 fallback directive.
    pub fn with_fdv1_fallback(mut self) -> SourceResult {
        match &mut self {
            SourceResult::ChangeSet { fdv1_fallback, .. }
            | SourceResult::Status { fdv1_fallback, .. } => *fdv1_fallback = true,
        }
        self
    }

    pub fn is_fdv1_fallback(&self) -> bool {
        match self {
            SourceResult::ChangeSet { fdv1_fallback, .. }
            | SourceResult::Status { fdv1_fallback, .. } => *fdv1_fallback,
        }
    }
}

/// Sending half of a [`PendingResult`].
#[derive(Debug)]
pub struct ResultSender(oneshot::Sender<SourceResult>);

impl ResultSender {
    /// Fulfil the pending result. Gives the result back if nobody is waiting for it anymore.
    pub fn send(self, result: SourceResult) -> Result<(), SourceResult> {
        self.0.send(result)
    }

    /// `true` once the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// A result that a source will produce in the future.
///
/// Resolves to `None` if the source drops the request without answering it.
#[derive(Debug)]
pub struct PendingResult {
    receiver: oneshot::Receiver<SourceResult>,
}

impl PendingResult {
    pub fn channel() -> (ResultSender, PendingResult) {
        let (sender, receiver) = oneshot::channel();
        (ResultSender(sender), PendingResult { receiver })
    }

    /// Already-resolved result.
    pub fn ready(result: SourceResult) -> PendingResult {
        let (sender, pending) = PendingResult::channel();
        // The receiver is alive, so this can't fail.
        let _ = sender.send(result);
        pending
    }
}

impl Future for PendingResult {
    type Output = Option<SourceResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(Result::ok)
    }
}

/// Something that holds resources until closed. `close` must be idempotent.
pub trait Closeable: Send + Sync {
    fn close(&self);
}

/// One-shot source.
pub trait Initializer: Closeable {
    /// Start the request. Called once per instance.
    fn run(&self) -> PendingResult;
}

/// Long-lived source.
pub trait Synchronizer: Closeable {
    /// Get the next result. Called repeatedly until the synchronizer is closed.
    fn next(&self) -> PendingResult;
}

pub type InitializerFactory = Arc<dyn Fn() -> Arc<dyn Initializer> + Send + Sync>;
pub type SynchronizerFactory = Arc<dyn Fn() -> Arc<dyn Synchronizer> + Send + Sync>;

/// The source currently owned by the data source, closed when it is replaced or on shutdown.
#[derive(Clone)]
pub enum ActiveSource {
    Initializer(Arc<dyn Initializer>),
    Synchronizer(Arc<dyn Synchronizer>),
}

impl Closeable for ActiveSource {
    fn close(&self) {
        match self {
            ActiveSource::Initializer(initializer) => initializer.close(),
            ActiveSource::Synchronizer(synchronizer) => synchronizer.close(),
        }
    }
}
