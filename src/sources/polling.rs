//! Polling initializer and synchronizer.
//!
//! Both are built on a [`Requestor`], a blocking transport that performs a single request for the
//! data at a given selector. The polling synchronizer runs the requestor on a background thread at
//! a jittered interval and queues every result for [`Synchronizer::next`].
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use super::queue::ResultQueue;
use crate::source::{
    Closeable, Initializer, InitializerFactory, PendingResult, ResultSender, SourceResult,
    SourceState, Synchronizer, SynchronizerFactory,
};
use crate::status::{ErrorInfo, ErrorKind};
use crate::store_types::{ChangeSet, Selector};

/// Successful response to a poll request.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResponse {
    pub change_set: ChangeSet,
    /// The service asked the client to fall back to the FDv1 protocol.
    pub fdv1_fallback: bool,
}

impl From<ChangeSet> for PollResponse {
    fn from(change_set: ChangeSet) -> Self {
        PollResponse {
            change_set,
            fdv1_fallback: false,
        }
    }
}

/// Failure of a poll request.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// The service responded with a non-success HTTP status.
    #[error("received HTTP status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    /// The response could not be parsed.
    #[error("malformed response: {0}")]
    InvalidData(String),
    #[error("{0}")]
    Unknown(String),
}

/// Blocking transport used by the polling sources.
pub trait Requestor: Send + Sync + 'static {
    /// Request the data that changed since `selector`. An empty selector requests everything.
    fn request(&self, selector: &Selector) -> Result<PollResponse, RequestError>;
}

impl<T> Requestor for T
where
    T: Fn(&Selector) -> Result<PollResponse, RequestError> + Send + Sync + 'static,
{
    fn request(&self, selector: &Selector) -> Result<PollResponse, RequestError> {
        self(selector)
    }
}

/// Whether a request that failed with HTTP `status` is worth retrying.
///
/// Client errors mean the request itself is wrong, except for a few that are transient.
pub fn is_http_error_recoverable(status: u16) -> bool {
    match status {
        400..=499 => matches!(status, 400 | 408 | 429),
        _ => true,
    }
}

/// Run one request and convert its outcome into a source result.
///
/// For a one-shot request every failure is terminal.
fn poll(requestor: &dyn Requestor, selector: &Selector, one_shot: bool) -> SourceResult {
    let err = match requestor.request(selector) {
        Ok(response) => {
            let result = SourceResult::change_set(response.change_set);
            return if response.fdv1_fallback {
                result.with_fdv1_fallback()
            } else {
                result
            };
        }
        Err(err) => err,
    };

    let (error_info, recoverable) = match &err {
        RequestError::Http(status) => {
            log::error!(target: "flagsync", "polling request failed with HTTP error: {status}");
            (
                ErrorInfo::from_http_status(*status),
                is_http_error_recoverable(*status),
            )
        }
        RequestError::Network(message) => {
            log::warn!(target: "flagsync", "polling request failed with network error: {message}");
            (
                ErrorInfo::new(ErrorKind::NetworkError).with_message(message.clone()),
                true,
            )
        }
        RequestError::InvalidData(message) => {
            log::error!(target: "flagsync", "polling request received malformed data: {message}");
            (
                ErrorInfo::new(ErrorKind::InvalidData).with_message(message.clone()),
                true,
            )
        }
        RequestError::Unknown(message) => {
            log::error!(target: "flagsync", "polling request failed: {message}");
            (
                ErrorInfo::new(ErrorKind::Unknown).with_message(message.clone()),
                true,
            )
        }
    };

    if one_shot || !recoverable {
        SourceResult::terminal_error(error_info)
    } else {
        SourceResult::interrupted(error_info)
    }
}

/// Timing of [`PollingSynchronizer`] requests.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Time between the end of one request and the start of the next, before jitter.
    pub interval: Duration,
    /// Upper bound of the random amount taken off each `interval`, so that many clients started
    /// together drift apart.
    pub jitter: Duration,
}

impl PollingConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    pub fn new() -> PollingConfig {
        PollingConfig::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> PollingConfig {
        self.interval = interval;
        self
    }

    /// A zero `jitter` makes polling strictly periodic.
    pub fn with_jitter(mut self, jitter: Duration) -> PollingConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollingConfig {
    fn default() -> PollingConfig {
        PollingConfig {
            interval: PollingConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollingConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// Initializer performing a single poll request on a background thread.
pub struct PollingInitializer {
    requestor: Arc<dyn Requestor>,
    /// Taken by whichever comes first: the request completing or `close()`.
    sender: Arc<Mutex<Option<ResultSender>>>,
}

impl PollingInitializer {
    pub fn new(requestor: Arc<dyn Requestor>) -> PollingInitializer {
        PollingInitializer {
            requestor,
            sender: Arc::new(Mutex::new(None)),
        }
    }

    pub fn factory(requestor: Arc<dyn Requestor>) -> InitializerFactory {
        Arc::new(move || -> Arc<dyn Initializer> {
            Arc::new(PollingInitializer::new(requestor.clone()))
        })
    }
}

impl Initializer for PollingInitializer {
    fn run(&self) -> PendingResult {
        let (sender, pending) = PendingResult::channel();
        *lock_sender(&self.sender) = Some(sender);

        let requestor = self.requestor.clone();
        let slot = self.sender.clone();
        let spawned = std::thread::Builder::new()
            .name("flagsync-initializer".to_owned())
            .spawn(move || {
                let result = poll(&*requestor, &Selector::EMPTY, true);
                if let Some(sender) = lock_sender(&slot).take() {
                    let _ = sender.send(result);
                }
            });

        if let Err(err) = spawned {
            log::error!(target: "flagsync", "failed to start initializer thread: {err}");
            if let Some(sender) = lock_sender(&self.sender).take() {
                let _ = sender.send(SourceResult::terminal_error(
                    ErrorInfo::new(ErrorKind::Unknown).with_message(err.to_string()),
                ));
            }
        }

        pending
    }
}

impl Closeable for PollingInitializer {
    fn close(&self) {
        if let Some(sender) = lock_sender(&self.sender).take() {
            let _ = sender.send(SourceResult::shutdown());
        }
    }
}

fn lock_sender(
    slot: &Mutex<Option<ResultSender>>,
) -> std::sync::MutexGuard<'_, Option<ResultSender>> {
    slot.lock()
        .expect("thread holding initializer lock should not panic")
}

/// Synchronizer polling on a background thread.
///
/// The first request is made immediately. After each change set the selector it carries is used
/// for the following request. A non-recoverable failure is delivered as a terminal error and stops
/// the thread.
pub struct PollingSynchronizer {
    queue: Arc<ResultQueue>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl PollingSynchronizer {
    /// Starts the poller thread.
    ///
    /// If the thread cannot be started, the synchronizer reports a terminal error on the first
    /// call to `next()`.
    pub fn start(requestor: Arc<dyn Requestor>, config: PollingConfig) -> PollingSynchronizer {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 is enough as we're sending a stop command, and we can simply
        // `try_send()` and ignore if the buffer is full.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let queue = Arc::new(ResultQueue::new());

        let spawned = {
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("flagsync-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let mut selector = Selector::EMPTY;
                        loop {
                            log::debug!(target: "flagsync", "polling for changes");
                            let result = poll(&*requestor, &selector, false);
                            let terminal = match &result {
                                SourceResult::ChangeSet { change_set, .. } => {
                                    if !change_set.selector.is_empty() {
                                        selector = change_set.selector.clone();
                                    }
                                    false
                                }
                                SourceResult::Status { status, .. } => {
                                    status.state == SourceState::TerminalError
                                }
                            };
                            if terminal {
                                queue.put(result);
                                queue.close();
                                return;
                            }
                            if !queue.put(result) {
                                // Closed.
                                return;
                            }

                            let timeout = next_poll_delay(&config);
                            match stop_receiver.recv_timeout(timeout) {
                                Err(RecvTimeoutError::Timeout) => {
                                    // Timed out. Loop back to poll again.
                                }
                                Ok(()) => {
                                    log::debug!(target: "flagsync", "poller thread received stop command");
                                    return;
                                }
                                Err(RecvTimeoutError::Disconnected) => {
                                    log::debug!(target: "flagsync", "poller thread received disconnected");
                                    return;
                                }
                            }
                        }
                    }));

                    // If catch_unwind returns Err, it means a panic occurred.
                    if result.is_err() {
                        queue.put(SourceResult::terminal_error(
                            ErrorInfo::new(ErrorKind::Unknown).with_message("poller thread panicked"),
                        ));
                        queue.close();
                    }
                })
        };

        if let Err(err) = spawned {
            log::error!(target: "flagsync", "failed to start poller thread: {err}");
            queue.put(SourceResult::terminal_error(
                ErrorInfo::new(ErrorKind::Unknown).with_message(err.to_string()),
            ));
            queue.close();
        }

        PollingSynchronizer { queue, stop_sender }
    }

    pub fn factory(requestor: Arc<dyn Requestor>, config: PollingConfig) -> SynchronizerFactory {
        Arc::new(move || -> Arc<dyn Synchronizer> {
            Arc::new(PollingSynchronizer::start(requestor.clone(), config.clone()))
        })
    }
}

impl Synchronizer for PollingSynchronizer {
    fn next(&self) -> PendingResult {
        self.queue.take()
    }
}

impl Closeable for PollingSynchronizer {
    /// Stop the poller thread. Does not wait for the thread to exit.
    fn close(&self) {
        // Error means that the receiver was dropped (thread exited) or the buffer is full (another
        // thread already sent a stop command). Both can be ignored.
        let _ = self.stop_sender.try_send(());
        self.queue.close();
    }
}

/// The configured interval, shortened by a random amount of up to the configured jitter.
fn next_poll_delay(config: &PollingConfig) -> Duration {
    let spread = thread_rng().gen_range(Duration::ZERO..=config.jitter);
    config.interval.saturating_sub(spread)
}
