//! Reusable building blocks for implementing sources.
//!
//! [`ResultQueue`] decouples a producer thread from the asynchronous `next()` consumer.
//! [`PollingInitializer`] and [`PollingSynchronizer`] implement the polling protocol on top of any
//! blocking [`Requestor`]; the HTTP client itself is supplied by the application.
mod polling;
mod queue;

pub use polling::{
    is_http_error_recoverable, PollResponse, PollingConfig, PollingInitializer,
    PollingSynchronizer, RequestError, Requestor,
};
pub use queue::ResultQueue;
