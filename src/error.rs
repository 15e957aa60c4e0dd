/// Represents a result type for operations in this crate.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while acquiring and applying flag data.
///
/// Source-level failures (network errors, bad responses) are never reported through this type.
/// Sources convert them into [`SourceResult`](crate::source::SourceResult) statuses and the
/// orchestrator treats them as data. Only local failures (the store, bad configuration) surface
/// as `Error`.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The data store rejected a write as a whole (not a single stale item).
    #[error("data store error: {0}")]
    Store(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
}
