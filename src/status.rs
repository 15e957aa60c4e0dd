//! Data source status and error reporting types.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

/// Connection state of the data source as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceState {
    /// No data has been received yet. Failures during start-up don't leave this state.
    Initializing,
    /// Data is flowing.
    Valid,
    /// Data was received before, but the source is currently failing.
    Interrupted,
    /// The data source has given up or was shut down.
    Off,
}

/// Kind of a source error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The request could not be made or the connection failed.
    NetworkError,
    /// The service responded with an error status; see [`ErrorInfo::status_code`].
    ErrorResponse,
    /// The payload could not be understood.
    InvalidData,
    /// Data was received but could not be written to the store.
    StoreError,
    Unknown,
}

/// Description of a source or store failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    /// HTTP-style status, for [`ErrorKind::ErrorResponse`].
    pub status_code: Option<u16>,
    pub message: Option<String>,
    pub time: Timestamp,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind) -> ErrorInfo {
        ErrorInfo {
            kind,
            status_code: None,
            message: None,
            time: Utc::now(),
        }
    }

    pub fn from_http_status(status_code: u16) -> ErrorInfo {
        ErrorInfo {
            status_code: Some(status_code),
            ..ErrorInfo::new(ErrorKind::ErrorResponse)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> ErrorInfo {
        self.message = Some(message.into());
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(status_code) = self.status_code {
            write!(f, "({status_code})")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Snapshot of the data source status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When `state` was entered.
    pub state_since: Timestamp,
    /// Most recent error, kept after recovery.
    pub last_error: Option<ErrorInfo>,
}

impl DataSourceStatus {
    pub(crate) fn initializing() -> DataSourceStatus {
        DataSourceStatus {
            state: DataSourceState::Initializing,
            state_since: Utc::now(),
            last_error: None,
        }
    }
}

/// A flag's definition (or the definition of something it depends on) changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlagChangeEvent {
    pub key: String,
}
