//! Everything needed to keep an in-memory copy of flag data up to date.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::broadcaster::{Listener, ListenerId};
use crate::data_source::{DataSource, DataSources, StartOutcome};
use crate::data_source_updates::DataSourceUpdates;
use crate::data_store::InMemoryDataStore;
use crate::status::{DataSourceState, DataSourceStatus, FlagChangeEvent};
use crate::{Error, Result};

/// Configuration for [`DataSystem`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSystemConfig {
    /// How long a synchronizer may stay interrupted before the next one is tried.
    ///
    /// Defaults to [`DataSystemConfig::DEFAULT_FALLBACK_TIMEOUT`].
    pub fallback_timeout: Duration,
    /// How long a non-prime synchronizer is used before going back to the prime one.
    ///
    /// Defaults to [`DataSystemConfig::DEFAULT_RECOVERY_TIMEOUT`].
    pub recovery_timeout: Duration,
    /// How long an outage may last before it is logged as an error. `None` disables outage
    /// logging.
    ///
    /// Defaults to [`DataSystemConfig::DEFAULT_OUTAGE_LOGGING_TIMEOUT`].
    pub outage_logging_timeout: Option<Duration>,
}

impl DataSystemConfig {
    /// Default value for [`DataSystemConfig::fallback_timeout`].
    pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(2 * 60);
    /// Default value for [`DataSystemConfig::recovery_timeout`].
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    /// Default value for [`DataSystemConfig::outage_logging_timeout`].
    pub const DEFAULT_OUTAGE_LOGGING_TIMEOUT: Option<Duration> = Some(Duration::from_secs(60));

    /// Create a new `DataSystemConfig` using default configuration.
    pub fn new() -> DataSystemConfig {
        DataSystemConfig::default()
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> DataSystemConfig {
        self.fallback_timeout = timeout;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> DataSystemConfig {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_outage_logging_timeout(mut self, timeout: Option<Duration>) -> DataSystemConfig {
        self.outage_logging_timeout = timeout;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the fallback or recovery timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.fallback_timeout.is_zero() {
            return Err(Error::InvalidConfiguration("fallback timeout must not be zero"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(Error::InvalidConfiguration("recovery timeout must not be zero"));
        }
        Ok(())
    }
}

impl Default for DataSystemConfig {
    fn default() -> DataSystemConfig {
        DataSystemConfig {
            fallback_timeout: DataSystemConfig::DEFAULT_FALLBACK_TIMEOUT,
            recovery_timeout: DataSystemConfig::DEFAULT_RECOVERY_TIMEOUT,
            outage_logging_timeout: DataSystemConfig::DEFAULT_OUTAGE_LOGGING_TIMEOUT,
        }
    }
}

/// An in-memory store kept up to date by a [`DataSource`].
///
/// # Examples
/// ```no_run
/// # async fn test(sources: flagsync::DataSources) -> flagsync::Result<()> {
/// use flagsync::{DataSystem, DataSystemConfig, StartOutcome};
///
/// let data_system = DataSystem::new(
///     sources,
///     DataSystemConfig::new(),
///     tokio::runtime::Handle::current(),
/// )?;
/// if data_system.start().await != StartOutcome::Initialized {
///     eprintln!("flag data is not available");
/// }
/// # Ok(())
/// # }
/// ```
pub struct DataSystem {
    store: Arc<InMemoryDataStore>,
    updates: Arc<DataSourceUpdates>,
    data_source: DataSource,
}

impl DataSystem {
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(
        sources: DataSources,
        config: DataSystemConfig,
        runtime: Handle,
    ) -> Result<DataSystem> {
        config.validate()?;

        let store = Arc::new(InMemoryDataStore::new());
        let updates = Arc::new(DataSourceUpdates::new(
            store.clone(),
            runtime.clone(),
            config.outage_logging_timeout,
        ));
        let data_source = DataSource::new(sources, updates.clone(), runtime, &config);

        Ok(DataSystem {
            store,
            updates,
            data_source,
        })
    }

    /// See [`DataSource::start`].
    pub fn start(&self) -> impl Future<Output = StartOutcome> + Send + 'static {
        self.data_source.start()
    }

    pub fn is_initialized(&self) -> bool {
        self.data_source.is_initialized()
    }

    pub fn is_fdv1_fallback_active(&self) -> bool {
        self.data_source.is_fdv1_fallback_active()
    }

    /// Stop updating the store. The store keeps its last contents.
    pub fn close(&self) {
        self.data_source.close();
    }

    pub fn store(&self) -> &Arc<InMemoryDataStore> {
        &self.store
    }

    pub fn updates(&self) -> &Arc<DataSourceUpdates> {
        &self.updates
    }

    pub fn status(&self) -> DataSourceStatus {
        self.updates.status()
    }

    /// See [`DataSourceUpdates::wait_for`].
    pub async fn wait_for(&self, state: DataSourceState, timeout: Duration) -> bool {
        self.updates.wait_for(state, timeout).await
    }

    pub fn add_flag_change_listener(
        &self,
        listener: impl Listener<FlagChangeEvent> + 'static,
    ) -> ListenerId {
        self.updates.add_flag_change_listener(listener)
    }

    pub fn add_status_listener(
        &self,
        listener: impl Listener<DataSourceStatus> + 'static,
    ) -> ListenerId {
        self.updates.add_status_listener(listener)
    }
}
