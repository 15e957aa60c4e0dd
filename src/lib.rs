//! `flagsync` acquires feature flag data from a prioritized set of sources and keeps a local store
//! up to date.
//!
//! # Overview
//!
//! `flagsync` is organized as a set of building blocks. Most applications only need the
//! [`DataSystem`] facade, which wires them together.
//!
//! Sources come in two kinds (see [`source`]). An [`Initializer`](source::Initializer) makes a
//! single request and is discarded. A [`Synchronizer`](source::Synchronizer) delivers a stream of
//! results until it is closed. Sources never fail with an error. They report
//! [`SourceResult`](source::SourceResult)s, which carry either a
//! [`ChangeSet`](store_types::ChangeSet) or a status. The [`sources`] module has polling
//! implementations over any blocking transport.
//!
//! [`DataSource`](data_source::DataSource) runs the initializers in order, then rotates through
//! the synchronizers ([`source_manager`]), falling back when the current one stays interrupted and
//! recovering to the primary one after a while ([`conditions`]).
//!
//! [`DataSourceUpdates`](data_source_updates::DataSourceUpdates) writes received data into a
//! [`DataStore`](data_store::DataStore) in dependency order ([`dependencies`]), emits a
//! [`FlagChangeEvent`](status::FlagChangeEvent) for every flag whose evaluation may have changed,
//! and tracks the [data source status](status::DataSourceStatus).
//!
//! [`InMemoryDataStore`](data_store::InMemoryDataStore) is a thread-safe store that hands out
//! immutable snapshots, so readers are never affected by concurrent writes.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with the `flagsync` target.
//! Outages that last longer than the configured timeout are logged at the error level.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod broadcaster;
pub mod conditions;
pub mod data_model;
pub mod data_source;
pub mod data_source_updates;
pub mod data_store;
pub mod data_system;
pub mod dependencies;
pub mod source;
pub mod source_manager;
pub mod sources;
pub mod status;
pub mod store_types;

mod error;

#[cfg(test)]
mod test_util;

pub use data_source::{DataSources, StartOutcome};
pub use data_system::{DataSystem, DataSystemConfig};
pub use error::{Error, Result};
