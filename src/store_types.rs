//! Types shared between sources, the change-application layer, and data stores.
use std::sync::Arc;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::data_model::{FeatureFlag, Segment};

/// Kind of a stored item.
///
/// `Features` and `Segments` are understood by the dependency graph. Any other kind is passed
/// through untouched and ordered after the known ones.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    #[display("segments")]
    Segments,
    #[display("features")]
    Features,
    #[display("{_0}")]
    Other(String),
}

impl DataKind {
    /// Relative order in which kinds must be written so that no item is written before an item it
    /// depends on. Unknown kinds have no priority.
    pub(crate) fn priority(&self) -> Option<u8> {
        match self {
            DataKind::Segments => Some(0),
            DataKind::Features => Some(1),
            DataKind::Other(_) => None,
        }
    }
}

/// A stored item value.
#[derive(Debug, Clone, PartialEq, From)]
pub enum Item {
    Flag(Arc<FeatureFlag>),
    Segment(Arc<Segment>),
    /// Item of a kind not modelled by this crate.
    Other(Arc<serde_json::Value>),
}

impl From<FeatureFlag> for Item {
    fn from(value: FeatureFlag) -> Self {
        Item::Flag(Arc::new(value))
    }
}

impl From<Segment> for Item {
    fn from(value: Segment) -> Self {
        Item::Segment(Arc::new(value))
    }
}

impl From<serde_json::Value> for Item {
    fn from(value: serde_json::Value) -> Self {
        Item::Other(Arc::new(value))
    }
}

/// Versioned item, or a deletion record when `item` is `None`.
///
/// Deletion records are stored like any other item so that a stale write that arrives later is
/// rejected by the version check.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<Item>,
}

impl ItemDescriptor {
    pub fn new(version: u64, item: impl Into<Item>) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: Some(item.into()),
        }
    }

    /// Deletion record ("tombstone") at `version`.
    pub fn deleted(version: u64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.item.is_none()
    }
}

impl From<FeatureFlag> for ItemDescriptor {
    fn from(flag: FeatureFlag) -> Self {
        ItemDescriptor::new(flag.version, flag)
    }
}

impl From<Segment> for ItemDescriptor {
    fn from(segment: Segment) -> Self {
        ItemDescriptor::new(segment.version, segment)
    }
}

/// Items of one kind, in order.
pub type KeyedItems = Vec<(String, ItemDescriptor)>;

/// Complete contents of a store.
#[derive(Debug, Clone, PartialEq)]
pub struct FullDataSet {
    pub data: Vec<(DataKind, KeyedItems)>,
    /// `false` when the data must update the in-memory view but not a durable backing store.
    pub should_persist: bool,
}

impl FullDataSet {
    pub fn new(data: Vec<(DataKind, KeyedItems)>) -> FullDataSet {
        FullDataSet {
            data,
            should_persist: true,
        }
    }
}

/// Opaque server-issued cursor identifying the point to resume from.
///
/// The `state` string is passed through unparsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Selector {
    pub version: u64,
    pub state: String,
}

impl Selector {
    /// Selector of a change set that has no basis yet.
    pub const EMPTY: Selector = Selector {
        version: 0,
        state: String::new(),
    };

    pub fn new(version: u64, state: impl Into<String>) -> Selector {
        Selector {
            version,
            state: state.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version == 0 && self.state.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetType {
    /// The data is the complete state; everything else is removed.
    Full,
    /// Incremental updates; anything not mentioned is unchanged.
    Partial,
    /// No data. Used by sources to signal "still up to date".
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub change_set_type: ChangeSetType,
    pub selector: Selector,
    pub data: Vec<(DataKind, KeyedItems)>,
    pub environment_id: Option<String>,
    pub should_persist: bool,
}

impl ChangeSet {
    pub fn full(selector: Selector, data: Vec<(DataKind, KeyedItems)>) -> ChangeSet {
        ChangeSet {
            change_set_type: ChangeSetType::Full,
            selector,
            data,
            environment_id: None,
            should_persist: true,
        }
    }

    pub fn partial(selector: Selector, data: Vec<(DataKind, KeyedItems)>) -> ChangeSet {
        ChangeSet {
            change_set_type: ChangeSetType::Partial,
            ..ChangeSet::full(selector, data)
        }
    }

    pub fn none(selector: Selector) -> ChangeSet {
        ChangeSet {
            change_set_type: ChangeSetType::None,
            ..ChangeSet::full(selector, Vec::new())
        }
    }

    pub fn with_environment_id(mut self, environment_id: impl Into<String>) -> ChangeSet {
        self.environment_id = Some(environment_id.into());
        self
    }

    pub fn with_should_persist(mut self, should_persist: bool) -> ChangeSet {
        self.should_persist = should_persist;
        self
    }
}

impl From<ChangeSet> for FullDataSet {
    fn from(change_set: ChangeSet) -> Self {
        FullDataSet {
            data: change_set.data,
            should_persist: change_set.should_persist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DataKind, Selector};

    #[test]
    fn empty_selector() {
        assert!(Selector::EMPTY.is_empty());
        assert!(Selector::default().is_empty());
        assert!(!Selector::new(0, "p:abc").is_empty());
        assert!(!Selector::new(7, "").is_empty());
    }

    #[test]
    fn data_kind_display() {
        assert_eq!(DataKind::Features.to_string(), "features");
        assert_eq!(DataKind::Other("configs".into()).to_string(), "configs");
    }
}
