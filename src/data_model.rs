//! Flag and segment models.
//!
//! Only the parts of a definition that matter for data acquisition are modelled: identity,
//! version, and the fields that reference other items (prerequisites and segment-match clauses).
//! Everything else is kept as opaque JSON so that it round-trips unchanged to whoever evaluates
//! flags.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Feature flag definition.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    pub version: u64,
    /// Flags that must evaluate to a specific variation before this flag is evaluated.
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    /// Fields not interpreted by this crate.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: u32,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A single matching condition inside a flag or segment rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    #[serde(default)]
    pub negate: bool,
    /// Fields not interpreted by this crate, e.g. `contextKind`.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Clause {
    pub fn new(
        attribute: impl Into<String>,
        op: Operator,
        values: Vec<serde_json::Value>,
    ) -> Clause {
        Clause {
            attribute: attribute.into(),
            op,
            values,
            negate: false,
            extra: HashMap::new(),
        }
    }

    /// Clause matching users that are included in any of the given segments.
    pub fn matching_segments<I, S>(segment_keys: I) -> Clause
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Clause::new(
            "",
            Operator::SegmentMatch,
            segment_keys
                .into_iter()
                .map(|key| serde_json::Value::String(key.into()))
                .collect(),
        )
    }

    /// Segment keys referenced by this clause. Empty unless this is a segment-match clause.
    ///
    /// Non-string values are ignored.
    pub fn referenced_segments(&self) -> impl Iterator<Item = &str> {
        let values: &[serde_json::Value] = if self.op == Operator::SegmentMatch {
            &self.values
        } else {
            &[]
        };
        values.iter().filter_map(|value| value.as_str())
    }
}

/// Clause operator. Only `segmentMatch` is interpreted here.
///
/// Operators this crate doesn't know about are kept verbatim, so a definition written by a newer
/// service serializes back exactly as it was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
#[allow(missing_docs)]
pub enum Operator {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    GreaterThan,
    SegmentMatch,
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::In => "in",
            Operator::EndsWith => "endsWith",
            Operator::StartsWith => "startsWith",
            Operator::Matches => "matches",
            Operator::Contains => "contains",
            Operator::LessThan => "lessThan",
            Operator::GreaterThan => "greaterThan",
            Operator::SegmentMatch => "segmentMatch",
            Operator::Unknown(op) => op,
        }
    }
}

impl From<String> for Operator {
    fn from(op: String) -> Operator {
        match op.as_str() {
            "in" => Operator::In,
            "endsWith" => Operator::EndsWith,
            "startsWith" => Operator::StartsWith,
            "matches" => Operator::Matches,
            "contains" => Operator::Contains,
            "lessThan" => Operator::LessThan,
            "greaterThan" => Operator::GreaterThan,
            "segmentMatch" => Operator::SegmentMatch,
            _ => Operator::Unknown(op),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> String {
        match op {
            Operator::Unknown(op) => op,
            known => known.as_str().to_owned(),
        }
    }
}

/// User segment definition.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl FeatureFlag {
    /// Create a flag with no prerequisites and no rules.
    pub fn new(key: impl Into<String>, version: u64) -> FeatureFlag {
        FeatureFlag {
            key: key.into(),
            version,
            ..Default::default()
        }
    }

    pub fn with_prerequisite(mut self, key: impl Into<String>, variation: u32) -> FeatureFlag {
        self.prerequisites.push(Prerequisite {
            key: key.into(),
            variation,
            extra: HashMap::new(),
        });
        self
    }

    pub fn with_rule(mut self, clauses: Vec<Clause>) -> FeatureFlag {
        self.rules.push(FlagRule {
            clauses,
            extra: HashMap::new(),
        });
        self
    }
}

impl Segment {
    /// Create a segment with no rules.
    pub fn new(key: impl Into<String>, version: u64) -> Segment {
        Segment {
            key: key.into(),
            version,
            ..Default::default()
        }
    }

    pub fn with_rule(mut self, clauses: Vec<Clause>) -> Segment {
        self.rules.push(SegmentRule {
            clauses,
            extra: HashMap::new(),
        });
        self
    }
}
