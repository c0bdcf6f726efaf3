//! Query descriptors passed to a [`ChangeSource`](crate::ChangeSource).
//!
//! A [`FeedQuery`] is plain data: which collection to watch, which change kind the
//! consumer cares about, and the field predicates the store should apply.

use std::cmp::Ordering;

use feedcast_shared::{ChangeKind, DocumentSnapshot, FeedcastError, PipelineEntry, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator of a [`Where`] predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl std::str::FromStr for Op {
    type Err = FeedcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "==" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            "<" => Ok(Self::Less),
            "<=" => Ok(Self::LessOrEqual),
            ">" => Ok(Self::Greater),
            ">=" => Ok(Self::GreaterOrEqual),
            other => Err(FeedcastError::validation(format!(
                "unknown filter operator '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
        };
        f.write_str(s)
    }
}

/// A single `field op value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Where {
    /// Dotted field path.
    pub path: String,
    pub op: Op,
    pub value: Value,
}

impl Where {
    /// Evaluate against a document. A missing field never matches.
    pub fn matches(&self, doc: &DocumentSnapshot) -> bool {
        let Some(field) = doc.field(&self.path) else {
            return false;
        };
        let Some(ordering) = compare(field, &self.value) else {
            // Incomparable types only satisfy `!=`.
            return self.op == Op::NotEqual;
        };
        match self.op {
            Op::Equal => ordering == Ordering::Equal,
            Op::NotEqual => ordering != Ordering::Equal,
            Op::Less => ordering == Ordering::Less,
            Op::LessOrEqual => ordering != Ordering::Greater,
            Op::Greater => ordering == Ordering::Greater,
            Op::GreaterOrEqual => ordering != Ordering::Less,
        }
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

/// What to watch and which changes to forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedQuery {
    /// Collection to watch.
    pub collection: String,
    /// Change kind forwarded by the adapter.
    pub kind: ChangeKind,
    /// Predicates evaluated by the store.
    #[serde(default)]
    pub filters: Vec<Where>,
}

impl FeedQuery {
    /// Watch `collection` for newly added documents.
    pub fn added_in(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            kind: ChangeKind::Added,
            filters: Vec::new(),
        }
    }

    /// Forward a different change kind.
    pub fn with_kind(mut self, kind: ChangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add a predicate.
    pub fn filter(mut self, path: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.filters.push(Where {
            path: path.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Whether an existing document belongs to this query's result set.
    pub fn matches(&self, doc: &DocumentSnapshot) -> bool {
        doc.exists
            && doc.path.split('/').next() == Some(self.collection.as_str())
            && self.filters.iter().all(|w| w.matches(doc))
    }
}

impl TryFrom<&PipelineEntry> for FeedQuery {
    type Error = FeedcastError;

    fn try_from(entry: &PipelineEntry) -> Result<Self> {
        let kind = entry.kind.parse::<ChangeKind>().map_err(|e| {
            FeedcastError::validation(format!("pipeline '{}': {e}", entry.name))
        })?;

        let mut query = Self::added_in(&entry.collection).with_kind(kind);
        for filter in &entry.filters {
            let op = filter.op.parse::<Op>()?;
            query = query.filter(&filter.path, op, filter.value.clone());
        }
        Ok(query)
    }
}
