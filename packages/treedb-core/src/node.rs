use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::NodeId;

/// Value of a user-defined column. The core never interprets these beyond the
/// parent column.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(untagged))]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Interpret the value as a parent reference.
    ///
    /// Empty strings and nulls mean "no parent"; integral numbers and numeric
    /// strings are accepted the way form inputs deliver them.
    pub fn as_parent(&self) -> Result<Option<NodeId>> {
        match self {
            FieldValue::Null => Ok(None),
            FieldValue::Integer(v) => Ok(Some(NodeId(*v))),
            FieldValue::Real(v) if v.fract() == 0.0 && v.is_finite() => Ok(Some(NodeId(*v as i64))),
            FieldValue::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                if let Ok(v) = trimmed.parse::<i64>() {
                    return Ok(Some(NodeId(v)));
                }
                match trimmed.parse::<f64>() {
                    Ok(v) if v.fract() == 0.0 && v.is_finite() => Ok(Some(NodeId(v as i64))),
                    _ => Err(Error::Validation(format!("parent id {text:?} is not an integer"))),
                }
            }
            other => Err(Error::Validation(format!(
                "parent id must be an integer or null, got {other:?}"
            ))),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Option<NodeId>> for FieldValue {
    fn from(value: Option<NodeId>) -> Self {
        value.map_or(FieldValue::Null, |id| FieldValue::Integer(id.0))
    }
}

/// Schema-less column payload keyed by column name.
pub type Fields = BTreeMap<String, FieldValue>;

/// One row of the hierarchy table.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct Node {
    pub id: NodeId,
    #[cfg_attr(feature = "serde", serde(default))]
    pub parent_id: Option<NodeId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub order_key: i64,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub fields: Fields,
}

impl Node {
    pub fn new(id: NodeId, parent_id: Option<NodeId>, order_key: i64) -> Self {
        Self {
            id,
            parent_id,
            order_key,
            fields: Fields::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Position of a node among its siblings, as read from the order column.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Sibling {
    pub id: NodeId,
    pub order_key: i64,
}

/// Sort `(order_key, id)` ascending, the canonical sibling order.
pub fn sort_siblings(siblings: &mut [Sibling]) {
    siblings.sort_by_key(|s| (s.order_key, s.id));
}
