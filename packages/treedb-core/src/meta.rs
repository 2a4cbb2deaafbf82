//! Table descriptions for building forms over the schema-less columns.
//!
//! Stores report what they know about their own table through
//! [`NodeTx::table_meta`](crate::traits::NodeTx::table_meta); the helpers here
//! turn raw column declarations into the same answers for every backend.

use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::node::FieldValue;

/// Most options returned for one foreign-key column.
pub const FOREIGN_OPTION_LIMIT: usize = 500;

/// Editor class of a column, derived from its declared type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(rename_all = "lowercase"))]
pub enum ColumnKind {
    Integer,
    Float,
    Boolean,
    Text,
}

impl ColumnKind {
    /// Classify a declared SQL type by substring, the way SQLite's affinity
    /// rules read it. Anything unrecognised is text.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("BOOL") {
            ColumnKind::Boolean
        } else if upper.contains("INT") {
            ColumnKind::Integer
        } else if ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"]
            .iter()
            .any(|hint| upper.contains(hint))
        {
            ColumnKind::Float
        } else {
            ColumnKind::Text
        }
    }

    /// Kind of a stored value, for stores without declared types.
    pub fn of_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Null => None,
            FieldValue::Bool(_) => Some(ColumnKind::Boolean),
            FieldValue::Integer(_) => Some(ColumnKind::Integer),
            FieldValue::Real(_) => Some(ColumnKind::Float),
            FieldValue::Text(_) => Some(ColumnKind::Text),
        }
    }

    fn is_text(declared: &str) -> bool {
        let upper = declared.to_ascii_uppercase();
        upper.is_empty() || ["CHAR", "TEXT", "CLOB"].iter().any(|t| upper.contains(t))
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(rename_all = "camelCase"))]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type, upper-cased; empty when the column has none.
    pub declared_type: String,
    pub kind: ColumnKind,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
    /// Covered by a single-column unique index.
    pub unique: bool,
    /// Multi-column unique indexes this column takes part in.
    pub unique_groups: Vec<Vec<String>>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, declared_type: &str) -> Self {
        let declared_type = declared_type.trim().to_ascii_uppercase();
        Self {
            name: name.into(),
            kind: ColumnKind::from_declared(&declared_type),
            declared_type,
            not_null: false,
            default_value: None,
            primary_key: false,
            unique: false,
            unique_groups: Vec::new(),
        }
    }
}

/// A foreign-key column of the node table and how to label its targets.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(rename_all = "camelCase"))]
pub struct ForeignKey {
    pub column: String,
    pub table: String,
    pub ref_column: String,
    /// Columns of the referenced table tried in turn for a display label.
    pub label_columns: Vec<String>,
    pub primary_column: String,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(rename_all = "camelCase"))]
pub struct TableMeta {
    pub table: String,
    pub id_field: String,
    pub parent_field: String,
    pub order_field: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableMeta {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }
}

/// One selectable value of a foreign-key column.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ForeignOption {
    pub value: FieldValue,
    pub label: String,
}

/// A table of a data source with its column names in declaration order.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TableSummary {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(rename_all = "camelCase"))]
pub struct TableListing {
    pub data_source_path: PathBuf,
    pub tables: Vec<TableSummary>,
}

const LABEL_HINTS: [&str; 7] = ["name", "title", "label", "desc", "description", "text", "display"];
const NON_LABEL_HINTS: [&str; 14] = [
    "order", "sort", "rank", "idx", "index", "sequence", "seq", "position", "pos", "step",
    "flag", "status", "code", "id",
];

/// Rank the columns of a referenced table as label candidates.
///
/// Name-like columns come first, then other text, then everything else, and
/// key-like columns last. The primary key and `ref_column` close the list so a
/// label always exists.
pub fn label_columns(columns: &[ColumnInfo], ref_column: &str) -> Vec<String> {
    let mut preferred = Vec::new();
    let mut text = Vec::new();
    let mut other = Vec::new();
    let mut keyish = Vec::new();
    let mut primary = None;
    for column in columns {
        if column.primary_key {
            primary = Some(column.name.clone());
            continue;
        }
        if column.name == ref_column {
            continue;
        }
        let lowered = column.name.to_lowercase();
        if LABEL_HINTS.iter().any(|h| lowered.contains(h)) {
            preferred.push(column.name.clone());
        } else if NON_LABEL_HINTS.iter().any(|h| lowered.contains(h)) {
            keyish.push(column.name.clone());
        } else if ColumnKind::is_text(&column.declared_type) {
            text.push(column.name.clone());
        } else {
            other.push(column.name.clone());
        }
    }

    let mut ordered: Vec<String> = Vec::new();
    let tail = primary.into_iter().chain(std::iter::once(ref_column.to_string()));
    for name in preferred.into_iter().chain(text).chain(other).chain(keyish).chain(tail) {
        if !ordered.contains(&name) {
            ordered.push(name);
        }
    }
    ordered
}

/// Display label for a foreign option: the label text, tagged with the
/// target's id when the two differ.
pub fn option_label(label: Option<&str>, id: Option<&str>) -> String {
    let text = label.map(str::trim).unwrap_or_default();
    let id = id.map(str::trim).unwrap_or_default();
    if id.is_empty() {
        return text.to_string();
    }
    if text.is_empty() {
        return id.to_string();
    }
    let lowered = text.to_lowercase();
    let id_lowered = id.to_lowercase();
    if id_lowered == lowered || id_lowered == format!("({lowered})") {
        return text.to_string();
    }
    format!("{text} (#{id})")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, declared: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            primary_key: pk,
            ..ColumnInfo::new(name, declared)
        }
    }

    #[test]
    fn declared_types_map_to_kinds() {
        assert_eq!(ColumnKind::from_declared("bigint"), ColumnKind::Integer);
        assert_eq!(ColumnKind::from_declared("DOUBLE PRECISION"), ColumnKind::Float);
        assert_eq!(ColumnKind::from_declared("decimal(10,2)"), ColumnKind::Float);
        assert_eq!(ColumnKind::from_declared("BOOLEAN"), ColumnKind::Boolean);
        assert_eq!(ColumnKind::from_declared("VARCHAR(20)"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_declared(""), ColumnKind::Text);
    }

    #[test]
    fn label_columns_prefer_names_over_codes() {
        let columns = [
            column("dept_id", "INTEGER", true),
            column("budget", "REAL", false),
            column("sort_code", "TEXT", false),
            column("notes", "TEXT", false),
            column("dept_name", "TEXT", false),
        ];
        assert_eq!(
            label_columns(&columns, "dept_id"),
            vec!["dept_name", "notes", "budget", "sort_code", "dept_id"]
        );
    }

    #[test]
    fn label_columns_end_with_the_referenced_column() {
        let columns = [column("code", "TEXT", false), column("rowid_pk", "INTEGER", true)];
        assert_eq!(label_columns(&columns, "code"), vec!["rowid_pk", "code"]);
    }

    #[test]
    fn option_labels_tag_distinct_ids() {
        assert_eq!(option_label(Some("Sales"), Some("3")), "Sales (#3)");
        assert_eq!(option_label(Some(" 3 "), Some("3")), "3");
        assert_eq!(option_label(None, Some("7")), "7");
        assert_eq!(option_label(Some("Ops"), None), "Ops");
        assert_eq!(option_label(Some(""), Some("")), "");
    }
}
