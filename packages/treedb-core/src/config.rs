use std::fmt;
use std::path::{Component, Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_TABLE: &str = "tree_nodes";
pub const DEFAULT_ID_FIELD: &str = "id";
pub const DEFAULT_PARENT_FIELD: &str = "parent_id";
pub const DEFAULT_ORDER_FIELD: &str = "sort_order";

/// Connection and field-mapping parameters a session works against.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct Config {
    #[cfg_attr(feature = "serde", serde(alias = "db_path"))]
    pub data_source_path: PathBuf,
    #[cfg_attr(feature = "serde", serde(alias = "table_name"))]
    pub table_name: String,
    #[cfg_attr(feature = "serde", serde(alias = "id_field"))]
    pub id_field: String,
    #[cfg_attr(feature = "serde", serde(alias = "parent_field"))]
    pub parent_field: String,
    #[cfg_attr(
        feature = "serde",
        serde(alias = "order_field", default = "default_order_field")
    )]
    pub order_field: String,
    #[cfg_attr(
        feature = "serde",
        serde(
            alias = "auto_bootstrap",
            default,
            deserialize_with = "deserialize_flag"
        )
    )]
    pub auto_bootstrap: bool,
}

#[cfg(feature = "serde")]
fn default_order_field() -> String {
    DEFAULT_ORDER_FIELD.to_string()
}

#[cfg(feature = "serde")]
fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(flag_value(&value))
}

/// Read a loosely typed JSON flag: booleans, non-zero numbers and the
/// spellings [`parse_bool`] accepts. Anything else is `false`.
#[cfg(feature = "serde")]
pub(crate) fn flag_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => parse_bool(s).unwrap_or(false),
        _ => false,
    }
}

impl Config {
    pub fn new(data_source_path: impl Into<PathBuf>, table_name: impl Into<String>) -> Self {
        Self {
            data_source_path: data_source_path.into(),
            table_name: table_name.into(),
            id_field: DEFAULT_ID_FIELD.to_string(),
            parent_field: DEFAULT_PARENT_FIELD.to_string(),
            order_field: DEFAULT_ORDER_FIELD.to_string(),
            auto_bootstrap: true,
        }
    }

    /// Trim names, require them to be present, and resolve the data source path
    /// against `base_dir`.
    pub fn normalized(&self, base_dir: &Path) -> Result<Self> {
        let required = |label: &str, value: &str| -> Result<String> {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(Error::Validation(format!("{label} must not be empty")));
            }
            Ok(trimmed.to_string())
        };

        let raw_path = self.data_source_path.to_string_lossy();
        let raw_path = required("data source path", &raw_path)?;
        let table_name = required("table name", &self.table_name)?;
        let id_field = required("id field", &self.id_field)?;
        let parent_field = required("parent field", &self.parent_field)?;
        let order_field = required("order field", &self.order_field)?;
        if id_field == parent_field || id_field == order_field || parent_field == order_field {
            return Err(Error::Validation(
                "id, parent and order fields must be distinct columns".into(),
            ));
        }

        Ok(Self {
            data_source_path: resolve_path(base_dir, Path::new(&raw_path)),
            table_name,
            id_field,
            parent_field,
            order_field,
            auto_bootstrap: self.auto_bootstrap,
        })
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.data_source_path, &self.table_name)
    }

    pub fn schema(&self) -> TableSchema {
        TableSchema {
            table: self.table_name.clone(),
            id_field: self.id_field.clone(),
            parent_field: self.parent_field.clone(),
            order_field: self.order_field.clone(),
        }
    }
}

/// Lexically resolve `path` against `base`, folding `.` and `..`.
pub(crate) fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Identity of a (data source, table) pair for exclusivity checks.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResourceKey {
    pub data_source: String,
    pub table: String,
}

impl ResourceKey {
    pub fn new(data_source: &Path, table: &str) -> Self {
        let data_source = data_source.to_string_lossy().into_owned();
        // Case-insensitive filesystems address the same file under any casing.
        let data_source = if cfg!(any(windows, target_os = "macos")) {
            data_source.to_lowercase()
        } else {
            data_source
        };
        Self {
            data_source,
            table: table.trim().to_lowercase(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.data_source, self.table)
    }
}

/// Column mapping used by node stores and patch handling.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableSchema {
    pub table: String,
    pub id_field: String,
    pub parent_field: String,
    pub order_field: String,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            id_field: DEFAULT_ID_FIELD.to_string(),
            parent_field: DEFAULT_PARENT_FIELD.to_string(),
            order_field: DEFAULT_ORDER_FIELD.to_string(),
        }
    }
}

impl TableSchema {
    pub fn is_id_key(&self, key: &str) -> bool {
        key == "id" || key == self.id_field
    }

    pub fn is_parent_key(&self, key: &str) -> bool {
        key == "parentId" || key == self.parent_field
    }

    pub fn is_order_key(&self, key: &str) -> bool {
        key == "orderKey" || key == self.order_field
    }

    /// Whether `key` names one of the structural columns.
    pub fn is_structural(&self, key: &str) -> bool {
        self.is_id_key(key) || self.is_parent_key(key) || self.is_order_key(key)
    }
}

/// Parse the boolean spellings accepted from forms and environment variables.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
