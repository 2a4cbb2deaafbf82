//! Table descriptions read through SQLite's schema pragmas.

use std::collections::{HashMap, HashSet};

use log::warn;
use rusqlite::{params, Connection};
use treedb_core::meta::{self, ColumnInfo, ForeignKey, ForeignOption, TableMeta, TableSummary};
use treedb_core::TableSchema;

use crate::storage::{quote_ident, storage_err, to_field_value};

/// Single-column unique indexes, and the multi-column ones by member column.
struct UniqueInfo {
    single: HashSet<String>,
    groups: HashMap<String, Vec<Vec<String>>>,
}

pub(crate) fn table_meta(conn: &Connection, schema: &TableSchema) -> treedb_core::Result<TableMeta> {
    Ok(TableMeta {
        table: schema.table.clone(),
        id_field: schema.id_field.clone(),
        parent_field: schema.parent_field.clone(),
        order_field: schema.order_field.clone(),
        columns: columns(conn, &schema.table)?,
        foreign_keys: foreign_keys(conn, &schema.table)?,
    })
}

/// `PRAGMA table_info` plus unique-index membership, in declaration order.
pub(crate) fn columns(conn: &Connection, table: &str) -> treedb_core::Result<Vec<ColumnInfo>> {
    let unique = unique_info(conn, table)?;
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let declared: Option<String> = row.get(2)?;
            let mut info = ColumnInfo::new(name, declared.as_deref().unwrap_or_default());
            info.not_null = row.get::<_, i64>(3)? != 0;
            info.default_value = row.get(4)?;
            info.primary_key = row.get::<_, i64>(5)? != 0;
            Ok(info)
        })
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;

    Ok(rows
        .into_iter()
        .map(|mut info| {
            info.unique = !info.primary_key && unique.single.contains(&info.name);
            info.unique_groups = unique.groups.get(&info.name).cloned().unwrap_or_default();
            info
        })
        .collect())
}

/// Unique indexes other than the primary key. Indexes over expressions are
/// skipped: their column list does not describe what is unique.
fn unique_info(conn: &Connection, table: &str) -> treedb_core::Result<UniqueInfo> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({})", quote_ident(table)))
        .map_err(storage_err)?;
    let indexes = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;

    let mut info = UniqueInfo {
        single: HashSet::new(),
        groups: HashMap::new(),
    };
    for (name, unique, origin) in indexes {
        if !unique || origin == "pk" {
            continue;
        }
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_info({})", quote_ident(&name)))
            .map_err(storage_err)?;
        let members = stmt
            .query_map([], |row| row.get::<_, Option<String>>(2))
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        let Some(members) = members.into_iter().collect::<Option<Vec<String>>>() else {
            continue;
        };
        match members.as_slice() {
            [] => {}
            [only] => {
                info.single.insert(only.clone());
            }
            _ => {
                for column in &members {
                    let groups = info.groups.entry(column.clone()).or_default();
                    if !groups.contains(&members) {
                        groups.push(members.clone());
                    }
                }
            }
        }
    }
    Ok(info)
}

/// `PRAGMA foreign_key_list`, with label candidates from each referenced
/// table. A key without an explicit target column points at the referenced
/// table's primary key.
fn foreign_keys(conn: &Connection, table: &str) -> treedb_core::Result<Vec<ForeignKey>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))
        .map_err(storage_err)?;
    let links = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;

    let mut keys = Vec::with_capacity(links.len());
    for (ref_table, column, ref_column) in links {
        let target = columns(conn, &ref_table)?;
        let primary = target.iter().find(|c| c.primary_key).map(|c| c.name.clone());
        let Some(ref_column) = ref_column.or_else(|| primary.clone()) else {
            warn!("foreign key {table}.{column} names no target column in {ref_table}; skipped");
            continue;
        };
        keys.push(ForeignKey {
            label_columns: meta::label_columns(&target, &ref_column),
            primary_column: primary.unwrap_or_else(|| ref_column.clone()),
            column,
            table: ref_table,
            ref_column,
        });
    }
    Ok(keys)
}

/// Values of the column `column` references, labelled by the first non-blank
/// label column and ordered by the label columns.
pub(crate) fn foreign_options(
    conn: &Connection,
    table: &str,
    column: &str,
    limit: usize,
) -> treedb_core::Result<Option<Vec<ForeignOption>>> {
    let Some(fk) = foreign_keys(conn, table)?.into_iter().find(|fk| fk.column == column) else {
        return Ok(None);
    };
    let value = quote_ident(&fk.ref_column);
    let mut label_parts: Vec<String> = fk
        .label_columns
        .iter()
        .map(|c| format!("NULLIF(TRIM(CAST({} AS TEXT)), '')", quote_ident(c)))
        .collect();
    label_parts.push(format!("CAST({value} AS TEXT)"));
    let order: Vec<String> = fk.label_columns.iter().map(|c| quote_ident(c)).collect();
    let sql = format!(
        "SELECT COALESCE({label}), {value}, CAST({primary} AS TEXT) FROM {table} ORDER BY {order} LIMIT ?1",
        label = label_parts.join(", "),
        primary = quote_ident(&fk.primary_column),
        table = quote_ident(&fk.table),
        order = if order.is_empty() { value.clone() } else { order.join(", ") },
    );
    let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
    let options = stmt
        .query_map(params![limit as i64], |row| {
            let label: Option<String> = row.get(0)?;
            let value = to_field_value(row.get_ref(1)?);
            let primary: Option<String> = row.get(2)?;
            Ok(ForeignOption {
                label: meta::option_label(label.as_deref(), primary.as_deref()),
                value,
            })
        })
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    Ok(Some(options))
}

/// User tables of the database, case-insensitively by name.
pub(crate) fn list_tables(conn: &Connection) -> treedb_core::Result<Vec<TableSummary>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name COLLATE NOCASE",
        )
        .map_err(storage_err)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;

    Ok(names
        .into_iter()
        .map(|name| {
            let columns = columns(conn, &name)
                .map(|cols| cols.into_iter().map(|c| c.name).collect())
                .unwrap_or_else(|err| {
                    warn!("cannot read columns of {name}: {err}");
                    Vec::new()
                });
            TableSummary { name, columns }
        })
        .collect())
}
