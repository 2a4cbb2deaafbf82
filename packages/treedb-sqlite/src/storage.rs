use std::collections::BTreeSet;

use log::debug;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use treedb_core::{
    error::Error,
    meta::{ForeignOption, TableMeta},
    node::{sort_siblings, FieldValue, Fields, Node, Sibling},
    traits::{NodeStore, NodeTx},
    NodeId, TableSchema,
};

use crate::introspect;

/// Key the unique sibling index uses for root rows, whose parent is NULL.
const ROOT_PARENT_SENTINEL: i64 = -1;

pub(crate) fn storage_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `NodeStore` over one table of a SQLite connection.
pub struct SqliteNodeStore {
    conn: Connection,
    schema: TableSchema,
}

impl SqliteNodeStore {
    /// A fresh in-memory database with an empty node table.
    pub fn open_in_memory(schema: TableSchema) -> treedb_core::Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        let store = Self { conn, schema };
        store.create_table()?;
        Ok(store)
    }

    /// Wrap an open connection. The caller checks or creates the table.
    pub(crate) fn from_connection(conn: Connection, schema: TableSchema) -> Self {
        Self { conn, schema }
    }

    pub(crate) fn table_exists(&self) -> treedb_core::Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                params![self.schema.table],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count > 0)
    }

    pub(crate) fn table_columns(&self) -> treedb_core::Result<BTreeSet<String>> {
        table_columns(&self.conn, &self.schema.table)
    }

    /// Create the node table with the mapped column names and its indexes.
    pub(crate) fn create_table(&self) -> treedb_core::Result<()> {
        let s = &self.schema;
        let table = quote_ident(&s.table);
        let id = quote_ident(&s.id_field);
        let parent = quote_ident(&s.parent_field);
        let order = quote_ident(&s.order_field);
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    {id} INTEGER PRIMARY KEY AUTOINCREMENT,
                    {parent} INTEGER DEFAULT NULL,
                    {order} INTEGER NOT NULL DEFAULT 0,
                    name TEXT DEFAULT ''
                );
                CREATE INDEX IF NOT EXISTS {parent_idx} ON {table} ({parent});",
                parent_idx = quote_ident(&format!("idx_{}_{}", s.table, s.parent_field)),
            ))
            .map_err(storage_err)?;
        self.create_sibling_index()?;
        debug!("created node table {}", s.table);
        Ok(())
    }

    /// Unique `(parent, order)` index. Root rows share a sentinel parent so
    /// their keys are unique too.
    pub(crate) fn create_sibling_index(&self) -> treedb_core::Result<()> {
        let s = &self.schema;
        self.conn
            .execute_batch(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {idx} ON {table} (COALESCE({parent}, {ROOT_PARENT_SENTINEL}), {order});",
                idx = quote_ident(&format!("idx_{}_{}_order", s.table, s.parent_field)),
                table = quote_ident(&s.table),
                parent = quote_ident(&s.parent_field),
                order = quote_ident(&s.order_field),
            ))
            .map_err(storage_err)
    }

    /// Add the order column to an existing table and number each sibling
    /// group from its current id order.
    pub(crate) fn add_order_column(&self) -> treedb_core::Result<()> {
        let s = &self.schema;
        let table = quote_ident(&s.table);
        let order = quote_ident(&s.order_field);
        self.conn
            .execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN {order} INTEGER NOT NULL DEFAULT 0;
                UPDATE {table} SET {order} = {id} * {gap};",
                id = quote_ident(&s.id_field),
                gap = treedb_core::order_key::GAP,
            ))
            .map_err(storage_err)?;
        self.create_sibling_index()?;
        debug!("added order column {} to {}", s.order_field, s.table);
        Ok(())
    }

    /// Insert the root row of a freshly created table.
    pub(crate) fn seed_root(&self) -> treedb_core::Result<()> {
        let s = &self.schema;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {table} ({id}, {parent}, {order}, name) VALUES (1, NULL, ?1, 'Root')",
                    table = quote_ident(&s.table),
                    id = quote_ident(&s.id_field),
                    parent = quote_ident(&s.parent_field),
                    order = quote_ident(&s.order_field),
                ),
                params![treedb_core::order_key::BASE],
            )
            .map_err(storage_err)?;
        Ok(())
    }
}

impl NodeStore for SqliteNodeStore {
    type Tx<'a> = SqliteTx<'a>;

    fn begin(&mut self) -> treedb_core::Result<SqliteTx<'_>> {
        let Self { conn, schema } = self;
        let tx = conn.transaction().map_err(storage_err)?;
        Ok(SqliteTx { tx, schema })
    }

    fn schema(&self) -> &TableSchema {
        &self.schema
    }
}

/// One SQLite transaction. Dropped without commit, it rolls back.
pub struct SqliteTx<'a> {
    tx: Transaction<'a>,
    schema: &'a TableSchema,
}

impl SqliteTx<'_> {
    fn table(&self) -> String {
        quote_ident(&self.schema.table)
    }

    fn select_nodes(&self, filter: &str, params: &[&dyn rusqlite::ToSql]) -> treedb_core::Result<Vec<Node>> {
        let sql = format!(
            "SELECT * FROM {table} {filter} ORDER BY {order}, {id}",
            table = self.table(),
            order = quote_ident(&self.schema.order_field),
            id = quote_ident(&self.schema.id_field),
        );
        let mut stmt = self.tx.prepare(&sql).map_err(storage_err)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params).map_err(storage_err)?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next().map_err(storage_err)? {
            let mut values = Vec::with_capacity(names.len());
            for i in 0..names.len() {
                values.push(to_field_value(row.get_ref(i).map_err(storage_err)?));
            }
            nodes.push(self.row_to_node(&names, values)?);
        }
        Ok(nodes)
    }

    fn row_to_node(&self, names: &[String], values: Vec<FieldValue>) -> treedb_core::Result<Node> {
        let mut id = None;
        let mut parent = None;
        let mut order_key = 0;
        let mut fields = Fields::new();
        for (name, value) in names.iter().zip(values) {
            if *name == self.schema.id_field {
                id = value.as_parent()?;
            } else if *name == self.schema.parent_field {
                parent = value.as_parent()?;
            } else if *name == self.schema.order_field {
                order_key = match value {
                    FieldValue::Integer(v) => v,
                    FieldValue::Real(v) => v as i64,
                    _ => 0,
                };
            } else {
                fields.insert(name.clone(), value);
            }
        }
        let id = id.ok_or_else(|| {
            Error::Store(format!("row without {} in {}", self.schema.id_field, self.schema.table))
        })?;
        Ok(Node {
            id,
            parent_id: parent,
            order_key,
            fields,
        })
    }
}

pub(crate) fn to_field_value(value: ValueRef<'_>) -> FieldValue {
    match value {
        ValueRef::Null => FieldValue::Null,
        ValueRef::Integer(v) => FieldValue::Integer(v),
        ValueRef::Real(v) => FieldValue::Real(v),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            FieldValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Integer(i64::from(*b)),
        FieldValue::Integer(v) => Value::Integer(*v),
        FieldValue::Real(v) => Value::Real(*v),
        FieldValue::Text(s) => Value::Text(s.clone()),
    }
}

fn table_columns(conn: &Connection, table: &str) -> treedb_core::Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
        .map_err(storage_err)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(storage_err)?
        .collect::<rusqlite::Result<BTreeSet<String>>>()
        .map_err(storage_err)?;
    Ok(names)
}

impl NodeTx for SqliteTx<'_> {
    fn columns(&mut self) -> treedb_core::Result<Option<BTreeSet<String>>> {
        table_columns(&self.tx, &self.schema.table).map(Some)
    }

    fn fetch_all(&mut self) -> treedb_core::Result<Vec<Node>> {
        self.select_nodes("", &[])
    }

    fn fetch(&mut self, id: NodeId) -> treedb_core::Result<Option<Node>> {
        let filter = format!("WHERE {} = ?1", quote_ident(&self.schema.id_field));
        Ok(self.select_nodes(&filter, &[&id.0])?.into_iter().next())
    }

    fn parent_of(&mut self, id: NodeId) -> treedb_core::Result<Option<Option<NodeId>>> {
        let sql = format!(
            "SELECT {parent} FROM {table} WHERE {id} = ?1",
            parent = quote_ident(&self.schema.parent_field),
            table = self.table(),
            id = quote_ident(&self.schema.id_field),
        );
        let value = self
            .tx
            .query_row(&sql, params![id.0], |row| {
                row.get_ref(0).map(to_field_value)
            })
            .optional()
            .map_err(storage_err)?;
        value.map(|v| v.as_parent()).transpose()
    }

    fn children_of(&mut self, parent: Option<NodeId>) -> treedb_core::Result<Vec<Sibling>> {
        let sql = format!(
            "SELECT {id}, {order} FROM {table} WHERE {parent} IS ?1",
            id = quote_ident(&self.schema.id_field),
            order = quote_ident(&self.schema.order_field),
            table = self.table(),
            parent = quote_ident(&self.schema.parent_field),
        );
        let mut stmt = self.tx.prepare(&sql).map_err(storage_err)?;
        let mut siblings = stmt
            .query_map(params![parent.map(|p| p.0)], |row| {
                Ok(Sibling {
                    id: NodeId(row.get(0)?),
                    order_key: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                })
            })
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        sort_siblings(&mut siblings);
        Ok(siblings)
    }

    fn parents(&mut self) -> treedb_core::Result<Vec<Option<NodeId>>> {
        let sql = format!(
            "SELECT DISTINCT {parent} FROM {table}",
            parent = quote_ident(&self.schema.parent_field),
            table = self.table(),
        );
        let mut stmt = self.tx.prepare(&sql).map_err(storage_err)?;
        let values = stmt
            .query_map([], |row| row.get_ref(0).map(to_field_value))
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        let parents: BTreeSet<Option<NodeId>> = values
            .iter()
            .map(FieldValue::as_parent)
            .collect::<treedb_core::Result<_>>()?;
        Ok(parents.into_iter().collect())
    }

    fn insert(
        &mut self,
        id: Option<NodeId>,
        parent: Option<NodeId>,
        order_key: i64,
        fields: &Fields,
    ) -> treedb_core::Result<NodeId> {
        let mut columns = Vec::with_capacity(fields.len() + 3);
        let mut values = Vec::with_capacity(fields.len() + 3);
        if let Some(id) = id {
            columns.push(quote_ident(&self.schema.id_field));
            values.push(Value::Integer(id.0));
        }
        columns.push(quote_ident(&self.schema.parent_field));
        values.push(parent.map_or(Value::Null, |p| Value::Integer(p.0)));
        columns.push(quote_ident(&self.schema.order_field));
        values.push(Value::Integer(order_key));
        for (name, value) in fields {
            columns.push(quote_ident(name));
            values.push(to_sql_value(value));
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(),
            columns.join(", "),
            placeholders.join(", ")
        );
        self.tx
            .execute(&sql, params_from_iter(values))
            .map_err(storage_err)?;
        Ok(id.unwrap_or_else(|| NodeId(self.tx.last_insert_rowid())))
    }

    fn update_fields(&mut self, id: NodeId, fields: &Fields) -> treedb_core::Result<bool> {
        if fields.is_empty() {
            return Ok(self.parent_of(id)?.is_some());
        }
        let assignments: Vec<String> = fields
            .keys()
            .enumerate()
            .map(|(i, name)| format!("{} = ?{}", quote_ident(name), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            self.table(),
            assignments.join(", "),
            quote_ident(&self.schema.id_field),
            fields.len() + 1
        );
        let mut values: Vec<Value> = fields.values().map(to_sql_value).collect();
        values.push(Value::Integer(id.0));
        let changed = self
            .tx
            .execute(&sql, params_from_iter(values))
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    fn place(&mut self, id: NodeId, parent: Option<NodeId>, order_key: i64) -> treedb_core::Result<()> {
        let sql = format!(
            "UPDATE {table} SET {parent} = ?1, {order} = ?2 WHERE {id} = ?3",
            table = self.table(),
            parent = quote_ident(&self.schema.parent_field),
            order = quote_ident(&self.schema.order_field),
            id = quote_ident(&self.schema.id_field),
        );
        let changed = self
            .tx
            .execute(&sql, params![parent.map(|p| p.0), order_key, id.0])
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("node {id}")));
        }
        Ok(())
    }

    fn delete(&mut self, id: NodeId) -> treedb_core::Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            self.table(),
            quote_ident(&self.schema.id_field)
        );
        let changed = self.tx.execute(&sql, params![id.0]).map_err(storage_err)?;
        Ok(changed > 0)
    }

    fn table_meta(&mut self) -> treedb_core::Result<TableMeta> {
        introspect::table_meta(&self.tx, self.schema)
    }

    fn foreign_options(
        &mut self,
        column: &str,
        limit: usize,
    ) -> treedb_core::Result<Option<Vec<ForeignOption>>> {
        introspect::foreign_options(&self.tx, &self.schema.table, column, limit)
    }

    fn commit(self) -> treedb_core::Result<()> {
        self.tx.commit().map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treedb_core::HierarchyStore;

    fn store() -> SqliteNodeStore {
        SqliteNodeStore::open_in_memory(TableSchema::default()).unwrap()
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("tree"), "\"tree\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let mut store = store();
        {
            let mut tx = store.begin().unwrap();
            tx.insert(None, None, 1000, &Fields::new()).unwrap();
        }
        let mut tx = store.begin().unwrap();
        assert!(tx.fetch_all().unwrap().is_empty());
    }

    #[test]
    fn sibling_keys_are_unique_at_root_level() {
        let mut store = store();
        let mut tx = store.begin().unwrap();
        tx.insert(None, None, 1000, &Fields::new()).unwrap();
        let err = tx.insert(None, None, 1000, &Fields::new()).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn unknown_columns_are_dropped_from_patches() {
        let mut tree = HierarchyStore::new(store());
        let mut fields = Fields::new();
        fields.insert("name".into(), "Finance".into());
        fields.insert("no_such_column".into(), FieldValue::Integer(3));
        let node = tree.insert(fields).unwrap();
        assert_eq!(node.fields.get("name"), Some(&FieldValue::from("Finance")));
        assert!(!node.fields.contains_key("no_such_column"));
    }
}
