use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use crate::config::{Config, TableSchema};
use crate::error::{Error, Result};
use crate::ids::NodeId;
use crate::meta::{ColumnInfo, ColumnKind, ForeignOption, TableMeta, TableSummary};
use crate::node::{sort_siblings, Fields, Node, Sibling};
use crate::traits::{NodeStore, NodeTx, StoreBackend};

/// In-memory node table for tests and prototyping.
///
/// Enforces the same `(parent, order_key)` uniqueness the SQLite schema
/// declares, so key maintenance is exercised the same way.
#[derive(Clone, Debug, Default)]
pub struct MemoryNodeStore {
    schema: TableSchema,
    rows: BTreeMap<NodeId, Node>,
    next_id: i64,
    poisoned_keys: HashSet<i64>,
}

impl MemoryNodeStore {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            ..Default::default()
        }
    }

    /// Seed rows verbatim, bypassing key allocation.
    pub fn with_rows(schema: TableSchema, rows: impl IntoIterator<Item = Node>) -> Self {
        let mut store = Self::new(schema);
        for row in rows {
            store.next_id = store.next_id.max(row.id.0);
            store.rows.insert(row.id, row);
        }
        store
    }

    /// Make any write of `key` fail. Intended for tests of failure handling.
    pub fn poison_order_key(&mut self, key: i64) {
        self.poisoned_keys.insert(key);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl NodeStore for MemoryNodeStore {
    type Tx<'a> = MemoryTx<'a>;

    fn begin(&mut self) -> Result<MemoryTx<'_>> {
        let staged = self.rows.clone();
        let next_id = self.next_id;
        Ok(MemoryTx {
            store: self,
            staged,
            next_id,
        })
    }

    fn schema(&self) -> &TableSchema {
        &self.schema
    }
}

/// Copy-on-begin transaction; the staged rows replace the store's on commit.
pub struct MemoryTx<'a> {
    store: &'a mut MemoryNodeStore,
    staged: BTreeMap<NodeId, Node>,
    next_id: i64,
}

impl MemoryTx<'_> {
    fn check_key(&self, id: NodeId, parent: Option<NodeId>, order_key: i64) -> Result<()> {
        if self.store.poisoned_keys.contains(&order_key) {
            return Err(Error::Store(format!("write of order key {order_key} rejected")));
        }
        let clash = self
            .staged
            .values()
            .any(|n| n.id != id && n.parent_id == parent && n.order_key == order_key);
        if clash {
            return Err(Error::Store(format!(
                "UNIQUE constraint failed: {}.{}, {}.{}",
                self.store.schema.table,
                self.store.schema.parent_field,
                self.store.schema.table,
                self.store.schema.order_field
            )));
        }
        Ok(())
    }
}

impl NodeTx for MemoryTx<'_> {
    fn columns(&mut self) -> Result<Option<BTreeSet<String>>> {
        Ok(None)
    }

    fn fetch_all(&mut self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.staged.values().cloned().collect();
        nodes.sort_by_key(|n| (n.order_key, n.id));
        Ok(nodes)
    }

    fn fetch(&mut self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.staged.get(&id).cloned())
    }

    fn parent_of(&mut self, id: NodeId) -> Result<Option<Option<NodeId>>> {
        Ok(self.staged.get(&id).map(|n| n.parent_id))
    }

    fn children_of(&mut self, parent: Option<NodeId>) -> Result<Vec<Sibling>> {
        let mut siblings: Vec<Sibling> = self
            .staged
            .values()
            .filter(|n| n.parent_id == parent)
            .map(|n| Sibling {
                id: n.id,
                order_key: n.order_key,
            })
            .collect();
        sort_siblings(&mut siblings);
        Ok(siblings)
    }

    fn parents(&mut self) -> Result<Vec<Option<NodeId>>> {
        let parents: BTreeSet<Option<NodeId>> = self.staged.values().map(|n| n.parent_id).collect();
        Ok(parents.into_iter().collect())
    }

    fn insert(
        &mut self,
        id: Option<NodeId>,
        parent: Option<NodeId>,
        order_key: i64,
        fields: &Fields,
    ) -> Result<NodeId> {
        let id = match id {
            Some(id) => id,
            None => NodeId(self.next_id + 1),
        };
        if self.staged.contains_key(&id) {
            return Err(Error::Store(format!("UNIQUE constraint failed: node {id}")));
        }
        self.check_key(id, parent, order_key)?;
        self.next_id = self.next_id.max(id.0);
        self.staged.insert(
            id,
            Node {
                id,
                parent_id: parent,
                order_key,
                fields: fields.clone(),
            },
        );
        Ok(id)
    }

    fn update_fields(&mut self, id: NodeId, fields: &Fields) -> Result<bool> {
        match self.staged.get_mut(&id) {
            Some(node) => {
                for (name, value) in fields {
                    node.fields.insert(name.clone(), value.clone());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn place(&mut self, id: NodeId, parent: Option<NodeId>, order_key: i64) -> Result<()> {
        if !self.staged.contains_key(&id) {
            return Err(Error::node_not_found(id));
        }
        self.check_key(id, parent, order_key)?;
        if let Some(node) = self.staged.get_mut(&id) {
            node.parent_id = parent;
            node.order_key = order_key;
        }
        Ok(())
    }

    fn delete(&mut self, id: NodeId) -> Result<bool> {
        Ok(self.staged.remove(&id).is_some())
    }

    /// Key columns plus every field any row carries, typed by the first
    /// non-null value seen.
    fn table_meta(&mut self) -> Result<TableMeta> {
        let schema = &self.store.schema;
        let mut id = ColumnInfo::new(schema.id_field.clone(), "INTEGER");
        id.primary_key = true;
        id.not_null = true;
        let parent = ColumnInfo::new(schema.parent_field.clone(), "INTEGER");
        let mut order = ColumnInfo::new(schema.order_field.clone(), "INTEGER");
        order.not_null = true;

        let mut kinds: BTreeMap<&str, Option<ColumnKind>> = BTreeMap::new();
        for node in self.staged.values() {
            for (name, value) in &node.fields {
                let kind = kinds.entry(name.as_str()).or_insert(None);
                if kind.is_none() {
                    *kind = ColumnKind::of_value(value);
                }
            }
        }
        let mut columns = vec![id, parent, order];
        columns.extend(kinds.into_iter().map(|(name, kind)| ColumnInfo {
            kind: kind.unwrap_or(ColumnKind::Text),
            ..ColumnInfo::new(name, "")
        }));

        Ok(TableMeta {
            table: schema.table.clone(),
            id_field: schema.id_field.clone(),
            parent_field: schema.parent_field.clone(),
            order_field: schema.order_field.clone(),
            columns,
            foreign_keys: Vec::new(),
        })
    }

    fn foreign_options(&mut self, _column: &str, _limit: usize) -> Result<Option<Vec<ForeignOption>>> {
        Ok(None)
    }

    fn commit(self) -> Result<()> {
        self.store.rows = self.staged;
        self.store.next_id = self.next_id;
        Ok(())
    }
}

/// Backend handing out empty memory stores, one per `open` call.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend;

impl StoreBackend for MemoryBackend {
    type Store = MemoryNodeStore;

    fn open(&self, config: &Config) -> Result<MemoryNodeStore> {
        Ok(MemoryNodeStore::new(config.schema()))
    }

    /// Memory stores live in no data source, so there is nothing to list.
    fn list_tables(&self, _path: &Path) -> Result<Vec<TableSummary>> {
        Ok(Vec::new())
    }
}
