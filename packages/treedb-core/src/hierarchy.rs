use std::collections::{BTreeSet, HashSet, VecDeque};

use log::{debug, warn};

use crate::config::TableSchema;
use crate::error::{Error, Result};
use crate::ids::NodeId;
use crate::meta::{ForeignOption, TableMeta, FOREIGN_OPTION_LIMIT};
use crate::node::{Fields, Node, Sibling};
use crate::order_key::{self, RenumberPlan, Slot};
use crate::traits::{NodeStore, NodeTx};

/// Where a moved node lands among its new siblings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    First,
    Last,
    After(NodeId),
}

/// A field patch split into the parent reference and plain columns.
#[derive(Debug, Default)]
struct Patch {
    parent: Option<Option<NodeId>>,
    fields: Fields,
}

/// Reads and writes the parent-pointer table while keeping it acyclic and
/// keeping sibling order keys unique.
///
/// Each public operation runs in exactly one store transaction.
pub struct HierarchyStore<S: NodeStore> {
    store: S,
}

impl<S: NodeStore> HierarchyStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn schema(&self) -> &TableSchema {
        self.store.schema()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Every node ordered by `(order_key, id)`.
    pub fn list_all(&mut self) -> Result<Vec<Node>> {
        let mut tx = self.store.begin()?;
        tx.fetch_all()
    }

    pub fn get(&mut self, id: NodeId) -> Result<Node> {
        let mut tx = self.store.begin()?;
        tx.fetch(id)?.ok_or_else(|| Error::node_not_found(id))
    }

    /// Children of `parent` (roots for `None`) in sibling order.
    pub fn children(&mut self, parent: Option<NodeId>) -> Result<Vec<Node>> {
        let mut tx = self.store.begin()?;
        Ok(tx
            .fetch_all()?
            .into_iter()
            .filter(|n| n.parent_id == parent)
            .collect())
    }

    pub fn table_meta(&mut self) -> Result<TableMeta> {
        let mut tx = self.store.begin()?;
        tx.table_meta()
    }

    /// Selectable values for the foreign-key column `column`.
    pub fn foreign_options(&mut self, column: &str) -> Result<Vec<ForeignOption>> {
        let mut tx = self.store.begin()?;
        tx.foreign_options(column, FOREIGN_OPTION_LIMIT)?
            .ok_or_else(|| Error::NotFound(format!("foreign key column {column}")))
    }

    /// Insert a node after the current last sibling of its parent.
    pub fn insert(&mut self, fields: Fields) -> Result<Node> {
        let schema = self.store.schema().clone();
        let mut tx = self.store.begin()?;
        let columns = tx.columns()?;
        let patch = split_patch(&schema, fields, columns.as_ref())?;
        if patch.parent.is_none() && patch.fields.is_empty() {
            return Err(Error::Validation("no insertable fields".into()));
        }

        let parent = patch.parent.flatten();
        if let Some(parent) = parent {
            require_parent(&mut tx, parent)?;
        }
        let key = append_key(&mut tx, parent)?;
        let id = tx.insert(None, parent, key, &patch.fields)?;
        let node = tx
            .fetch(id)?
            .ok_or_else(|| Error::Store(format!("inserted node {id} cannot be read back")))?;
        tx.commit()?;
        debug!("inserted node {id} under {parent:?} at key {key}");
        Ok(node)
    }

    /// Patch a node's fields. A changed parent is cycle-checked and the node
    /// is appended after its new siblings.
    pub fn update(&mut self, id: NodeId, fields: Fields) -> Result<Node> {
        let schema = self.store.schema().clone();
        let mut tx = self.store.begin()?;
        let current_parent = tx.parent_of(id)?.ok_or_else(|| Error::node_not_found(id))?;
        let columns = tx.columns()?;
        let patch = split_patch(&schema, fields, columns.as_ref())?;
        if patch.parent.is_none() && patch.fields.is_empty() {
            return Err(Error::Validation("no updatable fields".into()));
        }

        let mut new_parent = None;
        if let Some(requested) = patch.parent {
            let requested = self_parent_as_root(id, requested);
            if requested != current_parent {
                if let Some(parent) = requested {
                    require_parent(&mut tx, parent)?;
                    check_no_cycle(&mut tx, id, parent)?;
                }
                new_parent = Some(requested);
            }
        }

        if !patch.fields.is_empty() && !tx.update_fields(id, &patch.fields)? {
            return Err(Error::node_not_found(id));
        }
        if let Some(parent) = new_parent {
            let key = append_key(&mut tx, parent)?;
            tx.place(id, parent, key)?;
            debug!("reparented node {id} under {parent:?} at key {key}");
        }

        let node = tx.fetch(id)?.ok_or_else(|| Error::node_not_found(id))?;
        tx.commit()?;
        Ok(node)
    }

    /// Delete `id` and its whole descendant closure. Returns the deleted ids,
    /// `id` first, in breadth-first order.
    pub fn delete(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut tx = self.store.begin()?;
        if tx.parent_of(id)?.is_none() {
            return Err(Error::node_not_found(id));
        }
        let closure = collect_subtree(&mut tx, id)?;
        // Deepest rows first so a foreign key on the parent column never sees an orphan.
        for node in closure.iter().rev() {
            tx.delete(*node)?;
        }
        tx.commit()?;
        debug!("deleted subtree of {id} ({} rows)", closure.len());
        Ok(closure)
    }

    /// Ancestors of `id`, nearest first. Empty for roots and unknown ids.
    pub fn get_ancestors(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut tx = self.store.begin()?;
        let mut ancestors = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut current = tx.parent_of(id)?.flatten();
        while let Some(node) = current {
            if !visited.insert(node) {
                warn!("parent chain of {id} loops back at {node}; stopping traversal");
                break;
            }
            ancestors.push(node);
            current = tx.parent_of(node)?.flatten();
        }
        Ok(ancestors)
    }

    /// Descendants of `id` in breadth-first order, excluding `id`. Empty for
    /// leaves and unknown ids.
    pub fn get_descendants(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut tx = self.store.begin()?;
        if tx.parent_of(id)?.is_none() {
            return Ok(Vec::new());
        }
        let mut closure = collect_subtree(&mut tx, id)?;
        closure.remove(0);
        Ok(closure)
    }

    /// Fail with [`Error::Cycle`] if `new_parent` is `id` itself or one of its
    /// descendants.
    pub fn assert_no_cycle(&mut self, id: NodeId, new_parent: NodeId) -> Result<()> {
        let mut tx = self.store.begin()?;
        check_no_cycle(&mut tx, id, new_parent)
    }

    /// Give `parent`'s children a new left-to-right order.
    ///
    /// Listed children come first, in the given order; unlisted children keep
    /// their relative order after them.
    pub fn reorder_siblings(&mut self, parent: Option<NodeId>, ordered: &[NodeId]) -> Result<()> {
        let mut tx = self.store.begin()?;
        let siblings = tx.children_of(parent)?;
        let present: HashSet<NodeId> = siblings.iter().map(|s| s.id).collect();
        let mut listed = HashSet::with_capacity(ordered.len());
        for id in ordered {
            if !present.contains(id) {
                return Err(Error::Validation(format!(
                    "node {id} is not a child of {}",
                    describe_parent(parent)
                )));
            }
            if !listed.insert(*id) {
                return Err(Error::Validation(format!("node {id} listed twice")));
            }
        }

        let mut desired: Vec<NodeId> = ordered.to_vec();
        desired.extend(siblings.iter().map(|s| s.id).filter(|id| !listed.contains(id)));
        let plan = order_key::renumber_group(&desired, &siblings)?;
        if already_applied(&siblings, &plan) {
            return Ok(());
        }
        apply_plan(&mut tx, parent, &plan)?;
        tx.commit()
    }

    /// Move `id` under `new_parent` at `placement`.
    ///
    /// The node gets the midpoint key between its new neighbours; when the
    /// neighbours are adjacent the whole group is renumbered instead.
    pub fn move_node(
        &mut self,
        id: NodeId,
        new_parent: Option<NodeId>,
        placement: Placement,
    ) -> Result<Node> {
        let mut tx = self.store.begin()?;
        if tx.parent_of(id)?.is_none() {
            return Err(Error::node_not_found(id));
        }
        let new_parent = self_parent_as_root(id, new_parent);
        if let Some(parent) = new_parent {
            require_parent(&mut tx, parent)?;
            check_no_cycle(&mut tx, id, parent)?;
        }

        let group = tx.children_of(new_parent)?;
        let siblings: Vec<Sibling> = group.iter().filter(|s| s.id != id).copied().collect();
        let index = match placement {
            Placement::First => 0,
            Placement::Last => siblings.len(),
            Placement::After(anchor) => {
                let pos = siblings.iter().position(|s| s.id == anchor).ok_or_else(|| {
                    Error::Validation(format!(
                        "node {anchor} is not a sibling under {}",
                        describe_parent(new_parent)
                    ))
                })?;
                pos + 1
            }
        };

        let (lower, upper) = order_key::neighbours(&siblings, index);
        match order_key::between(lower, upper)? {
            Slot::Key(key) => tx.place(id, new_parent, key)?,
            Slot::Renumber => {
                let mut desired: Vec<NodeId> = siblings.iter().map(|s| s.id).collect();
                desired.insert(index, id);
                let plan = order_key::renumber_group(&desired, &group)?;
                apply_plan(&mut tx, new_parent, &plan)?;
            }
        }

        let node = tx.fetch(id)?.ok_or_else(|| Error::node_not_found(id))?;
        tx.commit()?;
        Ok(node)
    }

    /// Renumber every sibling group in the table, keeping the current order.
    /// Returns the number of rows rewritten.
    pub fn rebuild_order(&mut self) -> Result<usize> {
        let mut tx = self.store.begin()?;
        let mut rewritten = 0;
        for parent in tx.parents()? {
            let siblings = tx.children_of(parent)?;
            let ids: Vec<NodeId> = siblings.iter().map(|s| s.id).collect();
            let plan = order_key::renumber_group(&ids, &siblings)?;
            if already_applied(&siblings, &plan) {
                continue;
            }
            apply_plan(&mut tx, parent, &plan)?;
            rewritten += ids.len();
        }
        tx.commit()?;
        Ok(rewritten)
    }

    /// Write previously exported rows back with their original ids.
    ///
    /// Existing rows are overwritten. A restored key that clashes with a
    /// current sibling is replaced by an appended one. The batch is rejected
    /// as a whole if it leaves a dangling parent or a cycle.
    pub fn restore(&mut self, nodes: Vec<Node>) -> Result<usize> {
        let schema = self.store.schema().clone();
        let mut tx = self.store.begin()?;
        let columns = tx.columns()?;
        let mut restored = Vec::with_capacity(nodes.len());

        for node in nodes {
            let patch = split_patch(&schema, node.fields, columns.as_ref())?;
            let parent = self_parent_as_root(node.id, patch.parent.unwrap_or(node.parent_id));
            let clash = tx
                .children_of(parent)?
                .iter()
                .any(|s| s.id != node.id && s.order_key == node.order_key);
            let key = if clash {
                append_key(&mut tx, parent)?
            } else {
                node.order_key
            };
            if tx.parent_of(node.id)?.is_some() {
                tx.update_fields(node.id, &patch.fields)?;
                tx.place(node.id, parent, key)?;
            } else {
                tx.insert(Some(node.id), parent, key, &patch.fields)?;
            }
            restored.push(node.id);
        }

        for id in &restored {
            if let Some(Some(parent)) = tx.parent_of(*id)? {
                require_parent(&mut tx, parent)?;
                if ancestors_reach(&mut tx, parent, *id)? {
                    return Err(Error::Cycle { node: *id, parent });
                }
            }
        }
        tx.commit()?;
        Ok(restored.len())
    }
}

fn describe_parent(parent: Option<NodeId>) -> String {
    parent.map_or_else(|| "the root level".to_string(), |p| format!("node {p}"))
}

/// Setting a node as its own parent turns it into a root. Kept for
/// compatibility with existing clients; flagged in the log.
fn self_parent_as_root(id: NodeId, parent: Option<NodeId>) -> Option<NodeId> {
    match parent {
        Some(p) if p == id => {
            warn!("node {id} set as its own parent; treating it as a root");
            None
        }
        other => other,
    }
}

fn split_patch(
    schema: &TableSchema,
    fields: Fields,
    columns: Option<&BTreeSet<String>>,
) -> Result<Patch> {
    let mut patch = Patch::default();
    for (name, value) in fields {
        if schema.is_id_key(&name) || schema.is_order_key(&name) {
            continue;
        }
        if schema.is_parent_key(&name) {
            patch.parent = Some(value.as_parent()?);
            continue;
        }
        if columns.map_or(true, |cols| cols.contains(&name)) {
            patch.fields.insert(name, value);
        } else {
            debug!("dropping unknown column {name:?} from patch");
        }
    }
    Ok(patch)
}

fn require_parent<T: NodeTx>(tx: &mut T, parent: NodeId) -> Result<()> {
    if tx.parent_of(parent)?.is_none() {
        return Err(Error::Validation(format!("parent node {parent} does not exist")));
    }
    Ok(())
}

/// Whether walking up from `start` reaches `target`. Stops on loops in legacy data.
fn ancestors_reach<T: NodeTx>(tx: &mut T, start: NodeId, target: NodeId) -> Result<bool> {
    let mut visited = HashSet::new();
    let mut current = Some(start);
    while let Some(node) = current {
        if node == target {
            return Ok(true);
        }
        if !visited.insert(node) {
            warn!("parent chain from {start} loops at {node}");
            return Ok(false);
        }
        current = tx.parent_of(node)?.flatten();
    }
    Ok(false)
}

fn check_no_cycle<T: NodeTx>(tx: &mut T, id: NodeId, new_parent: NodeId) -> Result<()> {
    if ancestors_reach(tx, new_parent, id)? {
        return Err(Error::Cycle {
            node: id,
            parent: new_parent,
        });
    }
    Ok(())
}

/// Breadth-first closure of `root`, `root` first. Each node is visited once,
/// so cyclic data terminates.
fn collect_subtree<T: NodeTx>(tx: &mut T, root: NodeId) -> Result<Vec<NodeId>> {
    let mut visited = HashSet::from([root]);
    let mut order = vec![root];
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        for child in tx.children_of(Some(node))? {
            if visited.insert(child.id) {
                order.push(child.id);
                queue.push_back(child.id);
            } else {
                warn!("node {} reached twice below {root}; skipping", child.id);
            }
        }
    }
    Ok(order)
}

/// Key one step past the last child of `parent`, renumbering first if the
/// key space above the last child is exhausted.
fn append_key<T: NodeTx>(tx: &mut T, parent: Option<NodeId>) -> Result<i64> {
    let siblings = tx.children_of(parent)?;
    let last = siblings.last().map(|s| s.order_key);
    match order_key::next_after(last) {
        Slot::Key(key) => Ok(key),
        Slot::Renumber => {
            let ids: Vec<NodeId> = siblings.iter().map(|s| s.id).collect();
            let plan = order_key::renumber_group(&ids, &siblings)?;
            apply_plan(tx, parent, &plan)?;
            let last = plan.assignments.last().map(|(_, k)| *k);
            match order_key::next_after(last) {
                Slot::Key(key) => Ok(key),
                Slot::Renumber => Err(Error::Validation(format!(
                    "no order key left under {}",
                    describe_parent(parent)
                ))),
            }
        }
    }
}

fn already_applied(siblings: &[Sibling], plan: &RenumberPlan) -> bool {
    siblings.len() == plan.assignments.len()
        && siblings
            .iter()
            .zip(&plan.assignments)
            .all(|(s, (id, key))| s.id == *id && s.order_key == *key)
}

/// Write both phases of `plan` inside `tx`.
fn apply_plan<T: NodeTx>(tx: &mut T, parent: Option<NodeId>, plan: &RenumberPlan) -> Result<()> {
    let abort = |phase: u8, err: Error| Error::RenumberAborted {
        parent: describe_parent(parent),
        phase,
        reason: err.to_string(),
    };
    for (id, key) in &plan.temporary {
        tx.place(*id, parent, *key).map_err(|e| abort(1, e))?;
    }
    for (id, key) in &plan.assignments {
        tx.place(*id, parent, *key).map_err(|e| abort(2, e))?;
    }
    debug!(
        "renumbered {} children of {}",
        plan.assignments.len(),
        describe_parent(parent)
    );
    Ok(())
}
