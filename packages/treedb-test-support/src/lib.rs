//! Backend-agnostic conformance checks for TreeDB node stores.
//!
//! A backend crate calls [`run_conformance`] from its tests with a factory for
//! fresh, empty stores that have a `name` column.

use treedb_core::{
    Error, FieldValue, Fields, HierarchyStore, Node, NodeId, NodeStore, Placement,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn named(name: &str) -> Fields {
    fields(&[("name", name.into())])
}

pub fn child_of(parent: i64, name: &str) -> Fields {
    fields(&[("parentId", FieldValue::Integer(parent)), ("name", name.into())])
}

/// Write `(id, parent, order_key)` rows verbatim.
pub fn seed<S: NodeStore>(tree: &mut HierarchyStore<S>, rows: &[(i64, Option<i64>, i64)]) {
    let nodes = rows
        .iter()
        .map(|&(id, parent, key)| Node::new(NodeId(id), parent.map(NodeId), key))
        .collect();
    tree.restore(nodes).expect("seed rows");
}

pub fn ids(nodes: &[Node]) -> Vec<i64> {
    nodes.iter().map(|n| n.id.0).collect()
}

/// `(id, order_key)` of the children of `parent`, in sibling order.
pub fn child_keys<S: NodeStore>(tree: &mut HierarchyStore<S>, parent: Option<i64>) -> Vec<(i64, i64)> {
    tree.children(parent.map(NodeId))
        .expect("children")
        .iter()
        .map(|n| (n.id.0, n.order_key))
        .collect()
}

pub fn run_conformance<S, F>(make: F)
where
    S: NodeStore,
    F: Fn() -> S,
{
    init_logging();
    let fresh = || HierarchyStore::new(make());

    reference_scenario(&mut fresh());
    insert_appends_after_last_sibling(&mut fresh());
    insert_validates_input(&mut fresh());
    update_patches_fields_and_reparents(&mut fresh());
    missing_nodes_are_not_found(&mut fresh());
    reparent_into_subtree_is_a_cycle(&mut fresh());
    traversals_follow_parent_links(&mut fresh());
    reorder_lists_children_first(&mut fresh());
    reorder_rejects_foreign_and_duplicate_ids(&mut fresh());
    move_takes_midpoint_key(&mut fresh());
    move_between_adjacent_keys_renumbers(&mut fresh());
    rebuild_order_respaces_every_group(&mut fresh());
    renumber_parks_below_negative_keys(&mut fresh());
    restore_brings_back_deleted_subtree(&mut fresh());
    restore_rejects_cycles(&mut fresh());
}

pub fn reference_scenario<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(tree, &[(1, None, 0), (2, Some(1), 1000), (3, Some(1), 2000), (4, Some(2), 1000)]);

    let mut deleted = tree.delete(NodeId(2)).unwrap();
    deleted.sort();
    assert_eq!(deleted, vec![NodeId(2), NodeId(4)]);
    assert_eq!(ids(&tree.list_all().unwrap()), vec![1, 3]);
    assert!(tree.get_descendants(NodeId(2)).unwrap().is_empty());

    tree.reorder_siblings(Some(NodeId(1)), &[NodeId(3)]).unwrap();
    assert_eq!(child_keys(tree, Some(1)), vec![(3, 1000)]);

    let node = tree
        .update(NodeId(3), fields(&[("parentId", FieldValue::Integer(3))]))
        .unwrap();
    assert_eq!(node.parent_id, None);
}

pub fn insert_appends_after_last_sibling<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    let a = tree.insert(named("a")).unwrap();
    let b = tree.insert(named("b")).unwrap();
    let c = tree.insert(child_of(a.id.0, "c")).unwrap();
    let d = tree.insert(child_of(a.id.0, "d")).unwrap();

    assert_eq!(a.parent_id, None);
    assert_eq!((a.order_key, b.order_key), (1000, 2000));
    assert_eq!(c.parent_id, Some(a.id));
    assert_eq!((c.order_key, d.order_key), (1000, 2000));
    assert_eq!(c.fields.get("name"), Some(&FieldValue::from("c")));

    let listed = tree.list_all().unwrap();
    let keys: Vec<(i64, i64)> = listed.iter().map(|n| (n.order_key, n.id.0)).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

pub fn insert_validates_input<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    let err = tree.insert(Fields::new()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");

    let err = tree.insert(fields(&[("id", FieldValue::Integer(7))])).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");

    let err = tree.insert(child_of(99, "orphan")).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");
    assert!(tree.list_all().unwrap().is_empty());
}

pub fn update_patches_fields_and_reparents<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    let a = tree.insert(named("a")).unwrap();
    let b = tree.insert(named("b")).unwrap();
    tree.insert(child_of(b.id.0, "b1")).unwrap();

    let renamed = tree.update(a.id, named("alpha")).unwrap();
    assert_eq!(renamed.fields.get("name"), Some(&FieldValue::from("alpha")));
    assert_eq!(renamed.order_key, a.order_key);

    let moved = tree
        .update(a.id, fields(&[("parentId", FieldValue::Integer(b.id.0))]))
        .unwrap();
    assert_eq!(moved.parent_id, Some(b.id));
    assert_eq!(moved.order_key, 2000);

    let err = tree.update(a.id, Fields::new()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");
}

pub fn missing_nodes_are_not_found<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    assert!(matches!(tree.get(NodeId(42)), Err(Error::NotFound(_))));
    assert!(matches!(tree.update(NodeId(42), named("x")), Err(Error::NotFound(_))));
    assert!(matches!(tree.delete(NodeId(42)), Err(Error::NotFound(_))));
    assert!(matches!(
        tree.move_node(NodeId(42), None, Placement::Last),
        Err(Error::NotFound(_))
    ));
    assert!(tree.get_ancestors(NodeId(42)).unwrap().is_empty());
    assert!(tree.get_descendants(NodeId(42)).unwrap().is_empty());
}

pub fn reparent_into_subtree_is_a_cycle<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(tree, &[(1, None, 1000), (2, Some(1), 1000), (3, Some(2), 1000)]);
    let before = tree.list_all().unwrap();

    let err = tree
        .update(NodeId(1), fields(&[("parentId", FieldValue::Integer(3))]))
        .unwrap_err();
    assert_eq!(
        err,
        Error::Cycle {
            node: NodeId(1),
            parent: NodeId(3)
        }
    );
    let err = tree
        .move_node(NodeId(2), Some(NodeId(3)), Placement::First)
        .unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }), "{err:?}");
    assert!(tree.assert_no_cycle(NodeId(3), NodeId(1)).is_ok());
    assert_eq!(tree.list_all().unwrap(), before);
}

pub fn traversals_follow_parent_links<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(
        tree,
        &[
            (1, None, 1000),
            (2, Some(1), 1000),
            (3, Some(1), 2000),
            (4, Some(2), 1000),
            (5, Some(4), 1000),
        ],
    );
    assert_eq!(
        tree.get_ancestors(NodeId(5)).unwrap(),
        vec![NodeId(4), NodeId(2), NodeId(1)]
    );
    assert_eq!(
        tree.get_descendants(NodeId(1)).unwrap(),
        vec![NodeId(2), NodeId(3), NodeId(4), NodeId(5)]
    );
    assert!(tree.get_ancestors(NodeId(1)).unwrap().is_empty());
    assert!(tree.get_descendants(NodeId(3)).unwrap().is_empty());
}

pub fn reorder_lists_children_first<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(
        tree,
        &[(1, None, 1000), (2, Some(1), 1000), (3, Some(1), 2000), (4, Some(1), 3000)],
    );
    tree.reorder_siblings(Some(NodeId(1)), &[NodeId(4), NodeId(2)])
        .unwrap();
    let once = child_keys(tree, Some(1));
    assert_eq!(once, vec![(4, 1000), (2, 2000), (3, 3000)]);

    tree.reorder_siblings(Some(NodeId(1)), &[NodeId(4), NodeId(2)])
        .unwrap();
    assert_eq!(child_keys(tree, Some(1)), once);
}

pub fn reorder_rejects_foreign_and_duplicate_ids<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(tree, &[(1, None, 1000), (2, Some(1), 1000), (3, None, 2000)]);
    let before = tree.list_all().unwrap();

    let err = tree
        .reorder_siblings(Some(NodeId(1)), &[NodeId(3)])
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");
    let err = tree
        .reorder_siblings(Some(NodeId(1)), &[NodeId(2), NodeId(2)])
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");
    assert_eq!(tree.list_all().unwrap(), before);
}

pub fn move_takes_midpoint_key<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(
        tree,
        &[(1, None, 1000), (2, Some(1), 1000), (3, Some(1), 2000), (4, None, 2000)],
    );
    let moved = tree
        .move_node(NodeId(4), Some(NodeId(1)), Placement::After(NodeId(2)))
        .unwrap();
    assert_eq!(moved.parent_id, Some(NodeId(1)));
    assert_eq!(moved.order_key, 1500);

    let first = tree
        .move_node(NodeId(3), Some(NodeId(1)), Placement::First)
        .unwrap();
    assert_eq!(first.order_key, 0);
    assert_eq!(
        child_keys(tree, Some(1)),
        vec![(3, 0), (2, 1000), (4, 1500)]
    );

    let err = tree
        .move_node(NodeId(2), Some(NodeId(1)), Placement::After(NodeId(1)))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");
}

pub fn move_between_adjacent_keys_renumbers<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(
        tree,
        &[(1, None, 1000), (2, Some(1), 10), (3, Some(1), 11), (4, Some(1), 12)],
    );
    tree.move_node(NodeId(4), Some(NodeId(1)), Placement::After(NodeId(2)))
        .unwrap();
    assert_eq!(
        child_keys(tree, Some(1)),
        vec![(2, 1000), (4, 2000), (3, 3000)]
    );
}

pub fn rebuild_order_respaces_every_group<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(
        tree,
        &[(1, None, 1000), (2, Some(1), 5), (3, Some(1), 7), (4, Some(1), 100)],
    );
    assert_eq!(tree.rebuild_order().unwrap(), 3);
    assert_eq!(
        child_keys(tree, Some(1)),
        vec![(2, 1000), (3, 2000), (4, 3000)]
    );
    assert_eq!(tree.rebuild_order().unwrap(), 0);
}

/// Groups whose keys went negative through `First` placements still renumber.
pub fn renumber_parks_below_negative_keys<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(
        tree,
        &[(1, None, 1000), (2, Some(1), -8), (3, Some(1), -7), (4, Some(1), 0)],
    );
    tree.reorder_siblings(Some(NodeId(1)), &[NodeId(4)]).unwrap();
    assert_eq!(
        child_keys(tree, Some(1)),
        vec![(4, 1000), (2, 2000), (3, 3000)]
    );

    let first = tree
        .move_node(NodeId(3), Some(NodeId(1)), Placement::First)
        .unwrap();
    assert_eq!(first.order_key, 0);
    let first = tree
        .move_node(NodeId(2), Some(NodeId(1)), Placement::First)
        .unwrap();
    assert_eq!(first.order_key, -1000);
    tree.reorder_siblings(Some(NodeId(1)), &[NodeId(4)]).unwrap();
    assert_eq!(
        child_keys(tree, Some(1)),
        vec![(4, 1000), (2, 2000), (3, 3000)]
    );
}

pub fn restore_brings_back_deleted_subtree<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(
        tree,
        &[(1, None, 1000), (2, Some(1), 1000), (3, Some(2), 1000), (4, Some(1), 2000)],
    );
    let before = tree.list_all().unwrap();
    let snapshot: Vec<Node> = before
        .iter()
        .filter(|n| n.id == NodeId(2) || n.id == NodeId(3))
        .cloned()
        .collect();

    tree.delete(NodeId(2)).unwrap();
    assert_eq!(tree.restore(snapshot).unwrap(), 2);
    assert_eq!(tree.list_all().unwrap(), before);
}

pub fn restore_rejects_cycles<S: NodeStore>(tree: &mut HierarchyStore<S>) {
    seed(tree, &[(1, None, 1000), (2, Some(1), 1000)]);
    let before = tree.list_all().unwrap();

    let err = tree
        .restore(vec![Node::new(NodeId(1), Some(NodeId(2)), 1000)])
        .unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }), "{err:?}");
    let err = tree
        .restore(vec![Node::new(NodeId(9), Some(NodeId(77)), 1000)])
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");
    assert_eq!(tree.list_all().unwrap(), before);
}
