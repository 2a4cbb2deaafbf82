use std::collections::BTreeSet;

use proptest::prelude::*;
use treedb_core::order_key::{between, renumber_group, Slot};
use treedb_core::{Error, FieldValue, HierarchyStore, MemoryNodeStore, NodeId, Sibling, TableSchema};
use treedb_test_support::{fields, seed};

/// Parent index for nodes `1..=n`; node `i` hangs below a node with a smaller
/// id, or is a root when the pick is 0.
fn forest(max: usize) -> impl Strategy<Value = Vec<usize>> {
    (1..=max).prop_flat_map(|n| {
        (1..=n)
            .map(|i| (0..i).boxed())
            .collect::<Vec<_>>()
    })
}

fn build(parents: &[usize]) -> HierarchyStore<MemoryNodeStore> {
    let mut tree = HierarchyStore::new(MemoryNodeStore::new(TableSchema::default()));
    let rows: Vec<(i64, Option<i64>, i64)> = parents
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let id = i as i64 + 1;
            let parent = (p > 0).then_some(p as i64);
            (id, parent, id * 1000)
        })
        .collect();
    seed(&mut tree, &rows);
    tree
}

proptest! {
    #[test]
    fn between_stays_strictly_inside(lower in -1_000_000i64..1_000_000, span in 0i64..10_000) {
        let upper = lower + span;
        match between(Some(lower), Some(upper)).unwrap() {
            Slot::Key(key) => {
                prop_assert!(span > 1);
                prop_assert!(lower < key && key < upper);
            }
            Slot::Renumber => prop_assert!(span <= 1),
        }
    }

    #[test]
    fn renumber_plans_are_collision_free(
        ids in prop::collection::btree_set(-50i64..50, 0..20),
        keys in prop::collection::vec(-100_000i64..100_000, 20),
    ) {
        let ids: Vec<NodeId> = ids.into_iter().map(NodeId).collect();
        let current: Vec<Sibling> = ids
            .iter()
            .zip(&keys)
            .map(|(id, key)| Sibling { id: *id, order_key: *key })
            .collect();
        let plan = renumber_group(&ids, &current).unwrap();
        let temps: BTreeSet<i64> = plan.temporary.iter().map(|(_, k)| *k).collect();
        prop_assert_eq!(temps.len(), ids.len());
        prop_assert!(temps.iter().all(|k| *k < 0));
        prop_assert!(current.iter().all(|s| !temps.contains(&s.order_key)));
        let finals: Vec<i64> = plan.assignments.iter().map(|(_, k)| *k).collect();
        let expected: Vec<i64> = (1..=ids.len() as i64).map(|r| r * 1000).collect();
        prop_assert_eq!(finals, expected);
    }

    #[test]
    fn inserts_keep_listing_ordered(picks in prop::collection::vec(0usize..8, 1..30)) {
        let mut tree = HierarchyStore::new(MemoryNodeStore::new(TableSchema::default()));
        let mut inserted: Vec<NodeId> = Vec::new();
        for pick in picks {
            let mut patch = fields(&[("name", "n".into())]);
            if let Some(parent) = inserted.get(pick) {
                patch.insert("parentId".into(), FieldValue::Integer(parent.0));
            }
            inserted.push(tree.insert(patch).unwrap().id);
        }
        let listed = tree.list_all().unwrap();
        let keys: Vec<(i64, NodeId)> = listed.iter().map(|n| (n.order_key, n.id)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(keys, sorted);
        for node in &listed {
            let siblings = tree.children(node.parent_id).unwrap();
            prop_assert!(siblings.windows(2).all(|w| w[0].order_key < w[1].order_key));
        }
    }

    #[test]
    fn reorder_is_idempotent(parents in forest(12), seed_order in any::<u64>()) {
        let mut tree = build(&parents);
        let mut children: Vec<NodeId> = tree.children(None).unwrap().iter().map(|n| n.id).collect();
        let len = children.len();
        children.rotate_left((seed_order as usize) % len.max(1));
        children.truncate(len - (seed_order as usize / 7) % len.max(1));

        tree.reorder_siblings(None, &children).unwrap();
        let once = tree.children(None).unwrap();
        tree.reorder_siblings(None, &children).unwrap();
        prop_assert_eq!(tree.children(None).unwrap(), once.clone());
        let listed: Vec<NodeId> = once.iter().map(|n| n.id).take(children.len()).collect();
        prop_assert_eq!(listed, children);
    }

    #[test]
    fn reparent_below_descendant_is_rejected(parents in forest(12), pick in any::<prop::sample::Index>(), below in any::<prop::sample::Index>()) {
        let mut tree = build(&parents);
        let node = NodeId(pick.index(parents.len()) as i64 + 1);
        let descendants = tree.get_descendants(node).unwrap();
        prop_assume!(!descendants.is_empty());
        let target = descendants[below.index(descendants.len())];
        let before = tree.list_all().unwrap();

        let err = tree
            .update(node, fields(&[("parentId", FieldValue::Integer(target.0))]))
            .unwrap_err();
        prop_assert_eq!(err, Error::Cycle { node, parent: target });
        prop_assert_eq!(tree.list_all().unwrap(), before);
    }

    #[test]
    fn delete_removes_exactly_the_closure(parents in forest(12), pick in any::<prop::sample::Index>()) {
        let mut tree = build(&parents);
        let node = NodeId(pick.index(parents.len()) as i64 + 1);
        let mut closure: BTreeSet<NodeId> = tree.get_descendants(node).unwrap().into_iter().collect();
        closure.insert(node);
        let all: BTreeSet<NodeId> = tree.list_all().unwrap().iter().map(|n| n.id).collect();

        let deleted: BTreeSet<NodeId> = tree.delete(node).unwrap().into_iter().collect();
        prop_assert_eq!(&deleted, &closure);
        let left: BTreeSet<NodeId> = tree.list_all().unwrap().iter().map(|n| n.id).collect();
        prop_assert_eq!(left, all.difference(&closure).copied().collect::<BTreeSet<_>>());
        for id in &deleted {
            prop_assert!(tree.get_descendants(*id).unwrap().is_empty());
        }
    }
}
