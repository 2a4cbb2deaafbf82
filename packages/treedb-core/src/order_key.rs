use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::ids::NodeId;
use crate::node::Sibling;

/// Distance between consecutive keys written by appends and renumbers.
pub const GAP: i64 = 1000;
/// Key given to the first child of an empty sibling group.
pub const BASE: i64 = GAP;

/// Outcome of a placement request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    /// A free key strictly inside the requested interval.
    Key(i64),
    /// No integer fits; the sibling group has to be renumbered first.
    Renumber,
}

/// Key for appending after the current last sibling.
pub fn next_after(last: Option<i64>) -> Slot {
    match last {
        None => Slot::Key(BASE),
        Some(last) => last.checked_add(GAP).map_or(Slot::Renumber, Slot::Key),
    }
}

/// Allocate a key strictly between `lower` and `upper`.
///
/// Open ends extend by one [`GAP`]; two known neighbours get their integer
/// midpoint. Neighbours that are adjacent (or equal) leave no room and yield
/// [`Slot::Renumber`].
pub fn between(lower: Option<i64>, upper: Option<i64>) -> Result<Slot> {
    match (lower, upper) {
        (None, None) => Ok(Slot::Key(BASE)),
        (Some(lower), None) => Ok(next_after(Some(lower))),
        (None, Some(upper)) => Ok(upper.checked_sub(GAP).map_or(Slot::Renumber, Slot::Key)),
        (Some(lower), Some(upper)) => {
            if upper < lower {
                return Err(Error::Validation(format!(
                    "cannot allocate order key: upper {upper} < lower {lower}"
                )));
            }
            // i128 keeps the span exact at the ends of the i64 range.
            let span = upper as i128 - lower as i128;
            if span <= 1 {
                return Ok(Slot::Renumber);
            }
            Ok(Slot::Key((lower as i128 + span / 2) as i64))
        }
    }
}

/// The two write phases of a group renumber.
///
/// Rows are first parked on distinct temporary keys outside every key the
/// group held before, then moved to their final evenly spaced positive keys.
/// A unique `(parent, order_key)` index never sees two rows on the same key in
/// between, whatever the old and new ranks are.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RenumberPlan {
    pub temporary: Vec<(NodeId, i64)>,
    pub assignments: Vec<(NodeId, i64)>,
}

impl RenumberPlan {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Final key of `id`, if it belongs to the group.
    pub fn key_of(&self, id: NodeId) -> Option<i64> {
        self.assignments.iter().find(|(n, _)| *n == id).map(|(_, k)| *k)
    }
}

/// Plan new keys for `children`, taken as the desired left-to-right order.
///
/// `current` is every row the sibling group holds right now. Each child gets
/// the offset `rank * width + (id - min_id)` with
/// `width = (max_id - min_id + 1) + len`, so every `(rank, id)` pair has its
/// own slot. Temporary keys count down from `min(lowest, 0) - 1`; when that
/// would leave the i64 range they count up from
/// `max(highest, len * GAP) + 1` instead. Final keys are `(rank + 1) * GAP`.
pub fn renumber_group(children: &[NodeId], current: &[Sibling]) -> Result<RenumberPlan> {
    if children.is_empty() {
        return Ok(RenumberPlan::default());
    }

    let mut seen = HashSet::with_capacity(children.len());
    for id in children {
        if !seen.insert(*id) {
            return Err(Error::Validation(format!(
                "duplicate node {id} in sibling order"
            )));
        }
    }

    let min_id = children.iter().map(|id| id.0 as i128).min().unwrap_or(0);
    let max_id = children.iter().map(|id| id.0 as i128).max().unwrap_or(0);
    let len = children.len() as i128;
    let width = (max_id - min_id + 1) + len;
    let span = len * width;
    let last_final = len * GAP as i128;
    if last_final > i64::MAX as i128 {
        return Err(Error::Validation("sibling group too large to renumber".into()));
    }

    let lowest = current.iter().map(|s| s.order_key as i128).min().unwrap_or(0);
    let highest = current.iter().map(|s| s.order_key as i128).max().unwrap_or(0);
    let below = lowest.min(0) - 1;
    let above = highest.max(last_final) + 1;
    let (base, step) = if below - (span - 1) >= i64::MIN as i128 {
        (below, -1)
    } else if above + (span - 1) <= i64::MAX as i128 {
        (above, 1)
    } else {
        return Err(Error::Validation(
            "no free key range to park the sibling group in".into(),
        ));
    };

    let mut plan = RenumberPlan {
        temporary: Vec::with_capacity(children.len()),
        assignments: Vec::with_capacity(children.len()),
    };
    for (rank, id) in children.iter().enumerate() {
        let rank = rank as i128;
        let temp = (base + step * (rank * width + (id.0 as i128 - min_id))) as i64;
        plan.temporary.push((*id, temp));
        plan.assignments.push((*id, ((rank + 1) * GAP as i128) as i64));
    }
    Ok(plan)
}

/// Neighbour keys around the insertion point `index` of an ordered group.
pub fn neighbours(siblings: &[Sibling], index: usize) -> (Option<i64>, Option<i64>) {
    let lower = index.checked_sub(1).and_then(|i| siblings.get(i)).map(|s| s.order_key);
    let upper = siblings.get(index).map(|s| s.order_key);
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_step_by_gap() {
        assert_eq!(next_after(None), Slot::Key(BASE));
        assert_eq!(next_after(Some(2000)), Slot::Key(3000));
        assert_eq!(next_after(Some(i64::MAX - 10)), Slot::Renumber);
    }

    #[test]
    fn midpoint_between_neighbours() {
        assert_eq!(between(Some(1000), Some(2000)).unwrap(), Slot::Key(1500));
        assert_eq!(between(Some(10), Some(12)).unwrap(), Slot::Key(11));
        assert_eq!(between(None, Some(1000)).unwrap(), Slot::Key(0));
        assert_eq!(between(None, None).unwrap(), Slot::Key(BASE));
    }

    #[test]
    fn adjacent_keys_require_renumber() {
        assert_eq!(between(Some(10), Some(11)).unwrap(), Slot::Renumber);
        assert_eq!(between(Some(7), Some(7)).unwrap(), Slot::Renumber);
        assert!(between(Some(11), Some(10)).is_err());
    }

    #[test]
    fn renumber_temporary_keys_are_distinct_and_negative() {
        let ids = [NodeId(9), NodeId(2), NodeId(5), NodeId(3)];
        let plan = renumber_group(&ids, &[]).unwrap();
        let temps: HashSet<i64> = plan.temporary.iter().map(|(_, k)| *k).collect();
        assert_eq!(temps.len(), ids.len());
        assert!(plan.temporary.iter().all(|(_, k)| *k < 0));
        assert_eq!(
            plan.assignments,
            vec![
                (NodeId(9), 1000),
                (NodeId(2), 2000),
                (NodeId(5), 3000),
                (NodeId(3), 4000)
            ]
        );
    }

    fn group(keys: &[(i64, i64)]) -> Vec<Sibling> {
        keys.iter()
            .map(|&(id, order_key)| Sibling {
                id: NodeId(id),
                order_key,
            })
            .collect()
    }

    #[test]
    fn renumber_temporaries_stay_below_negative_keys() {
        let ids = [NodeId(1), NodeId(2), NodeId(3)];
        let current = group(&[(3, -1000), (2, 0), (1, 1000)]);
        let plan = renumber_group(&ids, &current).unwrap();
        assert!(plan.temporary.iter().all(|(_, k)| *k < -1000));
        assert_eq!(plan.temporary[0], (NodeId(1), -1001));
    }

    #[test]
    fn renumber_parks_above_when_the_floor_is_taken() {
        let ids = [NodeId(2), NodeId(3)];
        let current = group(&[(2, i64::MIN + 1), (3, 5000)]);
        let plan = renumber_group(&ids, &current).unwrap();
        assert!(plan.temporary.iter().all(|(_, k)| *k > 5000));
        assert_eq!(plan.assignments, vec![(NodeId(2), 1000), (NodeId(3), 2000)]);
    }

    #[test]
    fn renumber_fails_when_no_range_is_free() {
        let ids = [NodeId(1), NodeId(2)];
        let current = group(&[(1, i64::MIN + 1), (2, i64::MAX - 1)]);
        assert!(matches!(
            renumber_group(&ids, &current),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn renumber_rejects_duplicates_and_accepts_empty() {
        assert!(renumber_group(&[], &[]).unwrap().is_empty());
        assert!(matches!(
            renumber_group(&[NodeId(1), NodeId(1)], &[]),
            Err(Error::Validation(_))
        ));
    }
}
