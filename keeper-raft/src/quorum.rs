//! Quorum calculations over a set of node IDs, including joint-consensus sets.

use std::collections::HashSet;

use crate::NodeId;

/// Determine if the given set of `granted` votes constitutes a majority of `members`.
pub fn is_majority(granted: &HashSet<NodeId>, members: &HashSet<NodeId>) -> bool {
    if granted.is_empty() || members.is_empty() {
        return false;
    }
    let count = members.iter().filter(|id| granted.contains(*id)).count();
    count * 2 > members.len()
}

/// Determine if `granted` is a majority in both `members` and `members_after_consensus`, when the
/// latter is present (joint consensus).
pub fn is_majority_of_joint(
    granted: &HashSet<NodeId>,
    members: &HashSet<NodeId>,
    members_after_consensus: &Option<HashSet<NodeId>>,
) -> bool {
    if !is_majority(granted, members) {
        return false;
    }
    match members_after_consensus {
        Some(next) => is_majority(granted, next),
        None => true,
    }
}

/// Find the greatest value that is present in a majority of `indices` w.r.t. `members`.
///
/// Used to compute the highest log index that has been replicated to a quorum: given each
/// member's matched index, find the one where a majority have matched at least that far.
pub fn majority_value<'a, I>(members: &HashSet<NodeId>, indices: I) -> Option<u64>
where I: IntoIterator<Item = (&'a NodeId, &'a u64)> {
    let mut values: Vec<u64> = indices
        .into_iter()
        .filter(|(id, _)| members.contains(id))
        .map(|(_, v)| *v)
        .collect();
    if values.len() != members.len() {
        return None;
    }
    values.sort_unstable();
    let mid = (values.len().saturating_sub(1)) / 2;
    values.get(mid).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashset;

    #[test]
    fn majority_of_three() {
        let members = hashset! {1,2,3};
        assert!(!is_majority(&hashset! {1}, &members));
        assert!(is_majority(&hashset! {1,2}, &members));
        assert!(is_majority(&hashset! {1,2,3}, &members));
    }

    #[test]
    fn joint_requires_both_sides() {
        let members = hashset! {1,2,3};
        let next = Some(hashset! {3,4,5});
        assert!(!is_majority_of_joint(&hashset! {1,2}, &members, &next));
        assert!(is_majority_of_joint(&hashset! {1,2,3,4}, &members, &next));
    }
}
