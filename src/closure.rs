//! Pure closure-table arithmetic shared by the mutation paths.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::error::ClosureIndexError;

/// One `(ancestor, descendant, depth)` row of the closure table.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClosureEdge<Id> {
    pub ancestor: Id,
    pub descendant: Id,
    pub depth: i32,
}

impl<Id> ClosureEdge<Id> {
    pub fn new(ancestor: Id, descendant: Id, depth: i32) -> Self {
        Self {
            ancestor,
            descendant,
            depth,
        }
    }
}

impl<Id: PartialEq> ClosureEdge<Id> {
    pub fn is_reflexive(&self) -> bool {
        self.ancestor == self.descendant && self.depth == 0
    }
}

/// Attach a subtree below a parent.
///
/// `supertree` holds `(ancestor, depth to parent)` for the parent and all of
/// its ancestors; `subtree` holds `(descendant, depth from root)` for the
/// subtree root and everything below it.
pub fn link<Id: Clone>(supertree: &[(Id, i32)], subtree: &[(Id, i32)]) -> Vec<ClosureEdge<Id>> {
    let mut edges = Vec::with_capacity(supertree.len() * subtree.len());
    for (ancestor, up) in supertree {
        for (descendant, down) in subtree {
            edges.push(ClosureEdge::new(
                ancestor.clone(),
                descendant.clone(),
                up + down + 1,
            ));
        }
    }
    edges
}

/// A node as seen by [`compute`].
#[derive(Clone, Debug)]
pub struct ForestNode<Id> {
    pub id: Id,
    pub parent: Option<Id>,
    pub deleted: bool,
}

/// Recompute the closure for a whole forest from the parent references.
///
/// A deleted node keeps its edges to its own subtree but its link to its
/// parent counts as severed. Dangling parent references end the chain.
pub fn compute<Id>(nodes: &[ForestNode<Id>]) -> Result<Vec<ClosureEdge<Id>>, ClosureIndexError>
where
    Id: Clone + Eq + Hash + std::fmt::Debug,
{
    let by_id: HashMap<&Id, &ForestNode<Id>> = nodes.iter().map(|node| (&node.id, node)).collect();
    let mut edges = Vec::with_capacity(nodes.len());

    for node in nodes {
        edges.push(ClosureEdge::new(node.id.clone(), node.id.clone(), 0));

        let mut seen: HashSet<&Id> = HashSet::new();
        seen.insert(&node.id);
        let mut current = node;
        let mut depth = 0;

        while !current.deleted {
            let Some(parent) = current.parent.as_ref().and_then(|id| by_id.get(id).copied()) else {
                break;
            };
            if !seen.insert(&parent.id) {
                return Err(ClosureIndexError::invariant(format!(
                    "parent references of {:?} form a cycle through {:?}",
                    node.id, parent.id
                )));
            }
            depth += 1;
            edges.push(ClosureEdge::new(parent.id.clone(), node.id.clone(), depth));
            current = parent;
        }
    }

    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i32, parent: Option<i32>, deleted: bool) -> ForestNode<i32> {
        ForestNode {
            id,
            parent,
            deleted,
        }
    }

    fn sorted(mut edges: Vec<ClosureEdge<i32>>) -> Vec<(i32, i32, i32)> {
        let mut rows: Vec<_> = edges
            .drain(..)
            .map(|edge| (edge.ancestor, edge.descendant, edge.depth))
            .collect();
        rows.sort();
        rows
    }

    #[test]
    fn link_adds_one_hop_to_each_crossing() {
        // parent 2 sits under 1; subtree 5 has child 6
        let edges = link(&[(2, 0), (1, 1)], &[(5, 0), (6, 1)]);
        assert_eq!(
            sorted(edges),
            vec![(1, 5, 2), (1, 6, 3), (2, 5, 1), (2, 6, 2)]
        );
    }

    #[test]
    fn link_for_new_leaf_under_root() {
        let edges = link(&[(1, 0)], &[(9, 0)]);
        assert_eq!(edges, vec![ClosureEdge::new(1, 9, 1)]);
        assert!(!edges[0].is_reflexive());
    }

    #[test]
    fn compute_covers_every_path_once() {
        let forest = vec![
            node(1, None, false),
            node(2, Some(1), false),
            node(3, Some(2), false),
            node(4, None, false),
        ];
        assert_eq!(
            sorted(compute(&forest).unwrap()),
            vec![
                (1, 1, 0),
                (1, 2, 1),
                (1, 3, 2),
                (2, 2, 0),
                (2, 3, 1),
                (3, 3, 0),
                (4, 4, 0),
            ]
        );
    }

    #[test]
    fn compute_cuts_deleted_links_upward_only() {
        let forest = vec![
            node(1, None, false),
            node(2, Some(1), true),
            node(3, Some(2), false),
        ];
        assert_eq!(
            sorted(compute(&forest).unwrap()),
            vec![(1, 1, 0), (2, 2, 0), (2, 3, 1), (3, 3, 0)]
        );
    }

    #[test]
    fn compute_rejects_parent_cycles() {
        let forest = vec![node(1, Some(2), false), node(2, Some(1), false)];
        let err = compute(&forest).unwrap_err();
        assert!(matches!(err, ClosureIndexError::Invariant(_)));
    }

    #[test]
    fn compute_stops_at_dangling_parent() {
        let forest = vec![node(7, Some(99), false)];
        assert_eq!(sorted(compute(&forest).unwrap()), vec![(7, 7, 0)]);
    }
}
