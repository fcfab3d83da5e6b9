//! One round of pairwise merging, shared by the bottom-up builders.
//!
//! The builders keep a list of subtree roots. Each round pairs some of them up, writes the paired roots to their
//! final place in the node array (from the back toward index 1) and replaces every pair by its parent. The list
//! keeps its order, so the Morton order the builders start from is preserved.

use crate::{
    bvh2::Bvh2Node,
    parallel::{exclusive_prefix_sum, par_for_each, UnsafeSlice},
};

/// Marks a node that stays unmerged this round.
pub(crate) const UNPAIRED: u32 = u32::MAX;

/// Result of [`merge_pass`].
pub(crate) struct MergedNodes {
    /// Roots for the next round.
    pub next: Vec<Bvh2Node>,
    /// Position in `next` of every input node that survived as itself or as the parent of its pair.
    /// Only meaningful for those nodes.
    pub positions: Vec<u32>,
    pub pair_count: usize,
}

/// Merges every pair `(i, partner[i])`. Pairs must be mutual: `partner[partner[i]] == i`.
/// The parent takes the place of the lower index of its pair. Children are written to
/// `nodes[*children_end - 2 * pair_count..*children_end]`, and `children_end` moves down past them.
pub(crate) fn merge_pass(
    current: &[Bvh2Node],
    partner: &[u32],
    nodes: &mut [Bvh2Node],
    children_end: &mut usize,
) -> MergedNodes {
    crate::scope!("merge_pass");
    let count = current.len();
    debug_assert_eq!(partner.len(), count);

    let keeps: Vec<u32> = (0..count)
        .map(|i| (partner[i] == UNPAIRED || partner[i] as usize > i) as u32)
        .collect();
    let owns: Vec<u32> = (0..count)
        .map(|i| (partner[i] != UNPAIRED && partner[i] as usize > i) as u32)
        .collect();
    let mut positions = vec![0u32; count];
    let mut pair_index = vec![0u32; count];
    let next_count = exclusive_prefix_sum(&keeps, &mut positions) as usize;
    let pair_count = exclusive_prefix_sum(&owns, &mut pair_index) as usize;

    assert!(
        2 * pair_count < *children_end,
        "Not enough room for {pair_count} pairs below node {}",
        *children_end
    );
    let children_begin = *children_end - 2 * pair_count;

    let mut next = vec![Bvh2Node::default(); next_count];
    {
        let next_view = UnsafeSlice::new(&mut next);
        let nodes_view = UnsafeSlice::new(nodes);
        let (keeps, owns, positions, pair_index) = (&keeps, &owns, &positions, &pair_index);
        par_for_each(count, |i| {
            if keeps[i] == 0 {
                return;
            }
            let node = if owns[i] != 0 {
                let left = current[i];
                let right = current[partner[i] as usize];
                let first_child = children_begin + 2 * pair_index[i] as usize;
                // SAFETY: every pair owns a distinct slot pair, every kept node a distinct position.
                unsafe {
                    nodes_view.write(first_child, left);
                    nodes_view.write(first_child + 1, right);
                }
                Bvh2Node::new(left.aabb.union(&right.aabb), 0, first_child as u32)
            } else {
                current[i]
            };
            unsafe { next_view.write(positions[i] as usize, node) };
        });
    }

    *children_end = children_begin;
    MergedNodes {
        next,
        positions,
        pair_count,
    }
}
