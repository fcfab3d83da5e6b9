//! Reorders sibling pairs in memory so that pairs with larger area, which are visited more often, come first.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{
    bvh2::{Bvh2, Bvh2Node},
    parallel::{par_for_each, UnsafeSlice},
    radix_sort::sort_by_key,
};

/// Moves sibling pairs around without changing the topology: the root stays at 0, every pair stays together
/// and keeps its left/right order. Only the placement in memory changes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeLayoutOptimizer;

impl NodeLayoutOptimizer {
    pub fn optimize(&self, bvh: &mut Bvh2) {
        crate::scope!("node_layout_optimize");
        let node_count = bvh.nodes.len();
        if node_count < 5 {
            return;
        }
        let pair_count = (node_count - 1) / 2;
        let nodes = &bvh.nodes;
        let pair_key = |pair: usize| {
            let area = nodes[pair * 2 + 1].aabb.half_area() + nodes[pair * 2 + 2].aabb.half_area();
            // Areas are positive, so inverting the bits gives a descending order.
            !area.to_bits()
        };

        #[cfg(feature = "parallel")]
        let mut keys: Vec<u32> = (0..pair_count).into_par_iter().map(pair_key).collect();
        #[cfg(not(feature = "parallel"))]
        let mut keys: Vec<u32> = (0..pair_count).map(pair_key).collect();

        // order[new_pair] = old_pair
        let mut order: Vec<u32> = (0..pair_count as u32).collect();
        sort_by_key(&mut keys, &mut order);

        let mut new_pair_of = vec![0u32; pair_count];
        {
            let view = UnsafeSlice::new(&mut new_pair_of);
            let order = &order;
            // SAFETY: order is a permutation, every slot is written once.
            par_for_each(pair_count, |new_pair| unsafe {
                view.write(order[new_pair] as usize, new_pair as u32)
            });
        }

        let remap = |node: Bvh2Node| {
            let mut node = node;
            if !node.is_leaf() {
                let old_pair = (node.first_index as usize - 1) / 2;
                node.first_index = new_pair_of[old_pair] * 2 + 1;
            }
            node
        };

        let mut new_nodes = vec![Bvh2Node::default(); node_count];
        new_nodes[0] = remap(nodes[0]);
        {
            let view = UnsafeSlice::new(&mut new_nodes);
            let order = &order;
            par_for_each(pair_count, |new_pair| {
                let old_first = order[new_pair] as usize * 2 + 1;
                let new_first = new_pair * 2 + 1;
                // SAFETY: each new pair is written by one iteration.
                unsafe {
                    view.write(new_first, remap(nodes[old_first]));
                    view.write(new_first + 1, remap(nodes[old_first + 1]));
                }
            });
        }
        bvh.nodes = new_nodes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bvh2::leaf_indices,
        ploc::PlocBuilder,
        test_util::geometry::demoscene,
        utils::{compute_bounding_boxes_and_centers, compute_global_bounding_box},
    };

    #[test]
    fn layout_keeps_tree_and_sorts_pairs() {
        let tris = demoscene(16, 4);
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&tris);
        let mut bvh =
            PlocBuilder::default().build(&compute_global_bounding_box(&bboxes), &bboxes, &centers);
        let cost = bvh.compute_cost(1.0);
        let leaves = leaf_indices(&bvh.nodes).len();

        NodeLayoutOptimizer.optimize(&mut bvh);

        bvh.validate(&tris, false, true);
        assert!((bvh.compute_cost(1.0) - cost).abs() <= cost * 1e-5);
        assert_eq!(leaves, bvh.leaf_count());
        let pair_area = |i: usize| bvh.nodes[i].aabb.half_area() + bvh.nodes[i + 1].aabb.half_area();
        for pair in (1..bvh.nodes.len() - 2).step_by(2) {
            assert!(pair_area(pair) >= pair_area(pair + 2));
        }
    }
}
