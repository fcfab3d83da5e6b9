// Based on https://github.com/madmann91/bvh/blob/2fd0db62022993963a7343669275647cb073e19a/include/bvh/leaf_collapser.hpp
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    bvh2::{bottom_up::traverse_bottom_up, Bvh2, Bvh2Node},
    parallel::{par_for_each, prefix_sum_in_place, UnsafeSlice},
};

/// Collapses leaves of the BVH according to the SAH. This optimization
/// is only helpful for bottom-up builders, as top-down builders already
/// have a termination criterion that prevents leaf creation when the SAH
/// cost does not improve.
#[derive(Clone, Copy, Debug)]
pub struct LeafCollapser {
    /// Collapsing never produces a leaf with more primitives than this.
    pub max_leaf_size: u32,
    /// Cost of traversing an inner node relative to intersecting one primitive.
    pub traversal_cost: f32,
}

impl Default for LeafCollapser {
    fn default() -> Self {
        Self {
            max_leaf_size: u32::MAX,
            traversal_cost: 1.0,
        }
    }
}

impl LeafCollapser {
    pub fn collapse(&self, bvh: &mut Bvh2) {
        crate::scope!("collapse");

        if self.max_leaf_size <= 1 || bvh.nodes.is_empty() || bvh.nodes[0].is_leaf() {
            return;
        }

        let node_qty = bvh.nodes.len();
        let parents = bvh.compute_parents();
        let leaves = bvh.leaves();

        // Per node: how many nodes survive (0 or 1) and how many primitives it holds as a leaf.
        let node_counts: Vec<AtomicU32> = (0..node_qty).map(|_| AtomicU32::new(1)).collect();
        let prim_counts: Vec<AtomicU32> = (0..node_qty).map(|_| AtomicU32::new(0)).collect();

        let nodes = &bvh.nodes;
        traverse_bottom_up(
            &parents,
            &leaves,
            |i| prim_counts[i].store(nodes[i].prim_count, Ordering::Relaxed),
            |i| {
                let node = &nodes[i];
                let first_child = node.first_index as usize;
                let left_count = prim_counts[first_child].load(Ordering::Relaxed);
                let right_count = prim_counts[first_child + 1].load(Ordering::Relaxed);
                let total_count = left_count + right_count;

                // Only nodes whose children are both (possibly collapsed) leaves are candidates.
                if left_count > 0 && right_count > 0 && total_count <= self.max_leaf_size {
                    let left = &nodes[first_child];
                    let right = &nodes[first_child + 1];
                    let collapse_cost =
                        node.aabb.half_area() * (total_count as f32 - self.traversal_cost);
                    let base_cost = left.aabb.half_area() * left_count as f32
                        + right.aabb.half_area() * right_count as f32;
                    if collapse_cost <= base_cost {
                        prim_counts[i].store(total_count, Ordering::Relaxed);
                        prim_counts[first_child].store(0, Ordering::Relaxed);
                        prim_counts[first_child + 1].store(0, Ordering::Relaxed);
                        node_counts[first_child].store(0, Ordering::Relaxed);
                        node_counts[first_child + 1].store(0, Ordering::Relaxed);
                    }
                }
            },
        );

        let mut node_counts: Vec<u32> = node_counts.into_iter().map(|c| c.into_inner()).collect();
        let mut prim_counts: Vec<u32> = prim_counts.into_iter().map(|c| c.into_inner()).collect();
        let new_node_count = prefix_sum_in_place(&mut node_counts) as usize;
        let new_prim_count = prefix_sum_in_place(&mut prim_counts) as usize;

        if prim_counts[0] > 0 {
            // The root became a leaf, primitive_indices can stay as they are.
            let root = bvh.nodes[0];
            bvh.nodes = vec![Bvh2Node::new(root.aabb, prim_counts[0], 0)];
            log::debug!("leaf collapse turned the root into a leaf of {} primitives", prim_counts[0]);
            return;
        }

        let mut new_nodes = vec![Bvh2Node::default(); new_node_count];
        let mut new_indices = vec![0u32; new_prim_count];
        new_nodes[0] = bvh.nodes[0];
        new_nodes[0].first_index = node_counts[new_nodes[0].first_index as usize - 1];

        let nodes = &bvh.nodes;
        let primitive_indices = &bvh.primitive_indices;
        let new_nodes_view = UnsafeSlice::new(&mut new_nodes);
        let new_indices_view = UnsafeSlice::new(&mut new_indices);
        let node_counts = &node_counts;
        let prim_counts = &prim_counts;
        par_for_each(node_qty - 1, |k| {
            let i = k + 1;
            let node_id = node_counts[i - 1] as usize;
            if node_id == node_counts[i] as usize {
                // Removed by a collapse.
                return;
            }

            let mut node = nodes[i];
            let mut first_prim = prim_counts[i - 1];
            if first_prim != prim_counts[i] {
                node.prim_count = prim_counts[i] - first_prim;
                node.first_index = first_prim;

                // Gather the primitives of every leaf below i, depth first.
                let mut j = i;
                loop {
                    let current = &nodes[j];
                    if current.is_leaf() {
                        for n in 0..current.prim_count {
                            // SAFETY: slots first_prim.. belong to this leaf only.
                            unsafe {
                                new_indices_view.write(
                                    (first_prim + n) as usize,
                                    primitive_indices[(current.first_index + n) as usize],
                                )
                            };
                        }
                        first_prim += current.prim_count;
                        while !Bvh2Node::is_left_sibling(j) && j != i {
                            j = parents[j] as usize;
                        }
                        if j == i {
                            break;
                        }
                        j = Bvh2Node::sibling(j);
                    } else {
                        j = current.first_index as usize;
                    }
                }
            } else {
                node.first_index = node_counts[node.first_index as usize - 1];
            }
            // SAFETY: node_id is unique to node i.
            unsafe { new_nodes_view.write(node_id, node) };
        });

        log::debug!(
            "leaf collapse: {} -> {} nodes",
            bvh.nodes.len(),
            new_nodes.len()
        );
        bvh.nodes = new_nodes;
        bvh.primitive_indices = new_indices;
    }
}
