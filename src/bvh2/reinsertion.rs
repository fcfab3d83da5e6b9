// Reinsertion optimizer based on "Parallel Reinsertion for Bounding Volume Hierarchy Optimization", by D. Meister and J. Bittner:
// https://meistdan.github.io/publications/prbvh/paper.pdf
// https://jcgt.org/published/0011/04/01/paper.pdf
// Reference: https://github.com/madmann91/bvh/blob/2fd0db62022993963a7343669275647cb073e19a/include/bvh/parallel_reinsertion_optimizer.hpp

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::bvh2::{refit::refit_inner_nodes, Bvh2, Bvh2Node};

/// Restructures the BVH, moving subtrees to the place in the hierarchy where they lower the SAH cost the most.
///
/// Each round evaluates every `u`-th node as a candidate in parallel. Candidates that touch the same nodes
/// are resolved with per-node 64 bit locks: the best gain wins, the losers are dropped for this round.
/// A round that would raise the total cost is rolled back and ends the optimization.
#[derive(Clone, Copy, Debug)]
pub struct ReinsertionOptimizer {
    /// Initial candidate stride. Lowered each time a stride stops paying off.
    pub stride: usize,
    /// A round that improves the cost by less than this moves on to the next stride.
    pub threshold: f32,
    /// Inner node cost used for the SAH.
    pub traversal_cost: f32,
}

impl Default for ReinsertionOptimizer {
    fn default() -> Self {
        Self {
            stride: 9,
            threshold: 0.1,
            traversal_cost: 1.0,
        }
    }
}

#[derive(Default, Clone, Copy, Debug)]
pub struct Reinsertion {
    pub from: u32,
    pub to: u32,
    pub area_diff: f32,
}

impl Reinsertion {
    /// Orders by gain, ties broken by node index. Gains are positive so their bit patterns sort like the floats.
    #[inline(always)]
    fn lock_key(&self) -> u64 {
        ((self.area_diff.to_bits() as u64) << 32) | self.from as u64
    }

    #[inline(always)]
    fn conflicts(&self, parents: &[u32]) -> [usize; 5] {
        let from = self.from as usize;
        let to = self.to as usize;
        [
            to,
            from,
            Bvh2Node::sibling(from),
            parents[to] as usize,
            parents[from] as usize,
        ]
    }
}

impl ReinsertionOptimizer {
    /// Runs with the configured stride and threshold. Returns how many nodes were moved.
    pub fn optimize(&self, bvh: &mut Bvh2) -> usize {
        self.optimize_with(bvh, self.stride, self.threshold)
    }

    pub fn optimize_with(&self, bvh: &mut Bvh2, u: usize, threshold: f32) -> usize {
        crate::scope!("reinsertion_optimize");

        let node_count = bvh.nodes.len();
        // Smaller trees have no destination other than a sibling or parent.
        if u == 0 || node_count < 5 {
            return 0;
        }

        let mut parents = bvh.compute_parents();
        let locks: Vec<AtomicU64> = (0..node_count).map(|_| AtomicU64::new(0)).collect();
        let mut cost = bvh.compute_cost(self.traversal_cost);
        let mut u = u;
        let mut iteration = 0;
        let mut moved = 0;

        loop {
            let offset = iteration % u + 1;
            let candidates: Vec<u32> = (offset..node_count).step_by(u).map(|i| i as u32).collect();
            let reinsertions = search(&bvh.nodes, &parents, &candidates);
            let accepted = resolve_conflicts(&parents, &reinsertions, &locks);

            let mut gain = 0.0;
            if !accepted.is_empty() {
                let snapshot = bvh.nodes.clone();
                for reinsertion in &accepted {
                    reinsert_node(
                        &mut bvh.nodes,
                        &mut parents,
                        reinsertion.from as usize,
                        reinsertion.to as usize,
                    );
                }
                let leaves = bvh.leaves();
                refit_inner_nodes(&mut bvh.nodes, &parents, &leaves);

                let new_cost = bvh.compute_cost(self.traversal_cost);
                if new_cost > cost {
                    bvh.nodes = snapshot;
                    log::debug!(
                        "reinsertion: round with stride {u} would raise cost {cost} to {new_cost}, rolled back"
                    );
                    break;
                }
                log::debug!(
                    "reinsertion: stride {u}, {} candidates, {} proposals, {} applied, cost {cost} -> {new_cost}",
                    candidates.len(),
                    reinsertions.len(),
                    accepted.len()
                );
                moved += accepted.len();
                gain = cost - new_cost;
                cost = new_cost;
            }

            iteration += 1;
            if gain <= threshold || iteration >= u {
                if u <= 1 {
                    break;
                }
                u -= 1;
                iteration = 0;
            }
        }

        moved
    }
}

/// Best reinsertion of every candidate with a positive gain.
fn search(nodes: &[Bvh2Node], parents: &[u32], candidates: &[u32]) -> Vec<Reinsertion> {
    crate::scope!("reinsertion_search");
    #[cfg(feature = "parallel")]
    {
        candidates
            .par_iter()
            .map_init(Vec::new, |stack, &node_id| {
                find_reinsertion(nodes, parents, node_id as usize, stack)
            })
            .filter(|r| r.area_diff > 0.0)
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        let mut stack = Vec::new();
        candidates
            .iter()
            .map(|&node_id| find_reinsertion(nodes, parents, node_id as usize, &mut stack))
            .filter(|r| r.area_diff > 0.0)
            .collect()
    }
}

/// Every reinsertion claims the nodes it modifies with `fetch_max` of its key.
/// Only reinsertions that own all of their nodes afterwards are kept, the rest are dropped.
fn resolve_conflicts(
    parents: &[u32],
    reinsertions: &[Reinsertion],
    locks: &[AtomicU64],
) -> Vec<Reinsertion> {
    crate::scope!("reinsertion_resolve_conflicts");
    #[cfg(feature = "parallel")]
    {
        locks.par_iter().for_each(|l| l.store(0, Ordering::Relaxed));
        reinsertions.par_iter().for_each(|r| {
            let key = r.lock_key();
            for c in r.conflicts(parents) {
                locks[c].fetch_max(key, Ordering::Relaxed);
            }
        });
        reinsertions
            .par_iter()
            .filter(|r| {
                let key = r.lock_key();
                r.conflicts(parents)
                    .iter()
                    .all(|&c| locks[c].load(Ordering::Relaxed) == key)
            })
            .copied()
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        locks.iter().for_each(|l| l.store(0, Ordering::Relaxed));
        reinsertions.iter().for_each(|r| {
            let key = r.lock_key();
            for c in r.conflicts(parents) {
                locks[c].fetch_max(key, Ordering::Relaxed);
            }
        });
        reinsertions
            .iter()
            .filter(|r| {
                let key = r.lock_key();
                r.conflicts(parents)
                    .iter()
                    .all(|&c| locks[c].load(Ordering::Relaxed) == key)
            })
            .copied()
            .collect()
    }
}

/// Finds where moving `node_id` lowers the total area the most. `area_diff` is 0 if no move helps.
pub fn find_reinsertion(
    nodes: &[Bvh2Node],
    parents: &[u32],
    node_id: usize,
    stack: &mut Vec<(f32, u32)>,
) -> Reinsertion {
    debug_assert_ne!(node_id, 0);
    assert!(node_id < nodes.len() && node_id < parents.len());

    /*
     * Here is an example that explains how the cost of a reinsertion is computed. For the
     * reinsertion from A to C, in the figure below, we need to remove P1, replace it by B,
     * and create a node that holds A and C and place it where C was.
     *
     *             R
     *            / \
     *          Pn   Q1
     *          /     \
     *        ...     ...
     *        /         \
     *       P1          C
     *      / \
     *     A   B
     *
     * The resulting area *decrease* is (SA(x) means the surface area of x):
     *
     *     SA(P1) +                                                : P1 was removed
     *     SA(P2) - SA(B) +                                        : P2 now only contains B
     *     SA(P3) - SA(B U sibling(P2)) +                          : Same but for P3
     *     ... +
     *     SA(Pn) - SA(B U sibling(P2) U ... U sibling(P(n - 1)) + : Same but for Pn
     *     0 +                                                     : R does not change
     *     SA(Q1) - SA(Q1 U A) +                                   : Q1 now contains A
     *     SA(Q2) - SA(Q2 U A) +                                   : Q2 now contains A
     *     ... +
     *     -SA(A U C)                                              : For the parent of A and C
     */
    let mut best = Reinsertion {
        from: node_id as u32,
        to: 0,
        area_diff: 0.0,
    };
    let aabb = nodes[node_id].aabb;
    let node_area = aabb.half_area();

    let parent_id = parents[node_id] as usize;
    let mut area_diff = nodes[parent_id].aabb.half_area();
    let mut sibling_id = Bvh2Node::sibling(node_id);
    let mut pivot_bbox = nodes[sibling_id].aabb;
    let mut pivot_id = parent_id;

    stack.clear();
    loop {
        stack.push((area_diff, sibling_id as u32));
        while let Some((top_area_diff, top_sibling_id)) = stack.pop() {
            if top_area_diff - node_area <= best.area_diff {
                continue;
            }

            let dst_node = &nodes[top_sibling_id as usize];
            let merged_area = dst_node.aabb.union(&aabb).half_area();
            let reinsert_area = top_area_diff - merged_area;
            if reinsert_area > best.area_diff {
                best.to = top_sibling_id;
                best.area_diff = reinsert_area;
            }

            if !dst_node.is_leaf() {
                let child_area = reinsert_area + dst_node.aabb.half_area();
                stack.push((child_area, dst_node.first_index));
                stack.push((child_area, dst_node.first_index + 1));
            }
        }

        if pivot_id != parent_id {
            pivot_bbox = pivot_bbox.union(&nodes[sibling_id].aabb);
            area_diff += nodes[pivot_id].aabb.half_area() - pivot_bbox.half_area();
        }

        if pivot_id == 0 {
            break;
        }

        sibling_id = Bvh2Node::sibling(pivot_id);
        pivot_id = parents[pivot_id] as usize;
    }

    // Moving next to the sibling or the parent leaves the tree as it is.
    if best.to as usize == Bvh2Node::sibling(node_id) || best.to == parents[node_id] {
        best.area_diff = 0.0;
    }

    best
}

/// Moves the subtree at `from` next to `to`. The parent of `from` is replaced by its other child, and `to` becomes
/// an inner node over the pair slot of `from`. Boxes on the affected paths are left stale, refit afterwards.
pub fn reinsert_node(nodes: &mut [Bvh2Node], parents: &mut [u32], from: usize, to: usize) {
    let sibling_id = Bvh2Node::sibling(from);
    let parent_id = parents[from] as usize;
    let sibling_node = nodes[sibling_id];
    let dst_node = nodes[to];

    nodes[to].set_inner(Bvh2Node::pair_start(from) as u32);
    nodes[sibling_id] = dst_node;
    nodes[parent_id] = sibling_node;

    if !dst_node.is_leaf() {
        parents[dst_node.first_index as usize] = sibling_id as u32;
        parents[dst_node.first_index as usize + 1] = sibling_id as u32;
    }
    if !sibling_node.is_leaf() {
        parents[sibling_node.first_index as usize] = parent_id as u32;
        parents[sibling_node.first_index as usize + 1] = parent_id as u32;
    }

    parents[sibling_id] = to as u32;
    parents[from] = to as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        INVALID,
        lbvh::LinearBuilder,
        ploc::{PlocBuilder, PlocSearchDistance},
        test_util::geometry::demoscene,
        utils::{compute_bounding_boxes_and_centers, compute_global_bounding_box},
    };

    #[test]
    fn test_reinsertion() {
        let tris = demoscene(32, 0);
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&tris);
        let global = compute_global_bounding_box(&bboxes);

        let mut bvh = PlocBuilder {
            search_distance: PlocSearchDistance::VeryLow,
        }
        .build(&global, &bboxes, &centers);
        bvh.validate(&tris, false, true);
        let cost = bvh.compute_cost(1.0);
        ReinsertionOptimizer::default().optimize(&mut bvh);
        bvh.validate(&tris, false, true);
        assert!(bvh.compute_cost(1.0) <= cost);

        let mut bvh = LinearBuilder::default().build(&global, &bboxes, &centers);
        let cost = bvh.compute_cost(1.0);
        let moved = ReinsertionOptimizer::default().optimize_with(&mut bvh, 3, 0.0);
        bvh.validate(&tris, false, true);
        assert!(moved > 0);
        assert!(bvh.compute_cost(1.0) < cost);
    }

    #[test]
    fn move_leaf_to_better_place() {
        use crate::aabb::Aabb;
        use glam::*;

        // a and c are far apart but paired, b sits next to a.
        let a = Aabb::new(vec3a(0.0, 0.0, 0.0), vec3a(1.0, 1.0, 1.0));
        let c = Aabb::new(vec3a(20.0, 0.0, 0.0), vec3a(21.0, 1.0, 1.0));
        let b = Aabb::new(vec3a(1.5, 0.0, 0.0), vec3a(2.5, 1.0, 1.0));
        let d = Aabb::new(vec3a(22.0, 0.0, 0.0), vec3a(23.0, 1.0, 1.0));
        let mut nodes = vec![
            Bvh2Node::new(a.union(&b).union(&c).union(&d), 0, 1),
            Bvh2Node::new(a.union(&c), 0, 3),
            Bvh2Node::new(b.union(&d), 0, 5),
            Bvh2Node::new(a, 1, 0),
            Bvh2Node::new(c, 1, 1),
            Bvh2Node::new(b, 1, 2),
            Bvh2Node::new(d, 1, 3),
        ];
        let bvh = Bvh2 {
            nodes: nodes.clone(),
            primitive_indices: vec![0, 1, 2, 3],
        };
        let mut parents = bvh.compute_parents();
        let mut stack = Vec::new();
        let r = find_reinsertion(&nodes, &parents, 4, &mut stack);
        assert!(r.area_diff > 0.0);

        reinsert_node(&mut nodes, &mut parents, r.from as usize, r.to as usize);
        let mut moved = Bvh2 {
            nodes,
            primitive_indices: vec![0, 1, 2, 3],
        };
        let leaves = moved.leaves();
        refit_inner_nodes(&mut moved.nodes, &parents, &leaves);
        assert_eq!(parents, moved.compute_parents());
        moved.validate(&[a, c, b, d], false, true);
        assert!(moved.compute_cost(1.0) < bvh.compute_cost(1.0));
    }

    #[test]
    fn higher_gain_wins_shared_nodes() {
        // Full tree over four leaves: 0 -> (1, 2), 1 -> (3, 4), 2 -> (5, 6).
        let parents = vec![INVALID, 0, 0, 1, 1, 2, 2];
        let locks: Vec<AtomicU64> = (0..parents.len()).map(|_| AtomicU64::new(0)).collect();
        let big = Reinsertion {
            from: 4,
            to: 6,
            area_diff: 5.0,
        };
        // Touches 3, 5, 6, 1 and 2, all but 5 are also claimed by `big`.
        let small = Reinsertion {
            from: 5,
            to: 3,
            area_diff: 2.0,
        };
        assert!(big.lock_key() > small.lock_key());

        let accepted = resolve_conflicts(&parents, &[small, big], &locks);
        assert_eq!(accepted.len(), 1);
        assert_eq!((accepted[0].from, accepted[0].to), (4, 6));
        assert_eq!(locks[5].load(Ordering::Relaxed), small.lock_key());

        // Locks from the previous round are cleared, so a lone proposal always goes through.
        let accepted = resolve_conflicts(&parents, &[small], &locks);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].from, 5);

        // Equal gains fall back to the node index.
        let tie = Reinsertion {
            from: 3,
            to: 5,
            area_diff: 2.0,
        };
        assert!(small.lock_key() > tie.lock_key());
        let accepted = resolve_conflicts(&parents, &[tie, small], &locks);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].from, 5);
    }
}
