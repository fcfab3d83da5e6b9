//! Linear BVH builder: primitives are sorted along a Morton curve and neighbors are merged bottom-up,
//! tightest boundaries first.

use glam::Vec3A;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{
    aabb::Aabb,
    bvh2::{Bvh2, Bvh2Node},
    cluster::{merge_pass, UNPAIRED},
    morton::sort_primitives_by_morton_code,
    parallel::{par_for_each, UnsafeSlice},
};

/// Builds a tree shaped like the radix tree of the primitives' Morton codes. Fast, with lower quality than the
/// SAH builders; usually followed by reinsertion.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearBuilder;

impl LinearBuilder {
    pub fn build(&self, global_bbox: &Aabb, bboxes: &[Aabb], centers: &[Vec3A]) -> Bvh2 {
        crate::scope!("linear_build");
        assert!(!bboxes.is_empty(), "Cannot build a bvh without primitives");
        assert_eq!(bboxes.len(), centers.len(), "One center per bounding box expected");

        let prim_count = bboxes.len();
        let (primitive_indices, codes) = sort_primitives_by_morton_code(global_bbox, centers);

        let leaf = |slot: usize| {
            Bvh2Node::new(bboxes[primitive_indices[slot] as usize], 1, slot as u32)
        };
        // Merge level of the boundary after each node: the length of the common prefix of the two codes.
        // The last node has no boundary after it.
        let level = |i: usize| {
            if i + 1 < prim_count {
                (codes[i] ^ codes[i + 1]).leading_zeros()
            } else {
                0
            }
        };
        #[cfg(feature = "parallel")]
        let (mut current, mut levels): (Vec<Bvh2Node>, Vec<u32>) = (
            (0..prim_count).into_par_iter().map(leaf).collect(),
            (0..prim_count).into_par_iter().map(level).collect(),
        );
        #[cfg(not(feature = "parallel"))]
        let (mut current, mut levels): (Vec<Bvh2Node>, Vec<u32>) = (
            (0..prim_count).map(leaf).collect(),
            (0..prim_count).map(level).collect(),
        );

        let mut nodes = vec![Bvh2Node::default(); 2 * prim_count - 1];
        let mut children_end = nodes.len();
        let mut rounds = 0;
        while current.len() > 1 {
            let count = current.len();
            let flags = merge_flags(&levels);
            let partner: Vec<u32> = (0..count)
                .map(|i| {
                    if flags[i] {
                        i as u32 + 1
                    } else if i > 0 && flags[i - 1] {
                        i as u32 - 1
                    } else {
                        UNPAIRED
                    }
                })
                .collect();

            let merged = merge_pass(&current, &partner, &mut nodes, &mut children_end);
            debug_assert!(merged.pair_count > 0);

            let mut next_levels = vec![0u32; merged.next.len()];
            {
                let view = UnsafeSlice::new(&mut next_levels);
                let (levels, partner, positions) = (&levels, &partner, &merged.positions);
                par_for_each(count, |i| {
                    let p = partner[i];
                    // A merged pair inherits the boundary after its right node.
                    let level = if p == UNPAIRED {
                        levels[i]
                    } else if p as usize > i {
                        levels[p as usize]
                    } else {
                        return;
                    };
                    // SAFETY: surviving nodes have distinct positions.
                    unsafe { view.write(positions[i] as usize, level) };
                });
            }
            current = merged.next;
            levels = next_levels;
            rounds += 1;
        }

        debug_assert_eq!(children_end, 1);
        nodes[0] = current[0];
        log::debug!("linear: {} primitives, {} merge rounds", prim_count, rounds);
        Bvh2 {
            nodes,
            primitive_indices,
        }
    }
}

/// `flags[i]` is true if node `i` merges with node `i + 1` this round: the boundary between them is at least as
/// tight as both neighboring boundaries. Where two flagged boundaries share a node, the left one wins, first for
/// pairs starting at even indices, then for odd ones.
fn merge_flags(levels: &[u32]) -> Vec<bool> {
    let count = levels.len();
    let wants = |i: usize| {
        i + 1 < count && levels[i] >= levels[i + 1] && (i == 0 || levels[i] >= levels[i - 1])
    };
    #[cfg(feature = "parallel")]
    let mut flags: Vec<bool> = (0..count).into_par_iter().map(wants).collect();
    #[cfg(not(feature = "parallel"))]
    let mut flags: Vec<bool> = (0..count).map(wants).collect();

    for start in [0, 1] {
        let view = UnsafeSlice::new(&mut flags);
        let pairs = count.saturating_sub(start + 1).div_ceil(2);
        // SAFETY: every iteration only touches its own two flags.
        par_for_each(pairs, |k| unsafe {
            let i = start + 2 * k;
            if view.read(i) && view.read(i + 1) {
                view.write(i + 1, false);
            }
        });
    }
    flags
}

#[cfg(test)]
mod tests {
    use glam::*;

    use super::*;
    use crate::{
        test_util::geometry::demoscene,
        utils::{compute_bounding_boxes_and_centers, compute_global_bounding_box},
    };

    fn build(boxes: &[Aabb]) -> Bvh2 {
        let (bboxes, centers) = compute_bounding_boxes_and_centers(boxes);
        LinearBuilder.build(&compute_global_bounding_box(&bboxes), &bboxes, &centers)
    }

    #[test]
    fn flags_never_share_a_node() {
        let flags = merge_flags(&[5, 5, 5, 5, 2, 7, 7, 0]);
        assert!(flags[0]);
        for i in 0..flags.len() - 1 {
            assert!(!(flags[i] && flags[i + 1]), "{flags:?}");
        }
        assert!(flags[5]);
        assert!(!flags[7]);
    }

    #[test]
    fn single_primitive() {
        let bvh = build(&[Aabb::new(Vec3A::ZERO, Vec3A::ONE)]);
        assert_eq!(bvh.node_count(), 1);
        assert!(bvh.nodes[0].is_leaf());
        assert_eq!(bvh.primitive_indices, vec![0]);
    }

    #[test]
    fn neighbors_along_the_curve_are_siblings() {
        let boxes = [
            Aabb::new(vec3a(10.0, 0.0, 0.0), vec3a(11.0, 1.0, 1.0)),
            Aabb::new(vec3a(0.0, 0.0, 0.0), vec3a(1.0, 1.0, 1.0)),
            Aabb::new(vec3a(10.5, 0.0, 0.0), vec3a(11.5, 1.0, 1.0)),
            Aabb::new(vec3a(0.5, 0.0, 0.0), vec3a(1.5, 1.0, 1.0)),
        ];
        let bvh = build(&boxes);
        bvh.validate(&boxes, false, true);
        assert_eq!(bvh.node_count(), 7);
        let root = bvh.nodes[0];
        for child in [root.first_index, root.first_index + 1] {
            let node = bvh.nodes[child as usize];
            assert!(!node.is_leaf());
            let mut prims: Vec<u32> = [node.first_index, node.first_index + 1]
                .iter()
                .map(|&i| bvh.primitive_indices[bvh.nodes[i as usize].first_index as usize])
                .collect();
            prims.sort();
            assert!(prims == [0, 2] || prims == [1, 3], "{prims:?}");
        }
    }

    #[test]
    fn duplicate_positions() {
        let boxes = vec![Aabb::new(Vec3A::ZERO, Vec3A::ONE); 33];
        let bvh = build(&boxes);
        bvh.validate(&boxes, false, true);
        assert_eq!(bvh.leaf_count(), 33);
    }

    #[test]
    fn scene_is_valid() {
        let tris = demoscene(32, 5);
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&tris);
        let bvh = LinearBuilder.build(&compute_global_bounding_box(&bboxes), &bboxes, &centers);
        bvh.validate(&tris, false, true);
        assert_eq!(bvh.node_count(), 2 * tris.len() - 1);
    }
}
