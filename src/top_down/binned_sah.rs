// Based on https://github.com/madmann91/bvh/blob/2fd0db62022993963a7343669275647cb073e19a/include/bvh/binned_sah_builder.hpp

use std::sync::atomic::AtomicUsize;

use glam::Vec3A;

use crate::{
    aabb::Aabb,
    bvh2::{Bvh2, Bvh2Node},
    parallel::UnsafeSlice,
    top_down::{
        partition_in_place, run_task, sah_term, NodeAllocator, TopDownBuildTask, TopDownConfig,
        TopDownWorkItem, WorkItem,
    },
};

/// Top-down SAH builder that evaluates `BIN_COUNT` candidate planes per axis.
/// Primitives are assigned to bins by the position of their center within the node's box.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinnedSahBuilder<const BIN_COUNT: usize = 16> {
    pub config: TopDownConfig,
}

impl<const BIN_COUNT: usize> BinnedSahBuilder<BIN_COUNT> {
    pub fn build(&self, global_bbox: &Aabb, bboxes: &[Aabb], centers: &[Vec3A]) -> Bvh2 {
        crate::scope!("binned_sah_build");
        assert!(BIN_COUNT >= 2, "Binned SAH needs at least 2 bins");
        assert!(!bboxes.is_empty(), "Cannot build a bvh without primitives");
        assert_eq!(bboxes.len(), centers.len(), "One center per bounding box expected");

        let prim_count = bboxes.len();
        let mut nodes = vec![Bvh2Node::default(); 2 * prim_count - 1];
        let mut primitive_indices: Vec<u32> = (0..prim_count as u32).collect();
        nodes[0].aabb = *global_bbox;
        let node_count = AtomicUsize::new(1);

        let task = BinnedSahBuildTask::<BIN_COUNT> {
            config: self.config,
            bboxes,
            centers,
            nodes: NodeAllocator::new(&mut nodes, &node_count),
            primitive_indices: UnsafeSlice::new(&mut primitive_indices),
            bins: [[Bin::default(); BIN_COUNT]; 3],
        };
        run_task(
            task,
            TopDownWorkItem {
                node_index: 0,
                begin: 0,
                end: prim_count,
                depth: 0,
            },
            self.config.task_spawn_threshold,
        );

        nodes.truncate(node_count.into_inner());
        log::debug!(
            "binned sah: {} primitives, {} nodes",
            prim_count,
            nodes.len()
        );
        Bvh2 {
            nodes,
            primitive_indices,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Bin {
    aabb: Aabb,
    count: usize,
    right_cost: f32,
}

impl Default for Bin {
    fn default() -> Self {
        Self {
            aabb: Aabb::empty(),
            count: 0,
            right_cost: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Split {
    axis: usize,
    /// Bins `..index` go left.
    index: usize,
    cost: f32,
}

#[derive(Clone)]
struct BinnedSahBuildTask<'a, const BIN_COUNT: usize> {
    config: TopDownConfig,
    bboxes: &'a [Aabb],
    centers: &'a [Vec3A],
    nodes: NodeAllocator<'a>,
    primitive_indices: UnsafeSlice<'a, u32>,
    bins: [[Bin; BIN_COUNT]; 3],
}

#[inline(always)]
fn bin_index<const BIN_COUNT: usize>(axis: usize, aabb: &Aabb, center: Vec3A) -> usize {
    let extent = aabb.max[axis] - aabb.min[axis];
    if extent <= 0.0 {
        return 0;
    }
    let index = (center[axis] - aabb.min[axis]) * (BIN_COUNT as f32 / extent);
    (index.max(0.0) as usize).min(BIN_COUNT - 1)
}

impl<const BIN_COUNT: usize> BinnedSahBuildTask<'_, BIN_COUNT> {
    fn find_split(&mut self, node_aabb: &Aabb, indices: &[u32]) -> Split {
        let mut best = Split {
            axis: 0,
            index: BIN_COUNT / 2,
            cost: f32::MAX,
        };
        for axis in 0..3 {
            let bins = &mut self.bins[axis];
            bins.fill(Bin::default());
            for &i in indices {
                let bin = &mut bins[bin_index::<BIN_COUNT>(axis, node_aabb, self.centers[i as usize])];
                bin.aabb = bin.aabb.union(&self.bboxes[i as usize]);
                bin.count += 1;
            }

            // Sweep from the right to compute partial costs.
            let mut aabb = Aabb::empty();
            let mut count = 0;
            for bin in bins[1..].iter_mut().rev() {
                aabb = aabb.union(&bin.aabb);
                count += bin.count;
                bin.right_cost = sah_term(&aabb, count);
            }

            // Sweep from the left, combining with the right side.
            let mut aabb = Aabb::empty();
            let mut count = 0;
            for i in 0..BIN_COUNT - 1 {
                aabb = aabb.union(&bins[i].aabb);
                count += bins[i].count;
                let cost = sah_term(&aabb, count) + bins[i + 1].right_cost;
                if cost < best.cost {
                    best = Split {
                        axis,
                        index: i + 1,
                        cost,
                    };
                }
            }
        }
        best
    }

    fn make_leaf(&self, node: &mut Bvh2Node, item: &TopDownWorkItem) {
        node.set_leaf(item.begin as u32, item.work_size() as u32);
    }
}

impl<const BIN_COUNT: usize> TopDownBuildTask for BinnedSahBuildTask<'_, BIN_COUNT> {
    type WorkItem = TopDownWorkItem;

    fn build(&mut self, item: &TopDownWorkItem) -> Option<(TopDownWorkItem, TopDownWorkItem)> {
        let nodes = self.nodes;
        let primitive_indices = self.primitive_indices;
        // SAFETY: this task owns the item's node and reference range.
        let node = unsafe { nodes.node_mut(item.node_index) };
        if item.work_size() <= 1 || item.depth() >= self.config.max_depth {
            self.make_leaf(node, item);
            return None;
        }

        let indices = unsafe { primitive_indices.slice_mut(item.begin..item.end) };
        let node_aabb = node.aabb;
        let mut split = self.find_split(&node_aabb, indices);

        let work_size = item.work_size();
        let max_split_cost = node_aabb.half_area() * (work_size as f32 - self.config.traversal_cost);
        if split.cost >= max_split_cost {
            if work_size <= self.config.max_leaf_size {
                self.make_leaf(node, item);
                return None;
            }
            // The SAH would rather stop here, but the leaf is too large. Split near the median instead.
            split.axis = node_aabb.largest_axis();
            let bins = &self.bins[split.axis];
            let mut count = 0;
            for i in 0..BIN_COUNT - 1 {
                count += bins[i].count;
                if count >= (work_size * 2) / 5 + 1 {
                    split.index = i + 1;
                    break;
                }
            }
        }

        let axis = split.axis;
        let centers = self.centers;
        let left_count = partition_in_place(indices, |&i| {
            bin_index::<BIN_COUNT>(axis, &node_aabb, centers[i as usize]) < split.index
        });
        if left_count == 0 || left_count == work_size {
            self.make_leaf(node, item);
            return None;
        }

        let bins = &self.bins[axis];
        let left_aabb = bins[..split.index]
            .iter()
            .fold(Aabb::empty(), |a, b| a.union(&b.aabb));
        let right_aabb = bins[split.index..]
            .iter()
            .fold(Aabb::empty(), |a, b| a.union(&b.aabb));

        let first_child = nodes.allocate_pair(left_aabb, right_aabb);
        node.set_inner(first_child as u32);

        let mid = item.begin + left_count;
        Some((
            TopDownWorkItem {
                node_index: first_child,
                begin: item.begin,
                end: mid,
                depth: item.depth + 1,
            },
            TopDownWorkItem {
                node_index: first_child + 1,
                begin: mid,
                end: item.end,
                depth: item.depth + 1,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use glam::*;

    use super::*;
    use crate::{
        test_util::geometry::demoscene,
        utils::{compute_bounding_boxes_and_centers, compute_global_bounding_box},
    };

    fn build<const B: usize>(boxes: &[Aabb], config: TopDownConfig) -> Bvh2 {
        let (bboxes, centers) = compute_bounding_boxes_and_centers(boxes);
        BinnedSahBuilder::<B> { config }.build(&compute_global_bounding_box(&bboxes), &bboxes, &centers)
    }

    #[test]
    fn two_boxes() {
        let boxes = [
            Aabb::new(Vec3A::splat(-0.5), Vec3A::splat(0.5)),
            Aabb::new(vec3a(9.5, -0.5, -0.5), vec3a(10.5, 0.5, 0.5)),
        ];
        let bvh = build::<16>(&boxes, TopDownConfig::default());
        assert_eq!(bvh.node_count(), 3);
        assert_eq!(bvh.nodes[0].aabb, Aabb::new(Vec3A::splat(-0.5), vec3a(10.5, 0.5, 0.5)));
        bvh.validate(&boxes, false, true);
    }

    #[test]
    fn single_primitive() {
        let boxes = [Aabb::new(Vec3A::ZERO, Vec3A::ONE)];
        let bvh = build::<16>(&boxes, TopDownConfig::default());
        assert_eq!(bvh.node_count(), 1);
        assert!(bvh.nodes[0].is_leaf());
        assert_eq!(bvh.nodes[0].prim_count, 1);
    }

    #[test]
    fn identical_centers_become_one_leaf() {
        let boxes = vec![Aabb::new(Vec3A::ZERO, Vec3A::ONE); 40];
        let bvh = build::<16>(&boxes, TopDownConfig::default());
        assert_eq!(bvh.node_count(), 1);
        assert_eq!(bvh.nodes[0].prim_count, 40);
        bvh.validate(&boxes, false, true);
    }

    #[test]
    fn scene_is_valid_and_bounded() {
        let tris = demoscene(32, 11);
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&tris);
        let config = TopDownConfig {
            max_depth: 12,
            ..Default::default()
        };
        let bvh = BinnedSahBuilder::<8> { config }.build(
            &compute_global_bounding_box(&bboxes),
            &bboxes,
            &centers,
        );
        let result = bvh.validate(&tris, false, true);
        assert!(result.max_depth <= 12);
    }
}
