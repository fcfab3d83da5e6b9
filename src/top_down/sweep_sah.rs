// Based on https://github.com/madmann91/bvh/blob/2fd0db62022993963a7343669275647cb073e19a/include/bvh/sweep_sah_builder.hpp

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use glam::Vec3A;

use crate::{
    aabb::Aabb,
    bvh2::{Bvh2, Bvh2Node},
    parallel::{join, UnsafeSlice},
    radix_sort::sorted_indices,
    top_down::{run_task, NodeAllocator, TopDownBuildTask, TopDownConfig, TopDownWorkItem, WorkItem},
    utils::float_to_ordered_u32,
};

/// Top-down builder that evaluates the SAH at every primitive boundary along each axis.
/// References are sorted once per axis up front and kept sorted by stable partitioning.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepSahBuilder {
    pub config: TopDownConfig,
}

impl SweepSahBuilder {
    pub fn build(&self, global_bbox: &Aabb, bboxes: &[Aabb], centers: &[Vec3A]) -> Bvh2 {
        crate::scope!("sweep_sah_build");
        assert!(!bboxes.is_empty(), "Cannot build a bvh without primitives");
        assert_eq!(bboxes.len(), centers.len(), "One center per bounding box expected");

        let prim_count = bboxes.len();
        let sort_axis = |axis: usize| {
            let keys: Vec<u32> = centers
                .iter()
                .map(|c| float_to_ordered_u32(c[axis]))
                .collect();
            sorted_indices(&keys)
        };
        let (mut x, (mut y, mut z)) = join(|| sort_axis(0), || join(|| sort_axis(1), || sort_axis(2)));

        let mut nodes = vec![Bvh2Node::default(); 2 * prim_count - 1];
        let mut primitive_indices = vec![0u32; prim_count];
        let mut costs = vec![0.0f32; prim_count];
        let mut scratch = vec![0u32; prim_count];
        let marks: Vec<AtomicBool> = (0..prim_count).map(|_| AtomicBool::new(false)).collect();
        nodes[0].aabb = *global_bbox;
        let node_count = AtomicUsize::new(1);

        let task = SweepSahBuildTask {
            config: self.config,
            bboxes,
            nodes: NodeAllocator::new(&mut nodes, &node_count),
            references: [
                UnsafeSlice::new(&mut x),
                UnsafeSlice::new(&mut y),
                UnsafeSlice::new(&mut z),
            ],
            primitive_indices: UnsafeSlice::new(&mut primitive_indices),
            costs: UnsafeSlice::new(&mut costs),
            scratch: UnsafeSlice::new(&mut scratch),
            marks: &marks,
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
        log::debug!("sweep sah: {} primitives, {} nodes", prim_count, nodes.len());
        Bvh2 {
            nodes,
            primitive_indices,
        }
    }
}

#[derive(Clone, Copy)]
struct SweepSahBuildTask<'a> {
    config: TopDownConfig,
    bboxes: &'a [Aabb],
    nodes: NodeAllocator<'a>,
    /// Primitive indices sorted by center along each axis. Every item owns the same range in all three.
    references: [UnsafeSlice<'a, u32>; 3],
    primitive_indices: UnsafeSlice<'a, u32>,
    /// Right side costs of the sweep, indexed like the references.
    costs: UnsafeSlice<'a, f32>,
    /// Temporary storage for the stable partition, indexed like the references.
    scratch: UnsafeSlice<'a, u32>,
    /// Per primitive: true if it goes to the left child.
    marks: &'a [AtomicBool],
}

impl SweepSahBuildTask<'_> {
    /// Best split of the sorted range along `axis`: cost and the first index of the right side.
    fn find_split(&self, axis: usize, item: &TopDownWorkItem) -> (f32, usize) {
        // SAFETY: the item's ranges belong to this task.
        let references = unsafe { self.references[axis].slice_mut(item.begin..item.end) };
        let costs = unsafe { self.costs.slice_mut(item.begin..item.end) };
        let count = references.len();

        let mut aabb = Aabb::empty();
        for i in (1..count).rev() {
            aabb = aabb.union(&self.bboxes[references[i] as usize]);
            costs[i] = aabb.half_area() * (count - i) as f32;
        }

        let mut best = (f32::MAX, count / 2);
        let mut aabb = Aabb::empty();
        for i in 0..count - 1 {
            aabb = aabb.union(&self.bboxes[references[i] as usize]);
            let cost = aabb.half_area() * (i + 1) as f32 + costs[i + 1];
            if cost < best.0 {
                best = (cost, i + 1);
            }
        }
        best
    }

    fn make_leaf(&self, node: &mut Bvh2Node, item: &TopDownWorkItem) {
        // SAFETY: the item's ranges belong to this task.
        unsafe {
            self.primitive_indices
                .slice_mut(item.begin..item.end)
                .copy_from_slice(self.references[0].slice_mut(item.begin..item.end));
        }
        node.set_leaf(item.begin as u32, item.work_size() as u32);
    }

    fn range_aabb(&self, references: &[u32]) -> Aabb {
        references
            .iter()
            .fold(Aabb::empty(), |a, &i| a.union(&self.bboxes[i as usize]))
    }
}

impl TopDownBuildTask for SweepSahBuildTask<'_> {
    type WorkItem = TopDownWorkItem;

    fn build(&mut self, item: &TopDownWorkItem) -> Option<(TopDownWorkItem, TopDownWorkItem)> {
        let nodes = self.nodes;
        // SAFETY: this task owns the item's node.
        let node = unsafe { nodes.node_mut(item.node_index) };
        if item.work_size() <= 1 || item.depth() >= self.config.max_depth {
            self.make_leaf(node, item);
            return None;
        }

        let mut best_axis = 0;
        let mut best = (f32::MAX, 0);
        for axis in 0..3 {
            let split = self.find_split(axis, item);
            if split.0 < best.0 {
                best_axis = axis;
                best = split;
            }
        }

        let work_size = item.work_size();
        let max_split_cost = node.aabb.half_area() * (work_size as f32 - self.config.traversal_cost);
        if best.0 >= max_split_cost {
            if work_size <= self.config.max_leaf_size {
                self.make_leaf(node, item);
                return None;
            }
            // Too large for a leaf: split at the median of the largest axis.
            best_axis = node.aabb.largest_axis();
            best.1 = work_size / 2;
        }
        let mid = item.begin + best.1;

        // Mark which side every primitive goes to, then partition the other axes without breaking their order.
        // SAFETY: the item's ranges belong to this task.
        let split_refs = unsafe { self.references[best_axis].slice_mut(item.begin..item.end) };
        for (i, &r) in split_refs.iter().enumerate() {
            self.marks[r as usize].store(i < best.1, Ordering::Relaxed);
        }
        let scratch = unsafe { self.scratch.slice_mut(item.begin..item.end) };
        for axis in (0..3).filter(|&a| a != best_axis) {
            let refs = unsafe { self.references[axis].slice_mut(item.begin..item.end) };
            let mut left = 0;
            let mut right = best.1;
            for &r in refs.iter() {
                if self.marks[r as usize].load(Ordering::Relaxed) {
                    scratch[left] = r;
                    left += 1;
                } else {
                    scratch[right] = r;
                    right += 1;
                }
            }
            debug_assert_eq!(left, best.1);
            refs.copy_from_slice(scratch);
        }

        let left_aabb = self.range_aabb(&split_refs[..best.1]);
        let right_aabb = self.range_aabb(&split_refs[best.1..]);
        let first_child = nodes.allocate_pair(left_aabb, right_aabb);
        node.set_inner(first_child as u32);

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

    #[test]
    fn sweep_is_valid() {
        let tris = demoscene(32, 21);
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&tris);
        let bvh = SweepSahBuilder::default().build(
            &compute_global_bounding_box(&bboxes),
            &bboxes,
            &centers,
        );
        bvh.validate(&tris, false, true);
        for node in bvh.nodes.iter().filter(|n| n.is_leaf()) {
            assert!(node.prim_count as usize <= TopDownConfig::default().max_leaf_size);
        }
    }

    #[test]
    fn row_of_boxes() {
        let boxes: Vec<Aabb> = (0..100)
            .map(|i| {
                let x = i as f32 * 2.0;
                Aabb::new(vec3a(x, 0.0, 0.0), vec3a(x + 1.0, 1.0, 1.0))
            })
            .collect();
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&boxes);
        let bvh = SweepSahBuilder::default().build(
            &compute_global_bounding_box(&bboxes),
            &bboxes,
            &centers,
        );
        bvh.validate(&boxes, false, true);
        // Every leaf holds a contiguous run along x.
        for node in bvh.nodes.iter().filter(|n| n.is_leaf()) {
            let start = node.first_index as usize;
            let mut prims: Vec<u32> =
                bvh.primitive_indices[start..start + node.prim_count as usize].to_vec();
            prims.sort();
            assert!(prims.windows(2).all(|w| w[1] == w[0] + 1));
        }
    }
}
