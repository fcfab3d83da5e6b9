// Based on https://github.com/madmann91/bvh/blob/2fd0db62022993963a7343669275647cb073e19a/include/bvh/spatial_split_bvh_builder.hpp
// Spatial splits as described in https://www.nvidia.in/docs/IO/77714/sbvh.pdf

use std::sync::atomic::{AtomicUsize, Ordering};

use glam::Vec3A;

use crate::{
    aabb::Aabb,
    bvh2::{leaf_indices, Bvh2, Bvh2Node},
    parallel::{exclusive_prefix_sum, par_for_each, UnsafeSlice},
    primitive::SplittablePrimitive,
    top_down::{run_task, sah_term, NodeAllocator, TopDownBuildTask, TopDownConfig, WorkItem},
    INVALID,
};

/// Sweep SAH builder that may also cut primitives with axis aligned planes, putting a reference to the same
/// primitive in both children. The resulting tree can reference a primitive from several leaves.
///
/// Run [`repair_bvh_leaves`] on the result if later passes may move those references into the same leaf.
#[derive(Clone, Copy, Debug)]
pub struct SpatialSplitBuilder<const BIN_COUNT: usize = 64> {
    pub config: TopDownConfig,
    /// Spatial splits are only tried when the overlap of the best object split's children is larger than
    /// `alpha` times the surface area of the scene.
    pub alpha: f32,
    /// Extra references allowed, relative to the primitive count.
    pub split_factor: f32,
    /// Each pass re-bins the neighborhood of the best plane of the previous one.
    pub binning_pass_count: usize,
}

impl<const BIN_COUNT: usize> Default for SpatialSplitBuilder<BIN_COUNT> {
    fn default() -> Self {
        Self {
            config: TopDownConfig::default(),
            alpha: 1e-5,
            split_factor: 0.3,
            binning_pass_count: 2,
        }
    }
}

impl<const BIN_COUNT: usize> SpatialSplitBuilder<BIN_COUNT> {
    pub fn build<P: SplittablePrimitive>(
        &self,
        global_bbox: &Aabb,
        primitives: &[P],
        bboxes: &[Aabb],
        centers: &[Vec3A],
    ) -> Bvh2 {
        crate::scope!("spatial_split_build");
        assert!(BIN_COUNT >= 2, "Spatial splits need at least 2 bins");
        assert!(!primitives.is_empty(), "Cannot build a bvh without primitives");
        assert_eq!(primitives.len(), bboxes.len(), "One bounding box per primitive expected");
        assert_eq!(bboxes.len(), centers.len(), "One center per bounding box expected");

        let prim_count = primitives.len();
        let max_reference_count =
            prim_count + (prim_count as f32 * self.split_factor.max(0.0)) as usize;

        let initial_references = || {
            let mut references: Vec<Reference> = bboxes
                .iter()
                .zip(centers)
                .enumerate()
                .map(|(i, (aabb, center))| Reference {
                    aabb: *aabb,
                    center: *center,
                    primitive_index: i as u32,
                })
                .collect();
            references.resize(max_reference_count, Reference::UNUSED);
            references
        };
        let mut x = initial_references();
        let mut y = x.clone();
        let mut z = x.clone();

        let mut nodes = vec![Bvh2Node::default(); 2 * max_reference_count - 1];
        let mut primitive_indices = vec![0u32; max_reference_count];
        let mut accumulated = vec![Aabb::empty(); max_reference_count];
        nodes[0].aabb = *global_bbox;
        let node_count = AtomicUsize::new(1);
        let reference_count = AtomicUsize::new(0);

        let task = SpatialSplitBuildTask::<P, BIN_COUNT> {
            config: self.config,
            primitives,
            nodes: NodeAllocator::new(&mut nodes, &node_count),
            references: [
                UnsafeSlice::new(&mut x),
                UnsafeSlice::new(&mut y),
                UnsafeSlice::new(&mut z),
            ],
            accumulated: UnsafeSlice::new(&mut accumulated),
            primitive_indices: UnsafeSlice::new(&mut primitive_indices),
            reference_count: &reference_count,
            spatial_threshold: self.alpha * 2.0 * global_bbox.half_area(),
            binning_pass_count: self.binning_pass_count,
            bins: [SpatialBin::default(); BIN_COUNT],
            marks: Vec::new(),
            scratch: Vec::new(),
        };
        run_task(
            task,
            SpatialWorkItem {
                node_index: 0,
                begin: 0,
                end: prim_count,
                split_end: max_reference_count,
                depth: 0,
                is_sorted: false,
            },
            self.config.task_spawn_threshold,
        );

        nodes.truncate(node_count.into_inner());
        primitive_indices.truncate(reference_count.into_inner());
        log::debug!(
            "spatial split: {} primitives, {} references, {} nodes",
            prim_count,
            primitive_indices.len(),
            nodes.len()
        );
        Bvh2 {
            nodes,
            primitive_indices,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Reference {
    aabb: Aabb,
    center: Vec3A,
    primitive_index: u32,
}

impl Reference {
    const UNUSED: Self = Self {
        aabb: Aabb::EMPTY,
        center: Vec3A::ZERO,
        primitive_index: INVALID,
    };

    fn new(aabb: Aabb, primitive_index: u32) -> Self {
        Self {
            aabb,
            center: aabb.center(),
            primitive_index,
        }
    }
}

/// A node, the references `begin..end` it owns and the free space `end..split_end` its splits may fill.
#[derive(Clone, Copy, Debug)]
struct SpatialWorkItem {
    node_index: usize,
    begin: usize,
    end: usize,
    split_end: usize,
    depth: usize,
    /// The references of all three axes are already sorted by center.
    is_sorted: bool,
}

impl WorkItem for SpatialWorkItem {
    #[inline(always)]
    fn work_size(&self) -> usize {
        self.end - self.begin
    }
    #[inline(always)]
    fn depth(&self) -> usize {
        self.depth
    }
}

#[derive(Clone, Copy, Debug)]
struct SpatialBin {
    aabb: Aabb,
    accumulated: Aabb,
    /// References starting in this bin.
    entry: usize,
    /// References ending in this bin.
    exit: usize,
}

impl Default for SpatialBin {
    fn default() -> Self {
        Self {
            aabb: Aabb::empty(),
            accumulated: Aabb::empty(),
            entry: 0,
            exit: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ObjectSplit {
    cost: f32,
    /// First reference of the right child.
    index: usize,
    axis: usize,
    left_aabb: Aabb,
    right_aabb: Aabb,
}

#[derive(Clone, Copy, Debug)]
struct SpatialSplit {
    cost: f32,
    position: f32,
    axis: usize,
}

impl Default for SpatialSplit {
    fn default() -> Self {
        Self {
            cost: f32::MAX,
            position: 0.0,
            axis: 0,
        }
    }
}

struct SpatialSplitBuildTask<'a, P, const BIN_COUNT: usize> {
    config: TopDownConfig,
    primitives: &'a [P],
    nodes: NodeAllocator<'a>,
    /// References sorted by center along each axis, unless the item says otherwise.
    references: [UnsafeSlice<'a, Reference>; 3],
    /// Right side boxes of the object split sweep, indexed like the references.
    accumulated: UnsafeSlice<'a, Aabb>,
    primitive_indices: UnsafeSlice<'a, u32>,
    /// Number of primitive indices written by leaves so far.
    reference_count: &'a AtomicUsize,
    spatial_threshold: f32,
    binning_pass_count: usize,
    bins: [SpatialBin; BIN_COUNT],
    /// Per primitive side of the current object split. Pieces of one primitive can be in flight in several
    /// tasks at once, so every task keeps its own.
    marks: Vec<bool>,
    scratch: Vec<Reference>,
}

impl<P, const BIN_COUNT: usize> Clone for SpatialSplitBuildTask<'_, P, BIN_COUNT> {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            primitives: self.primitives,
            nodes: self.nodes,
            references: self.references,
            accumulated: self.accumulated,
            primitive_indices: self.primitive_indices,
            reference_count: self.reference_count,
            spatial_threshold: self.spatial_threshold,
            binning_pass_count: self.binning_pass_count,
            bins: self.bins,
            marks: Vec::new(),
            scratch: Vec::new(),
        }
    }
}

impl<P: SplittablePrimitive, const BIN_COUNT: usize> SpatialSplitBuildTask<'_, P, BIN_COUNT> {
    /// # Safety
    /// The item's range of `axis` must belong to this task.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    unsafe fn refs(&self, axis: usize, range: std::ops::Range<usize>) -> &mut [Reference] {
        self.references[axis].slice_mut(range)
    }

    fn find_object_split(&self, item: &SpatialWorkItem) -> ObjectSplit {
        let (begin, end) = (item.begin, item.end);
        let count = end - begin;
        let mut best = ObjectSplit {
            cost: f32::MAX,
            index: begin + 1,
            axis: 0,
            left_aabb: Aabb::empty(),
            right_aabb: Aabb::empty(),
        };
        for axis in 0..3 {
            // SAFETY: the item's ranges belong to this task.
            let refs = unsafe { self.refs(axis, begin..end) };
            let accumulated = unsafe { self.accumulated.slice_mut(begin..end) };
            if !item.is_sorted {
                refs.sort_unstable_by(|a, b| a.center[axis].total_cmp(&b.center[axis]));
            }

            let mut aabb = Aabb::empty();
            for i in (1..count).rev() {
                aabb = aabb.union(&refs[i].aabb);
                accumulated[i] = aabb;
            }

            let mut aabb = Aabb::empty();
            for i in 0..count - 1 {
                aabb = aabb.union(&refs[i].aabb);
                let cost = aabb.half_area() * (i + 1) as f32
                    + accumulated[i + 1].half_area() * (count - i - 1) as f32;
                if cost < best.cost {
                    best = ObjectSplit {
                        cost,
                        index: begin + i + 1,
                        axis,
                        left_aabb: aabb,
                        right_aabb: accumulated[i + 1],
                    };
                }
            }
        }
        best
    }

    /// Bins the references between `min` and `max` along `axis`, clipping every reference to each bin it
    /// crosses. Returns the range around the best plane if this pass improved `best`.
    fn run_binning_pass(
        &mut self,
        best: &mut SpatialSplit,
        axis: usize,
        refs: &[Reference],
        min: f32,
        max: f32,
    ) -> Option<(f32, f32)> {
        let bins = &mut self.bins;
        bins.fill(SpatialBin::default());

        let bin_size = (max - min) / BIN_COUNT as f32;
        if bin_size.is_nan() || bin_size <= 0.0 {
            return None;
        }
        let inv_size = 1.0 / bin_size;
        let bin_of = |p: f32| ((inv_size * (p - min)).max(0.0) as usize).min(BIN_COUNT - 1);

        for r in refs {
            let first_bin = bin_of(r.aabb.min[axis]);
            let last_bin = bin_of(r.aabb.max[axis]);
            let primitive = &self.primitives[r.primitive_index as usize];

            let mut current = r.aabb;
            for j in first_bin..last_bin {
                let (mut left, right) = primitive.split(axis, min + (j + 1) as f32 * bin_size);
                left.shrink(&current);
                if left.valid() {
                    bins[j].aabb = bins[j].aabb.union(&left);
                }
                current.shrink(&right);
            }
            if current.valid() {
                bins[last_bin].aabb = bins[last_bin].aabb.union(&current);
            }
            bins[first_bin].entry += 1;
            bins[last_bin].exit += 1;
        }

        let mut aabb = Aabb::empty();
        for bin in bins.iter_mut().rev() {
            aabb = aabb.union(&bin.aabb);
            bin.accumulated = aabb;
        }

        let mut found = None;
        let mut aabb = Aabb::empty();
        let mut left_count = 0;
        let mut right_count = refs.len();
        for i in 0..BIN_COUNT - 1 {
            left_count += bins[i].entry;
            right_count -= bins[i].exit;
            aabb = aabb.union(&bins[i].aabb);
            let cost = sah_term(&aabb, left_count) + sah_term(&bins[i + 1].accumulated, right_count);
            if cost < best.cost {
                let position = min + (i + 1) as f32 * bin_size;
                *best = SpatialSplit {
                    cost,
                    position,
                    axis,
                };
                found = Some((position - bin_size, position + bin_size));
            }
        }
        found
    }

    fn find_spatial_split(&mut self, item: &SpatialWorkItem, node_aabb: &Aabb) -> SpatialSplit {
        let mut best = SpatialSplit::default();
        let references = self.references[0];
        // SAFETY: the item's ranges belong to this task. Binning only reads them.
        let refs = unsafe { references.slice_mut(item.begin..item.end) };
        for axis in 0..3 {
            let mut min = node_aabb.min[axis];
            let mut max = node_aabb.max[axis];
            for _ in 0..self.binning_pass_count {
                match self.run_binning_pass(&mut best, axis, refs, min, max) {
                    Some(range) => (min, max) = range,
                    None => break,
                }
            }
        }
        best
    }

    /// Turns the node into an inner node and hands the free space after `right_end` to the children,
    /// proportionally to their SAH cost.
    fn allocate_children(
        &self,
        node: &mut Bvh2Node,
        item: &SpatialWorkItem,
        right_begin: usize,
        right_end: usize,
        left_aabb: Aabb,
        right_aabb: Aabb,
        is_sorted: bool,
    ) -> (SpatialWorkItem, SpatialWorkItem) {
        let first_child = self.nodes.allocate_pair(left_aabb, right_aabb);
        node.set_inner(first_child as u32);

        let remaining = item.split_end - right_end;
        let left_cost = left_aabb.half_area() * (right_begin - item.begin) as f32;
        let right_cost = right_aabb.half_area() * (right_end - right_begin) as f32;
        let ratio = if left_cost + right_cost > 0.0 {
            left_cost / (left_cost + right_cost)
        } else {
            0.5
        };
        let left_split_count = ((remaining as f32 * ratio) as usize).min(remaining);

        if left_split_count > 0 {
            let right_count = right_end - right_begin;
            for axis in 0..3 {
                // SAFETY: `right_begin..item.split_end` belongs to this task.
                let refs = unsafe { self.refs(axis, right_begin..right_end + left_split_count) };
                refs.copy_within(0..right_count, left_split_count);
            }
        }

        (
            SpatialWorkItem {
                node_index: first_child,
                begin: item.begin,
                end: right_begin,
                split_end: right_begin + left_split_count,
                depth: item.depth + 1,
                is_sorted,
            },
            SpatialWorkItem {
                node_index: first_child + 1,
                begin: right_begin + left_split_count,
                end: right_end + left_split_count,
                split_end: item.split_end,
                depth: item.depth + 1,
                is_sorted,
            },
        )
    }

    fn apply_object_split(
        &mut self,
        node: &mut Bvh2Node,
        item: &SpatialWorkItem,
        split: &ObjectSplit,
    ) -> (SpatialWorkItem, SpatialWorkItem) {
        let mid = split.index - item.begin;
        if self.marks.len() < self.primitives.len() {
            self.marks.resize(self.primitives.len(), false);
        }

        let references = self.references;
        // SAFETY: the item's ranges belong to this task.
        let split_refs = unsafe { references[split.axis].slice_mut(item.begin..item.end) };
        for (i, r) in split_refs.iter().enumerate() {
            self.marks[r.primitive_index as usize] = i < mid;
        }

        let marks = &self.marks;
        let scratch = &mut self.scratch;
        for axis in (0..3).filter(|&a| a != split.axis) {
            let refs = unsafe { references[axis].slice_mut(item.begin..item.end) };
            scratch.clear();
            scratch.extend(refs.iter().filter(|r| marks[r.primitive_index as usize]));
            scratch.extend(refs.iter().filter(|r| !marks[r.primitive_index as usize]));
            refs.copy_from_slice(scratch);
        }

        self.allocate_children(
            node,
            item,
            split.index,
            item.end,
            split.left_aabb,
            split.right_aabb,
            true,
        )
    }

    fn apply_spatial_split(
        &self,
        node: &mut Bvh2Node,
        item: &SpatialWorkItem,
        split: &SpatialSplit,
    ) -> (SpatialWorkItem, SpatialWorkItem) {
        let axis = split.axis;
        let position = split.position;
        let capacity = item.split_end - item.begin;
        // SAFETY: the item's ranges, including the free space, belong to this task.
        let refs = unsafe { self.refs(axis, item.begin..item.split_end) };

        // Indices are relative to `item.begin`:
        // 0..left_end go left, left_end..right_begin straddle the plane, right_begin..right_end go right.
        let mut left_end = 0;
        let mut right_begin = item.work_size();
        let mut right_end = item.work_size();
        let mut left_aabb = Aabb::empty();
        let mut right_aabb = Aabb::empty();

        let mut i = 0;
        while i < right_begin {
            let aabb = refs[i].aabb;
            if aabb.max[axis] <= position {
                left_aabb = left_aabb.union(&aabb);
                refs.swap(i, left_end);
                left_end += 1;
                i += 1;
            } else if aabb.min[axis] >= position {
                right_aabb = right_aabb.union(&aabb);
                right_begin -= 1;
                refs.swap(i, right_begin);
            } else {
                i += 1;
            }
        }

        let mut left_count = left_end;
        let mut right_count = right_end - right_begin;
        if (left_count == 0 || right_count == 0) && left_end == right_begin {
            // Every reference is on the same side: cut the range in half.
            if left_count > 0 {
                left_end -= left_count / 2;
            } else {
                left_end += right_count / 2;
            }
            right_begin = left_end;
            left_aabb = refs[..left_end]
                .iter()
                .fold(Aabb::empty(), |a, r| a.union(&r.aabb));
            right_aabb = refs[left_end..right_end]
                .iter()
                .fold(Aabb::empty(), |a, r| a.union(&r.aabb));
        } else {
            while left_end < right_begin {
                let reference = refs[left_end];
                let (mut left, mut right) =
                    self.primitives[reference.primitive_index as usize].split(axis, position);
                left.shrink(&reference.aabb);
                right.shrink(&reference.aabb);

                if right_end < capacity && left.valid() && right.valid() {
                    left_aabb = left_aabb.union(&left);
                    right_aabb = right_aabb.union(&right);
                    refs[right_end] = Reference::new(right, reference.primitive_index);
                    right_end += 1;
                    refs[left_end] = Reference::new(left, reference.primitive_index);
                    left_end += 1;
                    left_count += 1;
                    right_count += 1;
                } else if left_count < right_count {
                    left_aabb = left_aabb.union(&reference.aabb);
                    left_end += 1;
                    left_count += 1;
                } else {
                    right_aabb = right_aabb.union(&reference.aabb);
                    right_begin -= 1;
                    refs.swap(right_begin, left_end);
                    right_count += 1;
                }
            }
        }

        // The children are no longer sorted on any axis, copy the new references everywhere.
        for other in (0..3).filter(|&a| a != axis) {
            let other_refs = unsafe { self.refs(other, item.begin..item.begin + right_end) };
            other_refs.copy_from_slice(&refs[..right_end]);
        }

        self.allocate_children(
            node,
            item,
            item.begin + right_begin,
            item.begin + right_end,
            left_aabb,
            right_aabb,
            false,
        )
    }

    fn make_leaf(&self, node: &mut Bvh2Node, item: &SpatialWorkItem) {
        let count = item.work_size();
        let first = self.reference_count.fetch_add(count, Ordering::Relaxed);
        // SAFETY: the item's references belong to this task, `first..first + count` was just reserved.
        unsafe {
            let refs = self.refs(0, item.begin..item.end);
            let indices = self.primitive_indices.slice_mut(first..first + count);
            for (index, r) in indices.iter_mut().zip(refs.iter()) {
                *index = r.primitive_index;
            }
        }
        node.set_leaf(first as u32, count as u32);
    }
}

impl<P: SplittablePrimitive, const BIN_COUNT: usize> TopDownBuildTask
    for SpatialSplitBuildTask<'_, P, BIN_COUNT>
{
    type WorkItem = SpatialWorkItem;

    fn build(&mut self, item: &SpatialWorkItem) -> Option<(SpatialWorkItem, SpatialWorkItem)> {
        let nodes = self.nodes;
        // SAFETY: this task owns the item's node.
        let node = unsafe { nodes.node_mut(item.node_index) };
        if item.work_size() <= 1 || item.depth >= self.config.max_depth {
            self.make_leaf(node, item);
            return None;
        }

        let mut object_split = self.find_object_split(item);
        let node_aabb = node.aabb;

        let mut spatial_split = SpatialSplit::default();
        if item.split_end > item.end {
            let overlap = object_split.left_aabb.intersection(&object_split.right_aabb);
            if overlap.valid() && overlap.half_area() > self.spatial_threshold {
                spatial_split = self.find_spatial_split(item, &node_aabb);
            }
        }

        let best_cost = spatial_split.cost.min(object_split.cost);
        let mut use_spatial_split = best_cost < object_split.cost;

        let work_size = item.work_size();
        let max_split_cost = node_aabb.half_area() * (work_size as f32 - self.config.traversal_cost);
        if best_cost >= max_split_cost {
            if work_size <= self.config.max_leaf_size {
                self.make_leaf(node, item);
                return None;
            }
            // Too large for a leaf: median split on the largest axis.
            use_spatial_split = false;
            let axis = node_aabb.largest_axis();
            let index = (item.begin + item.end) / 2;
            // SAFETY: the item's ranges belong to this task.
            let refs = unsafe { self.refs(axis, item.begin..item.end) };
            let (left, right) = refs.split_at(index - item.begin);
            object_split = ObjectSplit {
                cost: best_cost,
                index,
                axis,
                left_aabb: left.iter().fold(Aabb::empty(), |a, r| a.union(&r.aabb)),
                right_aabb: right.iter().fold(Aabb::empty(), |a, r| a.union(&r.aabb)),
            };
        }

        Some(if use_spatial_split {
            self.apply_spatial_split(node, item, &spatial_split)
        } else {
            self.apply_object_split(node, item, &object_split)
        })
    }
}

/// Sorts the primitive indices of every leaf and removes duplicates, then compacts `primitive_indices`.
/// Spatial splits followed by reinsertion or leaf collapsing can put two references to the same primitive in
/// one leaf, which would report the same hit twice.
pub fn repair_bvh_leaves(bvh: &mut Bvh2) {
    crate::scope!("repair_bvh_leaves");
    let leaves = leaf_indices(&bvh.nodes);
    let mut counts = vec![0u32; leaves.len()];
    {
        let indices = UnsafeSlice::new(&mut bvh.primitive_indices);
        let counts_view = UnsafeSlice::new(&mut counts);
        let nodes = &bvh.nodes;
        let leaves = &leaves;
        par_for_each(leaves.len(), |i| {
            let node = nodes[leaves[i] as usize];
            let first = node.first_index as usize;
            // SAFETY: leaves own disjoint ranges of primitive indices.
            let slice = unsafe { indices.slice_mut(first..first + node.prim_count as usize) };
            slice.sort_unstable();
            let mut unique = 0;
            for j in 0..slice.len() {
                if unique == 0 || slice[j] != slice[unique - 1] {
                    slice[unique] = slice[j];
                    unique += 1;
                }
            }
            unsafe { counts_view.write(i, unique as u32) };
        });
    }

    let mut offsets = vec![0u32; leaves.len()];
    let total = exclusive_prefix_sum(&counts, &mut offsets);
    if total as usize == bvh.primitive_indices.len() {
        return;
    }

    let mut compacted = vec![0u32; total as usize];
    {
        let out = UnsafeSlice::new(&mut compacted);
        let nodes = UnsafeSlice::new(&mut bvh.nodes);
        let old = &bvh.primitive_indices;
        let (leaves, counts, offsets) = (&leaves, &counts, &offsets);
        par_for_each(leaves.len(), |i| {
            // SAFETY: every leaf writes its own node and its own output range.
            unsafe {
                let node = nodes.get_mut(leaves[i] as usize);
                let (offset, count) = (offsets[i] as usize, counts[i] as usize);
                let first = node.first_index as usize;
                out.slice_mut(offset..offset + count)
                    .copy_from_slice(&old[first..first + count]);
                node.set_leaf(offset as u32, count as u32);
            }
        });
    }
    log::debug!(
        "repaired leaves: {} -> {} primitive indices",
        bvh.primitive_indices.len(),
        total
    );
    bvh.primitive_indices = compacted;
}
