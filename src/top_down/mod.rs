//! Shared skeleton of the top-down builders.
//!
//! A build task turns one work item (a node and the range of references it owns) into either a leaf or two child
//! work items. [`run_task`] drives it: the larger child is processed next on the current thread, the smaller one
//! is spawned as a new task when it is big enough to be worth it.

pub mod binned_sah;
pub mod spatial_split;
pub mod sweep_sah;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{aabb::Aabb, bvh2::Bvh2Node, parallel::UnsafeSlice};

pub trait WorkItem: Copy + Send + 'static {
    /// Number of references below this item, used for task scheduling and leaf decisions.
    fn work_size(&self) -> usize;
    fn depth(&self) -> usize;
}

pub trait TopDownBuildTask: Clone + Send {
    type WorkItem: WorkItem;
    /// Processes one item. Returns the two children to process next, or `None` if a leaf was made.
    fn build(&mut self, item: &Self::WorkItem) -> Option<(Self::WorkItem, Self::WorkItem)>;
}

/// Runs `task` from `root` until every item became a leaf. Items with more than `task_spawn_threshold`
/// references get their own task, each task cloned from its parent.
pub fn run_task<T: TopDownBuildTask>(task: T, root: T::WorkItem, task_spawn_threshold: usize) {
    crate::scope!("run_task");
    #[cfg(feature = "parallel")]
    rayon::scope(move |s| run_task_in_scope(s, task, root, task_spawn_threshold));
    #[cfg(not(feature = "parallel"))]
    {
        let _ = task_spawn_threshold;
        let mut task = task;
        let mut stack = vec![root];
        while let Some(item) = stack.pop() {
            if let Some((a, b)) = task.build(&item) {
                let (large, small) = order_by_size(a, b);
                stack.push(small);
                stack.push(large);
            }
        }
    }
}

#[cfg(feature = "parallel")]
fn run_task_in_scope<'s, T: TopDownBuildTask + 's>(
    scope: &rayon::Scope<'s>,
    mut task: T,
    root: T::WorkItem,
    task_spawn_threshold: usize,
) {
    let mut stack = vec![root];
    while let Some(item) = stack.pop() {
        if let Some((a, b)) = task.build(&item) {
            let (large, small) = order_by_size(a, b);
            if small.work_size() > task_spawn_threshold {
                let child_task = task.clone();
                scope.spawn(move |s| run_task_in_scope(s, child_task, small, task_spawn_threshold));
            } else {
                stack.push(small);
            }
            stack.push(large);
        }
    }
}

#[inline(always)]
fn order_by_size<W: WorkItem>(a: W, b: W) -> (W, W) {
    if a.work_size() < b.work_size() {
        (b, a)
    } else {
        (a, b)
    }
}

/// Limits and costs shared by the top-down builders.
#[derive(Clone, Copy, Debug)]
pub struct TopDownConfig {
    /// Items at this depth become leaves. Keep it below the traversal stack size.
    pub max_depth: usize,
    /// Leaves larger than this are split even when the SAH says otherwise.
    pub max_leaf_size: usize,
    /// Cost of traversing an inner node relative to intersecting one primitive.
    pub traversal_cost: f32,
    pub task_spawn_threshold: usize,
}

impl Default for TopDownConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_leaf_size: 16,
            traversal_cost: 1.0,
            task_spawn_threshold: 1024,
        }
    }
}

/// A node and the reference range `begin..end` it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopDownWorkItem {
    pub node_index: usize,
    pub begin: usize,
    pub end: usize,
    pub depth: usize,
}

impl WorkItem for TopDownWorkItem {
    #[inline(always)]
    fn work_size(&self) -> usize {
        self.end - self.begin
    }
    #[inline(always)]
    fn depth(&self) -> usize {
        self.depth
    }
}

/// Node storage shared by every task of a build. Pairs are handed out by an atomic counter, so tasks never
/// write the same node.
#[derive(Clone, Copy)]
pub(crate) struct NodeAllocator<'a> {
    nodes: UnsafeSlice<'a, Bvh2Node>,
    node_count: &'a AtomicUsize,
}

impl<'a> NodeAllocator<'a> {
    pub fn new(nodes: &'a mut [Bvh2Node], node_count: &'a AtomicUsize) -> Self {
        Self {
            nodes: UnsafeSlice::new(nodes),
            node_count,
        }
    }

    /// Reserves a sibling pair, initialized with the given boxes. Returns the index of the first one.
    pub fn allocate_pair(&self, left: Aabb, right: Aabb) -> usize {
        let first = self.node_count.fetch_add(2, Ordering::Relaxed);
        assert!(
            first + 1 < self.nodes.len(),
            "Node storage exhausted ({} nodes)",
            self.nodes.len()
        );
        // SAFETY: the pair was just reserved by this task.
        unsafe {
            self.nodes.write(first, Bvh2Node::new(left, 0, 0));
            self.nodes.write(first + 1, Bvh2Node::new(right, 0, 0));
        }
        first
    }

    /// # Safety
    /// Only the task that owns the item of `index` may call this.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub unsafe fn node_mut(&self, index: usize) -> &mut Bvh2Node {
        self.nodes.get_mut(index)
    }
}

/// Reorders `slice` so that elements for which `pred` is true come first. Returns how many there are.
/// Not stable.
pub(crate) fn partition_in_place<T, F: FnMut(&T) -> bool>(slice: &mut [T], mut pred: F) -> usize {
    let mut first = 0;
    let mut last = slice.len();
    loop {
        while first < last && pred(&slice[first]) {
            first += 1;
        }
        while first < last && !pred(&slice[last - 1]) {
            last -= 1;
        }
        if first >= last {
            return first;
        }
        slice.swap(first, last - 1);
        first += 1;
        last -= 1;
    }
}

/// `half_area * count`, with empty bins contributing nothing.
#[inline(always)]
pub(crate) fn sah_term(aabb: &Aabb, count: usize) -> f32 {
    if count == 0 {
        0.0
    } else {
        aabb.half_area() * count as f32
    }
}
