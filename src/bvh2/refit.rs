//! Bounding box updates after primitives moved, without touching the topology.

use crate::{
    aabb::Aabb,
    bvh2::{bottom_up::traverse_bottom_up, Bvh2, Bvh2Node},
    parallel::UnsafeSlice,
    primitive::Primitive,
};

/// Refits a fixed hierarchy. Parents and leaves are computed once in [`HierarchyRefitter::new`] and reused by
/// every [`HierarchyRefitter::refit`] call, so the tree must not be restructured in between.
#[derive(Clone, Debug)]
pub struct HierarchyRefitter {
    parents: Vec<u32>,
    leaves: Vec<u32>,
}

impl HierarchyRefitter {
    pub fn new(bvh: &Bvh2) -> Self {
        Self {
            parents: bvh.compute_parents(),
            leaves: bvh.leaves(),
        }
    }

    /// Calls `update_leaf` on every leaf with the original indices of the primitives it holds, then recomputes
    /// every inner node as the union of its children.
    pub fn refit<F>(&self, bvh: &mut Bvh2, update_leaf: F)
    where
        F: Fn(&mut Bvh2Node, &[u32]) + Send + Sync,
    {
        crate::scope!("refit");
        assert_eq!(
            self.parents.len(),
            bvh.nodes.len(),
            "The hierarchy changed since the refitter was created"
        );
        let primitive_indices = &bvh.primitive_indices;
        let nodes = UnsafeSlice::new(&mut bvh.nodes);
        traverse_bottom_up(
            &self.parents,
            &self.leaves,
            |i| {
                // SAFETY: each leaf is visited once, by one thread.
                let node = unsafe { nodes.get_mut(i) };
                let start = node.first_index as usize;
                let end = start + node.prim_count as usize;
                update_leaf(node, &primitive_indices[start..end]);
            },
            // SAFETY: an inner node is processed once, after its children are final.
            |i| unsafe { refit_inner(nodes, i) },
        );
    }

    /// Refit with leaves set to the union of their primitives' bounding boxes.
    pub fn refit_primitives<P: Primitive>(&self, bvh: &mut Bvh2, primitives: &[P]) {
        self.refit(bvh, |node, indices| {
            node.aabb = indices.iter().fold(Aabb::empty(), |aabb, &i| {
                aabb.union(&primitives[i as usize].bounding_box())
            });
        });
    }
}

/// Recomputes the box of every inner node from the current leaf boxes.
pub fn refit_inner_nodes(nodes: &mut [Bvh2Node], parents: &[u32], leaves: &[u32]) {
    crate::scope!("refit_inner_nodes");
    let nodes = UnsafeSlice::new(nodes);
    // SAFETY: an inner node is processed once, after its children are final.
    traverse_bottom_up(parents, leaves, |_| {}, |i| unsafe { refit_inner(nodes, i) });
}

/// # Safety
/// Node `i` and its children must not be accessed concurrently.
#[inline(always)]
unsafe fn refit_inner(nodes: UnsafeSlice<Bvh2Node>, i: usize) {
    let first = nodes.read(i).first_index as usize;
    let aabb = nodes.read(first).aabb.union(&nodes.read(first + 1).aabb);
    nodes.get_mut(i).aabb = aabb;
}
