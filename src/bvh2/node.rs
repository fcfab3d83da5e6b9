use bytemuck::{Pod, Zeroable};

use crate::aabb::Aabb;

/// Inner node or leaf of a [`Bvh2`](super::Bvh2).
///
/// Nodes live in one array: the root alone at index 0, then sibling pairs `(1, 2)`, `(3, 4)`, ... so an inner
/// node only stores the index of its left child.
#[derive(Default, Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct Bvh2Node {
    pub aabb: Aabb,
    /// Zero for inner nodes.
    pub prim_count: u32,
    /// Left child of an inner node, or the start of a leaf's run in `primitive_indices`.
    pub first_index: u32,
}

unsafe impl Pod for Bvh2Node {}
unsafe impl Zeroable for Bvh2Node {}

impl Bvh2Node {
    #[inline(always)]
    pub fn new(aabb: Aabb, prim_count: u32, first_index: u32) -> Self {
        Self {
            aabb,
            prim_count,
            first_index,
        }
    }

    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        self.prim_count != 0
    }

    #[inline(always)]
    pub fn is_left_sibling(node_id: usize) -> bool {
        node_id & 1 == 1
    }

    /// Other node of the pair `node_id` belongs to. Not defined for the root.
    #[inline(always)]
    pub fn sibling(node_id: usize) -> usize {
        ((node_id - 1) ^ 1) + 1
    }

    /// Left node of the pair `node_id` belongs to.
    #[inline(always)]
    pub fn pair_start(node_id: usize) -> usize {
        ((node_id - 1) & !1) + 1
    }

    #[inline(always)]
    pub fn set_inner(&mut self, first_child: u32) {
        self.prim_count = 0;
        self.first_index = first_child;
    }

    #[inline(always)]
    pub fn set_leaf(&mut self, first_primitive: u32, prim_count: u32) {
        debug_assert!(prim_count > 0);
        self.prim_count = prim_count;
        self.first_index = first_primitive;
    }
}
