//! A binary BVH

pub mod bottom_up;
pub mod builder;
pub mod layout;
pub mod leaf_collapser;
pub mod node;
pub mod refit;
pub mod reinsertion;
pub mod traverse;

#[cfg(feature = "parallel")]
use std::sync::atomic::{AtomicU32, Ordering};
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

pub use node::Bvh2Node;

use crate::{aabb::Aabb, primitive::Primitive, INVALID};

/// A binary BVH
#[derive(Clone, Default, Debug)]
pub struct Bvh2 {
    /// List of nodes contained in this bvh. first_index in Bvh2Node indexes into this list.
    /// The root is at index 0.
    pub nodes: Vec<Bvh2Node>,

    /// Mapping from bvh primitive slots to original input indices.
    /// Multiple primitives in a leaf need their indices laid out contiguously, leaves reference a range of this list.
    /// After a spatial split build (and before repair) the same original index can occur more than once.
    pub primitive_indices: Vec<u32>,
}

impl Bvh2 {
    #[inline(always)]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Indices of all leaf nodes, in node order.
    pub fn leaves(&self) -> Vec<u32> {
        leaf_indices(&self.nodes)
    }

    /// SAH cost of the tree, normalized by the root's half area. Leaves cost their primitive count,
    /// inner nodes cost `traversal_cost`.
    pub fn compute_cost(&self, traversal_cost: f32) -> f32 {
        crate::scope!("compute_cost");
        if self.nodes.is_empty() {
            return 0.0;
        }
        let node_cost = |node: &Bvh2Node| {
            let weight = if node.is_leaf() {
                node.prim_count as f32
            } else {
                traversal_cost
            };
            node.aabb.half_area() * weight
        };
        #[cfg(feature = "parallel")]
        let cost: f32 = if self.nodes.len() >= crate::parallel::PARALLEL_THRESHOLD {
            self.nodes.par_iter().map(node_cost).sum()
        } else {
            self.nodes.iter().map(node_cost).sum()
        };
        #[cfg(not(feature = "parallel"))]
        let cost: f32 = self.nodes.iter().map(node_cost).sum();

        let root_area = self.nodes[0].aabb.half_area();
        if root_area > 0.0 {
            cost / root_area
        } else {
            cost
        }
    }

    /// Compute the mapping from a given node index to that node's parent for each node in the bvh.
    /// The root's parent is [`INVALID`].
    pub fn compute_parents(&self) -> Vec<u32> {
        crate::scope!("compute_parents");
        if self.nodes.is_empty() {
            return Vec::new();
        }
        #[cfg(not(feature = "parallel"))]
        {
            let mut parents = vec![INVALID; self.nodes.len()];
            self.nodes.iter().enumerate().for_each(|(i, node)| {
                if !node.is_leaf() {
                    parents[node.first_index as usize] = i as u32;
                    parents[node.first_index as usize + 1] = i as u32;
                }
            });
            parents
        }
        #[cfg(feature = "parallel")]
        {
            let parents: Vec<AtomicU32> = (0..self.nodes.len())
                .map(|_| AtomicU32::new(INVALID))
                .collect();

            self.nodes.par_iter().enumerate().for_each(|(i, node)| {
                if !node.is_leaf() {
                    parents[node.first_index as usize].store(i as u32, Ordering::Relaxed);
                    parents[node.first_index as usize + 1].store(i as u32, Ordering::Relaxed);
                }
            });

            parents
                .into_iter()
                .map(|a| a.into_inner())
                .collect()
        }
    }

    /// Copy of `primitives` in `primitive_indices` order, so slot `i` holds `primitives[primitive_indices[i]]`.
    pub fn permute<P: Clone + Send + Sync>(&self, primitives: &[P]) -> Vec<P> {
        #[cfg(feature = "parallel")]
        {
            self.primitive_indices
                .par_iter()
                .map(|&i| primitives[i as usize].clone())
                .collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            self.primitive_indices
                .iter()
                .map(|&i| primitives[i as usize].clone())
                .collect()
        }
    }

    /// Walks the whole tree asserting its invariants:
    /// - every node is reachable from the root exactly once
    /// - every child fits in its parent
    /// - without `splits`, every primitive is referenced exactly once and fits in its leaf
    /// - with `tight_fit`, every box equals the union of its content
    pub fn validate<P: Primitive>(
        &self,
        primitives: &[P],
        splits: bool,
        tight_fit: bool,
    ) -> Bvh2ValidationResult {
        let mut result = Bvh2ValidationResult {
            splits,
            require_tight_fit: tight_fit,
            ..Default::default()
        };

        if self.nodes.is_empty() {
            assert!(
                self.primitive_indices.is_empty(),
                "Empty bvh references {} primitives",
                self.primitive_indices.len()
            );
            return result;
        }

        self.validate_impl(primitives, &mut result, 0, 0, 0);

        assert_eq!(
            result.discovered_nodes.len(),
            self.nodes.len(),
            "Some nodes are unreachable from the root"
        );
        assert_eq!(result.node_count, self.nodes.len());
        assert_eq!(
            result.prim_count,
            self.primitive_indices.len(),
            "Leaves don't cover primitive_indices exactly"
        );
        if !splits {
            assert_eq!(
                result.discovered_primitives.len(),
                primitives.len(),
                "Not every primitive is referenced by a leaf"
            );
        }

        result
    }

    fn validate_impl<P: Primitive>(
        &self,
        primitives: &[P],
        result: &mut Bvh2ValidationResult,
        node_index: u32,
        parent_index: u32,
        current_depth: u32,
    ) {
        result.max_depth = result.max_depth.max(current_depth);
        let parent_aabb = self.nodes[parent_index as usize].aabb;
        assert!(
            result.discovered_nodes.insert(node_index),
            "Node {node_index} is referenced more than once"
        );
        let node = &self.nodes[node_index as usize];
        result.node_count += 1;
        *result.nodes_at_depth.entry(current_depth).or_insert(0) += 1;

        assert!(
            parent_aabb.contains_aabb(&node.aabb),
            "Child {} does not fit in parent {}:\nchild:  {:?}\nparent: {:?}",
            node_index,
            parent_index,
            node.aabb,
            parent_aabb
        );

        if node.is_leaf() {
            result.leaf_count += 1;
            *result.leaves_at_depth.entry(current_depth).or_insert(0) += 1;
            let start = node.first_index as usize;
            let end = start + node.prim_count as usize;
            assert!(
                end <= self.primitive_indices.len(),
                "Leaf {node_index} references slots {start}..{end} past primitive_indices"
            );
            let mut temp_aabb = Aabb::empty();
            let mut in_leaf = HashSet::new();
            for slot in start..end {
                result.prim_count += 1;
                let prim_index = self.primitive_indices[slot];
                assert!(
                    (prim_index as usize) < primitives.len(),
                    "Slot {slot} references primitive {prim_index} out of {}",
                    primitives.len()
                );
                assert!(
                    in_leaf.insert(prim_index),
                    "Primitive {prim_index} occurs twice in leaf {node_index}"
                );
                let first_time = result.discovered_primitives.insert(prim_index);
                // With splits, primitives can be shared between leaves and extend outside them.
                if !result.splits {
                    assert!(first_time, "Primitive {prim_index} is referenced by several leaves");
                    let prim_aabb = primitives[prim_index as usize].bounding_box();
                    temp_aabb = temp_aabb.union(&prim_aabb);
                    assert!(
                        node.aabb.contains_aabb(&prim_aabb),
                        "Primitive {} does not fit in leaf {}:\nprimitive: {:?}\nleaf:      {:?}",
                        prim_index,
                        node_index,
                        prim_aabb,
                        node.aabb
                    );
                }
            }
            if result.require_tight_fit && !result.splits {
                assert_eq!(
                    temp_aabb, node.aabb,
                    "Primitives do not fit tightly in leaf {node_index}",
                );
            }
        } else {
            let left_id = node.first_index as usize;
            let right_id = left_id + 1;
            assert!(
                Bvh2Node::is_left_sibling(left_id) && right_id < self.nodes.len(),
                "Node {node_index} has an invalid child pair at {left_id}"
            );
            if result.require_tight_fit {
                assert_eq!(
                    self.nodes[left_id].aabb.union(&self.nodes[right_id].aabb),
                    node.aabb,
                    "Children {left_id} & {right_id} do not fit tightly in parent {node_index}",
                );
            }

            self.validate_impl(
                primitives,
                result,
                node.first_index,
                node_index,
                current_depth + 1,
            );
            self.validate_impl(
                primitives,
                result,
                node.first_index + 1,
                node_index,
                current_depth + 1,
            );
        }
    }

    /// Basic debug print illustrating the bvh layout
    pub fn print_bvh(&self, node_index: usize, depth: usize) {
        let node = &self.nodes[node_index];
        if node.is_leaf() {
            println!(
                "{}{} leaf > {}..{}",
                " ".repeat(depth),
                node_index,
                node.first_index,
                node.first_index + node.prim_count
            )
        } else {
            println!(
                "{}{} inner > {}, {}",
                " ".repeat(depth),
                node_index,
                node.first_index,
                node.first_index + 1
            );
            self.print_bvh(node.first_index as usize, depth + 1);
            self.print_bvh(node.first_index as usize + 1, depth + 1);
        }
    }

    /// Get the maximum depth of the BVH from the given node. A lone leaf has depth 1.
    pub fn depth(&self, node_index: usize) -> usize {
        let node = &self.nodes[node_index];
        if node.is_leaf() {
            1
        } else {
            1 + self
                .depth(node.first_index as usize)
                .max(self.depth((node.first_index + 1) as usize))
        }
    }
}

/// Indices of the leaves in `nodes`.
pub fn leaf_indices(nodes: &[Bvh2Node]) -> Vec<u32> {
    #[cfg(feature = "parallel")]
    if nodes.len() >= crate::parallel::PARALLEL_THRESHOLD {
        return nodes
            .par_iter()
            .enumerate()
            .filter(|(_, n)| n.is_leaf())
            .map(|(i, _)| i as u32)
            .collect();
    }
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.is_leaf())
        .map(|(i, _)| i as u32)
        .collect()
}

/// Result of Bvh2 validation. Contains various bvh stats.
#[derive(Default)]
pub struct Bvh2ValidationResult {
    /// Whether the BVH primitives have splits or not.
    pub splits: bool,
    /// Require validation to ensure aabbs tightly fit children and primitives.
    pub require_tight_fit: bool,
    /// Set of primitives discovered though validation traversal.
    pub discovered_primitives: HashSet<u32>,
    /// Set of nodes discovered though validation traversal.
    pub discovered_nodes: HashSet<u32>,
    /// Total number of nodes discovered though validation traversal.
    pub node_count: usize,
    /// Total number of leafs discovered though validation traversal.
    pub leaf_count: usize,
    /// Total number of primitive references discovered though validation traversal.
    pub prim_count: usize,
    /// Maximum hierarchical BVH depth discovered though validation traversal.
    pub max_depth: u32,
    /// Quantity of nodes found at each depth though validation traversal.
    pub nodes_at_depth: HashMap<u32, u32>,
    /// Quantity of leaves found at each depth though validation traversal.
    pub leaves_at_depth: HashMap<u32, u32>,
}

impl fmt::Display for Bvh2ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Avg primitives/leaf: {:.3}",
            self.prim_count as f64 / self.leaf_count.max(1) as f64
        )?;

        writeln!(
            f,
            "\
node_count: {}
prim_count: {}
leaf_count: {}",
            self.node_count, self.prim_count, self.leaf_count
        )?;

        writeln!(f, "Node & Leaf counts for each depth")?;
        for i in 0..=self.max_depth {
            writeln!(
                f,
                "{:<3} {:<10} {:<10}",
                i,
                self.nodes_at_depth.get(&i).unwrap_or(&0),
                self.leaves_at_depth.get(&i).unwrap_or(&0)
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glam::*;

    use super::*;

    /// root(0) -> (1: leaf a, 2: inner) -> 2 -> (3: leaf b, 4: leaf c)
    pub(crate) fn small_tree() -> (Bvh2, Vec<Aabb>) {
        let boxes = vec![
            Aabb::new(vec3a(0.0, 0.0, 0.0), vec3a(1.0, 1.0, 1.0)),
            Aabb::new(vec3a(4.0, 0.0, 0.0), vec3a(5.0, 1.0, 1.0)),
            Aabb::new(vec3a(6.0, 0.0, 0.0), vec3a(7.0, 1.0, 1.0)),
        ];
        let bvh = Bvh2 {
            nodes: vec![
                Bvh2Node::new(boxes[0].union(&boxes[1]).union(&boxes[2]), 0, 1),
                Bvh2Node::new(boxes[0], 1, 0),
                Bvh2Node::new(boxes[1].union(&boxes[2]), 0, 3),
                Bvh2Node::new(boxes[1], 1, 1),
                Bvh2Node::new(boxes[2], 1, 2),
            ],
            primitive_indices: vec![0, 1, 2],
        };
        (bvh, boxes)
    }

    #[test]
    fn parents_and_metrics() {
        let (bvh, boxes) = small_tree();
        assert_eq!(bvh.compute_parents(), vec![INVALID, 0, 0, 2, 2]);
        assert_eq!(bvh.depth(0), 3);
        assert_eq!(bvh.leaf_count(), 3);
        assert_eq!(bvh.leaves(), vec![1, 3, 4]);
        let result = bvh.validate(&boxes, false, true);
        assert_eq!(result.leaf_count, 3);
        assert_eq!(result.max_depth, 2);
    }

    #[test]
    fn cost_of_single_leaf_is_its_count() {
        let bvh = Bvh2 {
            nodes: vec![Bvh2Node::new(Aabb::new(Vec3A::ZERO, Vec3A::ONE), 4, 0)],
            primitive_indices: vec![0, 1, 2, 3],
        };
        assert_eq!(bvh.compute_cost(1.0), 4.0);
    }

    #[test]
    fn cost_counts_inner_nodes() {
        let (bvh, _) = small_tree();
        let root = bvh.nodes[0].aabb.half_area();
        let expected = (root * 2.0
            + bvh.nodes[2].aabb.half_area() * 2.0
            + bvh.nodes[1].aabb.half_area()
            + bvh.nodes[3].aabb.half_area()
            + bvh.nodes[4].aabb.half_area())
            / root;
        assert!((bvh.compute_cost(2.0) - expected).abs() < 1e-5);
    }

    #[test]
    fn permute_follows_primitive_indices() {
        let (mut bvh, _) = small_tree();
        bvh.primitive_indices = vec![2, 0, 1];
        assert_eq!(bvh.permute(&['a', 'b', 'c']), vec!['c', 'a', 'b']);
    }

    #[test]
    #[should_panic(expected = "does not fit in parent")]
    fn validate_catches_escaping_child() {
        let (mut bvh, boxes) = small_tree();
        bvh.nodes[3].aabb = Aabb::new(vec3a(-9.0, 0.0, 0.0), vec3a(5.0, 1.0, 1.0));
        bvh.validate(&boxes, false, false);
    }
}
