//! PLOC (Parallel, Locally Ordered Clustering) BVH 2 Builder.

// https://madmann91.github.io/2021/05/05/ploc-revisited.html
// https://github.com/meistdan/ploc/
// https://meistdan.github.io/publications/ploc/paper.pdf
// https://github.com/madmann91/bvh/blob/v1/include/bvh/locally_ordered_clustering_builder.hpp

use glam::Vec3A;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{
    aabb::Aabb,
    bvh2::{Bvh2, Bvh2Node},
    cluster::{merge_pass, UNPAIRED},
    morton::sort_primitives_by_morton_code,
};

/// Bottom-up builder: starting from the leaves in Morton order, every node looks for the neighbor within the
/// search distance that gives the smallest combined box. Nodes that pick each other are merged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlocBuilder {
    pub search_distance: PlocSearchDistance,
}

impl PlocBuilder {
    pub fn build(&self, global_bbox: &Aabb, bboxes: &[Aabb], centers: &[Vec3A]) -> Bvh2 {
        match self.search_distance {
            PlocSearchDistance::Minimum => build_ploc::<1>(global_bbox, bboxes, centers),
            PlocSearchDistance::VeryLow => build_ploc::<2>(global_bbox, bboxes, centers),
            PlocSearchDistance::Low => build_ploc::<6>(global_bbox, bboxes, centers),
            PlocSearchDistance::Medium => build_ploc::<14>(global_bbox, bboxes, centers),
            PlocSearchDistance::High => build_ploc::<24>(global_bbox, bboxes, centers),
            PlocSearchDistance::VeryHigh => build_ploc::<32>(global_bbox, bboxes, centers),
        }
    }
}

/// SEARCH_DISTANCE should be <= 32
pub fn build_ploc<const SEARCH_DISTANCE: usize>(
    global_bbox: &Aabb,
    bboxes: &[Aabb],
    centers: &[Vec3A],
) -> Bvh2 {
    crate::scope!("build_ploc");
    assert!(!bboxes.is_empty(), "Cannot build a bvh without primitives");
    assert_eq!(bboxes.len(), centers.len(), "One center per bounding box expected");
    assert!(i8::MAX as usize > SEARCH_DISTANCE);

    let prim_count = bboxes.len();
    let (primitive_indices, _) = sort_primitives_by_morton_code(global_bbox, centers);
    let mut current: Vec<Bvh2Node> = primitive_indices
        .iter()
        .enumerate()
        .map(|(slot, &prim)| Bvh2Node::new(bboxes[prim as usize], 1, slot as u32))
        .collect();

    let mut nodes = vec![Bvh2Node::default(); 2 * prim_count - 1];
    let mut children_end = nodes.len();
    let mut merge = vec![0i8; prim_count];
    let mut depth = 0;
    while current.len() > 1 {
        let count = current.len();
        let merge = &mut merge[..count];
        find_best_nodes::<SEARCH_DISTANCE>(&current, merge);

        // The two nodes should be merged if they agree on their respective merge indices.
        let merge = &*merge;
        let mutual = |index: usize| {
            let best = (index as i64 + merge[index] as i64) as usize;
            if best != index && (best as i64 + merge[best] as i64) as usize == index {
                best as u32
            } else {
                UNPAIRED
            }
        };
        #[cfg(feature = "parallel")]
        let mut partner: Vec<u32> = if count >= crate::parallel::PARALLEL_THRESHOLD {
            (0..count).into_par_iter().map(mutual).collect()
        } else {
            (0..count).map(mutual).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let mut partner: Vec<u32> = (0..count).map(mutual).collect();

        if partner.iter().all(|&p| p == UNPAIRED) {
            // Only possible with ties in the costs. Force progress.
            log::trace!("ploc: no mutual neighbors among {count} nodes, merging the first two");
            partner[0] = 1;
            partner[1] = 0;
        }

        current = merge_pass(&current, &partner, &mut nodes, &mut children_end).next;
        depth += 1;
    }

    debug_assert_eq!(children_end, 1);
    nodes[0] = current[0];
    log::debug!("ploc: {} primitives, {} merge rounds", prim_count, depth);
    Bvh2 {
        nodes,
        primitive_indices,
    }
}

/// Fills `merge[i]` with the offset from `i` to its best neighbor.
fn find_best_nodes<const SEARCH_DISTANCE: usize>(nodes: &[Bvh2Node], merge: &mut [i8]) {
    crate::scope!("find_best_nodes");
    #[cfg(feature = "parallel")]
    // Due to rayon overhead, splitting small searches is slower than running them on one thread.
    if nodes.len() >= 4000 {
        let chunk_size = nodes.len().div_ceil(rayon::current_num_threads() * 4);
        merge
            .par_chunks_mut(chunk_size)
            .enumerate()
            .for_each_init(SearchCache::<SEARCH_DISTANCE>::default, |cache, (chunk, bests)| {
                for (i, best) in bests.iter_mut().enumerate() {
                    *best = cache.find_best_node_parallel(chunk * chunk_size + i, i, nodes);
                }
            });
        return;
    }

    let mut cache = SearchCache::<SEARCH_DISTANCE>::default();
    for (index, best) in merge.iter_mut().enumerate() {
        *best = cache.find_best_node(index, nodes);
    }
}

// For reference/testing
#[allow(dead_code)]
fn find_best_node_basic(index: usize, nodes: &[Bvh2Node], search_distance: usize) -> i8 {
    let mut best_node = index;
    let mut best_cost = f32::INFINITY;

    let begin = index - search_distance.min(index);
    let end = (index + search_distance + 1).min(nodes.len());

    let our_aabb = nodes[index].aabb;
    for other in begin..end {
        if other == index {
            continue;
        }
        let cost = our_aabb.union(&nodes[other].aabb).half_area();
        if cost < best_cost {
            best_node = other;
            best_cost = cost;
        }
    }

    (best_node as i64 - index as i64) as i8
}

/// In PLOC, the number of nodes before and after the current one that are evaluated for pairing.
/// Minimum (1) is fast and still results in decent quality BVHs especially when paired with a bit of reinsertion.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlocSearchDistance {
    /// 1
    Minimum,
    /// 2
    VeryLow,
    /// 6
    Low,
    #[default]
    /// 14
    Medium,
    /// 24
    High,
    /// 32
    VeryHigh,
}

impl PlocSearchDistance {
    pub fn distance(&self) -> usize {
        match self {
            PlocSearchDistance::Minimum => 1,
            PlocSearchDistance::VeryLow => 2,
            PlocSearchDistance::Low => 6,
            PlocSearchDistance::Medium => 14,
            PlocSearchDistance::High => 24,
            PlocSearchDistance::VeryHigh => 32,
        }
    }
}

impl From<u32> for PlocSearchDistance {
    fn from(value: u32) -> Self {
        match value {
            1 => PlocSearchDistance::Minimum,
            2 => PlocSearchDistance::VeryLow,
            6 => PlocSearchDistance::Low,
            14 => PlocSearchDistance::Medium,
            24 => PlocSearchDistance::High,
            32 => PlocSearchDistance::VeryHigh,
            _ => panic!("Invalid value for PlocSearchDistance: {value}"),
        }
    }
}

/// Sliding window of the costs computed so far: the cost of `(index, other)` for `other` ahead of `index` is
/// stored when `index` searches forward and read back when `other` searches backward.
// A fixed size array is much faster here than a Vec.
#[derive(Clone, Copy)]
struct SearchCache<const SEARCH_DISTANCE: usize>([[f32; SEARCH_DISTANCE]; SEARCH_DISTANCE]);

impl<const SEARCH_DISTANCE: usize> Default for SearchCache<SEARCH_DISTANCE> {
    fn default() -> Self {
        SearchCache([[0.0; SEARCH_DISTANCE]; SEARCH_DISTANCE])
    }
}

impl<const SEARCH_DISTANCE: usize> SearchCache<SEARCH_DISTANCE> {
    #[inline]
    fn back(&self, index: usize, other: usize) -> f32 {
        // The % SEARCH_DISTANCE removes the bounds check.
        self.0[other % SEARCH_DISTANCE][index % SEARCH_DISTANCE]
    }

    #[inline]
    fn front(&mut self, index: usize, other: usize) -> &mut f32 {
        &mut self.0[index % SEARCH_DISTANCE][other % SEARCH_DISTANCE]
    }

    /// Like [`Self::find_best_node`] for searches split into chunks: `i` is the position of `index` in its chunk.
    /// The cache only holds the costs of the current chunk.
    #[allow(dead_code)]
    fn find_best_node_parallel(&mut self, index: usize, i: usize, nodes: &[Bvh2Node]) -> i8 {
        let mut best_node = index;
        let mut best_cost = f32::INFINITY;

        let begin = index - SEARCH_DISTANCE.min(index);
        let end = (index + SEARCH_DISTANCE + 1).min(nodes.len());

        let our_aabb = nodes[index].aabb;
        for other in begin..index {
            // The first SEARCH_DISTANCE nodes of a chunk look back into the previous chunk.
            let area = if i <= SEARCH_DISTANCE {
                our_aabb.union(&nodes[other].aabb).half_area()
            } else {
                self.back(index, other)
            };

            if area < best_cost {
                best_node = other;
                best_cost = area;
            }
        }

        ((index + 1)..end).for_each(|other| {
            let cost = our_aabb.union(&nodes[other].aabb).half_area();
            *self.front(index, other) = cost;
            if cost < best_cost {
                best_node = other;
                best_cost = cost;
            }
        });

        (best_node as i64 - index as i64) as i8
    }

    fn find_best_node(&mut self, index: usize, nodes: &[Bvh2Node]) -> i8 {
        let mut best_node = index;
        let mut best_cost = f32::INFINITY;

        let begin = index - SEARCH_DISTANCE.min(index);
        let end = (index + SEARCH_DISTANCE + 1).min(nodes.len());

        for other in begin..index {
            let area = self.back(index, other);
            if area < best_cost {
                best_node = other;
                best_cost = area;
            }
        }

        let our_aabb = nodes[index].aabb;
        ((index + 1)..end).for_each(|other| {
            let cost = our_aabb.union(&nodes[other].aabb).half_area();
            *self.front(index, other) = cost;
            if cost < best_cost {
                best_node = other;
                best_cost = cost;
            }
        });

        (best_node as i64 - index as i64) as i8
    }
}
