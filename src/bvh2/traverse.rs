//! Single ray traversal.
//!
//! The traverser is generic over how ray/node tests are done ([`NodeIntersector`]), what a hit is and when to stop
//! ([`PrimitiveIntersector`]) and what to count ([`Statistics`]). Everything is monomorphized, so the unused
//! variants cost nothing.

use std::marker::PhantomData;

use glam::{BVec3A, Vec3A};

use crate::{
    bvh2::{Bvh2, Bvh2Node},
    primitive::{Intersection, Primitive},
    ray::Ray,
    utils::{add_ulp_magnitude, robust_max, robust_min, safe_inverse_vec},
};

/// Computes the parametric entry and exit distances of a ray through a node's box.
/// The ray is hit when `entry <= exit`. Implementations already clip to `ray.tmin..ray.tmax`.
pub trait NodeIntersector {
    fn new(ray: &Ray) -> Self;
    fn intersect(&self, node: &Bvh2Node, ray: &Ray) -> (f32, f32);
}

/// Slab test that never misses a box the ray touches. Exit distances are padded by 2 ulps and NaNs from
/// `0 * inf` are ignored.
#[derive(Clone, Copy, Debug)]
pub struct RobustNodeIntersector {
    inv_direction: Vec3A,
    padded_inv_direction: Vec3A,
    negative: BVec3A,
}

impl NodeIntersector for RobustNodeIntersector {
    #[inline(always)]
    fn new(ray: &Ray) -> Self {
        let inv_direction = Vec3A::ONE / ray.direction;
        let padded_inv_direction = Vec3A::new(
            add_ulp_magnitude(inv_direction.x, 2),
            add_ulp_magnitude(inv_direction.y, 2),
            add_ulp_magnitude(inv_direction.z, 2),
        );
        Self {
            inv_direction,
            padded_inv_direction,
            negative: direction_is_negative(ray.direction),
        }
    }

    #[inline(always)]
    fn intersect(&self, node: &Bvh2Node, ray: &Ray) -> (f32, f32) {
        let near = Vec3A::select(self.negative, node.aabb.max, node.aabb.min);
        let far = Vec3A::select(self.negative, node.aabb.min, node.aabb.max);
        let entry = (near - ray.origin) * self.inv_direction;
        let exit = (far - ray.origin) * self.padded_inv_direction;
        (
            robust_max(entry.x, robust_max(entry.y, robust_max(entry.z, ray.tmin))),
            robust_min(exit.x, robust_min(exit.y, robust_min(exit.z, ray.tmax))),
        )
    }
}

/// Slab test with one fused multiply-add per plane. Zero direction components are replaced by a tiny value
/// so the math stays finite.
#[derive(Clone, Copy, Debug)]
pub struct FastNodeIntersector {
    inv_direction: Vec3A,
    scaled_origin: Vec3A,
    negative: BVec3A,
}

impl NodeIntersector for FastNodeIntersector {
    #[inline(always)]
    fn new(ray: &Ray) -> Self {
        let inv_direction = safe_inverse_vec(ray.direction);
        Self {
            inv_direction,
            scaled_origin: -ray.origin * inv_direction,
            negative: direction_is_negative(ray.direction),
        }
    }

    #[inline(always)]
    fn intersect(&self, node: &Bvh2Node, ray: &Ray) -> (f32, f32) {
        let near = Vec3A::select(self.negative, node.aabb.max, node.aabb.min);
        let far = Vec3A::select(self.negative, node.aabb.min, node.aabb.max);
        let entry = near.mul_add(self.inv_direction, self.scaled_origin);
        let exit = far.mul_add(self.inv_direction, self.scaled_origin);
        (
            entry.max_element().max(ray.tmin),
            exit.min_element().min(ray.tmax),
        )
    }
}

#[inline(always)]
fn direction_is_negative(direction: Vec3A) -> BVec3A {
    BVec3A::new(
        direction.x.is_sign_negative(),
        direction.y.is_sign_negative(),
        direction.z.is_sign_negative(),
    )
}

/// Intersects the primitives of a leaf.
pub trait PrimitiveIntersector {
    type Result: Intersection;
    /// Stop at the first hit instead of searching for the closest one.
    const ANY_HIT: bool;
    /// `slot` indexes `Bvh2::primitive_indices`. Returned hits must lie in `ray.tmin..=ray.tmax`.
    fn intersect(&mut self, slot: usize, ray: &Ray) -> Option<Self::Result>;
}

/// Closest hit, with the original index of the primitive that was hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClosestHit<I> {
    pub primitive_index: u32,
    pub intersection: I,
}

impl<I: Intersection> Intersection for ClosestHit<I> {
    #[inline(always)]
    fn distance(&self) -> f32 {
        self.intersection.distance()
    }
}

/// Result of an any-hit query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnyHit {
    pub primitive_index: u32,
    pub distance: f32,
}

impl Intersection for AnyHit {
    #[inline(always)]
    fn distance(&self) -> f32 {
        self.distance
    }
}

/// Looks primitives up either through `primitive_indices` or, when `permuted`, directly by slot.
struct PrimitiveSource<'a, P> {
    primitive_indices: &'a [u32],
    primitives: &'a [P],
    permuted: bool,
}

impl<'a, P: Primitive> PrimitiveSource<'a, P> {
    fn new(bvh: &'a Bvh2, primitives: &'a [P], permuted: bool) -> Self {
        if permuted {
            assert_eq!(
                primitives.len(),
                bvh.primitive_indices.len(),
                "Permuted primitives must have one entry per bvh slot"
            );
        }
        Self {
            primitive_indices: &bvh.primitive_indices,
            primitives,
            permuted,
        }
    }

    #[inline(always)]
    fn get(&self, slot: usize) -> (u32, &P) {
        let index = self.primitive_indices[slot];
        if self.permuted {
            (index, &self.primitives[slot])
        } else {
            (index, &self.primitives[index as usize])
        }
    }
}

pub struct ClosestPrimitiveIntersector<'a, P> {
    source: PrimitiveSource<'a, P>,
}

impl<'a, P: Primitive> ClosestPrimitiveIntersector<'a, P> {
    /// `primitives` is the slice the bvh was built from.
    pub fn new(bvh: &'a Bvh2, primitives: &'a [P]) -> Self {
        Self {
            source: PrimitiveSource::new(bvh, primitives, false),
        }
    }

    /// `primitives` was produced by [`Bvh2::permute`].
    pub fn new_permuted(bvh: &'a Bvh2, primitives: &'a [P]) -> Self {
        Self {
            source: PrimitiveSource::new(bvh, primitives, true),
        }
    }
}

impl<P: Primitive> PrimitiveIntersector for ClosestPrimitiveIntersector<'_, P> {
    type Result = ClosestHit<P::Intersection>;
    const ANY_HIT: bool = false;

    #[inline(always)]
    fn intersect(&mut self, slot: usize, ray: &Ray) -> Option<Self::Result> {
        let (primitive_index, primitive) = self.source.get(slot);
        primitive.intersect(ray).map(|intersection| ClosestHit {
            primitive_index,
            intersection,
        })
    }
}

pub struct AnyPrimitiveIntersector<'a, P> {
    source: PrimitiveSource<'a, P>,
}

impl<'a, P: Primitive> AnyPrimitiveIntersector<'a, P> {
    pub fn new(bvh: &'a Bvh2, primitives: &'a [P]) -> Self {
        Self {
            source: PrimitiveSource::new(bvh, primitives, false),
        }
    }

    pub fn new_permuted(bvh: &'a Bvh2, primitives: &'a [P]) -> Self {
        Self {
            source: PrimitiveSource::new(bvh, primitives, true),
        }
    }
}

impl<P: Primitive> PrimitiveIntersector for AnyPrimitiveIntersector<'_, P> {
    type Result = AnyHit;
    const ANY_HIT: bool = true;

    #[inline(always)]
    fn intersect(&mut self, slot: usize, ray: &Ray) -> Option<Self::Result> {
        let (primitive_index, primitive) = self.source.get(slot);
        primitive.intersect(ray).map(|i| AnyHit {
            primitive_index,
            distance: i.distance(),
        })
    }
}

/// Counters updated during traversal.
pub trait Statistics {
    /// Called for every node visited.
    fn traversal_step(&mut self);
    /// Called for every primitive intersection test.
    fn intersection(&mut self);
}

/// Compiles to nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoStatistics;

impl Statistics for NoStatistics {
    #[inline(always)]
    fn traversal_step(&mut self) {}
    #[inline(always)]
    fn intersection(&mut self) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraversalStatistics {
    pub traversal_steps: usize,
    pub intersections: usize,
}

impl Statistics for TraversalStatistics {
    #[inline(always)]
    fn traversal_step(&mut self) {
        self.traversal_steps += 1;
    }
    #[inline(always)]
    fn intersection(&mut self) {
        self.intersections += 1;
    }
}

/// Depth first, nearest child first traversal of a [`Bvh2`].
///
/// `STACK_SIZE` bounds the tree depth that can be traversed, the builders' default `max_depth` fits in the default.
pub struct SingleRayTraverser<'a, N = FastNodeIntersector, const STACK_SIZE: usize = 64> {
    bvh: &'a Bvh2,
    _node_intersector: PhantomData<N>,
}

impl<'a, N: NodeIntersector, const STACK_SIZE: usize> SingleRayTraverser<'a, N, STACK_SIZE> {
    pub fn new(bvh: &'a Bvh2) -> Self {
        Self {
            bvh,
            _node_intersector: PhantomData,
        }
    }

    /// Returns the closest hit, or with an any-hit intersector the first one found.
    /// `ray.tmax` shrinks to the distance of the best hit so far.
    pub fn traverse<I, S>(
        &self,
        mut ray: Ray,
        primitive_intersector: &mut I,
        statistics: &mut S,
    ) -> Option<I::Result>
    where
        I: PrimitiveIntersector,
        S: Statistics,
    {
        let nodes = &self.bvh.nodes;
        if nodes.is_empty() {
            return None;
        }

        let node_intersector = N::new(&ray);
        let mut best = None;

        let mut intersect_leaf = |node: &Bvh2Node, ray: &mut Ray, statistics: &mut S| -> bool {
            let start = node.first_index as usize;
            for slot in start..start + node.prim_count as usize {
                statistics.intersection();
                if let Some(hit) = primitive_intersector.intersect(slot, ray) {
                    ray.tmax = hit.distance();
                    best = Some(hit);
                    if I::ANY_HIT {
                        return true;
                    }
                }
            }
            false
        };

        statistics.traversal_step();
        let root = &nodes[0];
        if root.is_leaf() {
            intersect_leaf(root, &mut ray, &mut *statistics);
            return best;
        }
        let (entry, exit) = node_intersector.intersect(root, &ray);
        if entry > exit {
            return None;
        }

        let mut stack = PairStack::<STACK_SIZE>::new();
        let mut current = root.first_index;
        loop {
            let left_id = current as usize;
            let left = &nodes[left_id];
            let right = &nodes[left_id + 1];
            statistics.traversal_step();
            statistics.traversal_step();

            let mut left_hit = node_intersector.intersect(left, &ray);
            let mut right_hit = node_intersector.intersect(right, &ray);

            // Leaves are intersected as soon as their box is hit.
            if left_hit.0 <= left_hit.1 && left.is_leaf() {
                if intersect_leaf(left, &mut ray, &mut *statistics) {
                    break;
                }
                left_hit.0 = f32::INFINITY;
            }
            if right_hit.0 <= right_hit.1 && right.is_leaf() {
                if intersect_leaf(right, &mut ray, &mut *statistics) {
                    break;
                }
                right_hit.0 = f32::INFINITY;
            }

            let hit_left = left_hit.0 <= left_hit.1.min(ray.tmax);
            let hit_right = right_hit.0 <= right_hit.1.min(ray.tmax);

            match (hit_left, hit_right) {
                (true, true) => {
                    let (near, far) = if left_hit.0 > right_hit.0 {
                        (right, left)
                    } else {
                        (left, right)
                    };
                    stack.push(far.first_index);
                    current = near.first_index;
                }
                (true, false) => current = left.first_index,
                (false, true) => current = right.first_index,
                (false, false) => match stack.pop() {
                    Some(next) => current = next,
                    None => break,
                },
            }
        }

        best
    }
}

/// Far sibling pairs still to visit, by the index of their left node.
struct PairStack<const N: usize> {
    pairs: [u32; N],
    len: usize,
}

impl<const N: usize> PairStack<N> {
    #[inline(always)]
    fn new() -> Self {
        Self { pairs: [0; N], len: 0 }
    }

    /// # Panics
    /// If the tree is deeper than `N`.
    #[inline(always)]
    fn push(&mut self, first_child: u32) {
        assert!(self.len < N, "Traversal stack overflow (capacity: {N})");
        self.pairs[self.len] = first_child;
        self.len += 1;
    }

    #[inline(always)]
    fn pop(&mut self) -> Option<u32> {
        self.len = self.len.checked_sub(1)?;
        Some(self.pairs[self.len])
    }
}

#[cfg(test)]
mod tests {
    use glam::*;

    use super::*;
    use crate::{aabb::Aabb, bvh2::Bvh2Node};

    fn two_boxes() -> (Bvh2, Vec<Aabb>) {
        let boxes = vec![
            Aabb::new(Vec3A::splat(-0.5), Vec3A::splat(0.5)),
            Aabb::new(vec3a(9.5, -0.5, -0.5), vec3a(10.5, 0.5, 0.5)),
        ];
        let bvh = Bvh2 {
            nodes: vec![
                Bvh2Node::new(boxes[0].union(&boxes[1]), 0, 1),
                Bvh2Node::new(boxes[1], 1, 0),
                Bvh2Node::new(boxes[0], 1, 1),
            ],
            primitive_indices: vec![1, 0],
        };
        (bvh, boxes)
    }

    #[test]
    fn closest_hit_reports_original_index() {
        let (bvh, boxes) = two_boxes();
        let ray = Ray::new_inf(vec3a(-5.0, 0.0, 0.0), Vec3A::X);
        let traverser = SingleRayTraverser::<RobustNodeIntersector>::new(&bvh);
        let hit = traverser
            .traverse(
                ray,
                &mut ClosestPrimitiveIntersector::new(&bvh, &boxes),
                &mut NoStatistics,
            )
            .unwrap();
        assert_eq!(hit.primitive_index, 0);
        assert_eq!(hit.distance(), 4.5);

        let back = Ray::new_inf(vec3a(15.0, 0.0, 0.0), -Vec3A::X);
        let permuted = bvh.permute(&boxes);
        let hit = traverser
            .traverse(
                back,
                &mut ClosestPrimitiveIntersector::new_permuted(&bvh, &permuted),
                &mut NoStatistics,
            )
            .unwrap();
        assert_eq!(hit.primitive_index, 1);
        assert_eq!(hit.distance(), 4.5);
    }

    #[test]
    fn miss_and_empty() {
        let (bvh, boxes) = two_boxes();
        let ray = Ray::new_inf(vec3a(-5.0, 3.0, 0.0), Vec3A::X);
        let traverser = SingleRayTraverser::<FastNodeIntersector>::new(&bvh);
        let mut stats = TraversalStatistics::default();
        assert!(traverser
            .traverse(ray, &mut ClosestPrimitiveIntersector::new(&bvh, &boxes), &mut stats)
            .is_none());
        assert_eq!(stats.intersections, 0);

        let empty = Bvh2::default();
        let no_boxes: [Aabb; 0] = [];
        assert!(SingleRayTraverser::<FastNodeIntersector>::new(&empty)
            .traverse(
                ray,
                &mut ClosestPrimitiveIntersector::new(&empty, &no_boxes),
                &mut NoStatistics
            )
            .is_none());
    }

    #[test]
    fn axis_aligned_ray_on_box_face() {
        // Direction has zero components and the origin lies exactly on a slab plane.
        let (bvh, boxes) = two_boxes();
        let ray = Ray::new_inf(vec3a(-5.0, 0.5, 0.0), Vec3A::X);
        let robust = SingleRayTraverser::<RobustNodeIntersector>::new(&bvh)
            .traverse(ray, &mut AnyPrimitiveIntersector::new(&bvh, &boxes), &mut NoStatistics);
        assert!(robust.is_some());
    }

    #[test]
    fn lone_leaf_root() {
        let boxes = [Aabb::new(Vec3A::ZERO, Vec3A::ONE)];
        let bvh = Bvh2 {
            nodes: vec![Bvh2Node::new(boxes[0], 1, 0)],
            primitive_indices: vec![0],
        };
        let ray = Ray::new_inf(vec3a(0.5, 0.5, -2.0), Vec3A::Z);
        let hit = SingleRayTraverser::<FastNodeIntersector>::new(&bvh)
            .traverse(ray, &mut ClosestPrimitiveIntersector::new(&bvh, &boxes), &mut NoStatistics)
            .unwrap();
        assert_eq!(hit.distance(), 2.0);
    }

    #[test]
    fn pair_stack_is_last_in_first_out() {
        let mut stack = PairStack::<3>::new();
        assert_eq!(stack.pop(), None);
        for pair in [1, 3, 7] {
            stack.push(pair);
        }
        assert_eq!(stack.pop(), Some(7));
        stack.push(9);
        assert_eq!(stack.pop(), Some(9));
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    #[should_panic(expected = "Traversal stack overflow")]
    fn pair_stack_overflows_past_capacity() {
        let mut stack = PairStack::<2>::new();
        for pair in [1, 3, 5] {
            stack.push(pair);
        }
    }
}
