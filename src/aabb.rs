//! Axis aligned bounding boxes.
//!
//! Boxes start out as [`Aabb::EMPTY`] and grow by union. An empty box has `min > max` on every axis, so it is
//! never [`valid`](Aabb::valid), has no area and is the identity of [`union`](Aabb::union).

use bytemuck::{Pod, Zeroable};
use glam::{BVec3A, Vec3A};

use crate::{
    ray::Ray,
    utils::{robust_max, robust_min},
};

#[derive(Default, Clone, Copy, Debug, PartialEq, Zeroable)]
#[repr(C)]
pub struct Aabb {
    pub min: Vec3A,
    pub max: Vec3A,
}

unsafe impl Pod for Aabb {}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3A::splat(f32::INFINITY),
        max: Vec3A::splat(f32::NEG_INFINITY),
    };

    #[inline(always)]
    pub fn new(min: Vec3A, max: Vec3A) -> Self {
        Self { min, max }
    }

    #[inline(always)]
    pub fn empty() -> Self {
        Self::EMPTY
    }

    /// Degenerate box holding a single point.
    #[inline(always)]
    pub fn from_point(point: Vec3A) -> Self {
        Self::new(point, point)
    }

    /// Smallest box holding every point, [`Aabb::EMPTY`] for none.
    pub fn from_points(points: &[Vec3A]) -> Self {
        points.iter().fold(Self::EMPTY, |aabb, &p| Self::new(aabb.min.min(p), aabb.max.max(p)))
    }

    #[inline(always)]
    pub fn extend(&mut self, point: Vec3A) -> &mut Self {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
        self
    }

    #[inline(always)]
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Overlap of both boxes. Disjoint boxes give a box that is not [`valid`](Aabb::valid).
    #[inline(always)]
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        Self::new(self.min.max(other.min), self.max.min(other.max))
    }

    /// Clips this box to `other`, used to keep split references inside their node.
    #[inline(always)]
    pub fn shrink(&mut self, other: &Self) -> &mut Self {
        *self = self.intersection(other);
        self
    }

    #[inline(always)]
    pub fn contains_point(&self, point: Vec3A) -> bool {
        (point.cmpge(self.min) & point.cmple(self.max)).all()
    }

    #[inline(always)]
    pub fn contains_aabb(&self, other: &Self) -> bool {
        (other.min.cmpge(self.min) & other.max.cmple(self.max)).all()
    }

    #[inline(always)]
    pub fn intersect_aabb(&self, other: &Self) -> bool {
        (self.min.cmple(other.max) & other.min.cmple(self.max)).all()
    }

    /// `min <= max` on every axis. False for [`Aabb::EMPTY`] and for NaN corners.
    #[inline(always)]
    pub fn valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    #[inline(always)]
    pub fn diagonal(&self) -> Vec3A {
        self.max - self.min
    }

    #[inline(always)]
    pub fn center(&self) -> Vec3A {
        (self.min + self.max) * 0.5
    }

    /// Axis of the largest extent, the first one on ties.
    #[inline]
    pub fn largest_axis(&self) -> usize {
        let d = self.diagonal();
        let mut axis = 0;
        for i in 1..3 {
            if d[i] > d[axis] {
                axis = i;
            }
        }
        axis
    }

    #[inline]
    pub fn largest_extent(&self) -> f32 {
        self.diagonal().max_element()
    }

    /// Half the surface area, the SAH weight of a node. Zero for boxes that are not valid.
    #[inline(always)]
    pub fn half_area(&self) -> f32 {
        let d = self.diagonal().max(Vec3A::ZERO);
        d.x * (d.y + d.z) + d.y * d.z
    }

    #[inline(always)]
    pub fn surface_area(&self) -> f32 {
        2.0 * self.half_area()
    }

    #[inline(always)]
    pub fn volume(&self) -> f32 {
        let d = self.diagonal().max(Vec3A::ZERO);
        d.x * d.y * d.z
    }

    /// Entry and exit distances of the infinite line through `ray`, not clipped to `tmin..tmax`.
    /// The line misses when `entry > exit`.
    ///
    /// Uses the exact reciprocal of the direction: a zero component with the origin on one of that axis' slab
    /// planes gives `0 * inf = NaN`, which the folds skip, so the ray still hits the face it slides along.
    #[inline(always)]
    pub fn ray_interval(&self, ray: &Ray) -> (f32, f32) {
        let inv_direction = Vec3A::ONE / ray.direction;
        let negative = BVec3A::new(
            ray.direction.x.is_sign_negative(),
            ray.direction.y.is_sign_negative(),
            ray.direction.z.is_sign_negative(),
        );
        let near = (Vec3A::select(negative, self.max, self.min) - ray.origin) * inv_direction;
        let far = (Vec3A::select(negative, self.min, self.max) - ray.origin) * inv_direction;
        (
            robust_max(near.x, robust_max(near.y, robust_max(near.z, f32::NEG_INFINITY))),
            robust_min(far.x, robust_min(far.y, robust_min(far.z, f32::INFINITY))),
        )
    }

    /// Distance at which `ray` enters the box, clamped to `ray.tmin`. [`f32::INFINITY`] if the box is not hit
    /// within `ray.tmin..=ray.tmax`.
    #[inline(always)]
    pub fn intersect_ray(&self, ray: &Ray) -> f32 {
        let (entry, exit) = self.ray_interval(ray);
        let entry = entry.max(ray.tmin);
        if entry <= exit.min(ray.tmax) {
            entry
        } else {
            f32::INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::vec3a;

    use super::*;

    fn unit() -> Aabb {
        Aabb::new(Vec3A::ZERO, Vec3A::ONE)
    }

    #[test]
    fn empty_is_union_identity() {
        let empty = Aabb::empty();
        assert!(!empty.valid());
        assert_eq!(empty.half_area(), 0.0);
        assert_eq!(empty.union(&unit()), unit());
        assert_eq!(Aabb::from_points(&[]), Aabb::EMPTY);
        let mut grown = Aabb::EMPTY;
        grown.extend(Vec3A::ONE).extend(Vec3A::ZERO);
        assert_eq!(grown, unit());
        assert_eq!(Aabb::from_points(&[Vec3A::ONE, Vec3A::ZERO]), unit());
        assert_eq!(Aabb::from_point(Vec3A::ONE).half_area(), 0.0);
    }

    #[test]
    fn overlap_and_containment() {
        let shifted = Aabb::new(Vec3A::splat(0.5), Vec3A::splat(1.5));
        assert_eq!(unit().intersection(&shifted), Aabb::new(Vec3A::splat(0.5), Vec3A::ONE));
        assert!(unit().intersect_aabb(&shifted));
        // Touching faces count as overlapping.
        assert!(unit().intersect_aabb(&Aabb::new(vec3a(1.0, 0.0, 0.0), vec3a(2.0, 1.0, 1.0))));
        let far = Aabb::new(Vec3A::splat(2.0), Vec3A::splat(3.0));
        assert!(!unit().intersect_aabb(&far));
        assert!(!unit().intersection(&far).valid());

        let mut clipped = Aabb::new(Vec3A::ZERO, Vec3A::splat(2.0));
        clipped.shrink(&shifted);
        assert_eq!(clipped, shifted);
        assert!(unit().contains_aabb(&Aabb::new(Vec3A::splat(0.25), Vec3A::ONE)));
        assert!(!unit().contains_aabb(&shifted));
        assert!(unit().contains_point(Vec3A::splat(0.5)));
        assert!(!unit().contains_point(Vec3A::splat(1.5)));
    }

    #[test]
    fn measures() {
        let aabb = Aabb::new(Vec3A::ZERO, vec3a(1.0, 2.0, 3.0));
        assert_eq!(aabb.diagonal(), vec3a(1.0, 2.0, 3.0));
        assert_eq!(aabb.center(), vec3a(0.5, 1.0, 1.5));
        assert_eq!(aabb.half_area(), 11.0);
        assert_eq!(aabb.surface_area(), 22.0);
        assert_eq!(aabb.volume(), 6.0);
        assert_eq!(aabb.largest_axis(), 2);
        assert_eq!(aabb.largest_extent(), 3.0);
        assert_eq!(Aabb::new(Vec3A::ZERO, vec3a(2.0, 2.0, 1.0)).largest_axis(), 0);
    }

    #[test]
    fn ray_entry() {
        let ray = Ray::new(Vec3A::splat(-1.0), Vec3A::ONE, 0.0, f32::MAX);
        assert_eq!(unit().intersect_ray(&ray), 1.0);
        let behind = Ray::new(Vec3A::splat(2.0), Vec3A::ONE, 0.0, f32::MAX);
        assert_eq!(unit().intersect_ray(&behind), f32::INFINITY);
        let short = Ray::new(Vec3A::splat(-1.0), Vec3A::ONE, 0.0, 0.5);
        assert_eq!(unit().intersect_ray(&short), f32::INFINITY);
        let inside = Ray::new_inf(Vec3A::splat(0.5), Vec3A::X);
        assert_eq!(unit().intersect_ray(&inside), 0.0);
    }

    #[test]
    fn ray_sliding_along_a_face() {
        let aabb = Aabb::new(Vec3A::splat(-0.5), Vec3A::splat(0.5));
        for origin in [vec3a(-5.0, 0.5, 0.0), vec3a(-5.0, -0.5, 0.5), vec3a(-5.0, 0.5, -0.5)] {
            let ray = Ray::new_inf(origin, Vec3A::X);
            assert_eq!(aabb.ray_interval(&ray), (4.5, 5.5), "{origin}");
            assert_eq!(aabb.intersect_ray(&ray), 4.5);
        }
        let negative_zero = Ray::new_inf(vec3a(5.0, 0.5, 0.0), vec3a(-1.0, -0.0, 0.0));
        assert_eq!(aabb.intersect_ray(&negative_zero), 4.5);
        let above = Ray::new_inf(vec3a(-5.0, 0.6, 0.0), Vec3A::X);
        assert_eq!(aabb.intersect_ray(&above), f32::INFINITY);
    }
}
