//! What the builders and the traverser need to know about the things stored in a BVH.

use glam::Vec3A;

use crate::{aabb::Aabb, ray::Ray};

/// Result of a successful ray/primitive intersection.
pub trait Intersection: Copy {
    /// Distance along the ray to the hit.
    fn distance(&self) -> f32;
}

impl Intersection for f32 {
    #[inline(always)]
    fn distance(&self) -> f32 {
        *self
    }
}

/// A primitive that can be stored in and traced against a BVH.
pub trait Primitive: Send + Sync {
    type Intersection: Intersection;

    fn bounding_box(&self) -> Aabb;
    fn center(&self) -> Vec3A;
    fn area(&self) -> f32;
    /// Returns a hit only if its distance is within `ray.tmin..=ray.tmax`.
    fn intersect(&self, ray: &Ray) -> Option<Self::Intersection>;
}

/// A primitive that can be clipped by an axis aligned plane. Required by the spatial split builder.
pub trait SplittablePrimitive: Primitive {
    /// Bounding boxes of the parts of the primitive on each side of the plane `p[axis] == position`.
    /// A side the primitive doesn't reach gets an empty (invalid) box.
    fn split(&self, axis: usize, position: f32) -> (Aabb, Aabb);
}

impl Primitive for Aabb {
    type Intersection = f32;

    #[inline(always)]
    fn bounding_box(&self) -> Aabb {
        *self
    }

    #[inline(always)]
    fn center(&self) -> Vec3A {
        Aabb::center(self)
    }

    #[inline(always)]
    fn area(&self) -> f32 {
        self.surface_area()
    }

    /// Hits at the point where the ray enters the box.
    #[inline(always)]
    fn intersect(&self, ray: &Ray) -> Option<f32> {
        let (entry, exit) = self.ray_interval(ray);
        let entry = entry.max(ray.tmin);
        (entry <= exit.min(ray.tmax)).then_some(entry)
    }
}

impl SplittablePrimitive for Aabb {
    fn split(&self, axis: usize, position: f32) -> (Aabb, Aabb) {
        let mut left = *self;
        let mut right = *self;
        left.max[axis] = left.max[axis].min(position);
        right.min[axis] = right.min[axis].max(position);
        (
            if left.valid() { left } else { Aabb::empty() },
            if right.valid() { right } else { Aabb::empty() },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aabb_hit_at_entry() {
        let aabb = Aabb::new(Vec3A::splat(-0.5), Vec3A::splat(0.5));
        let ray = Ray::new_inf(Vec3A::new(-5.0, 0.0, 0.0), Vec3A::X);
        assert_eq!(Primitive::intersect(&aabb, &ray), Some(4.5));

        let inside = Ray::new_inf(Vec3A::ZERO, Vec3A::X);
        assert_eq!(Primitive::intersect(&aabb, &inside), Some(0.0));

        let short = Ray::new(Vec3A::new(-5.0, 0.0, 0.0), Vec3A::X, 0.0, 4.0);
        assert_eq!(Primitive::intersect(&aabb, &short), None);

        let away = Ray::new_inf(Vec3A::new(-5.0, 0.0, 0.0), -Vec3A::X);
        assert_eq!(Primitive::intersect(&aabb, &away), None);
    }

    #[test]
    fn aabb_hit_along_a_face() {
        // Zero direction components with the origin on a slab plane.
        let aabb = Aabb::new(Vec3A::splat(-0.5), Vec3A::splat(0.5));
        let on_top = Ray::new_inf(Vec3A::new(-5.0, 0.5, 0.0), Vec3A::X);
        assert_eq!(Primitive::intersect(&aabb, &on_top), Some(4.5));
        let on_edge = Ray::new_inf(Vec3A::new(0.5, -0.5, -5.0), Vec3A::Z);
        assert_eq!(Primitive::intersect(&aabb, &on_edge), Some(4.5));
    }

    #[test]
    fn aabb_split() {
        let aabb = Aabb::new(Vec3A::ZERO, Vec3A::ONE);
        let (l, r) = aabb.split(1, 0.25);
        assert_eq!(l, Aabb::new(Vec3A::ZERO, Vec3A::new(1.0, 0.25, 1.0)));
        assert_eq!(r, Aabb::new(Vec3A::new(0.0, 0.25, 0.0), Vec3A::ONE));

        let (l, r) = aabb.split(0, 2.0);
        assert_eq!(l, aabb);
        assert!(!r.valid());
    }
}
