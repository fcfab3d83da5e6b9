//! Triangle representation in 3D space.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3A};

use crate::{
    aabb::Aabb,
    primitive::{Intersection, Primitive, SplittablePrimitive},
    ray::Ray,
};

#[derive(Clone, Copy, Default, Debug)]
pub struct Triangle {
    pub v0: Vec3A,
    pub v1: Vec3A,
    pub v2: Vec3A,
}

unsafe impl Pod for Triangle {}
unsafe impl Zeroable for Triangle {}

/// Distance and barycentric coordinates of a ray/triangle hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriangleHit {
    pub t: f32,
    pub u: f32,
    pub v: f32,
}

impl Intersection for TriangleHit {
    #[inline(always)]
    fn distance(&self) -> f32 {
        self.t
    }
}

impl Triangle {
    #[inline(always)]
    pub fn new(v0: Vec3A, v1: Vec3A, v2: Vec3A) -> Self {
        Self { v0, v1, v2 }
    }

    /// Compute the bounding box of the triangle.
    #[inline(always)]
    pub fn aabb(&self) -> Aabb {
        Aabb::from_points(&[self.v0, self.v1, self.v2])
    }

    pub fn transform(&mut self, matrix: &Mat4) {
        self.v0 = matrix.transform_point3a(self.v0);
        self.v1 = matrix.transform_point3a(self.v1);
        self.v2 = matrix.transform_point3a(self.v2);
    }

    /// Intersect the `Ray` with this Triangle. Hits outside `ray.tmin..=ray.tmax` are misses.
    // Based on Fast Minimum Storage Ray Triangle Intersection by T. Möller and B. Trumbore
    // https://madmann91.github.io/2021/04/29/an-introduction-to-bvhs.html
    #[inline(always)]
    pub fn intersect(&self, ray: &Ray) -> Option<TriangleHit> {
        let e1 = self.v0 - self.v1;
        let e2 = self.v2 - self.v0;
        let n = e1.cross(e2);

        let c = self.v0 - ray.origin;
        let r = ray.direction.cross(c);
        let inv_det = 1.0 / n.dot(ray.direction);

        let u = r.dot(e2) * inv_det;
        let v = r.dot(e1) * inv_det;
        let w = 1.0 - u - v;

        // Note: differs in that if v == -0.0, for example will cause valid to be false
        let hit = u.to_bits() | v.to_bits() | w.to_bits();
        let valid = inv_det != 0.0 && inv_det.is_finite() && hit & 0x8000_0000 == 0;

        if valid {
            let t = n.dot(c) * inv_det;
            if t >= ray.tmin && t <= ray.tmax {
                return Some(TriangleHit { t, u, v });
            }
        }

        None
    }
}

impl Primitive for Triangle {
    type Intersection = TriangleHit;

    #[inline(always)]
    fn bounding_box(&self) -> Aabb {
        self.aabb()
    }

    #[inline(always)]
    fn center(&self) -> Vec3A {
        (self.v0 + self.v1 + self.v2) * (1.0 / 3.0)
    }

    #[inline(always)]
    fn area(&self) -> f32 {
        (self.v1 - self.v0).cross(self.v2 - self.v0).length() * 0.5
    }

    #[inline(always)]
    fn intersect(&self, ray: &Ray) -> Option<TriangleHit> {
        Triangle::intersect(self, ray)
    }
}

impl SplittablePrimitive for Triangle {
    fn split(&self, axis: usize, position: f32) -> (Aabb, Aabb) {
        split_triangle(axis, position, [self.v0, self.v1, self.v2, self.v0])
    }
}

/// Clips the closed polygon `v` (last vertex repeating the first) against the plane `p[dim] == pos`
/// and returns the bounds of each side.
/// Based on <https://github.com/embree/embree/blob/be0accfd0b246e2b03355b8ee7710a22c1b49240/kernels/builders/splitter.h#L17C1-L49C6>,
/// but with the "current bounds" moved out.
pub fn split_triangle(dim: usize, pos: f32, v: [Vec3A; 4]) -> (Aabb, Aabb) {
    let mut left = Aabb::EMPTY;
    let mut right = Aabb::EMPTY;

    // Clip triangle to left and right box by processing all edges
    for i in 0..3 {
        let v0 = v[i];
        let v1 = v[i + 1];
        let v0d = v0[dim];
        let v1d = v1[dim];

        if v0d <= pos {
            left.extend(v0);
        }
        if v0d >= pos {
            right.extend(v0);
        }

        // The edge crosses the splitting location
        if (v0d < pos && pos < v1d) || (v1d < pos && pos < v0d) {
            debug_assert!((v1d - v0d) != 0.0);
            let inv_length = 1.0 / (v1d - v0d);
            let c = Vec3A::mul_add(Vec3A::splat((pos - v0d) * inv_length), v1 - v0, v0);
            left.extend(c);
            right.extend(c);
        }
    }

    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri() -> Triangle {
        Triangle::new(
            Vec3A::new(-1.0, -1.0, 0.0),
            Vec3A::new(1.0, -1.0, 0.0),
            Vec3A::new(0.0, 1.0, 0.0),
        )
    }

    #[test]
    fn intersect_front_and_back() {
        let t = tri();
        let hit = t
            .intersect(&Ray::new_inf(Vec3A::new(0.0, 0.0, 2.0), -Vec3A::Z))
            .unwrap();
        assert!((hit.t - 2.0).abs() < 1e-6);
        assert!(hit.u >= 0.0 && hit.v >= 0.0 && hit.u + hit.v <= 1.0);
        assert!(t
            .intersect(&Ray::new_inf(Vec3A::new(0.0, 0.0, -2.0), Vec3A::Z))
            .is_some());
        assert!(t
            .intersect(&Ray::new_inf(Vec3A::new(5.0, 0.0, 2.0), -Vec3A::Z))
            .is_none());
        assert!(t
            .intersect(&Ray::new(Vec3A::new(0.0, 0.0, 2.0), -Vec3A::Z, 0.0, 1.0))
            .is_none());
    }

    #[test]
    fn split_on_axis() {
        let t = tri();
        let (l, r) = t.split(0, 0.0);
        assert_eq!(l.min.x, -1.0);
        assert_eq!(l.max.x, 0.0);
        assert_eq!(r.min.x, 0.0);
        assert_eq!(r.max.x, 1.0);
        assert!(t.aabb().contains_aabb(&l));
        assert!(t.aabb().contains_aabb(&r));

        // A plane outside the triangle leaves one side empty.
        let (l, r) = t.split(1, 5.0);
        assert_eq!(l, t.aabb());
        assert!(!r.valid());
    }

    #[test]
    fn area_and_center() {
        let t = tri();
        assert_eq!(t.area(), 2.0);
        assert!((t.center() - Vec3A::new(0.0, -1.0 / 3.0, 0.0)).length() < 1e-6);
    }
}
