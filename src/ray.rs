//! A ray in 3D space.

use glam::Vec3A;

use crate::utils::safe_inverse_vec;

/// A struct representing a ray in 3D space.
/// `tmin..=tmax` is the range of valid hit distances. Closest hit traversal shrinks `tmax` as it finds hits.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Ray {
    /// The starting point of the ray.
    pub origin: Vec3A,
    /// The direction vector of the ray.
    pub direction: Vec3A,
    /// The inverse of the direction vector components, computed with [`crate::utils::safe_inverse`].
    pub inv_direction: Vec3A,
    /// The minimum `t` (distance) value for intersection tests.
    pub tmin: f32,
    /// The maximum `t` (distance) value for intersection tests.
    pub tmax: f32,
}

impl Ray {
    /// Creates a new `Ray` with the given origin, direction, and `t` (distance) range.
    pub fn new(origin: Vec3A, direction: Vec3A, min: f32, max: f32) -> Self {
        let ray = Ray {
            origin,
            direction,
            inv_direction: safe_inverse_vec(direction),
            tmin: min,
            tmax: max,
        };

        debug_assert!(ray.inv_direction.is_finite());
        debug_assert!(ray.direction.is_finite());
        debug_assert!(origin.is_finite());

        ray
    }

    /// Creates a new infinite `Ray` with the given origin, direction.
    pub fn new_inf(origin: Vec3A, direction: Vec3A) -> Self {
        Self::new(origin, direction, 0.0, f32::INFINITY)
    }

    /// The point at distance `t` along the ray.
    #[inline(always)]
    pub fn at(&self, t: f32) -> Vec3A {
        self.direction.mul_add(Vec3A::splat(t), self.origin)
    }

    /// Per axis sign of the direction. Bit `i` is set when axis `i` points towards negative infinity.
    #[inline(always)]
    pub fn octant(&self) -> u32 {
        (self.direction.x.is_sign_negative() as u32)
            | ((self.direction.y.is_sign_negative() as u32) << 1)
            | ((self.direction.z.is_sign_negative() as u32) << 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octant_bits() {
        let ray = Ray::new_inf(Vec3A::ZERO, Vec3A::new(1.0, -1.0, -0.0));
        assert_eq!(ray.octant(), 0b110);
        assert_eq!(ray.at(2.0), Vec3A::new(2.0, -2.0, -0.0));
    }
}
