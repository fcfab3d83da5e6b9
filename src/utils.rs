//! Small numeric helpers shared by builders, optimizers and traversal.

use glam::Vec3A;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{aabb::Aabb, primitive::Primitive};

/// Minimum that returns `b` if `a` is NaN. Useful when `b` is known to be finite.
#[inline(always)]
pub fn robust_min(a: f32, b: f32) -> f32 {
    if a < b { a } else { b }
}

/// Maximum that returns `b` if `a` is NaN. Useful when `b` is known to be finite.
#[inline(always)]
pub fn robust_max(a: f32, b: f32) -> f32 {
    if a > b { a } else { b }
}

/// Moves `x` away from zero by `ulps` units in the last place. Finite values saturate at `±f32::MAX`,
/// infinities and NaN are returned unchanged.
#[inline(always)]
pub fn add_ulp_magnitude(x: f32, ulps: u32) -> f32 {
    if !x.is_finite() {
        return x;
    }
    let sign = x.to_bits() & 0x8000_0000;
    let magnitude = (x.to_bits() & 0x7FFF_FFFF).saturating_add(ulps).min(f32::MAX.to_bits());
    f32::from_bits(sign | magnitude)
}

/// Reciprocal that clamps values within epsilon of zero to epsilon (keeping the sign),
/// so the result is always finite.
#[inline(always)]
pub fn safe_inverse(x: f32) -> f32 {
    if x.abs() <= f32::EPSILON {
        1.0 / f32::EPSILON.copysign(x)
    } else {
        1.0 / x
    }
}

#[inline(always)]
pub fn safe_inverse_vec(v: Vec3A) -> Vec3A {
    Vec3A::new(safe_inverse(v.x), safe_inverse(v.y), safe_inverse(v.z))
}

/// Maps a float to a u32 that sorts the same way as the float, negative values included.
#[inline(always)]
pub fn float_to_ordered_u32(x: f32) -> u32 {
    let bits = x.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

/// Inverse of [`float_to_ordered_u32`].
#[inline(always)]
pub fn ordered_u32_to_float(x: u32) -> f32 {
    if x & 0x8000_0000 != 0 {
        f32::from_bits(x & 0x7FFF_FFFF)
    } else {
        f32::from_bits(!x)
    }
}

/// Per primitive bounding boxes and centers, computed in parallel.
pub fn compute_bounding_boxes_and_centers<P: Primitive>(primitives: &[P]) -> (Vec<Aabb>, Vec<Vec3A>) {
    crate::scope!("compute_bounding_boxes_and_centers");
    #[cfg(feature = "parallel")]
    let iter = primitives.par_iter();
    #[cfg(not(feature = "parallel"))]
    let iter = primitives.iter();
    iter.map(|p| (p.bounding_box(), p.center())).unzip()
}

/// Union of all the given boxes. Empty input gives [`Aabb::empty`].
pub fn compute_global_bounding_box(bboxes: &[Aabb]) -> Aabb {
    crate::scope!("compute_global_bounding_box");
    #[cfg(feature = "parallel")]
    {
        bboxes
            .par_iter()
            .fold(Aabb::empty, |acc, b| acc.union(b))
            .reduce(Aabb::empty, |a, b| a.union(&b))
    }
    #[cfg(not(feature = "parallel"))]
    {
        bboxes.iter().fold(Aabb::empty(), |acc, b| acc.union(b))
    }
}
