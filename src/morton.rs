//! Morton codes for points inside a bounding box, and sorting primitives along the Morton curve.

// http://www.graphics.stanford.edu/~seander/bithacks.html#InterleaveBMN

use glam::{DVec3, UVec3, Vec3A};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{aabb::Aabb, radix_sort::sort_by_key};

//---------------------------------------------------
// --- 21 bit resolution per channel morton curve ---
//---------------------------------------------------

#[inline]
pub fn split_by_3_u64(a: u32) -> u64 {
    let mut x = a as u64 & 0x1fffff; // we only look at the first 21 bits
    x = (x | x << 32) & 0x1f00000000ffff;
    x = (x | x << 16) & 0x1f0000ff0000ff;
    x = (x | x << 8) & 0x100f00f00f00f00f;
    x = (x | x << 4) & 0x10c30c30c30c30c3;
    x = (x | x << 2) & 0x1249249249249249;
    x
}

#[inline]
/// Interleave the low 21 bits of x, y and z. x lands in the least significant bit.
pub fn morton_encode_u64(x: u32, y: u32, z: u32) -> u64 {
    split_by_3_u64(x) | split_by_3_u64(y) << 1 | split_by_3_u64(z) << 2
}

/// Maps points of a bounding box onto a `grid_dim`³ grid and Morton encodes the cell.
#[derive(Clone, Copy, Debug)]
pub struct MortonEncoder {
    scale: DVec3,
    offset: DVec3,
    max_cell: f64,
}

impl MortonEncoder {
    /// The finest grid a 64 bit code can address.
    pub const MAX_GRID_DIM: u32 = 1 << 21;

    pub fn new(bbox: &Aabb, grid_dim: u32) -> Self {
        assert!(
            grid_dim > 0 && grid_dim <= Self::MAX_GRID_DIM,
            "Morton grid dimension must be in 1..={}, got {grid_dim}",
            Self::MAX_GRID_DIM
        );
        let extent = bbox.diagonal().as_dvec3();
        let dim = grid_dim as f64;
        // Flat axes map everything to cell 0.
        let scale = DVec3::new(
            if extent.x > 0.0 { dim / extent.x } else { 0.0 },
            if extent.y > 0.0 { dim / extent.y } else { 0.0 },
            if extent.z > 0.0 { dim / extent.z } else { 0.0 },
        );
        Self {
            scale,
            offset: -bbox.min.as_dvec3() * scale,
            max_cell: dim - 1.0,
        }
    }

    /// Cell of `point`. Points outside the box are clamped to the border cells.
    #[inline(always)]
    pub fn grid_position(&self, point: Vec3A) -> UVec3 {
        let p = (point.as_dvec3() * self.scale + self.offset).clamp(DVec3::ZERO, DVec3::splat(self.max_cell));
        p.as_uvec3()
    }

    #[inline(always)]
    pub fn encode(&self, point: Vec3A) -> u64 {
        let p = self.grid_position(point);
        morton_encode_u64(p.x, p.y, p.z)
    }
}

/// Primitive indices ordered along the Morton curve of `global_bbox`, and their sorted codes.
pub fn sort_primitives_by_morton_code(global_bbox: &Aabb, centers: &[Vec3A]) -> (Vec<u32>, Vec<u64>) {
    crate::scope!("sort_primitives_by_morton_code");
    let encoder = MortonEncoder::new(global_bbox, MortonEncoder::MAX_GRID_DIM);

    #[cfg(feature = "parallel")]
    let mut codes: Vec<u64> = centers.par_iter().map(|c| encoder.encode(*c)).collect();
    #[cfg(not(feature = "parallel"))]
    let mut codes: Vec<u64> = centers.iter().map(|c| encoder.encode(*c)).collect();

    let mut indices: Vec<u32> = (0..centers.len() as u32).collect();
    sort_by_key(&mut codes, &mut indices);
    (indices, codes)
}
