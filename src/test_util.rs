//! Deterministic scenes, rays and noise for tests, doc examples and benchmarking.

pub mod sampling {
    use std::f32::consts::TAU;

    use glam::*;

    #[inline(always)]
    pub fn uhash(x: u32) -> u32 {
        // from https://nullprogram.com/blog/2018/07/31/
        let mut x = x ^ (x >> 16);
        x = x.wrapping_mul(0x7feb352d);
        x ^= x >> 15;
        x = x.wrapping_mul(0x846ca68b);
        x ^ (x >> 16)
    }

    #[inline(always)]
    pub fn uhash2(a: u32, b: u32) -> u32 {
        uhash(a.wrapping_mul(1597334673) ^ b.wrapping_mul(3812015801))
    }

    /// Maps a hash to `0.0..=1.0`.
    #[inline(always)]
    pub fn unormf(n: u32) -> f32 {
        n as f32 * (1.0 / u32::MAX as f32)
    }

    /// Value noise in `0.0..=1.0` for an integer coordinate.
    #[inline(always)]
    pub fn hash_noise(coord: UVec2, frame: u32) -> f32 {
        unormf(uhash2(coord.x, (coord.y << 11).wrapping_add(frame)))
    }

    /// Two independent noise values, for the sample functions below.
    #[inline(always)]
    pub fn hash_noise2(index: u32, seed: u32) -> Vec2 {
        vec2(
            hash_noise(uvec2(index, 0), seed),
            hash_noise(uvec2(index, 1), seed),
        )
    }

    #[inline(always)]
    pub fn uniform_sample_sphere(urand: Vec2) -> Vec3A {
        let z = 1.0 - 2.0 * urand.x;
        let r = (1.0 - z * z).max(0.0).sqrt();
        let theta = urand.y * TAU;
        vec3a(r * theta.cos(), r * theta.sin(), z)
    }

    #[inline(always)]
    fn cubic(v0: f32, v1: f32, v2: f32, v3: f32, x: f32) -> f32 {
        let p = (v3 - v2) - (v0 - v1);
        let q = (v0 - v1) - p;
        let r = v2 - v0;
        p * x.powi(3) + q * x.powi(2) + r * x + v1
    }

    /// Smooth noise over the plane, interpolating [`hash_noise`] on the integer grid.
    pub fn bicubic_noise(coord: Vec2, seed: u32) -> f32 {
        let ix = coord.x.floor() as u32;
        let iy = coord.y.floor() as u32;
        let fx = coord.x - ix as f32;
        let fy = coord.y - iy as f32;
        let row = |j: u32| {
            cubic(
                hash_noise(uvec2(ix, iy + j), seed),
                hash_noise(uvec2(ix + 1, iy + j), seed),
                hash_noise(uvec2(ix + 2, iy + j), seed),
                hash_noise(uvec2(ix + 3, iy + j), seed),
                fx,
            )
        };
        cubic(row(0), row(1), row(2), row(3), fy)
    }
}

pub mod geometry {
    use glam::*;

    use crate::{aabb::Aabb, test_util::sampling::*, triangle::Triangle};

    #[inline(always)]
    const fn vec(a: f32, b: f32, c: f32) -> Vec3A {
        Vec3A::new(a, b, c)
    }
    #[inline(always)]
    const fn tri(v0: Vec3A, v1: Vec3A, v2: Vec3A) -> Triangle {
        Triangle { v0, v1, v2 }
    }

    /// Cube triangle mesh with side length of 2 centered at 0,0,0
    pub const CUBE: [Triangle; 12] = [
        tri(vec(-1., 1., -1.), vec(1., 1., 1.), vec(1., 1., -1.)),
        tri(vec(1., 1., 1.), vec(-1., -1., 1.), vec(1., -1., 1.)),
        tri(vec(-1., 1., 1.), vec(-1., -1., -1.), vec(-1., -1., 1.)),
        tri(vec(1., -1., -1.), vec(-1., -1., 1.), vec(-1., -1., -1.)),
        tri(vec(1., 1., -1.), vec(1., -1., 1.), vec(1., -1., -1.)),
        tri(vec(-1., 1., -1.), vec(1., -1., -1.), vec(-1., -1., -1.)),
        tri(vec(-1., 1., -1.), vec(-1., 1., 1.), vec(1., 1., 1.)),
        tri(vec(1., 1., 1.), vec(-1., 1., 1.), vec(-1., -1., 1.)),
        tri(vec(-1., 1., 1.), vec(-1., 1., -1.), vec(-1., -1., -1.)),
        tri(vec(1., -1., -1.), vec(1., -1., 1.), vec(-1., -1., 1.)),
        tri(vec(1., 1., -1.), vec(1., 1., 1.), vec(1., -1., 1.)),
        tri(vec(-1., 1., -1.), vec(1., 1., -1.), vec(1., -1., -1.)),
    ];

    /// Plane triangle mesh with side length of 2 centered at 0,0,0, facing +y.
    pub const PLANE: [Triangle; 2] = [
        tri(vec(1., 0., 1.), vec(-1., 0., -1.), vec(-1., 0., 1.)),
        tri(vec(1., 0., 1.), vec(1., 0., -1.), vec(-1., 0., -1.)),
    ];

    /// Unit icosphere. Every subdivision multiplies the 20 base triangles by 4.
    pub fn icosphere(subdivisions: u32) -> Vec<Triangle> {
        let phi = (1.0 + 5.0_f32.sqrt()) / 2.0; // golden ratio
        let (a, b, c, d, e) = (1.0, -1.0, 0.0, phi, -phi);

        #[rustfmt::skip]
        let mut p = [vec(b,d,c),vec(a,d,c),vec(b,e,c),vec(a,e,c),vec(c,b,d),vec(c,a,d),vec(c,b,e),vec(c,a,e),vec(d,c,b),vec(d,c,a),vec(e,c,b),vec(e,c,a)];
        p.iter_mut().for_each(|v| *v = v.normalize());

        #[rustfmt::skip]
        let faces: [[usize; 3]; 20] = [
            [0, 11, 5], [0, 5, 1], [0, 1, 7], [0, 7, 10], [0, 10, 11],
            [1, 5, 9], [5, 11, 4], [11, 10, 2], [10, 7, 6], [7, 1, 8],
            [3, 9, 4], [3, 4, 2], [3, 2, 6], [3, 6, 8], [3, 8, 9],
            [4, 9, 5], [2, 4, 11], [6, 2, 10], [8, 6, 7], [9, 8, 1],
        ];
        let mut tris: Vec<Triangle> = faces.iter().map(|f| tri(p[f[0]], p[f[1]], p[f[2]])).collect();

        for _ in 0..subdivisions {
            tris = tris
                .iter()
                .flat_map(|t| {
                    let mid01 = ((t.v0 + t.v1) * 0.5).normalize();
                    let mid12 = ((t.v1 + t.v2) * 0.5).normalize();
                    let mid20 = ((t.v2 + t.v0) * 0.5).normalize();
                    [
                        tri(t.v0, mid01, mid20),
                        tri(t.v1, mid12, mid01),
                        tri(t.v2, mid20, mid12),
                        tri(mid01, mid12, mid20),
                    ]
                })
                .collect();
        }

        tris
    }

    /// Triangulates a height field over `-1.0..=1.0` in x and z. `height_map` is sampled at every grid corner.
    pub fn height_to_triangles<F>(height_map: F, x_resolution: usize, z_resolution: usize) -> Vec<Triangle>
    where
        F: Fn(usize, usize) -> f32,
    {
        let mut triangles = Vec::with_capacity(x_resolution * z_resolution * 2);
        let corner = |x: usize, z: usize| {
            vec(
                (x as f32 / x_resolution as f32) * 2.0 - 1.0,
                height_map(x, z),
                (z as f32 / z_resolution as f32) * 2.0 - 1.0,
            )
        };
        for z in 0..z_resolution {
            for x in 0..x_resolution {
                let v00 = corner(x, z);
                let v10 = corner(x + 1, z);
                let v01 = corner(x, z + 1);
                let v11 = corner(x + 1, z + 1);
                triangles.push(tri(v00, v01, v10));
                triangles.push(tri(v10, v01, v11));
            }
        }
        triangles
    }

    /// Noisy terrain with `2 * terrain_res²` triangles. The same seed always gives the same scene.
    pub fn demoscene(terrain_res: usize, seed: u32) -> Vec<Triangle> {
        let height_map = |x: usize, y: usize| -> f32 {
            let coord = vec2(x as f32, y as f32) / terrain_res as f32;
            let (mut cs, mut ns) = (1.579, 0.579);
            (1..17)
                .map(|i| {
                    (cs, ns) = (cs * 1.579, ns * -0.579);
                    bicubic_noise(coord * cs, seed + i) * ns
                })
                .sum::<f32>()
                * (1.0 - coord.y).powf(0.579)
                + (1.0 - coord.y).powf(1.579) * 0.579
        };
        height_to_triangles(height_map, terrain_res, terrain_res)
    }

    /// `count` boxes of varying size scattered through the cube `-extent..=extent`.
    pub fn scattered_boxes(count: usize, extent: f32, seed: u32) -> Vec<Aabb> {
        (0..count as u32)
            .map(|i| {
                let n = |axis: u32| hash_noise(uvec2(i, axis), seed);
                let center = vec3a(n(0), n(1), n(2)) * (2.0 * extent) - extent;
                let half_size = vec3a(n(3), n(4), n(5)) * (extent * 0.05) + extent * 0.001;
                Aabb::new(center - half_size, center + half_size)
            })
            .collect()
    }
}

pub mod rays {
    use glam::*;

    use crate::{aabb::Aabb, primitive::Primitive, ray::Ray, test_util::sampling::*};

    /// Rays starting on a sphere around `bbox`, each aimed at a point inside it.
    pub fn rays_through(bbox: &Aabb, count: usize, seed: u32) -> Vec<Ray> {
        let center = bbox.center();
        let radius = bbox.diagonal().length().max(1e-3);
        (0..count as u32)
            .map(|i| {
                let origin = center + uniform_sample_sphere(hash_noise2(i, seed)) * radius;
                let t = vec3a(
                    hash_noise(uvec2(i, 2), seed),
                    hash_noise(uvec2(i, 3), seed),
                    hash_noise(uvec2(i, 4), seed),
                );
                let target = bbox.min + (bbox.max - bbox.min) * t;
                Ray::new_inf(origin, (target - origin).normalize_or(Vec3A::X))
            })
            .collect()
    }

    /// Closest hit by testing every primitive. Returns the primitive index and distance.
    pub fn brute_force_closest<P: Primitive>(primitives: &[P], ray: &Ray) -> Option<(u32, f32)> {
        use crate::primitive::Intersection;
        let mut ray = *ray;
        let mut closest = None;
        for (i, primitive) in primitives.iter().enumerate() {
            if let Some(hit) = primitive.intersect(&ray) {
                ray.tmax = hit.distance();
                closest = Some((i as u32, hit.distance()));
            }
        }
        closest
    }
}

#[cfg(test)]
mod tests {
    use super::{geometry::*, rays::*, sampling::*};
    use glam::*;

    #[test]
    fn noise_is_deterministic_and_normalized() {
        for i in 0..100 {
            let a = hash_noise(uvec2(i, 7), 3);
            assert_eq!(a, hash_noise(uvec2(i, 7), 3));
            assert!((0.0..=1.0).contains(&a));
        }
        assert_ne!(hash_noise(uvec2(1, 2), 0), hash_noise(uvec2(1, 2), 1));
    }

    #[test]
    fn scene_sizes() {
        assert_eq!(icosphere(0).len(), 20);
        assert_eq!(icosphere(2).len(), 320);
        assert_eq!(demoscene(8, 0).len(), 128);
        assert_eq!(scattered_boxes(50, 10.0, 1).len(), 50);
    }

    #[test]
    fn rays_hit_the_box() {
        let bbox = crate::aabb::Aabb::new(Vec3A::splat(-1.0), Vec3A::splat(2.0));
        for ray in rays_through(&bbox, 64, 9) {
            assert!(bbox.intersect_ray(&ray) < f32::INFINITY);
        }
        let hit = brute_force_closest(&[bbox], &rays_through(&bbox, 1, 0)[0]);
        assert_eq!(hit.map(|h| h.0), Some(0));
    }
}
