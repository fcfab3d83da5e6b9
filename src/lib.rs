#![allow(clippy::needless_range_loop)]

//! # Parallel BVH Construction, Optimization and Traversal
//!
//! - Top-down builders: binned SAH, full-sweep SAH and [spatial split](https://www.nvidia.in/docs/IO/77714/sbvh.pdf) SAH.
//! - Bottom-up builders: a linear (Morton order) builder and [PLOC](https://meistdan.github.io/publications/ploc/paper.pdf).
//! - Optimizers: [parallel reinsertion](https://meistdan.github.io/publications/prbvh/paper.pdf), leaf collapsing, node layout and refitting.
//! - Single ray traversal with robust or fast node intersection, closest or any hit queries and optional statistics.
//!
//! Building and optimizing is parallelized with [rayon](https://github.com/rayon-rs/rayon) behind the `parallel`
//! feature (enabled by default). Without it every algorithm runs serially and produces the same trees.
//!
//! ## Example
//!
//! ```
//! use glam::*;
//! use parbvh::{
//!     bvh2::{
//!         builder::build_bvh2,
//!         traverse::{
//!             ClosestPrimitiveIntersector, FastNodeIntersector, NoStatistics, SingleRayTraverser,
//!         },
//!     },
//!     primitive::Intersection,
//!     ray::Ray,
//!     test_util::geometry::{icosphere, PLANE},
//!     triangle::Triangle,
//!     BvhBuildParams,
//! };
//! use std::time::Duration;
//!
//! // Build a scene with an icosphere and a plane
//! let mut tris: Vec<Triangle> = Vec::new();
//! tris.extend(icosphere(1));
//! tris.extend(PLANE);
//!
//! let bvh = build_bvh2(&tris, BvhBuildParams::medium_build(), &mut Duration::default());
//!
//! let ray = Ray::new_inf(vec3a(0.1, 0.1, 4.0), vec3a(0.0, 0.0, -1.0));
//!
//! // Traverse the BVH, finding the closest hit.
//! let traverser = SingleRayTraverser::<FastNodeIntersector>::new(&bvh);
//! let mut intersector = ClosestPrimitiveIntersector::new(&bvh, &tris);
//! if let Some(hit) = traverser.traverse(ray, &mut intersector, &mut NoStatistics) {
//!     // The hit reports the index into `tris`, not the bvh slot.
//!     println!("Hit Triangle {}", hit.primitive_index);
//!     println!("Distance to hit: {}", hit.distance());
//! } else {
//!     println!("Miss");
//! }
//! ```

use std::time::Duration;

use ploc::PlocSearchDistance;

pub mod aabb;
pub mod bvh2;
mod cluster;
pub mod lbvh;
pub mod morton;
pub mod parallel;
pub mod ploc;
pub mod primitive;
pub mod radix_sort;
pub mod ray;
pub mod test_util;
pub mod top_down;
pub mod triangle;
pub mod utils;

/// Marker for "no index", used as the parent of the root.
pub const INVALID: u32 = u32::MAX;

/// A macro to measure and print the execution time of a block of code.
///
/// # Arguments
/// * `$label` - A string label to identify the code block being timed.
/// * `$($code:tt)*` - The code block whose execution time is to be measured.
///
/// # Usage
/// ```rust
/// use parbvh::timeit;
/// timeit!["example",
///     // code to measure
/// ];
/// ```
///
/// # Note
/// The macro purposefully doesn't include a scope so variables don't need to
/// be passed out of it. This allows it to be trivially added to existing code.
///
/// This macro only measures time when the `timeit` feature is enabled.
#[macro_export]
#[doc(hidden)]
macro_rules! timeit {
    [$label:expr, $($code:tt)*] => {
        #[cfg(feature = "timeit")]
        let timeit_start = std::time::Instant::now();
        $($code)*
        #[cfg(feature = "timeit")]
        println!("{:>8} {}", format!("{}", $crate::PrettyDuration(timeit_start.elapsed())), $label);
    };
}

/// A wrapper struct for `std::time::Duration` to provide pretty-printing of durations.
#[doc(hidden)]
pub struct PrettyDuration(pub Duration);

impl std::fmt::Display for PrettyDuration {
    /// Seconds and milliseconds are printed with two decimal places, anything shorter in whole microseconds.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let duration = self.0;
        if duration.as_secs() > 0 {
            let seconds =
                duration.as_secs() as f64 + f64::from(duration.subsec_nanos()) / 1_000_000_000.0;
            write!(f, "{seconds:.2}s ")
        } else if duration.subsec_millis() > 0 {
            let milliseconds =
                duration.as_millis() as f64 + f64::from(duration.subsec_micros() % 1_000) / 1_000.0;
            write!(f, "{milliseconds:.2}ms")
        } else {
            let microseconds = duration.as_micros();
            write!(f, "{microseconds}µs")
        }
    }
}

/// Add profile scope. Nesting the macro allows us to make the profiling crate optional.
#[doc(hidden)]
#[macro_export]
macro_rules! scope {
    [$label:expr] => {
        #[cfg(feature = "profile")]
        profiling::scope!($label);
    };
}

/// Which construction algorithm [`bvh2::builder::build_bvh2`] runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuilderKind {
    /// Top-down, SAH evaluated on a fixed number of bins per axis.
    BinnedSah,
    /// Top-down, exact SAH from presorted references.
    SweepSah,
    /// Top-down, sweep SAH plus spatial splits that may duplicate primitives.
    /// Only available for primitives that can be split, other primitives fall back to [`BuilderKind::SweepSah`].
    SpatialSplit,
    /// Bottom-up merging of Morton sorted primitives.
    Linear,
    /// Bottom-up locally ordered clustering.
    Ploc,
}

/// General build parameters for the [`bvh2::builder`] pipeline.
#[derive(Clone, Copy, Debug)]
pub struct BvhBuildParams {
    pub builder: BuilderKind,
    /// In ploc, the number of nodes before and after the current one that are evaluated for pairing.
    pub ploc_search_distance: PlocSearchDistance,
    /// Leaf size limit used by top-down builders when falling back to a median split.
    pub max_leaf_size: usize,
    /// First stride of the reinsertion optimizer. 0 disables reinsertion.
    pub reinsertion_stride: usize,
    /// Merge leaves when the SAH says so. Collapsing never creates leaves larger than `max_prims_per_leaf`.
    pub collapse: bool,
    pub max_prims_per_leaf: u32,
    /// Multiplier for traversal cost calculation during collapse. A higher value will
    /// result in more primitives per leaf.
    pub collapse_traversal_cost: f32,
    /// Reorder sibling pairs by area after everything else ran.
    pub optimize_layout: bool,
}

impl BvhBuildParams {
    pub const fn fastest_build() -> Self {
        BvhBuildParams {
            builder: BuilderKind::Linear,
            ploc_search_distance: PlocSearchDistance::Minimum,
            max_leaf_size: 16,
            reinsertion_stride: 0,
            collapse: false,
            max_prims_per_leaf: 1,
            collapse_traversal_cost: 1.0,
            optimize_layout: false,
        }
    }
    pub const fn fast_build() -> Self {
        BvhBuildParams {
            builder: BuilderKind::BinnedSah,
            ploc_search_distance: PlocSearchDistance::Low,
            max_leaf_size: 16,
            reinsertion_stride: 0,
            collapse: false,
            max_prims_per_leaf: 8,
            collapse_traversal_cost: 1.0,
            optimize_layout: true,
        }
    }
    /// Bottom-up clustering followed by a bit of reinsertion and leaf collapsing.
    pub const fn medium_build() -> Self {
        BvhBuildParams {
            builder: BuilderKind::Ploc,
            ploc_search_distance: PlocSearchDistance::Medium,
            max_leaf_size: 16,
            reinsertion_stride: 3,
            collapse: true,
            max_prims_per_leaf: 8,
            collapse_traversal_cost: 1.0,
            optimize_layout: true,
        }
    }
    pub const fn slow_build() -> Self {
        BvhBuildParams {
            builder: BuilderKind::SweepSah,
            ploc_search_distance: PlocSearchDistance::Medium,
            max_leaf_size: 16,
            reinsertion_stride: 9,
            collapse: true,
            max_prims_per_leaf: 8,
            collapse_traversal_cost: 1.0,
            optimize_layout: true,
        }
    }
    pub const fn very_slow_build() -> Self {
        BvhBuildParams {
            builder: BuilderKind::SpatialSplit,
            ploc_search_distance: PlocSearchDistance::High,
            max_leaf_size: 16,
            reinsertion_stride: 9,
            collapse: true,
            max_prims_per_leaf: 8,
            collapse_traversal_cost: 1.0,
            optimize_layout: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_duration_units() {
        assert_eq!(PrettyDuration(Duration::from_millis(2500)).to_string(), "2.50s ");
        assert_eq!(PrettyDuration(Duration::from_micros(1250)).to_string(), "1.25ms");
        assert_eq!(PrettyDuration(Duration::from_micros(42)).to_string(), "42µs");
    }

    #[test]
    fn timeit_keeps_bindings_visible() {
        timeit!["sum", let total: u32 = (1..=4).sum();];
        assert_eq!(total, 10);
    }
}
