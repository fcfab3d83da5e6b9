use std::time::{Duration, Instant};

use glam::Vec3A;

use crate::{
    aabb::Aabb,
    lbvh::LinearBuilder,
    ploc::PlocBuilder,
    primitive::{Primitive, SplittablePrimitive},
    top_down::{
        binned_sah::BinnedSahBuilder,
        spatial_split::{repair_bvh_leaves, SpatialSplitBuilder},
        sweep_sah::SweepSahBuilder,
        TopDownConfig,
    },
    utils::{compute_bounding_boxes_and_centers, compute_global_bounding_box},
    BuilderKind, BvhBuildParams,
};

use super::{
    layout::NodeLayoutOptimizer, leaf_collapser::LeafCollapser, reinsertion::ReinsertionOptimizer,
    Bvh2,
};

/// Build a bvh2 from the given list of primitives.
/// Just a helper function / example, feel free to reimplement for your specific use case.
///
/// [`BuilderKind::SpatialSplit`] needs primitives that can be split, see [`build_bvh2_splittable`].
/// Here it falls back to [`BuilderKind::SweepSah`].
///
/// # Arguments
/// * `primitives` - A list of Primitives.
/// * `config` - Parameters for configuring the BVH building.
/// * `core_build_time` - The core BVH build time. Does not include things like initial AABB
///   generation or debug validation.
pub fn build_bvh2<P: Primitive>(
    primitives: &[P],
    config: BvhBuildParams,
    core_build_time: &mut Duration,
) -> Bvh2 {
    build_with(primitives, config, core_build_time, |_, _, _, _| None)
}

/// Same as [`build_bvh2`], with spatial splits available.
pub fn build_bvh2_splittable<P: SplittablePrimitive>(
    primitives: &[P],
    config: BvhBuildParams,
    core_build_time: &mut Duration,
) -> Bvh2 {
    build_with(
        primitives,
        config,
        core_build_time,
        |top_down, global_bbox, bboxes, centers| {
            let builder = SpatialSplitBuilder::<64> {
                config: top_down,
                ..Default::default()
            };
            Some(builder.build(global_bbox, primitives, bboxes, centers))
        },
    )
}

fn build_with<P, F>(
    primitives: &[P],
    config: BvhBuildParams,
    core_build_time: &mut Duration,
    spatial_split: F,
) -> Bvh2
where
    P: Primitive,
    F: FnOnce(TopDownConfig, &Aabb, &[Aabb], &[Vec3A]) -> Option<Bvh2>,
{
    if primitives.is_empty() {
        return Bvh2::default();
    }
    let (bboxes, centers) = compute_bounding_boxes_and_centers(primitives);
    let global_bbox = compute_global_bounding_box(&bboxes);

    let start_time = Instant::now();
    let top_down = TopDownConfig {
        max_leaf_size: config.max_leaf_size.max(1),
        ..Default::default()
    };
    let sweep = || SweepSahBuilder { config: top_down }.build(&global_bbox, &bboxes, &centers);

    let mut splits = false;
    let mut bvh2 = match config.builder {
        BuilderKind::BinnedSah => {
            BinnedSahBuilder::<16> { config: top_down }.build(&global_bbox, &bboxes, &centers)
        }
        BuilderKind::SweepSah => sweep(),
        BuilderKind::SpatialSplit => match spatial_split(top_down, &global_bbox, &bboxes, &centers) {
            Some(bvh) => {
                splits = true;
                bvh
            }
            None => {
                log::warn!("Spatial splits need splittable primitives, using the sweep SAH builder");
                sweep()
            }
        },
        BuilderKind::Linear => LinearBuilder.build(&global_bbox, &bboxes, &centers),
        BuilderKind::Ploc => PlocBuilder {
            search_distance: config.ploc_search_distance,
        }
        .build(&global_bbox, &bboxes, &centers),
    };

    if splits {
        repair_bvh_leaves(&mut bvh2);
    }
    if config.reinsertion_stride > 0 {
        ReinsertionOptimizer {
            stride: config.reinsertion_stride,
            ..Default::default()
        }
        .optimize(&mut bvh2);
    }
    if config.collapse {
        LeafCollapser {
            max_leaf_size: config.max_prims_per_leaf,
            traversal_cost: config.collapse_traversal_cost,
        }
        .collapse(&mut bvh2);
        // Merged leaves can hold two pieces of the same primitive.
        if splits {
            repair_bvh_leaves(&mut bvh2);
        }
    }
    if config.optimize_layout {
        NodeLayoutOptimizer.optimize(&mut bvh2);
    }

    *core_build_time += start_time.elapsed();
    log::debug!(
        "{:?} pipeline: {} primitives, {} nodes, cost {}",
        config.builder,
        primitives.len(),
        bvh2.nodes.len(),
        bvh2.compute_cost(1.0)
    );

    #[cfg(debug_assertions)]
    {
        bvh2.validate(primitives, splits, !splits);
    }

    bvh2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_util::geometry::demoscene, triangle::Triangle};

    fn presets() -> [BvhBuildParams; 5] {
        [
            BvhBuildParams::fastest_build(),
            BvhBuildParams::fast_build(),
            BvhBuildParams::medium_build(),
            BvhBuildParams::slow_build(),
            BvhBuildParams::very_slow_build(),
        ]
    }

    #[test]
    fn every_preset_builds() {
        let tris: Vec<Triangle> = demoscene(24, 3);
        for config in presets() {
            let mut time = Duration::default();
            let bvh = build_bvh2_splittable(&tris, config, &mut time);
            let splits = config.builder == BuilderKind::SpatialSplit;
            bvh.validate(&tris, splits, !splits);
            if config.collapse {
                for leaf in bvh.leaves() {
                    assert!(bvh.nodes[leaf as usize].prim_count <= config.max_prims_per_leaf);
                }
            }
        }
    }

    #[test]
    fn spatial_split_falls_back_without_split() {
        let tris: Vec<Triangle> = demoscene(16, 1);
        let bvh = build_bvh2(&tris, BvhBuildParams::very_slow_build(), &mut Duration::default());
        // Without splits every primitive is referenced once.
        assert_eq!(bvh.primitive_indices.len(), tris.len());
        bvh.validate(&tris, false, true);
    }

    #[test]
    fn empty_input() {
        let tris: Vec<Triangle> = Vec::new();
        let bvh = build_bvh2(&tris, BvhBuildParams::medium_build(), &mut Duration::default());
        assert!(bvh.is_empty());
    }
}
