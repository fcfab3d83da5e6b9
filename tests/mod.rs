#[cfg(test)]
mod tests {
    use std::time::Duration;

    use glam::*;
    use parbvh::{
        aabb::Aabb,
        bvh2::{
            builder::{build_bvh2, build_bvh2_splittable},
            layout::NodeLayoutOptimizer,
            leaf_collapser::LeafCollapser,
            refit::HierarchyRefitter,
            reinsertion::ReinsertionOptimizer,
            traverse::{
                AnyPrimitiveIntersector, ClosestPrimitiveIntersector, FastNodeIntersector,
                NoStatistics, NodeIntersector, RobustNodeIntersector, SingleRayTraverser,
                TraversalStatistics,
            },
            Bvh2,
        },
        lbvh::LinearBuilder,
        ploc::{PlocBuilder, PlocSearchDistance},
        primitive::{Intersection, Primitive, SplittablePrimitive},
        ray::Ray,
        test_util::{
            geometry::{demoscene, icosphere, scattered_boxes, CUBE, PLANE},
            rays::{brute_force_closest, rays_through},
        },
        top_down::{
            binned_sah::BinnedSahBuilder,
            spatial_split::{repair_bvh_leaves, SpatialSplitBuilder},
            sweep_sah::SweepSahBuilder,
        },
        triangle::Triangle,
        utils::{compute_bounding_boxes_and_centers, compute_global_bounding_box},
        BvhBuildParams,
    };

    /// Every builder, with a name for failure messages and whether it may duplicate primitives.
    fn build_all<P: SplittablePrimitive>(primitives: &[P]) -> Vec<(&'static str, Bvh2, bool)> {
        let (bboxes, centers) = compute_bounding_boxes_and_centers(primitives);
        let global = compute_global_bounding_box(&bboxes);
        let mut spatial = SpatialSplitBuilder::<64>::default().build(&global, primitives, &bboxes, &centers);
        repair_bvh_leaves(&mut spatial);
        vec![
            ("binned", BinnedSahBuilder::<16>::default().build(&global, &bboxes, &centers), false),
            ("sweep", SweepSahBuilder::default().build(&global, &bboxes, &centers), false),
            ("spatial", spatial, true),
            ("linear", LinearBuilder.build(&global, &bboxes, &centers), false),
            ("ploc", PlocBuilder::default().build(&global, &bboxes, &centers), false),
        ]
    }

    fn closest<N: NodeIntersector, P: Primitive>(
        bvh: &Bvh2,
        primitives: &[P],
        ray: Ray,
    ) -> Option<(u32, f32)> {
        SingleRayTraverser::<N>::new(bvh)
            .traverse(ray, &mut ClosestPrimitiveIntersector::new(bvh, primitives), &mut NoStatistics)
            .map(|hit| (hit.primitive_index, hit.distance()))
    }

    fn assert_same_hit(expected: Option<(u32, f32)>, actual: Option<(u32, f32)>, context: &str) {
        match (expected, actual) {
            (None, None) => (),
            (Some((_, a)), Some((_, b))) => {
                assert!((a - b).abs() <= a.abs().max(1.0) * 1e-4, "{context}: {a} vs {b}")
            }
            _ => panic!("{context}: expected {expected:?}, got {actual:?}"),
        }
    }

    fn two_boxes() -> [Aabb; 2] {
        [
            Aabb::new(Vec3A::splat(-0.5), Vec3A::splat(0.5)),
            Aabb::new(vec3a(9.5, -0.5, -0.5), vec3a(10.5, 0.5, 0.5)),
        ]
    }

    #[test]
    fn two_boxes_binned() {
        let boxes = two_boxes();
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&boxes);
        let bvh = BinnedSahBuilder::<16>::default().build(
            &compute_global_bounding_box(&bboxes),
            &bboxes,
            &centers,
        );
        assert_eq!(bvh.node_count(), 3);
        assert_eq!(
            bvh.nodes[0].aabb,
            Aabb::new(Vec3A::splat(-0.5), vec3a(10.5, 0.5, 0.5))
        );
    }

    #[test]
    fn one_primitive_every_builder() {
        let boxes = [Aabb::new(Vec3A::ZERO, Vec3A::ONE)];
        for (name, bvh, _) in build_all(&boxes) {
            assert_eq!(bvh.node_count(), 1, "{name}");
            assert!(bvh.nodes[0].is_leaf(), "{name}");
            assert_eq!(bvh.nodes[0].prim_count, 1, "{name}");
        }
    }

    #[test]
    fn ray_enters_first_box() {
        let boxes = two_boxes();
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&boxes);
        let bvh = BinnedSahBuilder::<16>::default().build(
            &compute_global_bounding_box(&bboxes),
            &bboxes,
            &centers,
        );
        let ray = Ray::new(vec3a(-5.0, 0.0, 0.0), Vec3A::X, 0.0, f32::INFINITY);
        let hit = closest::<FastNodeIntersector, _>(&bvh, &boxes, ray);
        assert_eq!(hit, Some((0, 4.5)));
    }

    #[test]
    fn any_hit_stops_early() {
        // Overlapping boxes that all cover the ray's path.
        let boxes: Vec<Aabb> = (0..64)
            .map(|i| {
                let x = i as f32 * 0.1;
                Aabb::new(vec3a(x, -1.0, -1.0), vec3a(x + 10.0, 1.0, 1.0))
            })
            .collect();
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&boxes);
        let bvh = LinearBuilder.build(&compute_global_bounding_box(&bboxes), &bboxes, &centers);
        let traverser = SingleRayTraverser::<FastNodeIntersector>::new(&bvh);
        let ray = Ray::new_inf(vec3a(-5.0, 0.0, 0.0), Vec3A::X);

        let mut closest_stats = TraversalStatistics::default();
        let closest_hit = traverser.traverse(
            ray,
            &mut ClosestPrimitiveIntersector::new(&bvh, &boxes),
            &mut closest_stats,
        );
        let mut any_stats = TraversalStatistics::default();
        let any_hit = traverser.traverse(
            ray,
            &mut AnyPrimitiveIntersector::new(&bvh, &boxes),
            &mut any_stats,
        );

        assert_eq!(closest_hit.map(|h| h.primitive_index), Some(0));
        assert_eq!(closest_hit.map(|h| h.distance()), Some(5.0));
        assert!(any_hit.is_some());
        assert_eq!(any_stats.intersections, 1);
        assert!(
            any_stats.traversal_steps < closest_stats.traversal_steps,
            "any hit: {any_stats:?}, closest hit: {closest_stats:?}"
        );
    }

    #[test]
    fn traversal_matches_brute_force() {
        let mut tris = demoscene(24, 2);
        tris.extend(icosphere(2).iter().map(|t| Triangle {
            v0: t.v0 * 0.3 + vec3a(0.0, 0.8, 0.0),
            v1: t.v1 * 0.3 + vec3a(0.0, 0.8, 0.0),
            v2: t.v2 * 0.3 + vec3a(0.0, 0.8, 0.0),
        }));
        let global = tris.iter().fold(Aabb::empty(), |a, t| a.union(&t.bounding_box()));
        let rays = rays_through(&global, 500, 11);

        for (name, bvh, splits) in build_all(&tris) {
            bvh.validate(&tris, splits, !splits);
            for (i, ray) in rays.iter().enumerate() {
                let expected = brute_force_closest(&tris, ray);
                let robust = closest::<RobustNodeIntersector, _>(&bvh, &tris, *ray);
                assert_same_hit(expected, robust, &format!("{name} ray {i}"));
            }
        }
    }

    #[test]
    fn boxes_match_brute_force() {
        let boxes = scattered_boxes(2000, 10.0, 4);
        let rays = rays_through(&Aabb::new(Vec3A::splat(-10.0), Vec3A::splat(10.0)), 300, 5);
        for (name, bvh, splits) in build_all(&boxes) {
            bvh.validate(&boxes, splits, !splits);
            for (i, ray) in rays.iter().enumerate() {
                let expected = brute_force_closest(&boxes, ray);
                let actual = closest::<RobustNodeIntersector, _>(&bvh, &boxes, *ray);
                assert_same_hit(expected, actual, &format!("{name} ray {i}"));
            }
        }
    }

    #[test]
    fn layout_does_not_change_hits() {
        let tris = demoscene(32, 8);
        let global = tris.iter().fold(Aabb::empty(), |a, t| a.union(&t.bounding_box()));
        let rays = rays_through(&global, 300, 1);
        for (name, mut bvh, splits) in build_all(&tris) {
            let before: Vec<_> = rays
                .iter()
                .map(|ray| closest::<FastNodeIntersector, _>(&bvh, &tris, *ray))
                .collect();
            NodeLayoutOptimizer.optimize(&mut bvh);
            bvh.validate(&tris, splits, !splits);
            for (i, ray) in rays.iter().enumerate() {
                let after = closest::<FastNodeIntersector, _>(&bvh, &tris, *ray);
                assert_same_hit(before[i], after, &format!("{name} ray {i}"));
            }
        }
    }

    #[test]
    fn reinsertion_never_raises_cost() {
        let tris = demoscene(32, 6);
        for (name, mut bvh, splits) in build_all(&tris) {
            let before = bvh.compute_cost(1.0);
            ReinsertionOptimizer::default().optimize(&mut bvh);
            let after = bvh.compute_cost(1.0);
            assert!(after <= before * (1.0 + 1e-5), "{name}: {before} -> {after}");
            bvh.validate(&tris, splits, !splits);
        }
    }

    #[test]
    fn collapse_never_raises_cost() {
        let tris = demoscene(32, 12);
        let (bboxes, centers) = compute_bounding_boxes_and_centers(&tris);
        let global = compute_global_bounding_box(&bboxes);
        for search_distance in [PlocSearchDistance::Minimum, PlocSearchDistance::High] {
            let mut bvh = PlocBuilder { search_distance }.build(&global, &bboxes, &centers);
            let before = bvh.compute_cost(1.0);
            LeafCollapser {
                max_leaf_size: 8,
                ..Default::default()
            }
            .collapse(&mut bvh);
            assert!(bvh.compute_cost(1.0) <= before * (1.0 + 1e-5));
            bvh.validate(&tris, false, true);
            for leaf in bvh.leaves() {
                assert!(bvh.nodes[leaf as usize].prim_count <= 8);
            }
        }
    }

    #[test]
    fn refit_twice_gives_same_boxes() {
        let mut tris = demoscene(16, 3);
        let mut bvh = build_bvh2(&tris, BvhBuildParams::medium_build(), &mut Duration::default());
        for t in tris.iter_mut() {
            let lift = vec3a(0.0, t.v0.x * 0.25, 0.0);
            t.v0 += lift;
            t.v1 += lift;
            t.v2 += lift;
        }
        let refitter = HierarchyRefitter::new(&bvh);
        refitter.refit_primitives(&mut bvh, &tris);
        let first = bvh.nodes.clone();
        refitter.refit_primitives(&mut bvh, &tris);
        assert_eq!(first, bvh.nodes);
        bvh.validate(&tris, false, true);
    }

    #[test]
    fn pipeline_presets_hit_like_brute_force() {
        let mut tris: Vec<Triangle> = icosphere(2);
        tris.extend(PLANE.iter().map(|t| Triangle {
            v0: t.v0 * 3.0 - Vec3A::Y,
            v1: t.v1 * 3.0 - Vec3A::Y,
            v2: t.v2 * 3.0 - Vec3A::Y,
        }));
        tris.extend(CUBE.iter().map(|t| Triangle {
            v0: t.v0 * 0.2 + vec3a(2.0, 0.0, 0.0),
            v1: t.v1 * 0.2 + vec3a(2.0, 0.0, 0.0),
            v2: t.v2 * 0.2 + vec3a(2.0, 0.0, 0.0),
        }));
        let global = tris.iter().fold(Aabb::empty(), |a, t| a.union(&t.bounding_box()));
        let rays = rays_through(&global, 200, 3);

        for config in [
            BvhBuildParams::fastest_build(),
            BvhBuildParams::fast_build(),
            BvhBuildParams::medium_build(),
            BvhBuildParams::slow_build(),
            BvhBuildParams::very_slow_build(),
        ] {
            let mut time = Duration::default();
            let bvh = build_bvh2_splittable(&tris, config, &mut time);
            for (i, ray) in rays.iter().enumerate() {
                let expected = brute_force_closest(&tris, ray);
                let actual = closest::<RobustNodeIntersector, _>(&bvh, &tris, *ray);
                assert_same_hit(expected, actual, &format!("{:?} ray {i}", config.builder));
            }
        }
    }

    #[test]
    fn permuted_primitives_report_original_index() {
        let tris = demoscene(16, 0);
        let bvh = build_bvh2(&tris, BvhBuildParams::slow_build(), &mut Duration::default());
        let permuted = bvh.permute(&tris);
        let ray = Ray::new_inf(vec3a(0.1, 5.0, 0.2), -Vec3A::Y);
        let traverser = SingleRayTraverser::<FastNodeIntersector>::new(&bvh);
        let direct = traverser.traverse(
            ray,
            &mut ClosestPrimitiveIntersector::new(&bvh, &tris),
            &mut NoStatistics,
        );
        let through_permuted = traverser.traverse(
            ray,
            &mut ClosestPrimitiveIntersector::new_permuted(&bvh, &permuted),
            &mut NoStatistics,
        );
        let (direct, through_permuted) = (direct.unwrap(), through_permuted.unwrap());
        assert_eq!(direct.primitive_index, through_permuted.primitive_index);
        assert_eq!(direct.distance(), through_permuted.distance());
        assert!(tris[direct.primitive_index as usize].intersect(&ray).is_some());
    }
}
