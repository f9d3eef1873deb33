#![allow(dead_code)]

use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, FileFailurePersistence};
use tilefuse::ir::{BBoxXYXY, ClassId, Detection, FusedDetection, ImageDimensions, Pixel, Tile};
use tilefuse::merge::{canonical_order, MatchMetric, MergeOptions, MergeStrategy};
use tilefuse::plan::TileGeometry;

pub fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(64);

    let mut config = ProptestConfig::with_failure_persistence(FileFailurePersistence::WithSource(
        "proptest-regressions",
    ));
    config.cases = cases;
    config.max_shrink_iters = 1024;
    config
}

pub fn arb_dimensions() -> impl Strategy<Value = ImageDimensions> {
    (1u32..=1500, 1u32..=1500)
        .prop_map(|(w, h)| ImageDimensions::new(w, h).expect("positive dimensions"))
}

pub fn arb_geometry() -> impl Strategy<Value = TileGeometry> {
    (16u32..=700, 16u32..=700, 0.0f64..0.5, 0.0f64..0.5).prop_map(|(h, w, oh, ow)| {
        TileGeometry::new(h, w, oh, ow).expect("geometry within bounds")
    })
}

pub fn arb_merge_options() -> impl Strategy<Value = MergeOptions> {
    (
        prop_oneof![Just(MergeStrategy::Nmm), Just(MergeStrategy::Nms)],
        prop_oneof![Just(MatchMetric::Iou), Just(MatchMetric::Ios)],
        0.05f64..=1.0,
    )
        .prop_map(|(strategy, metric, match_threshold)| MergeOptions {
            strategy,
            metric,
            match_threshold,
        })
}

fn arb_bbox() -> impl Strategy<Value = BBoxXYXY<Pixel>> {
    (0.0f64..300.0, 0.0f64..300.0, 1.0f64..120.0, 1.0f64..120.0)
        .prop_map(|(x, y, w, h)| BBoxXYXY::from_xyxy(x, y, x + w, y + h))
}

/// Detections with pairwise distinct confidences, clustered so that merges happen.
pub fn arb_detections(max_len: usize) -> impl Strategy<Value = Vec<Detection>> {
    prop::collection::vec((arb_bbox(), 0u32..3), 0..=max_len).prop_map(|items| {
        let n = items.len().max(1) as f64;
        items
            .into_iter()
            .enumerate()
            .map(|(i, (bbox, class))| Detection {
                bbox,
                confidence: 0.05 + 0.9 * (i as f64 + 1.0) / n,
                class_id: ClassId(class),
                class_name: format!("class{class}"),
                source_tile: Tile {
                    index: i,
                    x_min: 0,
                    y_min: 0,
                    x_max: 1024,
                    y_max: 1024,
                },
            })
            .collect()
    })
}

/// Fused detections without ids, in a fixed order.
pub fn fused_semantics(mut detections: Vec<FusedDetection>) -> Vec<(f64, f64, f64, f64, f64, u32, usize)> {
    canonical_order(&mut detections);
    detections
        .into_iter()
        .map(|d| {
            (
                d.bbox.xmin(),
                d.bbox.ymin(),
                d.bbox.xmax(),
                d.bbox.ymax(),
                d.confidence,
                d.class_id.as_u32(),
                d.merged_count,
            )
        })
        .collect()
}
