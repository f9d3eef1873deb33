//! Fuzz target for merging parsed detection lists.
//!
//! Whatever parses must merge without panicking; non-finite input is an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tilefuse::ir::io_json::from_json_slice;
use tilefuse::merge::{merge, MatchMetric, MergeOptions, MergeStrategy};

fuzz_target!(|data: &[u8]| {
    if data.len() > 1024 * 1024 {
        return;
    }

    let Ok(detections) = from_json_slice(data) else {
        return;
    };
    for strategy in [MergeStrategy::Nmm, MergeStrategy::Nms] {
        for metric in [MatchMetric::Iou, MatchMetric::Ios] {
            let opts = MergeOptions {
                strategy,
                metric,
                match_threshold: 0.5,
            };
            let _ = merge(&detections, &opts);
        }
    }
});
