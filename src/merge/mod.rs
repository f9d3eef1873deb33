//! Cross-tile detection merging.
//!
//! Overlapping tiles see the same object more than once, and a tile edge can
//! cut an object into a fragment. Merging collapses those duplicates with a
//! greedy, confidence-ordered pass: the strongest unconsumed detection claims
//! every same-class detection that matches it, then the next strongest
//! unconsumed one goes, and so on.
//!
//! Two strategies decide what a claimed group becomes:
//! - [`MergeStrategy::Nms`] keeps the strongest detection as-is.
//! - [`MergeStrategy::Nmm`] keeps its confidence and class but widens its box
//!   to enclose the whole group, which re-joins objects split by a tile edge.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::ir::{BBoxXYXY, ClassId, Detection, FusedDetection, Pixel};

/// How a group of matching detections is collapsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MergeStrategy {
    /// Non-maximum merging: union box of the group.
    #[default]
    Nmm,
    /// Non-maximum suppression: strongest box only.
    Nms,
}

/// Overlap score used to decide whether two boxes match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchMetric {
    /// Intersection over union.
    #[default]
    Iou,
    /// Intersection over the smaller area.
    Ios,
}

impl MatchMetric {
    #[inline]
    pub fn score(self, a: &BBoxXYXY<Pixel>, b: &BBoxXYXY<Pixel>) -> f64 {
        match self {
            MatchMetric::Iou => a.iou(b),
            MatchMetric::Ios => a.ios(b),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::Nmm => f.write_str("NMM"),
            MergeStrategy::Nms => f.write_str("NMS"),
        }
    }
}

impl fmt::Display for MatchMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMetric::Iou => f.write_str("IOU"),
            MatchMetric::Ios => f.write_str("IOS"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NMM" => Ok(MergeStrategy::Nmm),
            "NMS" => Ok(MergeStrategy::Nms),
            _ => Err(format!(
                "unknown merge strategy '{}' (expected NMM or NMS)",
                s
            )),
        }
    }
}

impl FromStr for MatchMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IOU" => Ok(MatchMetric::Iou),
            "IOS" => Ok(MatchMetric::Ios),
            _ => Err(format!(
                "unknown match metric '{}' (expected IOU or IOS)",
                s
            )),
        }
    }
}

/// Merge options.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub metric: MatchMetric,
    /// Minimum score, inclusive, for two boxes to count as the same object.
    pub match_threshold: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Nmm,
            metric: MatchMetric::Iou,
            match_threshold: 0.5,
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("match threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),

    #[error("detection {index} has a non-finite bounding box")]
    NonFiniteBox { index: usize },

    #[error("detection {index} has a non-finite confidence")]
    NonFiniteConfidence { index: usize },
}

/// Anything the merge engine can fold: per-tile detections, or fused
/// detections being merged again.
pub trait MergeCandidate {
    fn bbox(&self) -> &BBoxXYXY<Pixel>;
    fn confidence(&self) -> f64;
    fn class_id(&self) -> ClassId;
    fn class_name(&self) -> &str;

    /// How many original detections this candidate already stands for.
    fn merged_count(&self) -> usize {
        1
    }
}

impl MergeCandidate for Detection {
    fn bbox(&self) -> &BBoxXYXY<Pixel> {
        &self.bbox
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn class_id(&self) -> ClassId {
        self.class_id
    }

    fn class_name(&self) -> &str {
        &self.class_name
    }
}

impl MergeCandidate for FusedDetection {
    fn bbox(&self) -> &BBoxXYXY<Pixel> {
        &self.bbox
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn class_id(&self) -> ClassId {
        self.class_id
    }

    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn merged_count(&self) -> usize {
        self.merged_count
    }
}

/// Collapses duplicate detections.
///
/// Candidates are processed by descending confidence, then ascending class
/// id, then input position. Each unconsumed candidate claims every
/// unconsumed candidate of the same class whose score against its own box
/// is at least `match_threshold`. Classes never merge with each other.
///
/// The output is in processing order, one [`FusedDetection`] per group with
/// a fresh id. `merged_count` adds up the counts of the group's members.
///
/// # Errors
/// Rejects a threshold outside `[0, 1]` and any candidate with a non-finite
/// box or confidence. Nothing is merged in that case.
pub fn merge<D: MergeCandidate>(
    items: &[D],
    opts: &MergeOptions,
) -> Result<Vec<FusedDetection>, MergeError> {
    validate(items, opts)?;

    let order = processing_order(items);
    let mut consumed = vec![false; items.len()];
    let mut fused = Vec::with_capacity(items.len());

    for (pos, &lead_idx) in order.iter().enumerate() {
        if consumed[lead_idx] {
            continue;
        }
        consumed[lead_idx] = true;

        let lead = &items[lead_idx];
        let mut bbox = *lead.bbox();
        let mut merged_count = lead.merged_count();

        for &idx in &order[pos + 1..] {
            if consumed[idx] {
                continue;
            }
            let other = &items[idx];
            if other.class_id() != lead.class_id() {
                continue;
            }
            if opts.metric.score(lead.bbox(), other.bbox()) < opts.match_threshold {
                continue;
            }

            consumed[idx] = true;
            merged_count += other.merged_count();
            debug!(lead = lead_idx, member = idx, "grouped duplicate detection");
            if opts.strategy == MergeStrategy::Nmm {
                bbox = bbox.union_box(other.bbox());
            }
        }

        fused.push(FusedDetection::new(
            bbox,
            lead.confidence(),
            lead.class_id(),
            lead.class_name(),
            merged_count,
        ));
    }

    info!(
        strategy = %opts.strategy,
        metric = %opts.metric,
        threshold = opts.match_threshold,
        input = items.len(),
        output = fused.len(),
        "merged detections"
    );

    Ok(fused)
}

fn validate<D: MergeCandidate>(items: &[D], opts: &MergeOptions) -> Result<(), MergeError> {
    if !(0.0..=1.0).contains(&opts.match_threshold) {
        return Err(MergeError::InvalidThreshold(opts.match_threshold));
    }
    for (index, item) in items.iter().enumerate() {
        if !item.bbox().is_finite() {
            return Err(MergeError::NonFiniteBox { index });
        }
        if !item.confidence().is_finite() {
            return Err(MergeError::NonFiniteConfidence { index });
        }
    }
    Ok(())
}

fn processing_order<D: MergeCandidate>(items: &[D]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        let (da, db) = (&items[a], &items[b]);
        db.confidence()
            .total_cmp(&da.confidence())
            .then_with(|| da.class_id().cmp(&db.class_id()))
            .then_with(|| a.cmp(&b))
    });
    order
}

/// Orders fused detections the way [`merge`] emits them, ignoring ids.
///
/// Useful for comparing two merge results whose inputs were permuted.
pub fn canonical_order(detections: &mut [FusedDetection]) {
    detections.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.class_id.cmp(&b.class_id))
            .then_with(|| cmp_bbox(&a.bbox, &b.bbox))
    });
}

fn cmp_bbox(a: &BBoxXYXY<Pixel>, b: &BBoxXYXY<Pixel>) -> Ordering {
    a.xmin()
        .total_cmp(&b.xmin())
        .then_with(|| a.ymin().total_cmp(&b.ymin()))
        .then_with(|| a.xmax().total_cmp(&b.xmax()))
        .then_with(|| a.ymax().total_cmp(&b.ymax()))
}
