//! Per-image outcome types and text formatting.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::detect::DetectorError;
use crate::ir::{FusedDetection, Tile};
use crate::plan::TileGeometry;

/// Where processing of one image got to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Planning,
    Slicing,
    Detecting,
    Merging,
    /// Every tile succeeded.
    Done,
    /// Some tiles failed; the result covers the rest.
    PartiallyFailed,
    /// Every tile failed; there are no detections.
    Failed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Planning => "planning",
            ProcessState::Slicing => "slicing",
            ProcessState::Detecting => "detecting",
            ProcessState::Merging => "merging",
            ProcessState::Done => "done",
            ProcessState::PartiallyFailed => "partially failed",
            ProcessState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A tile whose detector call did not produce detections.
#[derive(Debug, Serialize)]
pub struct TileFailure {
    pub tile: Tile,
    #[serde(serialize_with = "error_message")]
    pub error: DetectorError,
}

/// Time spent on one tile, including tiles that failed or timed out.
#[derive(Clone, Debug, Serialize)]
pub struct TileTiming {
    pub tile: Tile,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
    pub succeeded: bool,
    /// Detections kept for this tile after filtering. Zero for a failed tile.
    pub detections: usize,
}

/// Counters for one processed image.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProcessStats {
    pub tile_count: usize,
    pub succeeded_tiles: usize,
    pub failed_tiles: usize,
    pub tile_timings: Vec<TileTiming>,
    pub detections_before_merge: usize,
    pub detections_after_merge: usize,
    /// Sum of fused detection confidences.
    pub confidence_sum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_confidence: Option<f64>,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
}

impl ProcessStats {
    pub(crate) fn record_fused(&mut self, detections: &[FusedDetection]) {
        self.detections_after_merge = detections.len();
        self.confidence_sum = detections.iter().map(|d| d.confidence).sum();
        self.mean_confidence = if detections.is_empty() {
            None
        } else {
            Some(self.confidence_sum / detections.len() as f64)
        };
    }
}

/// Everything produced for one image.
///
/// Serializes to the JSON result document written by `tilefuse detect`.
#[derive(Debug, Serialize)]
pub struct ProcessOutcome {
    pub image_id: String,
    pub width: u32,
    pub height: u32,
    pub geometry: TileGeometry,
    pub state: ProcessState,
    pub detections: Vec<FusedDetection>,
    pub stats: ProcessStats,
    pub failures: Vec<TileFailure>,
}

fn error_message<S: Serializer>(error: &DetectorError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

fn millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(as_millis_f64(*elapsed))
}

fn as_millis_f64(elapsed: Duration) -> f64 {
    elapsed.as_nanos() as f64 / 1_000_000.0
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image: {} ({}x{})", self.image_id, self.width, self.height)?;
        writeln!(f, "State: {}", self.state)?;
        writeln!(
            f,
            "Tiles: {} total, {} succeeded, {} failed ({}x{} px, overlap {:.2}/{:.2})",
            self.stats.tile_count,
            self.stats.succeeded_tiles,
            self.stats.failed_tiles,
            self.geometry.width(),
            self.geometry.height(),
            self.geometry.overlap_width_ratio(),
            self.geometry.overlap_height_ratio(),
        )?;
        writeln!(
            f,
            "Detections: {} before merge, {} after merge",
            self.stats.detections_before_merge, self.stats.detections_after_merge
        )?;
        if let Some(mean) = self.stats.mean_confidence {
            writeln!(f, "Mean confidence: {:.3}", mean)?;
        }
        writeln!(f, "Elapsed: {:.1} ms", as_millis_f64(self.stats.elapsed))?;

        if !self.failures.is_empty() {
            writeln!(f)?;
            writeln!(f, "Failed tiles:")?;
            for failure in &self.failures {
                writeln!(f, "  - {}: {}", failure.tile, failure.error)?;
            }
        }

        if !self.detections.is_empty() {
            writeln!(f)?;
            writeln!(f, "Detections:")?;
            for det in &self.detections {
                writeln!(
                    f,
                    "  - {} {:.3} [{:.1}, {:.1}, {:.1}, {:.1}] (merged {})",
                    det.class_name,
                    det.confidence,
                    det.bbox.xmin(),
                    det.bbox.ymin(),
                    det.bbox.xmax(),
                    det.bbox.ymax(),
                    det.merged_count
                )?;
            }
        }

        Ok(())
    }
}
