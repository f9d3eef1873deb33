//! Per-tile detection.
//!
//! The [`Detector`] trait is the seam to whatever model actually runs: it sees
//! one tile raster at a time and answers in tile-local coordinates. The
//! [`DetectionAdapter`] wraps a shared detector, runs it on a tile, drops
//! unusable or below-threshold results and moves the rest into full-image
//! coordinates. Nothing downstream of the adapter ever sees a tile-local box.

mod command;

pub use command::{parse_output as parse_command_output, CommandDetector};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{trace, warn};

use crate::config::ClassNames;
use crate::ir::{Detection, RawDetection, Tile};

/// Thresholds handed to the detector for every tile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DetectThresholds {
    /// Minimum confidence; lower-scoring results are also dropped by the adapter.
    pub confidence: f64,
    /// IoU threshold for the detector's own intra-tile NMS.
    pub nms: f64,
}

impl Default for DetectThresholds {
    fn default() -> Self {
        Self {
            confidence: 0.3,
            nms: 0.45,
        }
    }
}

/// Failure of a single tile. Recoverable: the other tiles carry on.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("failed to start detector process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("detector process exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("detector output is not a valid detection list: {0}")]
    InvalidOutput(#[source] serde_json::Error),

    #[error("failed to encode tile: {0}")]
    Encode(#[source] image::ImageError),

    #[error("tile task aborted: {0}")]
    TaskAborted(String),
}

/// An object detector that can run on one tile raster.
///
/// Implementations are shared read-only across concurrently running tiles
/// and across images, so `detect` takes `&self`. A detector that can only
/// serve one call at a time should be run with a pool size of 1.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Detects objects in `image`, returning boxes relative to its top-left corner.
    async fn detect(
        &self,
        image: &RgbImage,
        thresholds: &DetectThresholds,
    ) -> Result<Vec<RawDetection>, DetectorError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Runs a detector on tiles and remaps its answers into full-image space.
#[derive(Clone)]
pub struct DetectionAdapter {
    detector: Arc<dyn Detector>,
    thresholds: DetectThresholds,
    class_names: ClassNames,
    timeout: Option<Duration>,
}

impl DetectionAdapter {
    pub fn new(
        detector: Arc<dyn Detector>,
        thresholds: DetectThresholds,
        class_names: ClassNames,
    ) -> Self {
        Self {
            detector,
            thresholds,
            class_names,
            timeout: None,
        }
    }

    /// Fails a tile whose detector call takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Detects objects in one tile's pixels and returns them in image coordinates.
    pub async fn run(
        &self,
        tile_pixels: &RgbImage,
        tile: &Tile,
    ) -> Result<Vec<Detection>, DetectorError> {
        let call = self.detector.detect(tile_pixels, &self.thresholds);
        let raw = match self.timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| DetectorError::Timeout { after })??,
            None => call.await?,
        };
        Ok(self.remap(raw, tile))
    }

    /// Filters raw detections and shifts them by the tile origin.
    pub fn remap(&self, raw: Vec<RawDetection>, tile: &Tile) -> Vec<Detection> {
        let x_offset = tile.x_min as f64;
        let y_offset = tile.y_min as f64;

        raw.into_iter()
            .filter_map(|det| {
                if !det.bbox.is_finite() || !(0.0..=1.0).contains(&det.confidence) {
                    warn!(
                        detector = self.detector.name(),
                        tile = tile.index,
                        confidence = det.confidence,
                        "dropping malformed raw detection"
                    );
                    return None;
                }
                if det.confidence < self.thresholds.confidence {
                    trace!(
                        tile = tile.index,
                        confidence = det.confidence,
                        "dropping detection below confidence threshold"
                    );
                    return None;
                }

                let class_name = det
                    .class_name
                    .unwrap_or_else(|| self.class_names.name_for(det.class_id));
                Some(Detection {
                    bbox: det.bbox.to_image_space(x_offset, y_offset),
                    confidence: det.confidence,
                    class_id: det.class_id,
                    class_name,
                    source_tile: *tile,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BBoxXYXY, ClassId, Pixel};

    struct FixedDetector(Vec<RawDetection>);

    #[async_trait]
    impl Detector for FixedDetector {
        async fn detect(
            &self,
            _image: &RgbImage,
            _thresholds: &DetectThresholds,
        ) -> Result<Vec<RawDetection>, DetectorError> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct SlowDetector;

    #[async_trait]
    impl Detector for SlowDetector {
        async fn detect(
            &self,
            _image: &RgbImage,
            _thresholds: &DetectThresholds,
        ) -> Result<Vec<RawDetection>, DetectorError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn tile() -> Tile {
        Tile {
            index: 1,
            x_min: 410,
            y_min: 0,
            x_max: 800,
            y_max: 400,
        }
    }

    fn adapter(raw: Vec<RawDetection>, confidence: f64) -> DetectionAdapter {
        DetectionAdapter::new(
            Arc::new(FixedDetector(raw)),
            DetectThresholds {
                confidence,
                nms: 0.45,
            },
            ClassNames::new(vec!["person".into(), "car".into()]),
        )
    }

    #[tokio::test]
    async fn test_run_remaps_into_image_space() {
        let raw = vec![RawDetection::new(
            BBoxXYXY::from_xyxy(190.0, 0.0, 290.0, 100.0),
            0.9,
            0u32,
        )];
        let detections = adapter(raw, 0.3)
            .run(&RgbImage::new(390, 400), &tile())
            .await
            .expect("detect");

        assert_eq!(detections.len(), 1);
        let expected: BBoxXYXY<Pixel> = BBoxXYXY::from_xyxy(600.0, 0.0, 700.0, 100.0);
        assert_eq!(detections[0].bbox, expected);
        assert_eq!(detections[0].source_tile, tile());
        assert_eq!(detections[0].class_name, "person");
    }

    #[test]
    fn test_remap_filters_below_threshold_and_malformed() {
        let raw = vec![
            RawDetection::new(BBoxXYXY::from_xyxy(0.0, 0.0, 10.0, 10.0), 0.3, 1u32),
            RawDetection::new(BBoxXYXY::from_xyxy(0.0, 0.0, 10.0, 10.0), 0.5, 1u32),
            RawDetection::new(BBoxXYXY::from_xyxy(f64::NAN, 0.0, 10.0, 10.0), 0.9, 1u32),
            RawDetection::new(BBoxXYXY::from_xyxy(0.0, 0.0, 10.0, 10.0), 1.2, 1u32),
        ];
        let adapter = adapter(Vec::new(), 0.5);
        let detections = adapter.remap(raw, &tile());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 0.5);
        assert_eq!(detections[0].class_name, "car");
    }

    #[test]
    fn test_detector_class_name_wins_over_table() {
        let raw = vec![
            RawDetection::new(BBoxXYXY::from_xyxy(0.0, 0.0, 1.0, 1.0), 0.9, 0u32)
                .with_class_name("pedestrian"),
            RawDetection::new(BBoxXYXY::from_xyxy(0.0, 0.0, 1.0, 1.0), 0.9, 7u32),
        ];
        let detections = adapter(Vec::new(), 0.1).remap(raw, &tile());
        assert_eq!(detections[0].class_name, "pedestrian");
        assert_eq!(detections[1].class_name, "7");
        assert_eq!(detections[1].class_id, ClassId(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_the_tile() {
        let adapter = DetectionAdapter::new(
            Arc::new(SlowDetector),
            DetectThresholds::default(),
            ClassNames::default(),
        )
        .with_timeout(Some(Duration::from_millis(50)));

        let err = adapter
            .run(&RgbImage::new(4, 4), &tile())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectorError::Timeout { .. }));
    }
}
