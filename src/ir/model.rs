//! Core detection model for tiled inference.
//!
//! Data moves through these types in one direction: the slicer produces
//! [`Tile`]s, detectors produce [`RawDetection`]s in tile-local space, the
//! detection adapter turns them into full-image [`Detection`]s, and the merge
//! engine collapses those into [`FusedDetection`]s.

use serde::{Deserialize, Serialize};

use super::bbox::BBoxXYXY;
use super::ids::{ClassId, DetectionId};
use super::space::{Pixel, TileLocal};
use crate::error::TilefuseError;

/// Size of the source image in pixels. Both sides are positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDimensions {
    width: u32,
    height: u32,
}

impl ImageDimensions {
    /// Creates image dimensions, rejecting a zero-sized side.
    pub fn new(width: u32, height: u32) -> Result<Self, TilefuseError> {
        if width == 0 || height == 0 {
            return Err(TilefuseError::invalid_config(
                "image_dimensions",
                format!("{}x{} (both sides must be positive)", width, height),
            ));
        }
        Ok(Self { width, height })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }
}

/// A half-open pixel window `[x_min, x_max) x [y_min, y_max)` of the source image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    /// Position of this tile in raster slicing order.
    pub index: usize,
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl Tile {
    #[inline]
    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }

    /// Returns true if the pixel at `(x, y)` lies inside this tile.
    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x_min && x < self.x_max && y >= self.y_min && y < self.y_max
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tile #{} [{},{} .. {},{})",
            self.index, self.x_min, self.y_min, self.x_max, self.y_max
        )
    }
}

/// A detection exactly as a detector reported it, in tile-local coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub bbox: BBoxXYXY<TileLocal>,
    pub confidence: f64,
    pub class_id: ClassId,
    /// Left empty by detectors that only know class indices.
    pub class_name: Option<String>,
}

impl RawDetection {
    pub fn new(bbox: BBoxXYXY<TileLocal>, confidence: f64, class_id: impl Into<ClassId>) -> Self {
        Self {
            bbox,
            confidence,
            class_id: class_id.into(),
            class_name: None,
        }
    }

    /// Sets the class name reported by the detector.
    pub fn with_class_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = Some(name.into());
        self
    }
}

/// A detection remapped into full-image coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBoxXYXY<Pixel>,
    pub confidence: f64,
    pub class_id: ClassId,
    pub class_name: String,
    /// The tile this detection was found in.
    pub source_tile: Tile,
}

/// Where a fused detection came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    /// Produced by merging per-tile detections.
    TileFused,
}

/// Final output entity: one deduplicated object in full-image coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedDetection {
    pub id: DetectionId,
    pub bbox: BBoxXYXY<Pixel>,
    pub confidence: f64,
    pub class_id: ClassId,
    pub class_name: String,
    /// `(xmax - xmin) * (ymax - ymin)` of `bbox`.
    pub area: f64,
    pub source: DetectionSource,
    /// Number of input detections folded into this one (1 = kept as-is).
    pub merged_count: usize,
}

impl FusedDetection {
    /// Creates a fused detection with a fresh id and derived area.
    pub fn new(
        bbox: BBoxXYXY<Pixel>,
        confidence: f64,
        class_id: ClassId,
        class_name: impl Into<String>,
        merged_count: usize,
    ) -> Self {
        Self {
            id: DetectionId::new_random(),
            area: bbox.area(),
            bbox,
            confidence,
            class_id,
            class_name: class_name.into(),
            source: DetectionSource::TileFused,
            merged_count,
        }
    }
}

impl From<Detection> for FusedDetection {
    fn from(detection: Detection) -> Self {
        FusedDetection::new(
            detection.bbox,
            detection.confidence,
            detection.class_id,
            detection.class_name,
            1,
        )
    }
}
