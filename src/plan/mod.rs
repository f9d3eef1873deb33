//! Tile geometry planning.
//!
//! Chooses the tile size used for an image. With automatic sizing off the
//! requested geometry is used as-is; with it on, the tile count per axis is
//! derived from the image size and a target resolution and the tile size is
//! stretched so that neighbouring tiles overlap by exactly the requested
//! ratio.

use serde::Serialize;
use tracing::debug;

use crate::error::TilefuseError;
use crate::ir::ImageDimensions;

/// Nominal tile size plus overlap ratios.
///
/// Built through [`TileGeometry::new`], which guarantees positive sides and
/// ratios in `[0, 1)`, so slicing always advances.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TileGeometry {
    height: u32,
    width: u32,
    overlap_height_ratio: f64,
    overlap_width_ratio: f64,
}

impl TileGeometry {
    pub fn new(
        height: u32,
        width: u32,
        overlap_height_ratio: f64,
        overlap_width_ratio: f64,
    ) -> Result<Self, TilefuseError> {
        if height == 0 {
            return Err(TilefuseError::invalid_config("slice_height", "must be positive"));
        }
        if width == 0 {
            return Err(TilefuseError::invalid_config("slice_width", "must be positive"));
        }
        check_overlap("overlap_height_ratio", overlap_height_ratio)?;
        check_overlap("overlap_width_ratio", overlap_width_ratio)?;

        Ok(Self {
            height,
            width,
            overlap_height_ratio,
            overlap_width_ratio,
        })
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn overlap_height_ratio(&self) -> f64 {
        self.overlap_height_ratio
    }

    #[inline]
    pub fn overlap_width_ratio(&self) -> f64 {
        self.overlap_width_ratio
    }

    /// Vertical stride between tile rows: `height - floor(height * ratio)`.
    #[inline]
    pub fn step_height(&self) -> u32 {
        step(self.height, self.overlap_height_ratio)
    }

    /// Horizontal stride between tile columns.
    #[inline]
    pub fn step_width(&self) -> u32 {
        step(self.width, self.overlap_width_ratio)
    }
}

fn step(tile: u32, ratio: f64) -> u32 {
    let overlap = (tile as f64 * ratio).floor() as u32;
    tile.saturating_sub(overlap)
}

fn check_overlap(field: &str, ratio: f64) -> Result<(), TilefuseError> {
    if (0.0..1.0).contains(&ratio) {
        Ok(())
    } else {
        Err(TilefuseError::invalid_config(
            field,
            format!("{} is outside [0, 1)", ratio),
        ))
    }
}

/// Picks the tile geometry for an image.
///
/// With `auto` false the requested geometry is returned unchanged. With
/// `auto` true each axis gets `n = max(1, floor(dim / target_resolution))`
/// tiles of size `round(dim / (n - (n - 1) * overlap))`, at least 1 pixel.
///
/// # Errors
/// Returns [`TilefuseError::InvalidConfig`] if `auto` is set and
/// `target_resolution` is zero.
pub fn plan(
    image: ImageDimensions,
    requested: &TileGeometry,
    auto: bool,
    target_resolution: u32,
) -> Result<TileGeometry, TilefuseError> {
    if !auto {
        return Ok(*requested);
    }
    if target_resolution == 0 {
        return Err(TilefuseError::invalid_config(
            "target_resolution",
            "must be positive",
        ));
    }

    let height = auto_tile_size(
        image.height(),
        target_resolution,
        requested.overlap_height_ratio,
    );
    let width = auto_tile_size(
        image.width(),
        target_resolution,
        requested.overlap_width_ratio,
    );

    debug!(
        image_width = image.width(),
        image_height = image.height(),
        tile_width = width,
        tile_height = height,
        "planned automatic tile size"
    );

    TileGeometry::new(
        height,
        width,
        requested.overlap_height_ratio,
        requested.overlap_width_ratio,
    )
}

fn auto_tile_size(dimension: u32, target_resolution: u32, overlap_ratio: f64) -> u32 {
    let count = (dimension / target_resolution).max(1) as f64;
    let size = dimension as f64 / (count - (count - 1.0) * overlap_ratio);
    (size.round() as u32).max(1)
}
