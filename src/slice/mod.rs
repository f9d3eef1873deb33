//! Overlapping tile windows over an image.
//!
//! Tiles are emitted in raster order (rows top to bottom, columns left to
//! right). The last tile on each axis is clamped to the image boundary, so
//! it can be smaller than the nominal tile size, and slicing stops as soon
//! as a tile reaches the boundary. The union of all tiles is the full image.

use image::RgbImage;

use crate::error::TilefuseError;
use crate::ir::{ImageDimensions, Tile};
use crate::plan::TileGeometry;

/// Computes the tile windows covering `image`.
///
/// The result is a plain `Vec`, identical for identical inputs.
///
/// # Errors
/// Returns [`TilefuseError::InvalidConfig`] if a step size would be zero,
/// which only happens for an overlap ratio of 1 or more.
pub fn slice(image: ImageDimensions, geometry: &TileGeometry) -> Result<Vec<Tile>, TilefuseError> {
    let step_h = geometry.step_height();
    let step_w = geometry.step_width();
    if step_h == 0 {
        return Err(TilefuseError::invalid_config(
            "overlap_height_ratio",
            "step size is zero",
        ));
    }
    if step_w == 0 {
        return Err(TilefuseError::invalid_config(
            "overlap_width_ratio",
            "step size is zero",
        ));
    }

    let (width, height) = (image.width(), image.height());
    let mut tiles = Vec::with_capacity(estimated_count(width, height, geometry));

    let mut y = 0u32;
    while y < height {
        let y_max = y.saturating_add(geometry.height()).min(height);

        let mut x = 0u32;
        while x < width {
            let x_max = x.saturating_add(geometry.width()).min(width);
            tiles.push(Tile {
                index: tiles.len(),
                x_min: x,
                y_min: y,
                x_max,
                y_max,
            });
            if x_max == width {
                break;
            }
            x += step_w;
        }

        if y_max == height {
            break;
        }
        y += step_h;
    }

    Ok(tiles)
}

fn estimated_count(width: u32, height: u32, geometry: &TileGeometry) -> usize {
    let cols = width.div_ceil(geometry.step_width().max(1)) as usize;
    let rows = height.div_ceil(geometry.step_height().max(1)) as usize;
    cols.saturating_mul(rows)
}

/// Slices an arbitrary geometry and panics if the result breaks coverage.
///
/// Invalid dimensions or geometry are returned as errors.
#[cfg(feature = "fuzzing")]
pub fn fuzz_slice_invariants(
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    overlap_width_ratio: f64,
    overlap_height_ratio: f64,
) -> Result<(), TilefuseError> {
    let image = ImageDimensions::new(width, height)?;
    let geometry = TileGeometry::new(tile_height, tile_width, overlap_height_ratio, overlap_width_ratio)?;
    if estimated_count(width, height, &geometry) > 1_000_000 {
        return Ok(());
    }
    let tiles = slice(image, &geometry)?;

    let last = tiles.last().copied();
    assert_eq!(last.map(|t| (t.x_max, t.y_max)), Some((width, height)));
    for tile in &tiles {
        assert!(tile.width() > 0 && tile.height() > 0, "empty {tile}");
        assert!(tile.x_max <= width && tile.y_max <= height, "{tile} out of bounds");
        assert!(tile.width() <= tile_width && tile.height() <= tile_height);
    }
    Ok(())
}

/// Copies the pixels of `tile` out of `image`.
///
/// `tile` must come from slicing this image's dimensions.
pub fn crop(image: &RgbImage, tile: &Tile) -> RgbImage {
    image::imageops::crop_imm(image, tile.x_min, tile.y_min, tile.width(), tile.height())
        .to_image()
}
