//! Geometry and detection model for tilefuse.
//!
//! # Design Principles
//!
//! 1. **Type Safety**: Coordinate spaces are marker types. A box returned by a
//!    detector is `BBoxXYXY<TileLocal>` and has to be remapped explicitly
//!    before it can meet a `BBoxXYXY<Pixel>` from another tile.
//!
//! 2. **Canonical Format**: Boxes are XYXY in full-image pixel space from the
//!    detection adapter onwards.
//!
//! 3. **Permissive Construction**: Boxes may be degenerate. The merge engine
//!    gives them a zero match score rather than rejecting them.
//!
//! # Example
//!
//! ```
//! use tilefuse::ir::{BBoxXYXY, ClassId, FusedDetection, Pixel};
//!
//! let fused = FusedDetection::new(
//!     BBoxXYXY::<Pixel>::from_xyxy(590.0, 0.0, 700.0, 100.0),
//!     0.9,
//!     ClassId(0),
//!     "person",
//!     2,
//! );
//! assert_eq!(fused.area, 11_000.0);
//! ```

mod bbox;
mod coord;
mod ids;
pub mod io_json;
mod model;
mod space;

// Re-export core types for convenient access
pub use bbox::BBoxXYXY;
pub use coord::Coord;
pub use ids::{ClassId, DetectionId};
pub use model::{
    Detection, DetectionSource, FusedDetection, ImageDimensions, RawDetection, Tile,
};
pub use space::{Normalized, Pixel, TileLocal};
