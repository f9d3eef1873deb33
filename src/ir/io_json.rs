//! JSON serialization for fused detection lists.
//!
//! The on-disk shape is either a bare array or any object carrying the array
//! under a `detections` key (which is what `tilefuse detect --format json`
//! writes). Both are accepted on read so the output of one run can be fed
//! straight back into `tilefuse merge`.
//!
//! Array entries may be [`FusedDetection`]s or per-tile [`Detection`]s
//! (with a `source_tile` and no id). The latter come back as fused
//! detections with a fresh id and a `merged_count` of 1.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::Deserialize;

use super::model::{Detection, FusedDetection};
use crate::error::TilefuseError;

#[derive(Deserialize)]
#[serde(untagged)]
enum AnyDetection {
    Fused(FusedDetection),
    Tile(Detection),
}

impl From<AnyDetection> for FusedDetection {
    fn from(detection: AnyDetection) -> Self {
        match detection {
            AnyDetection::Fused(fused) => fused,
            AnyDetection::Tile(detection) => detection.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DetectionsDocument {
    Bare(Vec<AnyDetection>),
    Wrapped { detections: Vec<AnyDetection> },
}

impl DetectionsDocument {
    fn into_detections(self) -> Vec<FusedDetection> {
        let detections = match self {
            DetectionsDocument::Bare(detections) => detections,
            DetectionsDocument::Wrapped { detections } => detections,
        };
        detections.into_iter().map(FusedDetection::from).collect()
    }
}

/// Reads a list of fused detections from a JSON file.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn read_detections_json(path: &Path) -> Result<Vec<FusedDetection>, TilefuseError> {
    let file = File::open(path).map_err(TilefuseError::Io)?;
    let reader = BufReader::new(file);

    serde_json::from_reader::<_, DetectionsDocument>(reader)
        .map(DetectionsDocument::into_detections)
        .map_err(|source| TilefuseError::DetectionsJsonParse {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes a list of fused detections to a JSON file as a bare array.
pub fn write_detections_json(
    path: &Path,
    detections: &[FusedDetection],
) -> Result<(), TilefuseError> {
    let file = File::create(path).map_err(TilefuseError::Io)?;
    let writer = BufWriter::new(file);

    serde_json::to_writer_pretty(writer, detections).map_err(|source| TilefuseError::JsonWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses a detection list from a JSON string.
pub fn from_json_str(json: &str) -> Result<Vec<FusedDetection>, serde_json::Error> {
    serde_json::from_str::<DetectionsDocument>(json).map(DetectionsDocument::into_detections)
}

/// Parses a detection list from raw bytes.
pub fn from_json_slice(bytes: &[u8]) -> Result<Vec<FusedDetection>, serde_json::Error> {
    serde_json::from_slice::<DetectionsDocument>(bytes).map(DetectionsDocument::into_detections)
}

/// Serializes a detection list to a pretty JSON array.
pub fn to_json_string(detections: &[FusedDetection]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BBoxXYXY, ClassId};

    fn sample() -> Vec<FusedDetection> {
        vec![
            FusedDetection::new(
                BBoxXYXY::from_xyxy(10.0, 20.0, 110.0, 220.0),
                0.91,
                ClassId(0),
                "person",
                3,
            ),
            FusedDetection::new(
                BBoxXYXY::from_xyxy(5.0, 5.0, 15.0, 25.0),
                0.4,
                ClassId(2),
                "car",
                1,
            ),
        ]
    }

    #[test]
    fn test_bare_array_survives_a_write() {
        let detections = sample();
        let json = to_json_string(&detections).expect("serialize");
        let restored = from_json_str(&json).expect("parse");
        assert_eq!(restored, detections);
    }

    #[test]
    fn test_wrapped_document_is_accepted() {
        let detections = sample();
        let wrapped = serde_json::json!({
            "image_id": "tiles.png",
            "state": "done",
            "detections": detections,
        });
        let restored = from_json_slice(wrapped.to_string().as_bytes()).expect("parse");
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[1].class_name, "car");
    }

    #[test]
    fn test_file_write_and_read() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("detections.json");
        let detections = sample();
        write_detections_json(&path, &detections).expect("write");
        let restored = read_detections_json(&path).expect("read");
        assert_eq!(restored, detections);
    }

    #[test]
    fn test_per_tile_detections_are_accepted() {
        let json = r#"[
            {"bbox": {"xmin": 450, "ymin": 0, "xmax": 512, "ymax": 100},
             "confidence": 0.85, "class_id": 0, "class_name": "person",
             "source_tile": {"index": 0, "x_min": 0, "y_min": 0, "x_max": 512, "y_max": 400}},
            {"id": "6c1f0a0e-6a9e-4a57-9d4e-2d3f0a7b8c01",
             "bbox": {"xmin": 450, "ymin": 0, "xmax": 560, "ymax": 100},
             "confidence": 0.9, "class_id": 0, "class_name": "person",
             "area": 11000, "source": "tile_fused", "merged_count": 2}
        ]"#;
        let restored = from_json_str(json).expect("parse");
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].merged_count, 1);
        assert_eq!(restored[0].area, 6200.0);
        assert_eq!(restored[1].merged_count, 2);
        assert_eq!(restored[1].id.to_string(), "6c1f0a0e-6a9e-4a57-9d4e-2d3f0a7b8c01");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(from_json_str("{\"detections\": 3}").is_err());
        assert!(from_json_slice(b"not json").is_err());
    }
}
