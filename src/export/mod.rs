//! Writing detection results.
//!
//! Four output formats:
//! - **JSON**: the full result document per image (detections, stats and
//!   tile failures). One image is written as an object, several as an array.
//! - **CSV**: one row per fused detection, across all images.
//! - **YOLO**: one `class_id cx cy w h` line per detection, normalized to the
//!   image size, for a single image.
//! - **COCO**: one COCO JSON document across all images, with scores.

mod coco;

pub use coco::{to_coco_string, write_coco};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::TilefuseError;
use crate::pipeline::ProcessOutcome;

/// Output format for `tilefuse detect`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Yolo,
    Coco,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    image_id: &'a str,
    detection_id: String,
    class_id: u32,
    class_name: &'a str,
    confidence: f64,
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
    area: f64,
}

/// Writes the JSON result document(s) to `path`.
pub fn write_json(path: &Path, outcomes: &[ProcessOutcome]) -> Result<(), TilefuseError> {
    let file = File::create(path).map_err(TilefuseError::Io)?;
    let mut writer = BufWriter::new(file);

    let written = match outcomes {
        [single] => serde_json::to_writer_pretty(&mut writer, single),
        many => serde_json::to_writer_pretty(&mut writer, many),
    };
    written.map_err(|source| TilefuseError::JsonWrite {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(TilefuseError::Io)
}

/// Serializes the JSON result document(s).
pub fn to_json_string(outcomes: &[ProcessOutcome]) -> Result<String, serde_json::Error> {
    match outcomes {
        [single] => serde_json::to_string_pretty(single),
        many => serde_json::to_string_pretty(many),
    }
}

/// Writes every fused detection of every outcome as CSV.
pub fn write_csv(path: &Path, outcomes: &[ProcessOutcome]) -> Result<(), TilefuseError> {
    let file = File::create(path).map_err(TilefuseError::Io)?;
    let mut csv_writer = csv::Writer::from_writer(BufWriter::new(file));
    write_csv_rows(&mut csv_writer, outcomes)?;

    csv_writer
        .into_inner()
        .map_err(|e| TilefuseError::Io(e.into_error()))?
        .flush()
        .map_err(TilefuseError::Io)
}

/// CSV rendering of [`write_csv`].
pub fn to_csv_string(outcomes: &[ProcessOutcome]) -> Result<String, TilefuseError> {
    let mut csv_writer = csv::Writer::from_writer(Vec::new());
    write_csv_rows(&mut csv_writer, outcomes)?;

    let bytes = csv_writer
        .into_inner()
        .map_err(|e| TilefuseError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| TilefuseError::UnsupportedFormat(e.to_string()))
}

fn write_csv_rows<W: Write>(
    csv_writer: &mut csv::Writer<W>,
    outcomes: &[ProcessOutcome],
) -> Result<(), TilefuseError> {
    let mut rows = 0usize;
    for outcome in outcomes {
        for det in &outcome.detections {
            csv_writer.serialize(CsvRow {
                image_id: &outcome.image_id,
                detection_id: det.id.to_string(),
                class_id: det.class_id.as_u32(),
                class_name: &det.class_name,
                confidence: det.confidence,
                xmin: det.bbox.xmin(),
                ymin: det.bbox.ymin(),
                xmax: det.bbox.xmax(),
                ymax: det.bbox.ymax(),
                area: det.area,
            })?;
            rows += 1;
        }
    }
    if rows == 0 {
        // serde only emits the header alongside the first record.
        csv_writer.write_record([
            "image_id",
            "detection_id",
            "class_id",
            "class_name",
            "confidence",
            "xmin",
            "ymin",
            "xmax",
            "ymax",
            "area",
        ])?;
    }
    Ok(())
}

/// Writes the detections of one image as a YOLO label file.
pub fn write_yolo(path: &Path, outcome: &ProcessOutcome) -> Result<(), TilefuseError> {
    let mut file = File::create(path).map_err(TilefuseError::Io)?;
    file.write_all(to_yolo_string(outcome).as_bytes())
        .map_err(TilefuseError::Io)
}

/// YOLO label lines for one image, six decimals per value.
pub fn to_yolo_string(outcome: &ProcessOutcome) -> String {
    let (width, height) = (outcome.width as f64, outcome.height as f64);
    let mut out = String::new();
    for det in &outcome.detections {
        let (cx, cy, w, h) = det.bbox.to_normalized(width, height).to_cxcywh();
        out.push_str(&format!(
            "{} {:.6} {:.6} {:.6} {:.6}\n",
            det.class_id, cx, cy, w, h
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BBoxXYXY, ClassId, FusedDetection};
    use crate::pipeline::{ProcessState, ProcessStats};
    use crate::plan::TileGeometry;

    fn outcome(image_id: &str, detections: Vec<FusedDetection>) -> ProcessOutcome {
        ProcessOutcome {
            image_id: image_id.into(),
            width: 800,
            height: 400,
            geometry: TileGeometry::new(512, 512, 0.2, 0.2).expect("valid"),
            state: ProcessState::Done,
            detections,
            stats: ProcessStats::default(),
            failures: Vec::new(),
        }
    }

    fn person() -> FusedDetection {
        FusedDetection::new(
            BBoxXYXY::from_xyxy(200.0, 100.0, 600.0, 300.0),
            0.9,
            ClassId(0),
            "person",
            2,
        )
    }

    #[test]
    fn yolo_lines_are_normalized_center_format() {
        let text = to_yolo_string(&outcome("a.png", vec![person()]));
        assert_eq!(text, "0 0.500000 0.500000 0.500000 0.500000\n");
    }

    #[test]
    fn csv_has_header_and_one_row_per_detection() {
        let outcomes = vec![
            outcome("a.png", vec![person()]),
            outcome("b.png", vec![person(), person()]),
        ];
        let text = to_csv_string(&outcomes).expect("csv");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "image_id,detection_id,class_id,class_name,confidence,xmin,ymin,xmax,ymax,area"
        );
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("a.png,"));
        assert!(lines[3].ends_with(",person,0.9,200.0,100.0,600.0,300.0,80000.0"));
    }

    #[test]
    fn csv_without_detections_still_has_header() {
        let text = to_csv_string(&[outcome("empty.png", Vec::new())]).expect("csv");
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn json_single_outcome_is_an_object() {
        let single = to_json_string(&[outcome("a.png", vec![person()])]).expect("json");
        let value: serde_json::Value = serde_json::from_str(&single).expect("parse");
        assert_eq!(value["image_id"], "a.png");

        let restored = crate::ir::io_json::from_json_str(&single).expect("read back");
        assert_eq!(restored.len(), 1);

        let many = to_json_string(&[outcome("a.png", vec![]), outcome("b.png", vec![])])
            .expect("json");
        let value: serde_json::Value = serde_json::from_str(&many).expect("parse");
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn files_are_written() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let outcomes = vec![outcome("a.png", vec![person()])];

        write_json(&temp.path().join("out.json"), &outcomes).expect("json");
        write_csv(&temp.path().join("out.csv"), &outcomes).expect("csv");
        write_yolo(&temp.path().join("out.txt"), &outcomes[0]).expect("yolo");

        let yolo = std::fs::read_to_string(temp.path().join("out.txt")).expect("read");
        assert_eq!(yolo.lines().count(), 1);
    }
}
