//! COCO JSON export of detection results.
//!
//! COCO bounding boxes use `[x, y, width, height]` in absolute pixels, with
//! `(x, y)` the top-left corner. Every annotation carries the detection's
//! confidence as `score`, the way COCO result files do.
//!
//! Image and annotation ids are assigned from 1 in output order. Category ids
//! are class ids; the category list holds every configured class name plus
//! any class that only shows up in the detections.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::config::ClassNames;
use crate::error::TilefuseError;
use crate::pipeline::ProcessOutcome;

#[derive(Debug, Serialize)]
struct CocoDataset {
    info: CocoInfo,
    images: Vec<CocoImage>,
    annotations: Vec<CocoAnnotation>,
    categories: Vec<CocoCategory>,
}

#[derive(Debug, Serialize)]
struct CocoInfo {
    description: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct CocoImage {
    id: u64,
    width: u32,
    height: u32,
    file_name: String,
}

#[derive(Debug, Serialize)]
struct CocoCategory {
    id: u64,
    name: String,
}

#[derive(Debug, Serialize)]
struct CocoAnnotation {
    id: u64,
    image_id: u64,
    category_id: u64,

    /// COCO bbox format: [x, y, width, height] with (x,y) as top-left corner
    bbox: [f64; 4],
    area: f64,
    iscrowd: u8,
    segmentation: Vec<Vec<f64>>,
    score: f64,
}

/// Writes all outcomes as one COCO JSON file.
pub fn write_coco(
    path: &Path,
    outcomes: &[ProcessOutcome],
    class_names: &ClassNames,
) -> Result<(), TilefuseError> {
    let file = File::create(path).map_err(TilefuseError::Io)?;
    let mut writer = BufWriter::new(file);

    let coco = outcomes_to_coco(outcomes, class_names);
    serde_json::to_writer_pretty(&mut writer, &coco).map_err(|source| {
        TilefuseError::JsonWrite {
            path: path.to_path_buf(),
            source,
        }
    })?;
    writer.flush().map_err(TilefuseError::Io)
}

/// COCO JSON rendering of [`write_coco`].
pub fn to_coco_string(
    outcomes: &[ProcessOutcome],
    class_names: &ClassNames,
) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&outcomes_to_coco(outcomes, class_names))
}

fn outcomes_to_coco(outcomes: &[ProcessOutcome], class_names: &ClassNames) -> CocoDataset {
    let mut categories: BTreeMap<u32, String> = class_names
        .iter()
        .map(|(class_id, name)| (class_id.as_u32(), name.to_string()))
        .collect();

    let mut images = Vec::with_capacity(outcomes.len());
    let mut annotations = Vec::new();

    for (image_id, outcome) in (1u64..).zip(outcomes) {
        images.push(CocoImage {
            id: image_id,
            width: outcome.width,
            height: outcome.height,
            file_name: outcome.image_id.clone(),
        });

        for det in &outcome.detections {
            categories
                .entry(det.class_id.as_u32())
                .or_insert_with(|| det.class_name.clone());

            annotations.push(CocoAnnotation {
                id: annotations.len() as u64 + 1,
                image_id,
                category_id: u64::from(det.class_id.as_u32()),
                bbox: [
                    det.bbox.xmin(),
                    det.bbox.ymin(),
                    det.bbox.width(),
                    det.bbox.height(),
                ],
                area: det.area,
                iscrowd: 0,
                segmentation: Vec::new(),
                score: det.confidence,
            });
        }
    }

    CocoDataset {
        info: CocoInfo {
            description: "tilefuse detections".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        images,
        annotations,
        categories: categories
            .into_iter()
            .map(|(id, name)| CocoCategory {
                id: u64::from(id),
                name,
            })
            .collect(),
    }
}
