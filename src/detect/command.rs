//! Detector backed by an external program.
//!
//! The program is started once per tile. It receives the tile as a PNG on
//! stdin and the thresholds and tile size in `TILEFUSE_*` environment
//! variables, and must print a JSON array to stdout:
//!
//! ```json
//! [{"bbox": [x1, y1, x2, y2], "confidence": 0.91, "class_id": 0, "class_name": "person"}]
//! ```
//!
//! Boxes are in tile pixels. `class_name` is optional.

use std::ffi::OsString;
use std::io::Cursor;
use std::process::Stdio;

use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{DetectThresholds, Detector, DetectorError};
use crate::ir::{BBoxXYXY, ClassId, RawDetection};

#[derive(Deserialize)]
struct CommandDetection {
    bbox: [f64; 4],
    confidence: f64,
    class_id: u32,
    #[serde(default)]
    class_name: Option<String>,
}

/// Runs an external program per tile.
#[derive(Clone, Debug)]
pub struct CommandDetector {
    program: OsString,
    args: Vec<OsString>,
    name: String,
}

impl CommandDetector {
    pub fn new(program: impl Into<OsString>) -> Self {
        let program = program.into();
        let name = program.to_string_lossy().into_owned();
        Self {
            program,
            args: Vec::new(),
            name,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(
        &self,
        image: &RgbImage,
        thresholds: &DetectThresholds,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(DetectorError::Encode)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TILEFUSE_CONFIDENCE_THRESHOLD", thresholds.confidence.to_string())
            .env("TILEFUSE_NMS_THRESHOLD", thresholds.nms.to_string())
            .env("TILEFUSE_TILE_WIDTH", image.width().to_string())
            .env("TILEFUSE_TILE_HEIGHT", image.height().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DetectorError::Spawn)?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A program that exits without reading its input is judged by its exit status.
                if let Err(e) = stdin.write_all(&png).await {
                    debug!(error = %e, "detector closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(DetectorError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(detector = %self.name, status = %output.status, "detector process failed");
            return Err(DetectorError::CommandFailed {
                status: output.status.to_string(),
                stderr,
            });
        }

        parse_output(&output.stdout)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Parses the JSON a command detector prints.
pub fn parse_output(bytes: &[u8]) -> Result<Vec<RawDetection>, DetectorError> {
    let parsed: Vec<CommandDetection> =
        serde_json::from_slice(bytes).map_err(DetectorError::InvalidOutput)?;

    Ok(parsed
        .into_iter()
        .map(|d| {
            let [x1, y1, x2, y2] = d.bbox;
            RawDetection {
                bbox: BBoxXYXY::from_xyxy(x1, y1, x2, y2),
                confidence: d.confidence,
                class_id: ClassId(d.class_id),
                class_name: d.class_name,
            }
        })
        .collect())
}
