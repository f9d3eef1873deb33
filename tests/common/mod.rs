#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use tilefuse::config::{TilingConfig, ValidatedConfig};
use tilefuse::detect::{DetectThresholds, Detector, DetectorError};
use tilefuse::ir::{BBoxXYXY, RawDetection};

/// An image whose pixels encode their own coordinates.
///
/// A detector that only sees a cropped tile can recover the tile origin with
/// [`tile_origin`].
pub fn coordinate_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x & 0xff) as u8,
            (((x >> 8) & 0x0f) | (((y >> 8) & 0x0f) << 4)) as u8,
            (y & 0xff) as u8,
        ])
    })
}

/// Top-left corner, in the source image, of a tile cut from [`coordinate_image`].
pub fn tile_origin(tile: &RgbImage) -> (u32, u32) {
    let Rgb([r, g, b]) = *tile.get_pixel(0, 0);
    let x = r as u32 | ((g as u32 & 0x0f) << 8);
    let y = b as u32 | ((g as u32 >> 4) << 8);
    (x, y)
}

pub fn raw(xmin: f64, ymin: f64, xmax: f64, ymax: f64, confidence: f64, class: u32) -> RawDetection {
    RawDetection::new(BBoxXYXY::from_xyxy(xmin, ymin, xmax, ymax), confidence, class)
}

pub fn validated(config: TilingConfig) -> ValidatedConfig {
    config.validate().expect("valid test config")
}

/// What a [`ScriptedDetector`] does for one tile.
#[derive(Clone, Debug)]
pub enum Script {
    Detections(Vec<RawDetection>),
    Fail(String),
    Panic,
    Sleep(Duration),
}

/// A detector that answers per tile origin from a fixed script.
///
/// Tiles without a script produce no detections.
#[derive(Default)]
pub struct ScriptedDetector {
    scripts: HashMap<(u32, u32), Script>,
    fallback: Option<Script>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, origin: (u32, u32), script: Script) -> Self {
        self.scripts.insert(origin, script);
        self
    }

    /// Script for every tile without its own entry.
    pub fn otherwise(mut self, script: Script) -> Self {
        self.fallback = Some(script);
        self
    }

    /// Sleeps before answering, so that concurrent tiles overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(
        &self,
        image: &RgbImage,
        _thresholds: &DetectThresholds,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let script = self
            .scripts
            .get(&tile_origin(image))
            .or(self.fallback.as_ref())
            .cloned();
        let result = match script {
            None => Ok(Vec::new()),
            Some(Script::Detections(detections)) => Ok(detections),
            Some(Script::Fail(message)) => Err(DetectorError::Inference(message)),
            Some(Script::Panic) => panic!("scripted detector panic"),
            Some(Script::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(Vec::new())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
