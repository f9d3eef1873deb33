//! Per-image orchestration.
//!
//! An [`Orchestrator`] takes one image through planning, slicing, per-tile
//! detection and merging. Tiles run concurrently in a bounded pool; a tile
//! that fails is recorded and the rest carry on, so an image only fails
//! outright when every tile does.

mod report;

pub use report::{ProcessOutcome, ProcessState, ProcessStats, TileFailure, TileTiming};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ValidatedConfig;
use crate::detect::{DetectionAdapter, Detector, DetectorError};
use crate::error::TilefuseError;
use crate::ir::{Detection, ImageDimensions, Tile};
use crate::merge::merge;
use crate::plan::plan;
use crate::slice::{crop, slice};
use crate::source::ImageSource;

/// Cooperative cancellation shared between a caller and running pipelines.
///
/// Clones observe the same flag. Cancelling aborts every tile that has not
/// finished yet; a cancelled image yields [`TilefuseError::Cancelled`].
#[derive(Clone, Debug)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only returns once cancelled.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker pool settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Upper bound on in-flight detector calls. Zero is treated as one.
    pub max_concurrent_tiles: usize,
    pub tile_timeout: Option<Duration>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_tiles: 1,
            tile_timeout: None,
        }
    }
}

impl From<&ValidatedConfig> for OrchestratorOptions {
    fn from(config: &ValidatedConfig) -> Self {
        Self {
            max_concurrent_tiles: config.max_concurrent_tiles(),
            tile_timeout: config.tile_timeout(),
        }
    }
}

/// Runs the tiled detection pipeline with a shared detector.
pub struct Orchestrator {
    detector: Arc<dyn Detector>,
    options: OrchestratorOptions,
}

struct TileRun {
    tile: Tile,
    elapsed: Duration,
    result: Result<Vec<Detection>, DetectorError>,
}

impl Orchestrator {
    pub fn new(detector: Arc<dyn Detector>, options: OrchestratorOptions) -> Self {
        let options = OrchestratorOptions {
            max_concurrent_tiles: options.max_concurrent_tiles.max(1),
            ..options
        };
        Self { detector, options }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Detects objects in one decoded image.
    ///
    /// Returns `Ok` for every image whose tiles all ran to completion, even
    /// if some or all of them failed; check [`ProcessOutcome::state`].
    ///
    /// # Errors
    /// - [`TilefuseError::InvalidConfig`] if planning or slicing rejects the geometry.
    /// - [`TilefuseError::MergeFailed`] if the collected detections cannot be merged.
    /// - [`TilefuseError::Cancelled`] if `cancel` fires first.
    pub async fn process(
        &self,
        image_id: &str,
        image: Arc<RgbImage>,
        config: &ValidatedConfig,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome, TilefuseError> {
        let started = Instant::now();

        enter(image_id, ProcessState::Planning);
        let dims = ImageDimensions::new(image.width(), image.height())?;
        let geometry = plan(
            dims,
            config.requested_geometry(),
            config.auto_slice_resolution(),
            config.target_resolution(),
        )?;

        enter(image_id, ProcessState::Slicing);
        let tiles = slice(dims, &geometry)?;
        debug!(
            image_id,
            tiles = tiles.len(),
            tile_width = geometry.width(),
            tile_height = geometry.height(),
            "sliced image"
        );

        enter(image_id, ProcessState::Detecting);
        let adapter = Arc::new(
            DetectionAdapter::new(
                Arc::clone(&self.detector),
                *config.thresholds(),
                config.class_names().clone(),
            )
            .with_timeout(self.options.tile_timeout),
        );
        let runs = self
            .detect_tiles(image_id, &image, &tiles, adapter, cancel)
            .await?;

        let mut stats = ProcessStats {
            tile_count: tiles.len(),
            ..Default::default()
        };
        let mut failures = Vec::new();
        let mut collected = Vec::new();
        for run in runs {
            stats.tile_timings.push(TileTiming {
                tile: run.tile,
                elapsed: run.elapsed,
                succeeded: run.result.is_ok(),
                detections: run.result.as_ref().map_or(0, Vec::len),
            });
            match run.result {
                Ok(detections) => {
                    stats.succeeded_tiles += 1;
                    collected.extend(detections);
                }
                Err(error) => {
                    warn!(image_id, tile = %run.tile, error = %error, "tile failed");
                    stats.failed_tiles += 1;
                    failures.push(TileFailure {
                        tile: run.tile,
                        error,
                    });
                }
            }
        }
        stats.detections_before_merge = collected.len();

        let (state, detections) = if stats.succeeded_tiles == 0 {
            (ProcessState::Failed, Vec::new())
        } else {
            enter(image_id, ProcessState::Merging);
            let fused = merge(&collected, config.merge_options()).map_err(|source| {
                TilefuseError::MergeFailed {
                    succeeded_tiles: stats.succeeded_tiles,
                    source,
                }
            })?;
            let state = if failures.is_empty() {
                ProcessState::Done
            } else {
                ProcessState::PartiallyFailed
            };
            (state, fused)
        };

        stats.record_fused(&detections);
        stats.elapsed = started.elapsed();
        enter(image_id, state);
        info!(
            image_id,
            state = %state,
            tiles = stats.tile_count,
            failed_tiles = stats.failed_tiles,
            detections = detections.len(),
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "processed image"
        );

        Ok(ProcessOutcome {
            image_id: image_id.to_string(),
            width: dims.width(),
            height: dims.height(),
            geometry,
            state,
            detections,
            stats,
            failures,
        })
    }

    /// Loads `image_id` from `source`, then processes it.
    ///
    /// A missing or undecodable image fails before any tile is attempted.
    pub async fn process_from_source(
        &self,
        source: &dyn ImageSource,
        image_id: &str,
        config: &ValidatedConfig,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome, TilefuseError> {
        let image = source.load(image_id)?;
        self.process(image_id, Arc::new(image), config, cancel).await
    }

    /// Processes images one after another, one result per image.
    ///
    /// An error on one image does not stop the batch. Cancellation does:
    /// images not yet started are left out of the result.
    pub async fn process_batch(
        &self,
        source: &dyn ImageSource,
        image_ids: &[String],
        config: &ValidatedConfig,
        cancel: &CancelToken,
    ) -> Vec<(String, Result<ProcessOutcome, TilefuseError>)> {
        let mut results = Vec::with_capacity(image_ids.len());

        for image_id in image_ids {
            if cancel.is_cancelled() {
                info!(
                    processed = results.len(),
                    remaining = image_ids.len() - results.len(),
                    "batch cancelled"
                );
                break;
            }
            let result = self
                .process_from_source(source, image_id, config, cancel)
                .await;
            if let Err(e) = &result {
                warn!(image_id = %image_id, error = %e, "image failed");
            }
            results.push((image_id.clone(), result));
        }

        results
    }

    async fn detect_tiles(
        &self,
        image_id: &str,
        image: &Arc<RgbImage>,
        tiles: &[Tile],
        adapter: Arc<DetectionAdapter>,
        cancel: &CancelToken,
    ) -> Result<Vec<TileRun>, TilefuseError> {
        let total = tiles.len();
        if cancel.is_cancelled() {
            return Err(TilefuseError::Cancelled {
                completed_tiles: 0,
                total_tiles: total,
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_tiles));
        let mut set = JoinSet::new();
        let mut pending = HashMap::with_capacity(total);

        for &tile in tiles {
            let semaphore = Arc::clone(&semaphore);
            let adapter = Arc::clone(&adapter);
            let image = Arc::clone(image);

            let handle = set.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let started = Instant::now();
                        let pixels = crop(&image, &tile);
                        let result = adapter.run(&pixels, &tile).await;
                        drop(permit);
                        (started.elapsed(), result)
                    }
                    Err(closed) => (
                        Duration::ZERO,
                        Err(DetectorError::TaskAborted(closed.to_string())),
                    ),
                }
            });
            pending.insert(handle.id(), tile);
        }

        let mut runs = Vec::with_capacity(total);
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    set.abort_all();
                    info!(image_id, completed = runs.len(), total, "cancelled");
                    return Err(TilefuseError::Cancelled {
                        completed_tiles: runs.len(),
                        total_tiles: total,
                    });
                }
                joined = set.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (id, elapsed, result) = match joined {
                Ok((id, (elapsed, result))) => (id, elapsed, result),
                Err(join_error) => (
                    join_error.id(),
                    Duration::ZERO,
                    Err(DetectorError::TaskAborted(join_error.to_string())),
                ),
            };
            let Some(tile) = pending.remove(&id) else {
                continue;
            };
            debug!(image_id, tile = %tile, ok = result.is_ok(), "tile finished");
            runs.push(TileRun {
                tile,
                elapsed,
                result,
            });
        }

        // Completion order depends on scheduling; merge input must not.
        runs.sort_by_key(|run| run.tile.index);
        Ok(runs)
    }
}

fn enter(image_id: &str, state: ProcessState) {
    debug!(image_id, state = %state, "entering stage");
}
