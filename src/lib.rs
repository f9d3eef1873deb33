//! Tilefuse: sliced object detection for large images.
//!
//! Small objects vanish when a large image is shrunk to a detector's input
//! size. Tilefuse cuts the image into overlapping tiles, runs a detector on
//! each tile, moves every detection back into full-image coordinates and
//! fuses the duplicates that the overlap (or a tile edge) produced.
//!
//! # Modules
//!
//! - [`plan`]: Tile size selection, fixed or derived from the image size
//! - [`slice`]: Overlapping tile windows and tile cropping
//! - [`detect`]: The [`Detector`](detect::Detector) seam and the per-tile adapter
//! - [`merge`]: Cross-tile NMS / NMM fusion
//! - [`pipeline`]: Per-image orchestration with a bounded worker pool
//! - [`source`]: Image loading by id
//! - [`export`]: JSON, CSV and YOLO output
//! - [`config`]: Configuration surface and validation
//! - [`ir`]: Geometry and detection types
//! - [`error`]: Error types for tilefuse operations

pub mod config;
pub mod detect;
pub mod error;
pub mod export;
pub mod ir;
pub mod merge;
pub mod pipeline;
pub mod plan;
pub mod slice;
pub mod source;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

pub use error::TilefuseError;

use config::{ClassNames, TilingConfig};
use detect::CommandDetector;
use export::ExportFormat;
use ir::{ImageDimensions, Tile};
use merge::{MatchMetric, MergeStrategy};
use pipeline::{CancelToken, Orchestrator, OrchestratorOptions, ProcessOutcome, ProcessState};
use plan::TileGeometry;
use source::DirectoryImageSource;

/// The tilefuse CLI application.
#[derive(Parser)]
#[command(name = "tilefuse")]
#[command(version, author, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Show the tiles an image of the given size would be cut into.
    Plan(PlanArgs),
    /// Run a detector over an image or a directory of images.
    Detect(DetectArgs),
    /// Fuse an existing list of full-image detections (fused or per-tile).
    Merge(MergeArgs),
}

/// Tile geometry overrides.
#[derive(clap::Args, Debug, Default)]
struct GeometryArgs {
    /// Tile height in pixels.
    #[arg(long, env = "TILEFUSE_SLICE_HEIGHT")]
    slice_height: Option<u32>,

    /// Tile width in pixels.
    #[arg(long, env = "TILEFUSE_SLICE_WIDTH")]
    slice_width: Option<u32>,

    /// Vertical overlap between neighbouring tiles, in [0, 1).
    #[arg(long, env = "TILEFUSE_OVERLAP_HEIGHT_RATIO")]
    overlap_height_ratio: Option<f64>,

    /// Horizontal overlap between neighbouring tiles, in [0, 1).
    #[arg(long, env = "TILEFUSE_OVERLAP_WIDTH_RATIO")]
    overlap_width_ratio: Option<f64>,

    /// Derive the tile size from the image size and --target-resolution.
    #[arg(
        long,
        env = "TILEFUSE_AUTO_SLICE_RESOLUTION",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    auto_slice_resolution: Option<bool>,

    /// Approximate tile side used with --auto-slice-resolution.
    #[arg(long, env = "TILEFUSE_TARGET_RESOLUTION")]
    target_resolution: Option<u32>,
}

/// Merge overrides.
#[derive(clap::Args, Debug, Default)]
struct MergeOverrides {
    /// Merge strategy ('NMM' or 'NMS').
    #[arg(long, env = "TILEFUSE_POSTPROCESS_TYPE")]
    postprocess_type: Option<MergeStrategy>,

    /// Minimum match score for two boxes to be fused, in [0, 1].
    #[arg(long, env = "TILEFUSE_POSTPROCESS_MATCH_THRESHOLD")]
    postprocess_match_threshold: Option<f64>,

    /// Match score ('IOU' or 'IOS').
    #[arg(long, env = "TILEFUSE_POSTPROCESS_MATCH_METRIC")]
    postprocess_match_metric: Option<MatchMetric>,
}

/// Detector and pool overrides.
#[derive(clap::Args, Debug, Default)]
struct DetectOverrides {
    /// Minimum detection confidence, in [0, 1].
    #[arg(long, env = "TILEFUSE_CONFIDENCE_THRESHOLD")]
    confidence_threshold: Option<f64>,

    /// IoU threshold for the detector's own NMS, in [0, 1].
    #[arg(long, env = "TILEFUSE_NMS_THRESHOLD")]
    nms_threshold: Option<f64>,

    /// Maximum number of tiles in flight at once.
    #[arg(long, env = "TILEFUSE_MAX_CONCURRENT_TILES")]
    max_concurrent_tiles: Option<usize>,

    /// Fail a tile whose detector call takes longer than this.
    #[arg(long, env = "TILEFUSE_TILE_TIMEOUT_MS")]
    tile_timeout_ms: Option<u64>,
}

/// Arguments for the plan subcommand.
#[derive(clap::Args)]
struct PlanArgs {
    /// Image width in pixels.
    #[arg(long)]
    width: u32,

    /// Image height in pixels.
    #[arg(long)]
    height: u32,

    /// YAML config file.
    #[arg(long, env = "TILEFUSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    geometry: GeometryArgs,

    /// Output format ('text' or 'json').
    #[arg(long, default_value = "text")]
    output: String,
}

/// Arguments for the detect subcommand.
#[derive(clap::Args)]
struct DetectArgs {
    /// Image file, or a directory searched recursively for images.
    input: PathBuf,

    /// Detector program, run once per tile (PNG on stdin, JSON on stdout).
    #[arg(long, env = "TILEFUSE_DETECTOR_CMD")]
    detector_cmd: PathBuf,

    /// Argument passed to the detector program (repeatable).
    #[arg(long = "detector-arg", allow_hyphen_values = true)]
    detector_args: Vec<String>,

    /// YAML config file.
    #[arg(long, env = "TILEFUSE_CONFIG")]
    config: Option<PathBuf>,

    /// classes.json with class names indexed by class id.
    #[arg(long, env = "TILEFUSE_CLASSES")]
    classes: Option<PathBuf>,

    #[command(flatten)]
    geometry: GeometryArgs,

    #[command(flatten)]
    merge: MergeOverrides,

    #[command(flatten)]
    detect: DetectOverrides,

    /// Output file (a directory for YOLO output of several images). Defaults to stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
    format: ExportFormat,

    /// Print a text report per image to stderr.
    #[arg(long)]
    report: bool,
}

/// Arguments for the merge subcommand.
#[derive(clap::Args)]
struct MergeArgs {
    /// JSON file with full-image detections: a bare array or a detect result,
    /// holding fused detections or per-tile ones with a `source_tile`.
    input: PathBuf,

    /// YAML config file.
    #[arg(long, env = "TILEFUSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    merge: MergeOverrides,

    /// Output file. Defaults to stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Run the tilefuse CLI.
///
/// This is the main entry point for the CLI, called from `main.rs`.
pub fn run() -> Result<(), TilefuseError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Some(Commands::Plan(args)) => run_plan(args),
        Some(Commands::Detect(args)) => run_detect(args),
        Some(Commands::Merge(args)) => run_merge(args),
        None => {
            println!("tilefuse {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Sliced object detection for large images.");
            println!();
            println!("Run 'tilefuse --help' for usage information.");
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // A subscriber may already be installed when running inside a test harness.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<TilingConfig, TilefuseError> {
    match path {
        Some(path) => TilingConfig::from_yaml_file(path),
        None => Ok(TilingConfig::default()),
    }
}

impl GeometryArgs {
    fn apply(&self, config: &mut TilingConfig) {
        if let Some(v) = self.slice_height {
            config.slice_height = v;
        }
        if let Some(v) = self.slice_width {
            config.slice_width = v;
        }
        if let Some(v) = self.overlap_height_ratio {
            config.overlap_height_ratio = v;
        }
        if let Some(v) = self.overlap_width_ratio {
            config.overlap_width_ratio = v;
        }
        if let Some(v) = self.auto_slice_resolution {
            config.auto_slice_resolution = v;
        }
        if let Some(v) = self.target_resolution {
            config.target_resolution = v;
        }
    }
}

impl MergeOverrides {
    fn apply(&self, config: &mut TilingConfig) {
        if let Some(v) = self.postprocess_type {
            config.postprocess_type = v;
        }
        if let Some(v) = self.postprocess_match_threshold {
            config.postprocess_match_threshold = v;
        }
        if let Some(v) = self.postprocess_match_metric {
            config.postprocess_match_metric = v;
        }
    }
}

impl DetectOverrides {
    fn apply(&self, config: &mut TilingConfig) {
        if let Some(v) = self.confidence_threshold {
            config.confidence_threshold = v;
        }
        if let Some(v) = self.nms_threshold {
            config.nms_threshold = v;
        }
        if let Some(v) = self.max_concurrent_tiles {
            config.max_concurrent_tiles = v;
        }
        if let Some(v) = self.tile_timeout_ms {
            config.tile_timeout_ms = Some(v);
        }
    }
}

/// JSON form of `tilefuse plan`.
#[derive(Serialize)]
struct PlanReport {
    image_width: u32,
    image_height: u32,
    geometry: TileGeometry,
    tiles: Vec<Tile>,
}

/// Execute the plan subcommand.
fn run_plan(args: PlanArgs) -> Result<(), TilefuseError> {
    let mut config = load_config(args.config.as_deref())?;
    args.geometry.apply(&mut config);
    let validated = config.validate()?;

    let dims = ImageDimensions::new(args.width, args.height)?;
    let geometry = plan::plan(
        dims,
        validated.requested_geometry(),
        validated.auto_slice_resolution(),
        validated.target_resolution(),
    )?;
    let tiles = slice::slice(dims, &geometry)?;

    match args.output.as_str() {
        "json" => {
            let report = PlanReport {
                image_width: dims.width(),
                image_height: dims.height(),
                geometry,
                tiles,
            };
            let json = serde_json::to_string_pretty(&report).map_err(|source| {
                TilefuseError::JsonWrite {
                    path: PathBuf::from("<stdout>"),
                    source,
                }
            })?;
            println!("{json}");
        }
        "text" => {
            println!("Image: {}x{}", dims.width(), dims.height());
            println!(
                "Tile size: {}x{} (overlap {:.2} wide, {:.2} high; step {}x{})",
                geometry.width(),
                geometry.height(),
                geometry.overlap_width_ratio(),
                geometry.overlap_height_ratio(),
                geometry.step_width(),
                geometry.step_height()
            );
            println!("Tiles: {}", tiles.len());
            for tile in &tiles {
                println!("  - {tile}");
            }
        }
        other => {
            return Err(TilefuseError::UnsupportedFormat(format!(
                "'{}' (supported: text, json)",
                other
            )));
        }
    }

    Ok(())
}

/// Execute the detect subcommand.
fn run_detect(args: DetectArgs) -> Result<(), TilefuseError> {
    let mut config = load_config(args.config.as_deref())?;
    args.geometry.apply(&mut config);
    args.merge.apply(&mut config);
    args.detect.apply(&mut config);
    if let Some(path) = &args.classes {
        config.class_names = ClassNames::from_json_file(path)?.into_vec();
    }
    let validated = config.validate()?;

    let (source, image_ids) = resolve_input(&args.input)?;
    if image_ids.is_empty() {
        warn!(input = %args.input.display(), "no images found");
    }

    let detector = CommandDetector::new(args.detector_cmd.clone()).with_args(&args.detector_args);
    let orchestrator = Orchestrator::new(Arc::new(detector), OrchestratorOptions::from(&validated));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let results = runtime.block_on(async {
        let cancel = CancelToken::new();
        let on_interrupt = cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                on_interrupt.cancel();
            }
        });

        let results = orchestrator
            .process_batch(&source, &image_ids, &validated, &cancel)
            .await;
        interrupt.abort();
        results
    });

    let mut outcomes = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (_, result) in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    if args.report {
        for outcome in &outcomes {
            eprintln!("{outcome}");
        }
    }
    write_outcomes(
        &outcomes,
        args.format,
        args.output.as_deref(),
        validated.class_names(),
    )?;
    info!(images = outcomes.len(), "wrote results");

    if let Some(e) = first_error {
        return Err(e);
    }
    if let Some(failed) = outcomes.iter().find(|o| o.state == ProcessState::Failed) {
        return Err(TilefuseError::DetectionFailed {
            image_id: failed.image_id.clone(),
            failed_tiles: failed.stats.failed_tiles,
            total_tiles: failed.stats.tile_count,
        });
    }
    Ok(())
}

fn resolve_input(input: &Path) -> Result<(DirectoryImageSource, Vec<String>), TilefuseError> {
    if input.is_dir() {
        let source = DirectoryImageSource::new(input);
        let ids = source.list()?;
        return Ok((source, ids));
    }

    let file_name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|_| input.is_file())
        .ok_or_else(|| TilefuseError::ImageNotFound {
            image_id: input.display().to_string(),
        })?;
    let root = input
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((DirectoryImageSource::new(root), vec![file_name]))
}

fn write_outcomes(
    outcomes: &[ProcessOutcome],
    format: ExportFormat,
    output: Option<&Path>,
    class_names: &ClassNames,
) -> Result<(), TilefuseError> {
    match (format, output) {
        (ExportFormat::Json, Some(path)) => export::write_json(path, outcomes),
        (ExportFormat::Json, None) => {
            let json = export::to_json_string(outcomes).map_err(|source| {
                TilefuseError::JsonWrite {
                    path: PathBuf::from("<stdout>"),
                    source,
                }
            })?;
            println!("{json}");
            Ok(())
        }
        (ExportFormat::Csv, Some(path)) => export::write_csv(path, outcomes),
        (ExportFormat::Csv, None) => {
            print!("{}", export::to_csv_string(outcomes)?);
            Ok(())
        }
        (ExportFormat::Yolo, output) => write_yolo_outcomes(outcomes, output),
        (ExportFormat::Coco, Some(path)) => export::write_coco(path, outcomes, class_names),
        (ExportFormat::Coco, None) => {
            let json = export::to_coco_string(outcomes, class_names).map_err(|source| {
                TilefuseError::JsonWrite {
                    path: PathBuf::from("<stdout>"),
                    source,
                }
            })?;
            println!("{json}");
            Ok(())
        }
    }
}

fn write_yolo_outcomes(
    outcomes: &[ProcessOutcome],
    output: Option<&Path>,
) -> Result<(), TilefuseError> {
    match (outcomes, output) {
        ([single], Some(path)) if !path.is_dir() => export::write_yolo(path, single),
        ([single], None) => {
            print!("{}", export::to_yolo_string(single));
            Ok(())
        }
        (_, Some(dir)) => {
            std::fs::create_dir_all(dir)?;
            for outcome in outcomes {
                let label = dir.join(Path::new(&outcome.image_id).with_extension("txt"));
                if let Some(parent) = label.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                export::write_yolo(&label, outcome)?;
            }
            Ok(())
        }
        (_, None) => Err(TilefuseError::UnsupportedFormat(
            "YOLO output for several images needs --output <DIR>".to_string(),
        )),
    }
}

/// Execute the merge subcommand.
fn run_merge(args: MergeArgs) -> Result<(), TilefuseError> {
    let mut config = load_config(args.config.as_deref())?;
    args.merge.apply(&mut config);
    let validated = config.validate()?;

    let detections = ir::io_json::read_detections_json(&args.input)?;
    let fused = merge::merge(&detections, validated.merge_options())?;

    match args.output {
        Some(path) => ir::io_json::write_detections_json(&path, &fused),
        None => {
            let json = ir::io_json::to_json_string(&fused).map_err(|source| {
                TilefuseError::JsonWrite {
                    path: PathBuf::from("<stdout>"),
                    source,
                }
            })?;
            println!("{json}");
            Ok(())
        }
    }
}
