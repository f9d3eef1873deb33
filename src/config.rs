//! Run configuration.
//!
//! [`TilingConfig`] is the raw, serde-friendly bag of options that can come
//! from a YAML file, environment variables or CLI flags. Nothing consumes it
//! directly: [`TilingConfig::validate`] turns it into a [`ValidatedConfig`]
//! once per request, and every pipeline stage takes the validated form, so
//! a bad value is reported before any tile work starts.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detect::DetectThresholds;
use crate::error::TilefuseError;
use crate::ir::ClassId;
use crate::merge::{MatchMetric, MergeOptions, MergeStrategy};
use crate::plan::TileGeometry;

/// Raw configuration surface.
///
/// Field names match the YAML keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TilingConfig {
    pub slice_height: u32,
    pub slice_width: u32,
    pub overlap_height_ratio: f64,
    pub overlap_width_ratio: f64,
    /// Derive tile size from the image size and `target_resolution`.
    pub auto_slice_resolution: bool,
    pub target_resolution: u32,
    pub postprocess_type: MergeStrategy,
    pub postprocess_match_threshold: f64,
    pub postprocess_match_metric: MatchMetric,
    pub confidence_threshold: f64,
    pub nms_threshold: f64,
    pub max_concurrent_tiles: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_timeout_ms: Option<u64>,
    /// Class names indexed by class id.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub class_names: Vec<String>,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            slice_height: 512,
            slice_width: 512,
            overlap_height_ratio: 0.2,
            overlap_width_ratio: 0.2,
            auto_slice_resolution: false,
            target_resolution: 512,
            postprocess_type: MergeStrategy::Nmm,
            postprocess_match_threshold: 0.5,
            postprocess_match_metric: MatchMetric::Iou,
            confidence_threshold: 0.3,
            nms_threshold: 0.45,
            max_concurrent_tiles: 1,
            tile_timeout_ms: None,
            class_names: Vec::new(),
        }
    }
}

impl TilingConfig {
    /// Loads a YAML config file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, TilefuseError> {
        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|source| TilefuseError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every field and builds the form the pipeline consumes.
    ///
    /// The error names the first offending field.
    pub fn validate(&self) -> Result<ValidatedConfig, TilefuseError> {
        let geometry = TileGeometry::new(
            self.slice_height,
            self.slice_width,
            self.overlap_height_ratio,
            self.overlap_width_ratio,
        )?;

        if self.auto_slice_resolution && self.target_resolution == 0 {
            return Err(TilefuseError::invalid_config(
                "target_resolution",
                "must be positive when auto_slice_resolution is enabled",
            ));
        }

        let thresholds = DetectThresholds {
            confidence: unit_interval("confidence_threshold", self.confidence_threshold)?,
            nms: unit_interval("nms_threshold", self.nms_threshold)?,
        };

        let merge = MergeOptions {
            strategy: self.postprocess_type,
            metric: self.postprocess_match_metric,
            match_threshold: unit_interval(
                "postprocess_match_threshold",
                self.postprocess_match_threshold,
            )?,
        };

        if self.max_concurrent_tiles == 0 {
            return Err(TilefuseError::invalid_config(
                "max_concurrent_tiles",
                "must be at least 1",
            ));
        }

        let tile_timeout = match self.tile_timeout_ms {
            Some(0) => {
                return Err(TilefuseError::invalid_config(
                    "tile_timeout_ms",
                    "must be positive (omit it to disable the timeout)",
                ))
            }
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };

        Ok(ValidatedConfig {
            geometry,
            auto_slice_resolution: self.auto_slice_resolution,
            target_resolution: self.target_resolution,
            thresholds,
            merge,
            max_concurrent_tiles: self.max_concurrent_tiles,
            tile_timeout,
            class_names: ClassNames::new(self.class_names.clone()),
        })
    }
}

fn unit_interval(field: &str, value: f64) -> Result<f64, TilefuseError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(TilefuseError::invalid_config(
            field,
            format!("{} is outside [0, 1]", value),
        ))
    }
}

/// Configuration that has passed validation.
///
/// Only [`TilingConfig::validate`] builds one, so holders can rely on every
/// invariant without re-checking.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    geometry: TileGeometry,
    auto_slice_resolution: bool,
    target_resolution: u32,
    thresholds: DetectThresholds,
    merge: MergeOptions,
    max_concurrent_tiles: usize,
    tile_timeout: Option<Duration>,
    class_names: ClassNames,
}

impl ValidatedConfig {
    /// Geometry as requested, before any automatic sizing.
    pub fn requested_geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    pub fn auto_slice_resolution(&self) -> bool {
        self.auto_slice_resolution
    }

    pub fn target_resolution(&self) -> u32 {
        self.target_resolution
    }

    pub fn thresholds(&self) -> &DetectThresholds {
        &self.thresholds
    }

    pub fn merge_options(&self) -> &MergeOptions {
        &self.merge
    }

    pub fn max_concurrent_tiles(&self) -> usize {
        self.max_concurrent_tiles
    }

    pub fn tile_timeout(&self) -> Option<Duration> {
        self.tile_timeout
    }

    pub fn class_names(&self) -> &ClassNames {
        &self.class_names
    }
}

/// Lookup table from class id to human-readable name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Reads a `classes.json` file: either a bare array of names or an
    /// object with a `classes` array (other keys, such as colors, are ignored).
    pub fn from_json_file(path: &Path) -> Result<Self, TilefuseError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ClassesFile {
            Bare(Vec<String>),
            Wrapped { classes: Vec<String> },
        }

        let text = fs::read_to_string(path)?;
        let parsed: ClassesFile =
            serde_json::from_str(&text).map_err(|source| TilefuseError::ClassNamesParse {
                path: path.to_path_buf(),
                source,
            })?;
        let names = match parsed {
            ClassesFile::Bare(names) => names,
            ClassesFile::Wrapped { classes } => classes,
        };
        Ok(Self { names })
    }

    /// Name for `class_id`, falling back to the decimal id.
    pub fn name_for(&self, class_id: ClassId) -> String {
        self.names
            .get(class_id.as_u32() as usize)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }

    /// Configured names with their class ids, in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(index, name)| (ClassId(index as u32), name.as_str()))
    }

    pub fn into_vec(self) -> Vec<String> {
        self.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let validated = TilingConfig::default().validate().expect("defaults are valid");
        assert_eq!(validated.requested_geometry().height(), 512);
        assert_eq!(validated.merge_options().strategy, MergeStrategy::Nmm);
        assert_eq!(validated.max_concurrent_tiles(), 1);
        assert!(validated.tile_timeout().is_none());
    }

    #[test]
    fn test_overlap_of_one_is_rejected() {
        let config = TilingConfig {
            overlap_width_ratio: 1.0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap_width_ratio"), "{err}");
    }

    #[test]
    fn test_thresholds_outside_unit_interval_are_rejected() {
        for config in [
            TilingConfig {
                confidence_threshold: 1.5,
                ..Default::default()
            },
            TilingConfig {
                nms_threshold: -0.1,
                ..Default::default()
            },
            TilingConfig {
                postprocess_match_threshold: f64::NAN,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(TilefuseError::InvalidConfig { .. })
            ));
        }
    }

    #[test]
    fn test_zero_pool_and_zero_timeout_are_rejected() {
        let pool = TilingConfig {
            max_concurrent_tiles: 0,
            ..Default::default()
        };
        assert!(pool.validate().is_err());

        let timeout = TilingConfig {
            tile_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(timeout.validate().is_err());
    }

    #[test]
    fn test_auto_sizing_needs_target_resolution() {
        let config = TilingConfig {
            auto_slice_resolution: true,
            target_resolution: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("target_resolution"));
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("tilefuse.yaml");
        fs::write(
            &path,
            "slice_height: 640\npostprocess_type: NMS\npostprocess_match_metric: IOS\nclass_names: [person, car]\n",
        )
        .expect("write config");

        let config = TilingConfig::from_yaml_file(&path).expect("parse config");
        assert_eq!(config.slice_height, 640);
        assert_eq!(config.slice_width, 512);
        assert_eq!(config.postprocess_type, MergeStrategy::Nms);
        assert_eq!(config.postprocess_match_metric, MatchMetric::Ios);
        assert_eq!(config.class_names, vec!["person", "car"]);
    }

    #[test]
    fn test_yaml_unknown_key_is_rejected() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("tilefuse.yaml");
        fs::write(&path, "slice_heigth: 640\n").expect("write config");
        assert!(matches!(
            TilingConfig::from_yaml_file(&path),
            Err(TilefuseError::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_class_names_file_formats() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let bare = temp.path().join("bare.json");
        let wrapped = temp.path().join("wrapped.json");
        fs::write(&bare, r#"["person", "bicycle"]"#).expect("write bare");
        fs::write(
            &wrapped,
            r#"{"classes": ["person", "bicycle"], "colors": {"person": [0, 255, 0]}}"#,
        )
        .expect("write wrapped");

        for path in [&bare, &wrapped] {
            let names = ClassNames::from_json_file(path).expect("parse classes");
            assert_eq!(names.name_for(ClassId(1)), "bicycle");
            assert_eq!(names.name_for(ClassId(9)), "9");
        }
    }
}
