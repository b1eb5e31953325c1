//! Model deploy configuration
//!
//! Exported detection and segmentation models ship with a JSON description of
//! the preprocessing they expect (`Preprocess`) and, for detectors, the class
//! names (`label_list`). PaddleSeg style configs nest the same information
//! under `Deploy.transforms`; both layouts are accepted.

use crate::error::{NennError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Width/height pair accepted either as a single integer or as `[h, w]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Size {
    /// Square size
    Square(u32),
    /// Explicit `[height, width]`
    Pair([u32; 2]),
}

impl Size {
    /// Return `(height, width)`
    #[must_use]
    pub fn hw(self) -> (u32, u32) {
        match self {
            Self::Square(s) => (s, s),
            Self::Pair([h, w]) => (h, w),
        }
    }
}

/// Channel order produced by the `Decode` step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Normalization flavour of the `Normalize` step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NormType {
    /// `(x - mean) / std` after optional scaling
    #[default]
    #[serde(rename = "mean_std")]
    MeanStd,
    /// Only the optional `1/255` scaling
    #[serde(rename = "none")]
    ScaleOnly,
}

/// A single preprocessing step, tagged by `"type"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PreprocessOp {
    Decode {
        #[serde(default)]
        mode: ChannelOrder,
    },
    Resize {
        #[serde(default)]
        target_size: Option<Size>,
        #[serde(default)]
        keep_ratio: bool,
        #[serde(default)]
        resize_short: Option<u32>,
        #[serde(default = "default_interp")]
        interp: i32,
    },
    #[serde(alias = "NormalizeImage")]
    Normalize {
        #[serde(default = "default_mean_std")]
        mean: Vec<f32>,
        #[serde(default = "default_mean_std")]
        std: Vec<f32>,
        #[serde(default = "default_true")]
        is_scale: bool,
        #[serde(default)]
        norm_type: NormType,
    },
    #[serde(alias = "CenterCrop")]
    Crop { crop_size: Size },
    Permute {},
}

fn default_interp() -> i32 {
    1
}

fn default_mean_std() -> Vec<f32> {
    vec![0.5, 0.5, 0.5]
}

fn default_true() -> bool {
    true
}

impl PreprocessOp {
    /// Name of the step as it appears in the config
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "Decode",
            Self::Resize { .. } => "Resize",
            Self::Normalize { .. } => "Normalize",
            Self::Crop { .. } => "Crop",
            Self::Permute {} => "Permute",
        }
    }
}

/// Parsed deploy config of an exported model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeployConfig {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    /// Score threshold the exporter recommends for drawing boxes
    #[serde(default)]
    pub draw_threshold: Option<f32>,
    #[serde(rename = "Preprocess", alias = "transforms", default)]
    pub preprocess: Vec<PreprocessOp>,
    #[serde(default)]
    pub label_list: Vec<String>,
}

impl DeployConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    /// - File cannot be read
    /// - Malformed JSON or unknown preprocessing step
    /// - Validation failures (see [`DeployConfig::validate`])
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NennError::file_io_error("read model config", path, &e))?;
        let config = Self::from_json_str(&text)?;
        log::debug!(
            "Loaded deploy config from {} ({} preprocessing steps, {} labels)",
            path.display(),
            config.preprocess.len(),
            config.label_list.len()
        );
        Ok(config)
    }

    /// Parse and validate a config from JSON text
    ///
    /// # Errors
    /// - Malformed JSON or unknown preprocessing step
    /// - Validation failures (see [`DeployConfig::validate`])
    pub fn from_json_str(text: &str) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        if let Some(inner) = value.get_mut("Deploy").map(serde_json::Value::take) {
            if inner.is_object() {
                value = inner;
            }
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the preprocessing list for values the pipeline cannot apply
    ///
    /// # Errors
    /// - mean/std without exactly 3 entries, or a zero std entry
    /// - zero-sized resize or crop targets, or unknown interpolation codes
    /// - `Resize` with neither `target_size` nor `resize_short`
    /// - `Permute` that is repeated or not the last step
    pub fn validate(&self) -> Result<()> {
        let last = self.preprocess.len().saturating_sub(1);
        let mut permutes = 0;

        for (index, op) in self.preprocess.iter().enumerate() {
            match op {
                PreprocessOp::Decode { .. } => {},
                PreprocessOp::Resize {
                    target_size,
                    resize_short,
                    interp,
                    ..
                } => {
                    match (target_size, resize_short) {
                        (None, None) => {
                            return Err(NennError::invalid_config(format!(
                                "Resize step {index} needs 'target_size' or 'resize_short'"
                            )));
                        },
                        (Some(size), _) => {
                            let (h, w) = size.hw();
                            if h == 0 || w == 0 {
                                return Err(NennError::invalid_config(format!(
                                    "Resize step {index} has a zero target size"
                                )));
                            }
                        },
                        (None, Some(0)) => {
                            return Err(NennError::invalid_config(format!(
                                "Resize step {index} has a zero 'resize_short'"
                            )));
                        },
                        (None, Some(_)) => {},
                    }
                    if !(0..=4).contains(interp) {
                        return Err(NennError::config_value_error(
                            "interpolation code",
                            *interp,
                            "0-4",
                            Some(1),
                        ));
                    }
                },
                PreprocessOp::Normalize { mean, std, .. } => {
                    if mean.len() != 3 || std.len() != 3 {
                        return Err(NennError::invalid_config(format!(
                            "Normalize step {index} needs 3 mean and 3 std values, got {} and {}",
                            mean.len(),
                            std.len()
                        )));
                    }
                    if std.iter().any(|s| *s == 0.0) {
                        return Err(NennError::invalid_config(format!(
                            "Normalize step {index} has a zero std value"
                        )));
                    }
                },
                PreprocessOp::Crop { crop_size } => {
                    let (h, w) = crop_size.hw();
                    if h == 0 || w == 0 {
                        return Err(NennError::invalid_config(format!(
                            "Crop step {index} has a zero crop size"
                        )));
                    }
                },
                PreprocessOp::Permute {} => {
                    permutes += 1;
                    if permutes > 1 || index != last {
                        return Err(NennError::invalid_config(
                            "Permute must appear once, as the last preprocessing step",
                        ));
                    }
                },
            }
        }

        if let Some(threshold) = self.draw_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(NennError::config_value_error(
                    "draw_threshold",
                    threshold,
                    "0.0-1.0",
                    Some(0.5),
                ));
            }
        }

        Ok(())
    }

    /// Class name for a detector class id
    #[must_use]
    pub fn label(&self, class_id: i64) -> Option<&str> {
        usize::try_from(class_id)
            .ok()
            .and_then(|index| self.label_list.get(index))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PICODET_CONFIG: &str = r#"{
        "mode": "paddle",
        "draw_threshold": 0.5,
        "metric": "COCO",
        "arch": "PicoDet",
        "min_subgraph_size": 3,
        "Preprocess": [
            {"interp": 2, "keep_ratio": false, "target_size": [416, 416], "type": "Resize"},
            {"is_scale": true, "mean": [0.485, 0.456, 0.406], "std": [0.229, 0.224, 0.225], "type": "NormalizeImage"},
            {"type": "Permute"}
        ],
        "label_list": ["person", "bicycle", "car"]
    }"#;

    #[test]
    fn test_parse_detection_config() {
        let config = DeployConfig::from_json_str(PICODET_CONFIG).unwrap();
        assert_eq!(config.arch.as_deref(), Some("PicoDet"));
        assert_eq!(config.draw_threshold, Some(0.5));
        assert_eq!(config.preprocess.len(), 3);
        assert_eq!(
            config.preprocess[0],
            PreprocessOp::Resize {
                target_size: Some(Size::Pair([416, 416])),
                keep_ratio: false,
                resize_short: None,
                interp: 2,
            }
        );
        assert_eq!(config.preprocess[1].name(), "Normalize");
        assert_eq!(config.label(2), Some("car"));
        assert_eq!(config.label(3), None);
        assert_eq!(config.label(-1), None);
    }

    #[test]
    fn test_parse_nested_segmentation_config() {
        let text = r#"{
            "Deploy": {
                "model": "model.pdmodel",
                "transforms": [
                    {"type": "Decode", "mode": "BGR"},
                    {"type": "Resize", "target_size": 192},
                    {"type": "Normalize"},
                    {"type": "CenterCrop", "crop_size": [192, 192]}
                ]
            }
        }"#;
        let config = DeployConfig::from_json_str(text).unwrap();
        assert_eq!(config.preprocess.len(), 4);
        assert_eq!(config.preprocess[0], PreprocessOp::Decode { mode: ChannelOrder::Bgr });
        match &config.preprocess[2] {
            PreprocessOp::Normalize { mean, std, is_scale, norm_type } => {
                assert_eq!(mean, &vec![0.5, 0.5, 0.5]);
                assert_eq!(std, &vec![0.5, 0.5, 0.5]);
                assert!(*is_scale);
                assert_eq!(*norm_type, NormType::MeanStd);
            },
            other => panic!("unexpected op {other:?}"),
        }
        assert!(config.label_list.is_empty());
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let text = r#"{"Preprocess": [{"type": "Rotate", "angle": 90}]}"#;
        assert!(matches!(
            DeployConfig::from_json_str(text),
            Err(NennError::Json(_))
        ));
    }

    #[test]
    fn test_permute_must_be_last() {
        let text = r#"{"Preprocess": [{"type": "Permute"}, {"type": "Normalize"}]}"#;
        let err = DeployConfig::from_json_str(text).unwrap_err();
        assert!(err.to_string().contains("Permute"));
    }

    #[test]
    fn test_normalize_validation() {
        let text = r#"{"Preprocess": [{"type": "Normalize", "mean": [0.5], "std": [0.5, 0.5, 0.5]}]}"#;
        assert!(DeployConfig::from_json_str(text).is_err());

        let text = r#"{"Preprocess": [{"type": "Normalize", "std": [0.5, 0.0, 0.5]}]}"#;
        let err = DeployConfig::from_json_str(text).unwrap_err();
        assert!(err.to_string().contains("zero std"));
    }

    #[test]
    fn test_resize_validation() {
        let text = r#"{"Preprocess": [{"type": "Resize", "keep_ratio": true}]}"#;
        assert!(DeployConfig::from_json_str(text).is_err());

        let text = r#"{"Preprocess": [{"type": "Resize", "target_size": [0, 10]}]}"#;
        assert!(DeployConfig::from_json_str(text).is_err());

        let text = r#"{"Preprocess": [{"type": "Resize", "resize_short": 256, "interp": 9}]}"#;
        let err = DeployConfig::from_json_str(text).unwrap_err();
        assert!(err.to_string().contains("interpolation"));
    }

    #[test]
    fn test_draw_threshold_range() {
        let text = r#"{"draw_threshold": 1.5}"#;
        assert!(DeployConfig::from_json_str(text).is_err());
    }
}
