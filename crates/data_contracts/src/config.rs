//! Network configuration: anchor geometry, backbone choice, per-stage
//! hyperparameters and loss weights. Loaded from TOML.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_CONFIG_NAME: &str = "frcnn.toml";
const CONFIG_ENV: &str = "FRCNN_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid type for pretrained module: {requested:?}, should be one of: {supported:?}")]
    UnsupportedBackbone {
        requested: String,
        supported: &'static [&'static str],
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parse error at {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Pretrained feature extractor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackboneKind {
    Vgg,
    Resnet,
    ResnetV2,
}

impl BackboneKind {
    pub const SUPPORTED: &'static [&'static str] = &["vgg", "resnet", "resnetv2"];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackboneKind::Vgg => "vgg",
            BackboneKind::Resnet => "resnet",
            BackboneKind::ResnetV2 => "resnetv2",
        }
    }

    /// Channel widths used when the config does not override them.
    pub fn default_channels(&self) -> Vec<usize> {
        match self {
            BackboneKind::Vgg => vec![64, 128, 256, 512, 512],
            BackboneKind::Resnet | BackboneKind::ResnetV2 => vec![64, 128, 256, 512],
        }
    }
}

impl FromStr for BackboneKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vgg" => Ok(BackboneKind::Vgg),
            "resnet" => Ok(BackboneKind::Resnet),
            "resnetv2" => Ok(BackboneKind::ResnetV2),
            _ => Err(ConfigError::UnsupportedBackbone {
                requested: s.to_string(),
                supported: Self::SUPPORTED,
            }),
        }
    }
}

impl TryFrom<String> for BackboneKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackboneKind> for String {
    fn from(kind: BackboneKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Side of the unscaled square anchor, in pixels.
    pub base_size: f32,
    pub scales: Vec<f32>,
    /// Width / height.
    pub ratios: Vec<f32>,
    /// Pixels per feature-map cell. Must equal the backbone's downsampling
    /// factor or the projected anchors drift from their receptive fields.
    pub stride: usize,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            base_size: 16.0,
            scales: vec![8.0, 16.0, 32.0],
            ratios: vec![0.5, 1.0, 2.0],
            stride: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub kind: BackboneKind,
    /// When false the backbone weights are excluded from gradient updates.
    pub trainable: bool,
    /// Per-block output channels; `None` picks the family default.
    pub channels: Option<Vec<usize>>,
    /// Residual blocks per ResNet stage (ignored by VGG).
    pub resnet_blocks: Vec<usize>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            kind: BackboneKind::Vgg,
            trainable: true,
            channels: None,
            resnet_blocks: vec![2, 2, 2],
        }
    }
}

impl BackboneConfig {
    pub fn resolved_channels(&self) -> Vec<usize> {
        self.channels
            .clone()
            .unwrap_or_else(|| self.kind.default_channels())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpnConfig {
    pub hidden_channels: usize,
    pub pre_nms_top_n_train: usize,
    pub post_nms_top_n_train: usize,
    pub pre_nms_top_n_test: usize,
    pub post_nms_top_n_test: usize,
    pub nms_threshold: f32,
    /// Proposals narrower or shorter than this (pixels) are dropped.
    pub min_size: f32,
    pub positive_overlap: f32,
    pub negative_overlap: f32,
    /// Labelled anchors sampled per image for the loss.
    pub batch_size: usize,
    pub foreground_fraction: f32,
    /// How far (pixels) an anchor may cross the image border and still be
    /// labelled.
    pub allowed_border: f32,
    pub sigma: f32,
}

impl Default for RpnConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 512,
            pre_nms_top_n_train: 12000,
            post_nms_top_n_train: 2000,
            pre_nms_top_n_test: 6000,
            post_nms_top_n_test: 300,
            nms_threshold: 0.7,
            min_size: 0.0,
            positive_overlap: 0.7,
            negative_overlap: 0.3,
            batch_size: 256,
            foreground_fraction: 0.5,
            allowed_border: 0.0,
            sigma: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcnnConfig {
    /// Run ROI pooling and the classification head at all.
    pub enabled: bool,
    /// Object classes, background excluded.
    pub num_classes: usize,
    pub pooled_size: usize,
    pub hidden: usize,
    pub foreground_threshold: f32,
    pub background_threshold_low: f32,
    pub minibatch_size: usize,
    pub foreground_fraction: f32,
    pub sigma: f32,
}

impl Default for RcnnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_classes: 20,
            pooled_size: 7,
            hidden: 1024,
            foreground_threshold: 0.5,
            background_threshold_low: 0.0,
            minibatch_size: 256,
            foreground_fraction: 0.25,
            sigma: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub rpn_cls_weight: f32,
    pub rpn_reg_weight: f32,
    pub rcnn_cls_weight: f32,
    pub rcnn_reg_weight: f32,
    /// L2 coefficient applied to every conv/linear weight.
    pub weight_decay: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            rpn_cls_weight: 1.0,
            rpn_reg_weight: 2.0,
            rcnn_cls_weight: 1.0,
            rcnn_reg_weight: 2.0,
            weight_decay: 5e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FasterRcnnConfig {
    pub anchors: AnchorConfig,
    pub backbone: BackboneConfig,
    pub rpn: RpnConfig,
    pub rcnn: RcnnConfig,
    pub loss: LossConfig,
    /// Keep raw intermediates in the prediction bundle.
    pub debug: bool,
    /// Seed for anchor / proposal minibatch sampling.
    pub seed: u64,
}

impl FasterRcnnConfig {
    /// Resolve from `$FRCNN_CONFIG`, then `./frcnn.toml`, then defaults.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_NAME));
        if !path.exists() {
            return Self::default();
        }
        match Self::from_path(&path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("frcnn config {}: {err}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: FasterRcnnConfig = toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }
        if self.anchors.stride == 0 {
            return Err(invalid("anchors.stride", "must be positive"));
        }
        if self.backbone.resolved_channels().iter().any(|c| *c == 0) {
            return Err(invalid("backbone.channels", "channel widths must be positive"));
        }
        let ratio_ok = |v: f32| (0.0..=1.0).contains(&v);
        if !ratio_ok(self.rpn.foreground_fraction) {
            return Err(invalid("rpn.foreground_fraction", "must lie in [0, 1]"));
        }
        if !ratio_ok(self.rcnn.foreground_fraction) {
            return Err(invalid("rcnn.foreground_fraction", "must lie in [0, 1]"));
        }
        if self.rpn.negative_overlap > self.rpn.positive_overlap {
            return Err(invalid(
                "rpn.negative_overlap",
                "must not exceed rpn.positive_overlap",
            ));
        }
        if self.rcnn.enabled && self.rcnn.num_classes == 0 {
            return Err(invalid("rcnn.num_classes", "must be positive"));
        }
        if self.rcnn.pooled_size == 0 {
            return Err(invalid("rcnn.pooled_size", "must be positive"));
        }
        if self.loss.weight_decay < 0.0 {
            return Err(invalid("loss.weight_decay", "must be non-negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backbone_identifiers_parse() {
        assert_eq!("vgg".parse::<BackboneKind>().unwrap(), BackboneKind::Vgg);
        assert_eq!("resnet".parse::<BackboneKind>().unwrap(), BackboneKind::Resnet);
        assert_eq!(
            "ResNetV2".parse::<BackboneKind>().unwrap(),
            BackboneKind::ResnetV2
        );
        let err = "inception".parse::<BackboneKind>().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedBackbone { .. }));
        assert!(err.to_string().contains("inception"));
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = FasterRcnnConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.anchors.scales, vec![8.0, 16.0, 32.0]);
        assert_eq!(cfg.loss.rpn_reg_weight, 2.0);
        assert_eq!(cfg.backbone.resolved_channels().len(), 5);
    }

    #[test]
    fn zero_stride_rejected() {
        let mut cfg = FasterRcnnConfig::default();
        cfg.anchors.stride = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "anchors.stride",
                ..
            })
        ));
    }
}
