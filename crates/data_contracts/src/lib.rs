//! Shared data contracts for the detection pipeline: ground-truth boxes and
//! network configuration.

pub mod boxes;
pub mod config;

pub use boxes::{GroundTruthBox, ValidationError};
pub use config::{
    AnchorConfig, BackboneConfig, BackboneKind, ConfigError, FasterRcnnConfig, LossConfig,
    RcnnConfig, RpnConfig,
};
