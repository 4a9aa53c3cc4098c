//! Burn sub-networks of the two-stage detector.
//!
//! This crate defines the stages the detector composes:
//! - `Backbone`: VGG or ResNet v2 feature extractor (stride 16).
//! - `Rpn`: objectness + box deltas per anchor, proposal generation.
//! - `RoiPooling`: fixed-size crops of the feature map per proposal.
//! - `Rcnn`: per-proposal classification and class-specific refinement.
//!
//! Each stage owns its parameters and exposes `loss(&prediction)` returning
//! named terms. Target assignment, proposal decoding and NMS run host-side.

pub mod backbone;
pub mod boxes;
pub mod loss;
pub mod rcnn;
pub mod roi_pool;
pub mod rpn;
pub mod sampling;

pub use backbone::{Backbone, BackboneOutput, ResNetV2, Vgg};
pub use loss::LossTerms;
pub use rcnn::{ClassificationPrediction, Rcnn, RcnnTargets, RCNN_CLS_LOSS, RCNN_REG_LOSS};
pub use roi_pool::{RoiPooling, RoiPrediction};
pub use rpn::{Rpn, RpnPrediction, RpnTargets, RPN_CLS_LOSS, RPN_REG_LOSS};

pub mod prelude {
    pub use super::{
        Backbone, BackboneOutput, ClassificationPrediction, LossTerms, Rcnn, RoiPooling,
        RoiPrediction, Rpn, RpnPrediction,
    };
}
