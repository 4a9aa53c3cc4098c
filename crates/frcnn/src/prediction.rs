use burn::tensor::{backend::Backend, Tensor};
use data_contracts::GroundTruthBox;
use models::{ClassificationPrediction, RpnPrediction};

use crate::loss::LossReport;

/// Raw intermediates kept only in debug mode.
#[derive(Debug, Clone)]
pub struct DebugOutputs<B: Backend> {
    /// Input image, `[1, H, W, 3]`.
    pub image: Tensor<B, 4>,
    /// Full anchor grid, `[H' * W' * A, 4]`.
    pub all_anchors: Tensor<B, 2>,
    pub gt_boxes: Vec<GroundTruthBox>,
    /// Backbone activations by endpoint name.
    pub backbone_endpoints: Vec<(String, Tensor<B, 4>)>,
    /// ROI pooled features; absent when the classification head is disabled.
    pub roi_pooled: Option<Tensor<B, 4>>,
}

/// Everything one forward pass produced. Created fresh per call.
#[derive(Debug, Clone)]
pub struct PredictionBundle<B: Backend> {
    /// `(height, width)` of the input image in pixels.
    pub image_shape: (usize, usize),
    pub feature_map: Tensor<B, 4>,
    pub rpn: RpnPrediction<B>,
    /// Present iff the classification head is enabled.
    pub classification: Option<ClassificationPrediction<B>>,
    /// Present iff debug mode is on.
    pub debug: Option<DebugOutputs<B>>,
    /// Filled by `FasterRcnn::loss`.
    pub losses: Option<LossReport<B>>,
}

impl<B: Backend> PredictionBundle<B> {
    /// Final boxes and class probabilities, when the classification head ran.
    pub fn detections(&self) -> Option<(&Tensor<B, 2>, &Tensor<B, 2>)> {
        self.classification
            .as_ref()
            .map(|c| (&c.objects, &c.cls_prob))
    }

    pub fn proposals(&self) -> &Tensor<B, 2> {
        &self.rpn.proposals
    }
}
