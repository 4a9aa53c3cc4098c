//! The two-stage detector: backbone -> anchors -> RPN -> ROI pooling -> RCNN.

use burn::module::{Ignored, Module};
use burn::tensor::{backend::Backend, Tensor};
use data_contracts::{FasterRcnnConfig, GroundTruthBox};
use models::{Backbone, Rcnn, RoiPooling, Rpn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::anchors::AnchorGenerator;
use crate::error::{FrcnnError, Result};
use crate::loss::{LossAggregator, LossWeights};
use crate::metrics::{tensor_stats, Metric, MetricTag};
use crate::prediction::{DebugOutputs, PredictionBundle};

#[derive(Module, Debug)]
pub struct FasterRcnn<B: Backend> {
    backbone: Backbone<B>,
    rpn: Rpn<B>,
    roi_pool: Option<RoiPooling>,
    rcnn: Option<Rcnn<B>>,
    anchors: Ignored<AnchorGenerator>,
    config: Ignored<FasterRcnnConfig>,
}

impl<B: Backend> FasterRcnn<B> {
    /// Fails on invalid configuration (including anchor geometry) before any
    /// parameter is allocated.
    pub fn new(config: FasterRcnnConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let anchors = AnchorGenerator::new(&config.anchors)?;

        let backbone = Backbone::new(&config.backbone, device);
        if backbone.stride() != anchors.stride() {
            tracing::warn!(
                backbone = %config.backbone.kind,
                backbone_stride = backbone.stride(),
                anchor_stride = anchors.stride(),
                "anchor stride differs from backbone downsampling; anchors will misalign"
            );
        }

        let channels = backbone.out_channels();
        let rpn = Rpn::new(channels, anchors.num_anchors(), config.rpn.clone(), device);
        let (roi_pool, rcnn) = if config.rcnn.enabled {
            (
                Some(RoiPooling::new(config.rcnn.pooled_size)),
                Some(Rcnn::new(channels, config.rcnn.clone(), device)),
            )
        } else {
            (None, None)
        };

        tracing::debug!(
            backbone = %config.backbone.kind,
            num_anchors = anchors.num_anchors(),
            with_rcnn = config.rcnn.enabled,
            "faster r-cnn constructed"
        );

        Ok(Self {
            backbone,
            rpn,
            roi_pool,
            rcnn,
            anchors: Ignored(anchors),
            config: Ignored(config),
        })
    }

    /// Like [`FasterRcnn::new`] with the backbone given by identifier
    /// (`vgg`, `resnet` or `resnetv2`).
    pub fn with_backbone(
        mut config: FasterRcnnConfig,
        backbone: &str,
        device: &B::Device,
    ) -> Result<Self> {
        config.backbone.kind = backbone.parse()?;
        Self::new(config, device)
    }

    pub fn config(&self) -> &FasterRcnnConfig {
        &self.config.0
    }

    pub fn anchor_generator(&self) -> &AnchorGenerator {
        &self.anchors.0
    }

    pub fn with_rcnn(&self) -> bool {
        self.rcnn.is_some()
    }

    /// Forward pass with minibatch sampling seeded from the config.
    ///
    /// `image` is `[1, H, W, 3]` in 0..255; `gt_boxes` are absolute
    /// `[x1, y1, x2, y2]`. Training targets are built only when
    /// `is_training` is set. Fails if a ground-truth box is inverted, leaves
    /// the image or carries a label outside `0..num_classes`.
    pub fn forward(
        &self,
        image: Tensor<B, 4>,
        gt_boxes: &[GroundTruthBox],
        is_training: bool,
    ) -> Result<PredictionBundle<B>> {
        let mut rng = StdRng::seed_from_u64(self.config.0.seed);
        self.forward_with_rng(image, gt_boxes, is_training, &mut rng)
    }

    pub fn forward_with_rng(
        &self,
        image: Tensor<B, 4>,
        gt_boxes: &[GroundTruthBox],
        is_training: bool,
        rng: &mut StdRng,
    ) -> Result<PredictionBundle<B>> {
        let [_, height, width, _] = image.dims();
        let image_shape = (height, width);
        let num_classes = self.config.0.rcnn.num_classes;
        data_contracts::boxes::validate_all(gt_boxes, image_shape, num_classes)?;
        let debug = self.config.0.debug;

        let backbone_out = self.backbone.forward(image.clone());
        let feature_map = backbone_out.feature_map;
        let [_, _, grid_h, grid_w] = feature_map.dims();
        let all_anchors = self.anchors.0.grid(grid_h, grid_w);
        tracing::debug!(
            ?image_shape,
            grid = ?(grid_h, grid_w),
            anchors = all_anchors.len(),
            "backbone forward"
        );

        let rpn = self.rpn.forward(
            feature_map.clone(),
            gt_boxes,
            image_shape,
            &all_anchors,
            is_training,
            rng,
        );

        let mut roi_pooled = None;
        let classification = match (&self.roi_pool, &self.rcnn) {
            (Some(roi_pool), Some(rcnn)) => {
                let roi = roi_pool.forward(rpn.proposals.clone(), feature_map.clone(), image_shape);
                if debug {
                    roi_pooled = Some(roi.pooled.clone());
                }
                Some(rcnn.forward(
                    roi.pooled,
                    rpn.proposals.clone(),
                    gt_boxes,
                    image_shape,
                    is_training,
                    rng,
                ))
            }
            _ => None,
        };

        let debug = debug.then(|| DebugOutputs {
            image,
            all_anchors: models::boxes::boxes_to_tensor(&all_anchors, &feature_map.device()),
            gt_boxes: gt_boxes.to_vec(),
            backbone_endpoints: backbone_out.endpoints,
            roi_pooled,
        });

        Ok(PredictionBundle {
            image_shape,
            feature_map,
            rpn,
            classification,
            debug,
            losses: None,
        })
    }

    /// Sum of squared weights of every trainable sub-network, scaled by
    /// `loss.weight_decay`. A frozen backbone contributes nothing.
    pub fn regularization(&self, device: &B::Device) -> Tensor<B, 1> {
        let mut total = self.rpn.regularization();
        if self.config.0.backbone.trainable {
            total = total + self.backbone.regularization(device);
        }
        if let Some(rcnn) = &self.rcnn {
            total = total + rcnn.regularization();
        }
        total.mul_scalar(self.config.0.loss.weight_decay)
    }

    /// Joint training loss. Returns the scalar used for gradients and stores
    /// the itemised, weighted terms in `prediction.losses`.
    pub fn loss(&self, prediction: &mut PredictionBundle<B>) -> Result<Tensor<B, 1>> {
        let rpn_terms = self
            .rpn
            .loss(&prediction.rpn)
            .ok_or(FrcnnError::MissingTargets { stage: "rpn" })?;
        let rcnn_terms = match (&self.rcnn, &prediction.classification) {
            (Some(rcnn), Some(classification)) => Some(
                rcnn.loss(classification)
                    .ok_or(FrcnnError::MissingTargets { stage: "rcnn" })?,
            ),
            _ => None,
        };

        let device = prediction.feature_map.device();
        let regularization = if self.config.0.loss.weight_decay > 0.0 {
            self.regularization(&device)
        } else {
            Tensor::zeros([1], &device)
        };

        let aggregator = LossAggregator::new(LossWeights::from(&self.config.0.loss));
        let report = aggregator.aggregate(rpn_terms, rcnn_terms, regularization);
        let total = report.total.clone();
        prediction.losses = Some(report);
        Ok(total)
    }

    /// Metrics describing one forward (and, if run, loss) pass.
    pub fn summary(&self, prediction: &PredictionBundle<B>) -> Vec<Metric> {
        let mut metrics = tensor_stats(MetricTag::Rpn, "feature_map", &prediction.feature_map);
        metrics.push(Metric::new(
            MetricTag::Rpn,
            "num_proposals",
            prediction.rpn.num_proposals() as f32,
        ));
        if let Some(targets) = &prediction.rpn.targets {
            metrics.push(Metric::new(
                MetricTag::Rpn,
                "positive_anchors",
                targets.num_positive() as f32,
            ));
            metrics.push(Metric::new(
                MetricTag::Rpn,
                "negative_anchors",
                targets.num_negative() as f32,
            ));
        }

        if self.with_rcnn() {
            if let Some(classification) = &prediction.classification {
                let detected = classification.labels.iter().filter(|l| **l > 0).count();
                metrics.push(Metric::new(MetricTag::Rcnn, "num_detected", detected as f32));
                if let Some(targets) = &classification.targets {
                    metrics.push(Metric::new(
                        MetricTag::Rcnn,
                        "num_foreground",
                        targets.num_foreground() as f32,
                    ));
                    metrics.push(Metric::new(
                        MetricTag::Rcnn,
                        "num_background",
                        targets.num_background() as f32,
                    ));
                }
            }
        }

        if let Some(report) = &prediction.losses {
            metrics.extend(
                report
                    .values()
                    .into_iter()
                    .map(|(name, value)| Metric::new(MetricTag::Losses, name, value)),
            );
        }
        metrics
    }
}
