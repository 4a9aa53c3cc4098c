//! Region proposal network.
//!
//! Per-location outputs are flattened cell-major, anchor-minor: row `i` of
//! every flattened tensor belongs to anchor `i` of the grid produced by
//! `(y * W + x) * A + a`.

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use data_contracts::{GroundTruthBox, RpnConfig};
use rand::rngs::StdRng;

use crate::boxes;
use crate::loss::{smooth_l1, zero_loss, LossTerms};
use crate::sampling::{best_matches, subsample};

pub const RPN_CLS_LOSS: &str = "rpn_cls_loss";
pub const RPN_REG_LOSS: &str = "rpn_reg_loss";

/// Per-anchor training targets; `labels` is 1 (object), 0 (background) or
/// -1 (ignored).
#[derive(Debug, Clone, PartialEq)]
pub struct RpnTargets {
    pub labels: Vec<i64>,
    pub bbox_targets: Vec<[f32; 4]>,
}

impl RpnTargets {
    pub fn num_positive(&self) -> usize {
        self.labels.iter().filter(|l| **l == 1).count()
    }

    pub fn num_negative(&self) -> usize {
        self.labels.iter().filter(|l| **l == 0).count()
    }
}

#[derive(Debug, Clone)]
pub struct RpnPrediction<B: Backend> {
    /// Objectness logits, one per anchor: `[num_anchors]`.
    pub cls_logits: Tensor<B, 1>,
    /// Box deltas, one row per anchor: `[num_anchors, 4]`.
    pub bbox_pred: Tensor<B, 2>,
    /// Clipped, post-NMS proposals: `[num_proposals, 4]`.
    pub proposals: Tensor<B, 2>,
    pub proposal_scores: Tensor<B, 1>,
    /// Only present when the forward pass ran in training mode.
    pub targets: Option<RpnTargets>,
}

impl<B: Backend> RpnPrediction<B> {
    pub fn num_proposals(&self) -> usize {
        self.proposals.dims()[0]
    }
}

#[derive(Module, Debug)]
pub struct Rpn<B: Backend> {
    conv: Conv2d<B>,
    cls: Conv2d<B>,
    bbox: Conv2d<B>,
    num_anchors: usize,
    config: Ignored<RpnConfig>,
}

impl<B: Backend> Rpn<B> {
    pub fn new(
        in_channels: usize,
        num_anchors: usize,
        config: RpnConfig,
        device: &B::Device,
    ) -> Self {
        let hidden = config.hidden_channels.max(1);
        let conv = Conv2dConfig::new([in_channels, hidden], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let cls = Conv2dConfig::new([hidden, num_anchors], [1, 1]).init(device);
        let bbox = Conv2dConfig::new([hidden, num_anchors * 4], [1, 1]).init(device);
        Self {
            conv,
            cls,
            bbox,
            num_anchors,
            config: Ignored(config),
        }
    }

    pub fn num_anchors(&self) -> usize {
        self.num_anchors
    }

    /// `image_shape` is `(height, width)`; `anchors` is the full grid.
    pub fn forward(
        &self,
        feature_map: Tensor<B, 4>,
        gt_boxes: &[GroundTruthBox],
        image_shape: (usize, usize),
        anchors: &[[f32; 4]],
        is_training: bool,
        rng: &mut StdRng,
    ) -> RpnPrediction<B> {
        let [_, _, h, w] = feature_map.dims();
        let total = h * w * self.num_anchors;
        let x = relu(self.conv.forward(feature_map));

        let cls_logits = self
            .cls
            .forward(x.clone())
            .permute([0, 2, 3, 1])
            .reshape([total]);
        let bbox_pred = self
            .bbox
            .forward(x)
            .permute([0, 2, 3, 1])
            .reshape([total, 4]);

        let device = cls_logits.device();
        let scores = sigmoid(cls_logits.clone().detach())
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        let deltas = boxes::tensor_to_boxes(bbox_pred.clone().detach());
        let (proposals, proposal_scores) =
            self.generate_proposals(anchors, &scores, &deltas, image_shape, is_training);
        tracing::debug!(
            anchors = total,
            proposals = proposals.len(),
            "rpn proposals generated"
        );

        let targets =
            is_training.then(|| self.anchor_targets(anchors, gt_boxes, image_shape, rng));

        let num_proposals = proposal_scores.len();
        RpnPrediction {
            cls_logits,
            bbox_pred,
            proposals: boxes::boxes_to_tensor(&proposals, &device),
            proposal_scores: Tensor::from_data(
                TensorData::new(proposal_scores, [num_proposals]),
                &device,
            ),
            targets,
        }
    }

    fn generate_proposals(
        &self,
        anchors: &[[f32; 4]],
        scores: &[f32],
        deltas: &[[f32; 4]],
        image_shape: (usize, usize),
        is_training: bool,
    ) -> (Vec<[f32; 4]>, Vec<f32>) {
        let cfg = &self.config.0;
        let (pre_top, post_top) = if is_training {
            (cfg.pre_nms_top_n_train, cfg.post_nms_top_n_train)
        } else {
            (cfg.pre_nms_top_n_test, cfg.post_nms_top_n_test)
        };

        let mut candidates = Vec::with_capacity(anchors.len());
        let mut candidate_scores = Vec::with_capacity(anchors.len());
        for ((anchor, delta), score) in anchors.iter().zip(deltas).zip(scores) {
            let b = boxes::clip(&boxes::decode(anchor, delta), image_shape);
            if boxes::width(&b) < cfg.min_size || boxes::height(&b) < cfg.min_size {
                continue;
            }
            candidates.push(b);
            candidate_scores.push(*score);
        }

        let order = boxes::top_n(&candidate_scores, pre_top);
        let candidates: Vec<[f32; 4]> = order.iter().map(|&i| candidates[i]).collect();
        let candidate_scores: Vec<f32> = order.iter().map(|&i| candidate_scores[i]).collect();

        let mut keep = boxes::nms(&candidates, &candidate_scores, cfg.nms_threshold);
        keep.truncate(post_top);

        if keep.is_empty() {
            tracing::warn!("rpn produced no proposals; falling back to the full image");
            let (ih, iw) = image_shape;
            return (vec![[0.0, 0.0, iw as f32, ih as f32]], vec![0.0]);
        }
        (
            keep.iter().map(|&i| candidates[i]).collect(),
            keep.iter().map(|&i| candidate_scores[i]).collect(),
        )
    }

    /// Label anchors against the ground truth and sample the loss minibatch.
    pub fn anchor_targets(
        &self,
        anchors: &[[f32; 4]],
        gt_boxes: &[GroundTruthBox],
        image_shape: (usize, usize),
        rng: &mut StdRng,
    ) -> RpnTargets {
        let cfg = &self.config.0;
        let n = anchors.len();
        let inside: Vec<bool> = anchors
            .iter()
            .map(|a| boxes::is_inside(a, image_shape, cfg.allowed_border))
            .collect();

        let mut labels = vec![-1i64; n];
        let mut bbox_targets = vec![[0.0f32; 4]; n];

        if gt_boxes.is_empty() {
            for (label, _) in labels.iter_mut().zip(&inside).filter(|(_, i)| **i) {
                *label = 0;
            }
        } else {
            let gt: Vec<[f32; 4]> = gt_boxes.iter().map(|g| g.bbox).collect();
            let overlaps = boxes::iou_matrix(anchors, &gt);
            let matches = best_matches(&overlaps, n, gt.len());

            for i in (0..n).filter(|i| inside[*i]) {
                if matches[i].1 < cfg.negative_overlap {
                    labels[i] = 0;
                }
            }

            // Every ground truth claims the inside anchors that overlap it best.
            for g in 0..gt.len() {
                let best = (0..n)
                    .filter(|i| inside[*i])
                    .map(|i| overlaps[i * gt.len() + g])
                    .fold(0.0f32, f32::max);
                if best <= 0.0 {
                    continue;
                }
                for i in (0..n).filter(|i| inside[*i]) {
                    if overlaps[i * gt.len() + g] == best {
                        labels[i] = 1;
                    }
                }
            }

            for i in (0..n).filter(|i| inside[*i]) {
                if matches[i].1 >= cfg.positive_overlap {
                    labels[i] = 1;
                }
            }

            for i in 0..n {
                if labels[i] == 1 {
                    bbox_targets[i] = boxes::encode(&anchors[i], &gt[matches[i].0]);
                }
            }
        }

        let max_fg = (cfg.foreground_fraction * cfg.batch_size as f32) as usize;
        subsample(&mut labels, 1, max_fg, rng);
        let num_fg = labels.iter().filter(|l| **l == 1).count();
        subsample(&mut labels, 0, cfg.batch_size.saturating_sub(num_fg), rng);

        for (label, target) in labels.iter().zip(bbox_targets.iter_mut()) {
            if *label != 1 {
                *target = [0.0; 4];
            }
        }

        RpnTargets {
            labels,
            bbox_targets,
        }
    }

    /// `rpn_cls_loss`: BCE over labelled anchors. `rpn_reg_loss`: smooth-L1
    /// over positive anchors, normalised by the labelled count.
    pub fn loss(&self, prediction: &RpnPrediction<B>) -> Option<LossTerms<B>> {
        let targets = prediction.targets.as_ref()?;
        let device = prediction.cls_logits.device();
        let mut terms = LossTerms::new();

        let labelled: Vec<i64> = (0..targets.labels.len() as i64)
            .filter(|i| targets.labels[*i as usize] >= 0)
            .collect();
        if labelled.is_empty() {
            terms.insert(RPN_CLS_LOSS, zero_loss(&device));
            terms.insert(RPN_REG_LOSS, zero_loss(&device));
            return Some(terms);
        }

        let count = labelled.len();
        let idx =
            Tensor::<B, 1, Int>::from_data(TensorData::new(labelled.clone(), [count]), &device);
        let logits = prediction.cls_logits.clone().select(0, idx);
        let cls_targets: Vec<i64> = labelled
            .iter()
            .map(|i| targets.labels[*i as usize])
            .collect();
        let cls_targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(cls_targets, [count]), &device);
        let bce = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device);
        terms.insert(RPN_CLS_LOSS, bce.forward(logits, cls_targets));

        let positive: Vec<i64> = labelled
            .iter()
            .copied()
            .filter(|i| targets.labels[*i as usize] == 1)
            .collect();
        let reg = if positive.is_empty() {
            zero_loss(&device)
        } else {
            let num_pos = positive.len();
            let box_targets: Vec<[f32; 4]> = positive
                .iter()
                .map(|i| targets.bbox_targets[*i as usize])
                .collect();
            let idx = Tensor::<B, 1, Int>::from_data(TensorData::new(positive, [num_pos]), &device);
            let pred = prediction.bbox_pred.clone().select(0, idx);
            let target = boxes::boxes_to_tensor::<B>(&box_targets, &device);
            smooth_l1(pred - target, self.config.0.sigma)
                .sum()
                .div_scalar(count as f32)
        };
        terms.insert(RPN_REG_LOSS, reg);
        Some(terms)
    }

    pub fn regularization(&self) -> Tensor<B, 1> {
        self.conv.weight.val().powf_scalar(2.0).sum()
            + self.cls.weight.val().powf_scalar(2.0).sum()
            + self.bbox.weight.val().powf_scalar(2.0).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::Param;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type B = NdArray<f32>;

    fn small_config() -> RpnConfig {
        RpnConfig {
            hidden_channels: 4,
            batch_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn anchor_targets_label_best_and_ignore_outside() {
        let device = Default::default();
        let rpn = Rpn::<B>::new(2, 1, small_config(), &device);
        let anchors = vec![
            [0.0, 0.0, 10.0, 10.0],
            [20.0, 20.0, 30.0, 30.0],
            [-5.0, -5.0, 5.0, 5.0],
            [2.0, 2.0, 12.0, 12.0],
        ];
        let gt = vec![GroundTruthBox::new([0.0, 0.0, 10.0, 10.0], 0)];
        let mut rng = StdRng::seed_from_u64(0);
        let targets = rpn.anchor_targets(&anchors, &gt, (32, 32), &mut rng);
        assert_eq!(targets.labels, vec![1, 0, -1, -1]);
        assert_eq!(targets.bbox_targets[0], [0.0, 0.0, 0.0, 0.0]);
        assert_eq!(targets.num_positive(), 1);
        assert_eq!(targets.num_negative(), 1);
    }

    #[test]
    fn no_ground_truth_makes_inside_anchors_background() {
        let device = Default::default();
        let rpn = Rpn::<B>::new(2, 1, small_config(), &device);
        let anchors = vec![[0.0, 0.0, 10.0, 10.0], [-1.0, 0.0, 10.0, 10.0]];
        let mut rng = StdRng::seed_from_u64(0);
        let targets = rpn.anchor_targets(&anchors, &[], (32, 32), &mut rng);
        assert_eq!(targets.labels, vec![0, -1]);
    }

    /// Row `i` of the flattened heads must belong to anchor `(y * W + x) * A + a`,
    /// the order the anchor grid is expanded in.
    #[test]
    fn flattened_rows_follow_cell_major_anchor_minor_order() {
        let device = Default::default();
        let (h, w, a) = (2usize, 3usize, 2usize);
        let cfg = RpnConfig {
            hidden_channels: 1,
            ..small_config()
        };
        let mut rpn = Rpn::<B>::new(1, a, cfg, &device);

        // Hidden activation is the input cell value; output channel `c` adds `100 * c`.
        let mut center = vec![0.0f32; 9];
        center[4] = 1.0;
        rpn.conv.weight =
            Param::from_tensor(Tensor::from_data(TensorData::new(center, [1, 1, 3, 3]), &device));
        rpn.conv.bias = Some(Param::from_tensor(Tensor::zeros([1], &device)));
        let offsets = |n: usize| {
            let values: Vec<f32> = (0..n).map(|c| 100.0 * c as f32).collect();
            Tensor::<B, 1>::from_data(TensorData::new(values, [n]), &device)
        };
        rpn.cls.weight = Param::from_tensor(Tensor::ones([a, 1, 1, 1], &device));
        rpn.cls.bias = Some(Param::from_tensor(offsets(a)));
        rpn.bbox.weight = Param::from_tensor(Tensor::ones([4 * a, 1, 1, 1], &device));
        rpn.bbox.bias = Some(Param::from_tensor(offsets(4 * a)));

        let cells: Vec<f32> = (0..h * w).map(|c| c as f32).collect();
        let feature_map = Tensor::<B, 4>::from_data(TensorData::new(cells, [1, 1, h, w]), &device);
        let anchors = vec![[0.0, 0.0, 8.0, 8.0]; h * w * a];
        let mut rng = StdRng::seed_from_u64(0);
        let pred = rpn.forward(feature_map, &[], (32, 48), &anchors, false, &mut rng);

        let logits = pred.cls_logits.into_data().to_vec::<f32>().unwrap();
        let deltas = boxes::tensor_to_boxes(pred.bbox_pred);
        for y in 0..h {
            for x in 0..w {
                let cell = (y * w + x) as f32;
                for k in 0..a {
                    let i = (y * w + x) * a + k;
                    assert_eq!(logits[i], cell + 100.0 * k as f32, "logit row {i}");
                    for c in 0..4 {
                        let expected = cell + 100.0 * (4 * k + c) as f32;
                        assert_eq!(deltas[i][c], expected, "delta row {i} col {c}");
                    }
                }
            }
        }
    }

    #[test]
    fn forward_flattens_per_anchor() {
        let device = Default::default();
        let rpn = Rpn::<B>::new(3, 2, small_config(), &device);
        let feature_map = Tensor::<B, 4>::zeros([1, 3, 2, 3], &device);
        let anchors: Vec<[f32; 4]> = (0..12)
            .map(|i| {
                let o = i as f32;
                [o, o, o + 8.0, o + 8.0]
            })
            .collect();
        let mut rng = StdRng::seed_from_u64(0);
        let pred = rpn.forward(feature_map, &[], (32, 48), &anchors, false, &mut rng);
        assert_eq!(pred.cls_logits.dims(), [12]);
        assert_eq!(pred.bbox_pred.dims(), [12, 4]);
        assert!(pred.num_proposals() >= 1);
        assert!(pred.targets.is_none());
        assert!(rpn.loss(&pred).is_none());
    }
}
