//! Second-stage classifier: per-proposal class scores and class-specific
//! box refinement on top of ROI-pooled features.

use burn::module::{Ignored, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use data_contracts::{GroundTruthBox, RcnnConfig};
use rand::rngs::StdRng;

use crate::boxes;
use crate::loss::{smooth_l1, zero_loss, LossTerms};
use crate::sampling::{best_matches, subsample};

pub const RCNN_CLS_LOSS: &str = "rcnn_cls_loss";
pub const RCNN_REG_LOSS: &str = "rcnn_reg_loss";

/// Per-proposal targets. Labels: -1 ignored, 0 background, `k + 1` for
/// ground-truth class `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct RcnnTargets {
    pub labels: Vec<i64>,
    pub bbox_targets: Vec<[f32; 4]>,
}

impl RcnnTargets {
    pub fn num_foreground(&self) -> usize {
        self.labels.iter().filter(|l| **l > 0).count()
    }

    pub fn num_background(&self) -> usize {
        self.labels.iter().filter(|l| **l == 0).count()
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationPrediction<B: Backend> {
    /// `[num_proposals, num_classes + 1]`, column 0 is background.
    pub cls_logits: Tensor<B, 2>,
    /// Softmax of `cls_logits`.
    pub cls_prob: Tensor<B, 2>,
    /// Class-specific deltas `[num_proposals, 4 * num_classes]`.
    pub bbox_pred: Tensor<B, 2>,
    /// Refined, clipped boxes for the arg-max class: `[num_proposals, 4]`.
    pub objects: Tensor<B, 2>,
    /// Arg-max class per proposal (0 = background).
    pub labels: Vec<usize>,
    pub targets: Option<RcnnTargets>,
}

#[derive(Module, Debug)]
pub struct Rcnn<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    cls: Linear<B>,
    bbox: Linear<B>,
    num_classes: usize,
    config: Ignored<RcnnConfig>,
}

impl<B: Backend> Rcnn<B> {
    /// `in_channels` is the feature-map depth; pooled inputs are
    /// `in_channels * pooled_size^2` wide once flattened.
    pub fn new(in_channels: usize, config: RcnnConfig, device: &B::Device) -> Self {
        let in_features = in_channels * config.pooled_size * config.pooled_size;
        let hidden = config.hidden.max(1);
        let num_classes = config.num_classes.max(1);
        Self {
            fc1: LinearConfig::new(in_features, hidden).init(device),
            fc2: LinearConfig::new(hidden, hidden).init(device),
            cls: LinearConfig::new(hidden, num_classes + 1).init(device),
            bbox: LinearConfig::new(hidden, num_classes * 4).init(device),
            num_classes,
            config: Ignored(config),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward(
        &self,
        pooled: Tensor<B, 4>,
        proposals: Tensor<B, 2>,
        gt_boxes: &[GroundTruthBox],
        image_shape: (usize, usize),
        is_training: bool,
        rng: &mut StdRng,
    ) -> ClassificationPrediction<B> {
        let x = pooled.flatten::<2>(1, 3);
        let x = relu(self.fc1.forward(x));
        let x = relu(self.fc2.forward(x));
        let cls_logits = self.cls.forward(x.clone());
        let cls_prob = softmax(cls_logits.clone(), 1);
        let bbox_pred = self.bbox.forward(x);

        let device = cls_logits.device();
        let proposal_boxes = boxes::tensor_to_boxes(proposals);
        let (objects, labels) = self.refine(
            &proposal_boxes,
            cls_prob.clone().detach(),
            bbox_pred.clone().detach(),
            image_shape,
        );
        let targets =
            is_training.then(|| self.proposal_targets(&proposal_boxes, gt_boxes, rng));

        ClassificationPrediction {
            cls_logits,
            cls_prob,
            bbox_pred,
            objects: boxes::boxes_to_tensor(&objects, &device),
            labels,
            targets,
        }
    }

    fn refine(
        &self,
        proposals: &[[f32; 4]],
        cls_prob: Tensor<B, 2>,
        bbox_pred: Tensor<B, 2>,
        image_shape: (usize, usize),
    ) -> (Vec<[f32; 4]>, Vec<usize>) {
        let k1 = self.num_classes + 1;
        let probs = cls_prob.into_data().to_vec::<f32>().unwrap_or_default();
        let deltas = bbox_pred.into_data().to_vec::<f32>().unwrap_or_default();
        let width = self.num_classes * 4;
        if probs.len() < proposals.len() * k1 || deltas.len() < proposals.len() * width {
            tracing::warn!("rcnn outputs unreadable on the host; keeping proposals unrefined");
            return (proposals.to_vec(), vec![0; proposals.len()]);
        }

        let mut objects = Vec::with_capacity(proposals.len());
        let mut labels = Vec::with_capacity(proposals.len());
        for (i, proposal) in proposals.iter().enumerate() {
            let row = &probs[i * k1..(i + 1) * k1];
            let label = row
                .iter()
                .enumerate()
                .fold((0usize, f32::MIN), |best, (c, &p)| {
                    if p > best.1 {
                        (c, p)
                    } else {
                        best
                    }
                })
                .0;
            let refined = if label == 0 {
                *proposal
            } else {
                let base = i * width + (label - 1) * 4;
                let d = [
                    deltas[base],
                    deltas[base + 1],
                    deltas[base + 2],
                    deltas[base + 3],
                ];
                boxes::clip(&boxes::decode(proposal, &d), image_shape)
            };
            objects.push(refined);
            labels.push(label);
        }
        (objects, labels)
    }

    pub fn proposal_targets(
        &self,
        proposals: &[[f32; 4]],
        gt_boxes: &[GroundTruthBox],
        rng: &mut StdRng,
    ) -> RcnnTargets {
        let cfg = &self.config.0;
        let n = proposals.len();
        let mut labels = vec![-1i64; n];
        let mut bbox_targets = vec![[0.0f32; 4]; n];

        if gt_boxes.is_empty() {
            if cfg.background_threshold_low <= 0.0 {
                labels.iter_mut().for_each(|l| *l = 0);
            }
        } else {
            if let Some(bad) = gt_boxes.iter().find(|g| g.label >= self.num_classes) {
                tracing::warn!(
                    label = bad.label,
                    num_classes = self.num_classes,
                    "ground truth label out of range; its proposals are ignored"
                );
            }
            let gt: Vec<[f32; 4]> = gt_boxes.iter().map(|g| g.bbox).collect();
            let overlaps = boxes::iou_matrix(proposals, &gt);
            for (i, (g, overlap)) in best_matches(&overlaps, n, gt.len())
                .into_iter()
                .enumerate()
            {
                if gt_boxes[g].label >= self.num_classes {
                    continue;
                }
                if overlap >= cfg.foreground_threshold {
                    labels[i] = gt_boxes[g].label as i64 + 1;
                    bbox_targets[i] = boxes::encode(&proposals[i], &gt[g]);
                } else if overlap >= cfg.background_threshold_low {
                    labels[i] = 0;
                }
            }
        }

        let max_fg = (cfg.foreground_fraction * cfg.minibatch_size as f32) as usize;
        let mut fg_only: Vec<i64> = labels.iter().map(|l| if *l > 0 { 1 } else { 0 }).collect();
        subsample(&mut fg_only, 1, max_fg, rng);
        for (label, keep) in labels.iter_mut().zip(&fg_only) {
            if *label > 0 && *keep != 1 {
                *label = -1;
            }
        }
        let num_fg = labels.iter().filter(|l| **l > 0).count();
        subsample(&mut labels, 0, cfg.minibatch_size.saturating_sub(num_fg), rng);

        for (label, target) in labels.iter().zip(bbox_targets.iter_mut()) {
            if *label <= 0 {
                *target = [0.0; 4];
            }
        }
        RcnnTargets {
            labels,
            bbox_targets,
        }
    }

    /// `rcnn_cls_loss`: cross-entropy over sampled proposals. `rcnn_reg_loss`:
    /// smooth-L1 on the true class's deltas of foreground proposals,
    /// normalised by the sampled count.
    pub fn loss(&self, prediction: &ClassificationPrediction<B>) -> Option<LossTerms<B>> {
        let targets = prediction.targets.as_ref()?;
        let device = prediction.cls_logits.device();
        let mut terms = LossTerms::new();

        let sampled: Vec<i64> = (0..targets.labels.len() as i64)
            .filter(|i| targets.labels[*i as usize] >= 0)
            .collect();
        if sampled.is_empty() {
            terms.insert(RCNN_CLS_LOSS, zero_loss(&device));
            terms.insert(RCNN_REG_LOSS, zero_loss(&device));
            return Some(terms);
        }

        let count = sampled.len();
        let idx =
            Tensor::<B, 1, Int>::from_data(TensorData::new(sampled.clone(), [count]), &device);
        let logits = prediction.cls_logits.clone().select(0, idx);
        let cls_targets: Vec<i64> = sampled
            .iter()
            .map(|i| targets.labels[*i as usize])
            .collect();
        let cls_targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(cls_targets, [count]), &device);
        let ce = CrossEntropyLossConfig::new().init(&device);
        terms.insert(RCNN_CLS_LOSS, ce.forward(logits, cls_targets));

        let foreground: Vec<i64> = sampled
            .iter()
            .copied()
            .filter(|i| targets.labels[*i as usize] > 0)
            .collect();
        let reg = if foreground.is_empty() {
            zero_loss(&device)
        } else {
            let width = self.num_classes * 4;
            let num_fg = foreground.len();
            let mut mask = vec![0.0f32; num_fg * width];
            let mut target = vec![0.0f32; num_fg * width];
            for (row, i) in foreground.iter().enumerate() {
                let i = *i as usize;
                let base = row * width + (targets.labels[i] as usize - 1) * 4;
                mask[base..base + 4].copy_from_slice(&[1.0; 4]);
                target[base..base + 4].copy_from_slice(&targets.bbox_targets[i]);
            }
            let idx =
                Tensor::<B, 1, Int>::from_data(TensorData::new(foreground, [num_fg]), &device);
            let pred = prediction.bbox_pred.clone().select(0, idx);
            let mask = Tensor::<B, 2>::from_data(TensorData::new(mask, [num_fg, width]), &device);
            let target =
                Tensor::<B, 2>::from_data(TensorData::new(target, [num_fg, width]), &device);
            smooth_l1((pred - target) * mask, self.config.0.sigma)
                .sum()
                .div_scalar(count as f32)
        };
        terms.insert(RCNN_REG_LOSS, reg);
        Some(terms)
    }

    pub fn regularization(&self) -> Tensor<B, 1> {
        self.fc1.weight.val().powf_scalar(2.0).sum()
            + self.fc2.weight.val().powf_scalar(2.0).sum()
            + self.cls.weight.val().powf_scalar(2.0).sum()
            + self.bbox.weight.val().powf_scalar(2.0).sum()
    }
}
