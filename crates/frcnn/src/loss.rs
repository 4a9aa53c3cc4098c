//! Weighted multi-task loss composition.

use burn::tensor::{backend::Backend, Tensor};
use data_contracts::LossConfig;
use models::loss::scalar_value;
use models::{LossTerms, RCNN_CLS_LOSS, RCNN_REG_LOSS, RPN_CLS_LOSS, RPN_REG_LOSS};

/// Per-term multipliers. Box regression is weighted above classification in
/// both stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub rpn_cls: f32,
    pub rpn_reg: f32,
    pub rcnn_cls: f32,
    pub rcnn_reg: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            rpn_cls: 1.0,
            rpn_reg: 2.0,
            rcnn_cls: 1.0,
            rcnn_reg: 2.0,
        }
    }
}

impl From<&LossConfig> for LossWeights {
    fn from(cfg: &LossConfig) -> Self {
        Self {
            rpn_cls: cfg.rpn_cls_weight,
            rpn_reg: cfg.rpn_reg_weight,
            rcnn_cls: cfg.rcnn_cls_weight,
            rcnn_reg: cfg.rcnn_reg_weight,
        }
    }
}

/// Itemised result of one loss evaluation. Stage terms are already weighted.
#[derive(Debug, Clone)]
pub struct LossReport<B: Backend> {
    /// Used for gradients: `no_reg + regularization`.
    pub total: Tensor<B, 1>,
    pub no_reg: Tensor<B, 1>,
    pub regularization: Tensor<B, 1>,
    pub rpn: LossTerms<B>,
    pub rcnn: Option<LossTerms<B>>,
}

impl<B: Backend> LossReport<B> {
    /// Every weighted term followed by the three totals, pulled to the host.
    pub fn values(&self) -> Vec<(String, f32)> {
        let mut out: Vec<(String, f32)> = self
            .rpn
            .iter()
            .chain(self.rcnn.iter().flat_map(|t| t.iter()))
            .map(|(name, t)| (name.to_string(), scalar_value(t.clone())))
            .collect();
        out.push(("total_loss".into(), scalar_value(self.total.clone())));
        out.push(("no_reg_loss".into(), scalar_value(self.no_reg.clone())));
        out.push((
            "regularization_loss".into(),
            scalar_value(self.regularization.clone()),
        ));
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LossAggregator {
    weights: LossWeights,
}

impl LossAggregator {
    pub fn new(weights: LossWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> LossWeights {
        self.weights
    }

    /// Weight every stage term and sum them. `rcnn` is `None` when the
    /// classification head did not run.
    pub fn aggregate<B: Backend>(
        &self,
        mut rpn: LossTerms<B>,
        rcnn: Option<LossTerms<B>>,
        regularization: Tensor<B, 1>,
    ) -> LossReport<B> {
        rpn.scale(RPN_CLS_LOSS, self.weights.rpn_cls);
        rpn.scale(RPN_REG_LOSS, self.weights.rpn_reg);
        let rcnn = rcnn.map(|mut terms| {
            terms.scale(RCNN_CLS_LOSS, self.weights.rcnn_cls);
            terms.scale(RCNN_REG_LOSS, self.weights.rcnn_reg);
            terms
        });

        let no_reg = rpn
            .iter()
            .chain(rcnn.iter().flat_map(|t| t.iter()))
            .map(|(_, t)| t.clone())
            .reduce(|a, b| a + b)
            .unwrap_or_else(|| regularization.zeros_like());
        let total = no_reg.clone() + regularization.clone();

        LossReport {
            total,
            no_reg,
            regularization,
            rpn,
            rcnn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn terms(pairs: &[(&str, f32)]) -> LossTerms<B> {
        let device = Default::default();
        let mut t = LossTerms::new();
        for (name, v) in pairs {
            t.insert(*name, Tensor::from_floats([*v], &device));
        }
        t
    }

    #[test]
    fn unknown_terms_pass_through_unweighted() {
        let device = Default::default();
        let rpn = terms(&[(RPN_CLS_LOSS, 1.0), ("rpn_extra", 0.25)]);
        let zero = Tensor::<B, 1>::zeros([1], &device);
        let report = LossAggregator::default().aggregate(rpn, None, zero);
        assert!((scalar_value(report.no_reg) - 1.25).abs() < 1e-6);
    }
}
