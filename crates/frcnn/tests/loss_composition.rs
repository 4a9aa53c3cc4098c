use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use frcnn::{LossAggregator, LossWeights};
use models::loss::scalar_value;
use models::{LossTerms, RCNN_CLS_LOSS, RCNN_REG_LOSS, RPN_CLS_LOSS, RPN_REG_LOSS};

type B = NdArray<f32>;

fn ones(names: &[&str]) -> LossTerms<B> {
    let device = Default::default();
    let mut terms = LossTerms::new();
    for name in names {
        terms.insert(*name, Tensor::<B, 1>::from_floats([1.0], &device));
    }
    terms
}

fn zero() -> Tensor<B, 1> {
    Tensor::zeros([1], &Default::default())
}

#[test]
fn default_weights() {
    assert_eq!(
        LossWeights::default(),
        LossWeights {
            rpn_cls: 1.0,
            rpn_reg: 2.0,
            rcnn_cls: 1.0,
            rcnn_reg: 2.0,
        }
    );
}

#[test]
fn both_stages_weighted_sum() {
    let report = LossAggregator::default().aggregate(
        ones(&[RPN_CLS_LOSS, RPN_REG_LOSS]),
        Some(ones(&[RCNN_CLS_LOSS, RCNN_REG_LOSS])),
        zero(),
    );
    assert!((scalar_value(report.no_reg.clone()) - 6.0).abs() < 1e-6);
    assert!((scalar_value(report.total.clone()) - 6.0).abs() < 1e-6);
    assert_eq!(scalar_value(report.rpn.get(RPN_REG_LOSS).unwrap().clone()), 2.0);
    assert_eq!(report.values().len(), 7);
}

#[test]
fn rpn_only_when_head_disabled() {
    let report =
        LossAggregator::default().aggregate(ones(&[RPN_CLS_LOSS, RPN_REG_LOSS]), None, zero());
    assert!((scalar_value(report.no_reg.clone()) - 3.0).abs() < 1e-6);
    assert!(report.rcnn.is_none());
    assert!(report.values().iter().all(|(name, _)| !name.starts_with("rcnn")));
}

#[test]
fn regularization_added_to_total_only() {
    let device = Default::default();
    let reg = Tensor::<B, 1>::from_floats([0.5], &device);
    let report = LossAggregator::default().aggregate(
        ones(&[RPN_CLS_LOSS, RPN_REG_LOSS]),
        Some(ones(&[RCNN_CLS_LOSS, RCNN_REG_LOSS])),
        reg,
    );
    assert!((scalar_value(report.no_reg) - 6.0).abs() < 1e-6);
    assert!((scalar_value(report.regularization) - 0.5).abs() < 1e-6);
    assert!((scalar_value(report.total) - 6.5).abs() < 1e-6);
}

#[test]
fn custom_weights() {
    let weights = LossWeights {
        rpn_cls: 0.5,
        rpn_reg: 0.0,
        rcnn_cls: 3.0,
        rcnn_reg: 1.0,
    };
    let report = LossAggregator::new(weights).aggregate(
        ones(&[RPN_CLS_LOSS, RPN_REG_LOSS]),
        Some(ones(&[RCNN_CLS_LOSS, RCNN_REG_LOSS])),
        zero(),
    );
    assert!((scalar_value(report.no_reg) - 4.5).abs() < 1e-6);
}
