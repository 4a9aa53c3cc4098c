use burn::backend::Autodiff;
use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use data_contracts::{GroundTruthBox, RcnnConfig, RpnConfig};
use models::loss::scalar_value;
use models::{
    boxes, Rcnn, RoiPooling, Rpn, RCNN_CLS_LOSS, RCNN_REG_LOSS, RPN_CLS_LOSS, RPN_REG_LOSS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

// CPU backend keeps the check independent of any GPU feature.
type ADBackend = Autodiff<NdArray<f32>>;

fn grid_anchors(h: usize, w: usize, stride: f32, side: f32) -> Vec<[f32; 4]> {
    let mut out = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let (sx, sy) = (x as f32 * stride, y as f32 * stride);
            out.push([sx, sy, sx + side, sy + side]);
        }
    }
    out
}

#[test]
fn rpn_loss_is_finite_and_backpropagates() {
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let rpn = Rpn::<ADBackend>::new(
        4,
        1,
        RpnConfig {
            hidden_channels: 4,
            batch_size: 16,
            ..Default::default()
        },
        &device,
    );
    let feature_map = Tensor::<ADBackend, 4>::ones([1, 4, 4, 4], &device).require_grad();
    let anchors = grid_anchors(4, 4, 16.0, 16.0);
    let gt = vec![GroundTruthBox::new([16.0, 16.0, 34.0, 30.0], 0)];
    let mut rng = StdRng::seed_from_u64(11);

    let pred = rpn.forward(feature_map.clone(), &gt, (64, 64), &anchors, true, &mut rng);
    let targets = pred.targets.clone().unwrap();
    assert!(targets.num_positive() >= 1);

    let terms = rpn.loss(&pred).unwrap();
    let cls = terms.get(RPN_CLS_LOSS).unwrap().clone();
    let reg = terms.get(RPN_REG_LOSS).unwrap().clone();
    assert!(scalar_value(cls.clone()).is_finite());
    assert!(scalar_value(reg.clone()) > 0.0);

    let grads = (cls + reg).backward();
    let fm_grad = feature_map.grad(&grads).expect("feature map receives gradient");
    let values = fm_grad.into_data().to_vec::<f32>().unwrap();
    assert!(values.iter().any(|g| *g != 0.0));
}

#[test]
fn roi_pool_then_rcnn_loss() {
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let feature_map = Tensor::<ADBackend, 4>::ones([1, 3, 4, 4], &device).require_grad();
    let proposals = boxes::boxes_to_tensor::<ADBackend>(
        &[[0.0, 0.0, 32.0, 32.0], [30.0, 30.0, 64.0, 64.0], [0.0, 40.0, 20.0, 64.0]],
        &device,
    );
    let pooled = RoiPooling::new(2).forward(proposals.clone(), feature_map.clone(), (64, 64));
    assert_eq!(pooled.pooled.dims(), [3, 3, 2, 2]);

    let rcnn = Rcnn::<ADBackend>::new(
        3,
        RcnnConfig {
            num_classes: 2,
            pooled_size: 2,
            hidden: 8,
            ..Default::default()
        },
        &device,
    );
    let gt = vec![GroundTruthBox::new([2.0, 2.0, 30.0, 34.0], 0)];
    let mut rng = StdRng::seed_from_u64(5);
    let pred = rcnn.forward(pooled.pooled, proposals, &gt, (64, 64), true, &mut rng);
    assert_eq!(pred.targets.as_ref().unwrap().labels[0], 1);

    let terms = rcnn.loss(&pred).unwrap();
    let total =
        terms.get(RCNN_CLS_LOSS).unwrap().clone() + terms.get(RCNN_REG_LOSS).unwrap().clone();
    assert!(scalar_value(total.clone()).is_finite());

    let grads = total.backward();
    let fm_grad = feature_map.grad(&grads).expect("feature map receives gradient");
    assert_eq!(fm_grad.dims(), [1, 3, 4, 4]);
}
