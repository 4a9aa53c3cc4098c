//! Pretrained-style feature extractors. Both families downsample by 16.
//!
//! Input images are `[1, H, W, 3]` in 0..255 (NHWC); feature maps come out
//! as `[1, C, H/16, W/16]` (NCHW).

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};
use data_contracts::{BackboneConfig, BackboneKind};

const VGG_CONVS_PER_BLOCK: [usize; 5] = [2, 2, 3, 3, 3];
const VGG_MEANS: [f32; 3] = [123.68, 116.78, 103.94];

/// Feature map plus named intermediate activations.
#[derive(Debug, Clone)]
pub struct BackboneOutput<B: Backend> {
    pub feature_map: Tensor<B, 4>,
    pub endpoints: Vec<(String, Tensor<B, 4>)>,
}

fn conv3x3<B: Backend>(cin: usize, cout: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([cin, cout], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

fn squared_sum<B: Backend, const D: usize>(weight: Tensor<B, D>) -> Tensor<B, 1> {
    weight.powf_scalar(2.0).sum()
}

#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

/// VGG-16 layout: five conv blocks, 2x2 max pooling after the first four.
#[derive(Module, Debug)]
pub struct Vgg<B: Backend> {
    blocks: Vec<VggBlock<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> Vgg<B> {
    pub fn new(channels: &[usize], device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(VGG_CONVS_PER_BLOCK.len());
        let mut cin = 3;
        for (i, n_convs) in VGG_CONVS_PER_BLOCK.iter().enumerate() {
            let cout = channels.get(i).copied().unwrap_or(cin);
            let mut convs = Vec::with_capacity(*n_convs);
            for c in 0..*n_convs {
                let input = if c == 0 { cin } else { cout };
                convs.push(conv3x3(input, cout, 1, device));
            }
            blocks.push(VggBlock { convs });
            cin = cout;
        }
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        Self { blocks, pool }
    }

    pub fn out_channels(&self) -> usize {
        self.blocks
            .last()
            .and_then(|b| b.convs.last())
            .map(|c| c.weight.dims()[0])
            .unwrap_or(3)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> BackboneOutput<B> {
        let mut x = x;
        let mut endpoints = Vec::with_capacity(self.blocks.len());
        let last = self.blocks.len().saturating_sub(1);
        for (i, block) in self.blocks.iter().enumerate() {
            for conv in &block.convs {
                x = relu(conv.forward(x));
            }
            endpoints.push((format!("conv{}", i + 1), x.clone()));
            if i < last {
                x = self.pool.forward(x);
            }
        }
        BackboneOutput {
            feature_map: x,
            endpoints,
        }
    }

    pub fn regularization(&self, device: &B::Device) -> Tensor<B, 1> {
        let mut total = Tensor::<B, 1>::zeros([1], device);
        for conv in self.blocks.iter().flat_map(|b| b.convs.iter()) {
            total = total + squared_sum(conv.weight.val());
        }
        total
    }
}

/// Pre-activation residual block (BN -> ReLU -> conv, twice).
#[derive(Module, Debug)]
pub struct PreActBlock<B: Backend> {
    bn1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> PreActBlock<B> {
    fn new(cin: usize, cout: usize, stride: usize, device: &B::Device) -> Self {
        let shortcut = (cin != cout || stride != 1).then(|| {
            Conv2dConfig::new([cin, cout], [1, 1])
                .with_stride([stride, stride])
                .init(device)
        });
        Self {
            bn1: BatchNormConfig::new(cin).init(device),
            conv1: conv3x3(cin, cout, stride, device),
            bn2: BatchNormConfig::new(cout).init(device),
            conv2: conv3x3(cout, cout, 1, device),
            shortcut,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let preact = relu(self.bn1.forward(x.clone()));
        let residual = match &self.shortcut {
            Some(conv) => conv.forward(preact.clone()),
            None => x,
        };
        let out = self.conv1.forward(preact);
        let out = self.conv2.forward(relu(self.bn2.forward(out)));
        out + residual
    }

    fn regularization(&self) -> Tensor<B, 1> {
        let mut total = squared_sum(self.conv1.weight.val()) + squared_sum(self.conv2.weight.val());
        if let Some(conv) = &self.shortcut {
            total = total + squared_sum(conv.weight.val());
        }
        total
    }
}

#[derive(Module, Debug)]
pub struct ResNetStage<B: Backend> {
    blocks: Vec<PreActBlock<B>>,
}

/// ResNet v2: 7x7/2 stem, 3x3/2 max pool, then three pre-activation stages
/// where the second and third halve the resolution.
#[derive(Module, Debug)]
pub struct ResNetV2<B: Backend> {
    stem: Conv2d<B>,
    stem_pool: MaxPool2d,
    stages: Vec<ResNetStage<B>>,
    post_norm: BatchNorm<B, 2>,
}

impl<B: Backend> ResNetV2<B> {
    pub fn new(channels: &[usize], blocks: &[usize], device: &B::Device) -> Self {
        let stem_out = channels.first().copied().unwrap_or(64);
        let stem = Conv2dConfig::new([3, stem_out], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .init(device);
        let stem_pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut stages = Vec::with_capacity(3);
        let mut cin = stem_out;
        for stage in 0..3 {
            let cout = channels.get(stage + 1).copied().unwrap_or(cin);
            let n_blocks = blocks.get(stage).copied().unwrap_or(1).max(1);
            let stride = if stage == 0 { 1 } else { 2 };
            let mut stage_blocks = Vec::with_capacity(n_blocks);
            for b in 0..n_blocks {
                let (input, s) = if b == 0 { (cin, stride) } else { (cout, 1) };
                stage_blocks.push(PreActBlock::new(input, cout, s, device));
            }
            stages.push(ResNetStage {
                blocks: stage_blocks,
            });
            cin = cout;
        }

        Self {
            stem,
            stem_pool,
            stages,
            post_norm: BatchNormConfig::new(cin).init(device),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.post_norm.gamma.dims()[0]
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> BackboneOutput<B> {
        let mut endpoints = Vec::with_capacity(self.stages.len() + 1);
        let mut x = self.stem_pool.forward(self.stem.forward(x));
        endpoints.push(("stem".to_string(), x.clone()));
        for (i, stage) in self.stages.iter().enumerate() {
            for block in &stage.blocks {
                x = block.forward(x);
            }
            endpoints.push((format!("block{}", i + 1), x.clone()));
        }
        let feature_map = relu(self.post_norm.forward(x));
        BackboneOutput {
            feature_map,
            endpoints,
        }
    }

    pub fn regularization(&self, device: &B::Device) -> Tensor<B, 1> {
        let mut total = Tensor::<B, 1>::zeros([1], device) + squared_sum(self.stem.weight.val());
        for block in self.stages.iter().flat_map(|s| s.blocks.iter()) {
            total = total + block.regularization();
        }
        total
    }
}

/// Backbone selected by [`BackboneKind`]; exactly one of the variants is set.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    vgg: Option<Vgg<B>>,
    resnet: Option<ResNetV2<B>>,
    kind: Ignored<BackboneKind>,
}

impl<B: Backend> Backbone<B> {
    pub fn new(config: &BackboneConfig, device: &B::Device) -> Self {
        let channels = config.resolved_channels();
        let (vgg, resnet) = match config.kind {
            BackboneKind::Vgg => (Some(Vgg::new(&channels, device)), None),
            BackboneKind::Resnet | BackboneKind::ResnetV2 => (
                None,
                Some(ResNetV2::new(&channels, &config.resnet_blocks, device)),
            ),
        };
        let backbone = Self {
            vgg,
            resnet,
            kind: Ignored(config.kind),
        };
        if config.trainable {
            backbone
        } else {
            backbone.no_grad()
        }
    }

    pub fn kind(&self) -> BackboneKind {
        self.kind.0
    }

    /// Total downsampling between image pixels and feature-map cells.
    pub fn stride(&self) -> usize {
        16
    }

    pub fn out_channels(&self) -> usize {
        match (&self.vgg, &self.resnet) {
            (Some(vgg), _) => vgg.out_channels(),
            (_, Some(resnet)) => resnet.out_channels(),
            _ => 0,
        }
    }

    /// Permute to NCHW and normalise the way each family was pretrained.
    fn preprocess(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = image.permute([0, 3, 1, 2]);
        match self.kind.0 {
            BackboneKind::Vgg => {
                let means =
                    Tensor::<B, 1>::from_floats(VGG_MEANS, &x.device()).reshape([1, 3, 1, 1]);
                x - means
            }
            BackboneKind::Resnet | BackboneKind::ResnetV2 => x.div_scalar(127.5).sub_scalar(1.0),
        }
    }

    pub fn forward(&self, image: Tensor<B, 4>) -> BackboneOutput<B> {
        let x = self.preprocess(image);
        match (&self.vgg, &self.resnet) {
            (Some(vgg), _) => vgg.forward(x),
            (_, Some(resnet)) => resnet.forward(x),
            _ => BackboneOutput {
                feature_map: x,
                endpoints: Vec::new(),
            },
        }
    }

    pub fn regularization(&self, device: &B::Device) -> Tensor<B, 1> {
        match (&self.vgg, &self.resnet) {
            (Some(vgg), _) => vgg.regularization(device),
            (_, Some(resnet)) => resnet.regularization(device),
            _ => Tensor::zeros([1], device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn config(kind: BackboneKind, channels: Vec<usize>) -> BackboneConfig {
        BackboneConfig {
            kind,
            trainable: true,
            channels: Some(channels),
            resnet_blocks: vec![1, 1, 1],
        }
    }

    #[test]
    fn vgg_downsamples_by_sixteen() {
        let device = Default::default();
        let backbone = Backbone::<B>::new(&config(BackboneKind::Vgg, vec![2, 2, 4, 4, 6]), &device);
        let image = Tensor::<B, 4>::zeros([1, 64, 48, 3], &device);
        let out = backbone.forward(image);
        assert_eq!(out.feature_map.dims(), [1, 6, 4, 3]);
        assert_eq!(out.endpoints.len(), 5);
        assert_eq!(out.endpoints[0].0, "conv1");
        assert_eq!(backbone.out_channels(), 6);
    }

    #[test]
    fn resnet_downsamples_by_sixteen() {
        let device = Default::default();
        let backbone =
            Backbone::<B>::new(&config(BackboneKind::ResnetV2, vec![4, 4, 8, 8]), &device);
        let image = Tensor::<B, 4>::zeros([1, 64, 32, 3], &device);
        let out = backbone.forward(image);
        assert_eq!(out.feature_map.dims(), [1, 8, 4, 2]);
        assert_eq!(backbone.out_channels(), 8);
        assert_eq!(backbone.stride(), 16);
    }
}
