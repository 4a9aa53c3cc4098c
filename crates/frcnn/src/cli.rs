//! `frcnn_forward`: one forward (and loss, when ground truth is given) pass
//! over a single image.

use anyhow::Context;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use clap::Parser;
use data_contracts::{FasterRcnnConfig, GroundTruthBox};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::metrics::{JsonlSink, MetricsSink, TracingSink};
use crate::{FasterRcnn, FrcnnBackend};

#[derive(Parser, Debug)]
#[command(
    name = "frcnn_forward",
    about = "Run one Faster R-CNN forward pass (and loss when ground truth is given)"
)]
pub struct ForwardArgs {
    /// TOML config; falls back to $FRCNN_CONFIG, ./frcnn.toml, then defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Input image (any format the `image` crate decodes).
    #[arg(long)]
    pub image: PathBuf,
    /// Ground-truth box `x1,y1,x2,y2[,label]` in pixels; repeatable.
    #[arg(long = "gt")]
    pub gt: Vec<String>,
    /// Backbone override: vgg, resnet or resnetv2.
    #[arg(long)]
    pub backbone: Option<String>,
    /// Keep raw intermediates in the prediction bundle.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Skip ROI pooling and the classification head.
    #[arg(long, default_value_t = false)]
    pub no_rcnn: bool,
    /// Inference mode even when ground truth is given: no targets, no loss.
    #[arg(long, default_value_t = false)]
    pub eval: bool,
    /// Append metrics as JSON lines to this file.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
    /// Override the sampling seed.
    #[arg(long)]
    pub seed: Option<u64>,
}

pub fn parse_gt(raw: &str) -> anyhow::Result<GroundTruthBox> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != 4 && parts.len() != 5 {
        anyhow::bail!("expected x1,y1,x2,y2[,label], got {raw:?}");
    }
    let mut bbox = [0.0f32; 4];
    for (slot, part) in bbox.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .with_context(|| format!("invalid coordinate {part:?} in {raw:?}"))?;
    }
    let label = match parts.get(4) {
        Some(l) => l
            .parse()
            .with_context(|| format!("invalid label {l:?} in {raw:?}"))?,
        None => 0,
    };
    let gt = GroundTruthBox::new(bbox, label);
    gt.validate()?;
    Ok(gt)
}

/// Decode to `[1, H, W, 3]` with channel values in 0..255.
pub fn load_image<B: Backend>(path: &Path, device: &B::Device) -> anyhow::Result<Tensor<B, 4>> {
    let rgb = image::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open image {:?}: {e}", path))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let data: Vec<f32> = rgb.as_raw().iter().map(|v| *v as f32).collect();
    Ok(Tensor::from_data(
        TensorData::new(data, [1, height as usize, width as usize, 3]),
        device,
    ))
}

pub fn resolve_config(args: &ForwardArgs) -> anyhow::Result<FasterRcnnConfig> {
    let mut cfg = match &args.config {
        Some(path) => FasterRcnnConfig::from_path(path)?,
        None => FasterRcnnConfig::load(),
    };
    if let Some(backbone) = &args.backbone {
        cfg.backbone.kind = backbone.parse()?;
    }
    if args.debug {
        cfg.debug = true;
    }
    if args.no_rcnn {
        cfg.rcnn.enabled = false;
    }
    if let Some(seed) = args.seed {
        cfg.seed = seed;
    }
    Ok(cfg)
}

pub fn run_forward(args: ForwardArgs) -> anyhow::Result<()> {
    let cfg = resolve_config(&args)?;
    let gt_boxes = args
        .gt
        .iter()
        .map(|raw| parse_gt(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let device = <FrcnnBackend as Backend>::Device::default();
    let image = load_image::<FrcnnBackend>(&args.image, &device)?;
    let [_, height, width, _] = image.dims();
    data_contracts::boxes::validate_all(&gt_boxes, (height, width), cfg.rcnn.num_classes)?;

    let model = FasterRcnn::<FrcnnBackend>::new(cfg, &device)?;
    let is_training = !args.eval && !gt_boxes.is_empty();
    let mut bundle = model.forward(image, &gt_boxes, is_training)?;
    println!(
        "image {}x{}: {} proposals",
        width,
        height,
        bundle.rpn.num_proposals()
    );
    if let Some(classification) = &bundle.classification {
        let detected = classification.labels.iter().filter(|l| **l > 0).count();
        println!("classification head: {detected} non-background detections");
    }

    if is_training {
        model.loss(&mut bundle)?;
        if let Some(report) = &bundle.losses {
            for (name, value) in report.values() {
                println!("{name}: {value:.4}");
            }
        }
    }

    let metrics = model.summary(&bundle);
    TracingSink.record(&metrics)?;
    if let Some(path) = &args.metrics_out {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open metrics file {}", path.display()))?;
        JsonlSink::new(file).record(&metrics)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gt_with_and_without_label() {
        let gt = parse_gt("1, 2, 30, 40").unwrap();
        assert_eq!(gt, GroundTruthBox::new([1.0, 2.0, 30.0, 40.0], 0));
        let gt = parse_gt("1,2,30,40,3").unwrap();
        assert_eq!(gt.label, 3);
    }

    #[test]
    fn parse_gt_rejects_bad_input() {
        assert!(parse_gt("1,2,3").is_err());
        assert!(parse_gt("1,2,x,4").is_err());
        assert!(parse_gt("10,2,3,4").is_err());
    }

    #[test]
    fn cli_overrides_apply() {
        let args = ForwardArgs::parse_from([
            "frcnn_forward",
            "--image",
            "img.png",
            "--backbone",
            "resnet",
            "--no-rcnn",
            "--seed",
            "9",
        ]);
        let cfg = resolve_config(&args).unwrap();
        assert_eq!(cfg.backbone.kind, data_contracts::BackboneKind::Resnet);
        assert!(!cfg.rcnn.enabled);
        assert_eq!(cfg.seed, 9);
        assert!(!cfg.debug);
    }
}
