use data_contracts::ValidationError;
use frcnn::cli::{run_forward, ForwardArgs};
use image::{Rgb, RgbImage};
use std::fs;

const TINY_CONFIG: &str = r#"
seed = 3

[anchors]
scales = [1.0, 2.0]
ratios = [0.5, 1.0, 2.0]

[backbone]
kind = "vgg"
channels = [2, 2, 4, 4, 4]

[rpn]
hidden_channels = 4
pre_nms_top_n_train = 64
post_nms_top_n_train = 16
batch_size = 32

[rcnn]
num_classes = 2
pooled_size = 2
hidden = 8
minibatch_size = 16
"#;

fn args(dir: &std::path::Path, gt: Vec<String>, eval: bool) -> ForwardArgs {
    ForwardArgs {
        config: Some(dir.join("frcnn.toml")),
        image: dir.join("input.png"),
        gt,
        backbone: None,
        debug: false,
        no_rcnn: false,
        eval,
        metrics_out: Some(dir.join("metrics.jsonl")),
        seed: None,
    }
}

fn setup() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("frcnn.toml"), TINY_CONFIG).unwrap();
    let img = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
    img.save(dir.path().join("input.png")).unwrap();
    dir
}

#[test]
fn training_run_appends_loss_metrics() {
    let dir = setup();
    run_forward(args(dir.path(), vec!["4,4,40,30,1".into()], false)).unwrap();
    run_forward(args(dir.path(), vec!["4,4,40,30,1".into()], false)).unwrap();

    let text = fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
    let rows: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(rows.iter().any(|r| r["name"] == "total_loss" && r["tag"] == "losses"));
    assert!(rows.iter().any(|r| r["name"] == "num_proposals"));
}

#[test]
fn eval_run_has_no_loss_metrics() {
    let dir = setup();
    run_forward(args(dir.path(), Vec::new(), true)).unwrap();
    let text = fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
    assert!(!text.contains("total_loss"));
}

#[test]
fn box_outside_image_is_rejected() {
    let dir = setup();
    let err = run_forward(args(dir.path(), vec!["4,4,80,30".into()], false)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ValidationError>(),
        Some(ValidationError::OutOfBounds { .. })
    ));
}

#[test]
fn label_beyond_class_count_is_rejected() {
    let dir = setup();
    assert!(run_forward(args(dir.path(), vec!["4,4,40,30,5".into()], false)).is_err());
}
