use data_contracts::{BackboneKind, ConfigError, FasterRcnnConfig};
use std::fs;

#[test]
fn partial_toml_fills_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frcnn.toml");
    fs::write(
        &path,
        r#"
debug = true

[anchors]
stride = 8
scales = [1.0, 2.0]

[backbone]
kind = "resnetv2"
trainable = false

[rcnn]
num_classes = 3
"#,
    )
    .unwrap();

    let cfg = FasterRcnnConfig::from_path(&path).unwrap();
    assert!(cfg.debug);
    assert_eq!(cfg.anchors.stride, 8);
    assert_eq!(cfg.anchors.scales, vec![1.0, 2.0]);
    assert_eq!(cfg.anchors.ratios, vec![0.5, 1.0, 2.0]);
    assert_eq!(cfg.backbone.kind, BackboneKind::ResnetV2);
    assert!(!cfg.backbone.trainable);
    assert_eq!(cfg.rcnn.num_classes, 3);
    assert!(cfg.rcnn.enabled);
    assert_eq!(cfg.loss.rcnn_reg_weight, 2.0);
}

#[test]
fn unknown_backbone_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frcnn.toml");
    fs::write(&path, "[backbone]\nkind = \"mobilenet\"\n").unwrap();

    let err = FasterRcnnConfig::from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Toml { .. }));
    assert!(err.to_string().contains("frcnn.toml"));
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = FasterRcnnConfig::from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn config_serializes_backbone_as_identifier() {
    let cfg = FasterRcnnConfig::default();
    let json = serde_json::to_value(&cfg).unwrap();
    assert_eq!(json["backbone"]["kind"], "vgg");
}
