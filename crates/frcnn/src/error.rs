use data_contracts::{ConfigError, ValidationError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FrcnnError>;

#[derive(Debug, Error, PartialEq)]
pub enum AnchorError {
    #[error("anchor {field} must not be empty")]
    Empty { field: &'static str },
    #[error("anchor {field} must be positive and finite, got {value}")]
    NonPositive { field: &'static str, value: f32 },
    #[error("anchor stride must be positive")]
    ZeroStride,
    #[error("anchor with ratio {ratio} and scale {scale} rounds to zero size ({width}x{height})")]
    Degenerate {
        ratio: f32,
        scale: f32,
        width: f32,
        height: f32,
    },
}

#[derive(Debug, Error)]
pub enum FrcnnError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{stage} loss requested but the forward pass ran without training targets")]
    MissingTargets { stage: &'static str },
}
