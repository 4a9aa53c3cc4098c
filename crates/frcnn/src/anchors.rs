//! Anchor generation.
//!
//! Reference anchors are centred on the origin; ratio is width / height:
//! `w = round(base * scale * sqrt(ratio))`, `h = round(base * scale / sqrt(ratio))`,
//! box `(-w/2, -h/2, w/2, h/2)`. Order is ratio-major (every scale for the
//! first ratio, then the next ratio).
//!
//! The grid is laid out cell-major, anchor-minor: anchor `a` of cell `(y, x)`
//! sits at flat index `(y * W + x) * A + a`, translated by the cell origin
//! `(x * stride, y * stride)`. The RPN flattens its outputs the same way.

use burn::tensor::{backend::Backend, Tensor};
use data_contracts::AnchorConfig;

use crate::error::AnchorError;

pub fn generate_reference_anchors(
    base_size: f32,
    ratios: &[f32],
    scales: &[f32],
) -> Result<Vec<[f32; 4]>, AnchorError> {
    if ratios.is_empty() {
        return Err(AnchorError::Empty { field: "ratios" });
    }
    if scales.is_empty() {
        return Err(AnchorError::Empty { field: "scales" });
    }
    let check = |field: &'static str, value: f32| {
        if value.is_finite() && value > 0.0 {
            Ok(())
        } else {
            Err(AnchorError::NonPositive { field, value })
        }
    };
    check("base_size", base_size)?;
    for &r in ratios {
        check("ratios", r)?;
    }
    for &s in scales {
        check("scales", s)?;
    }

    let mut anchors = Vec::with_capacity(ratios.len() * scales.len());
    for &ratio in ratios {
        let sqrt_ratio = ratio.sqrt();
        for &scale in scales {
            let width = (base_size * scale * sqrt_ratio).round();
            let height = (base_size * scale / sqrt_ratio).round();
            if width <= 0.0 || height <= 0.0 {
                return Err(AnchorError::Degenerate {
                    ratio,
                    scale,
                    width,
                    height,
                });
            }
            anchors.push([-width / 2.0, -height / 2.0, width / 2.0, height / 2.0]);
        }
    }
    Ok(anchors)
}

/// Translate `reference` to every cell origin of an `height x width` grid.
pub fn expand_grid(
    reference: &[[f32; 4]],
    height: usize,
    width: usize,
    stride: usize,
) -> Vec<[f32; 4]> {
    let mut anchors = Vec::with_capacity(height * width * reference.len());
    for y in 0..height {
        let shift_y = (y * stride) as f32;
        for x in 0..width {
            let shift_x = (x * stride) as f32;
            for r in reference {
                anchors.push([
                    r[0] + shift_x,
                    r[1] + shift_y,
                    r[2] + shift_x,
                    r[3] + shift_y,
                ]);
            }
        }
    }
    anchors
}

/// Reference anchors fixed at construction plus the stride used to project
/// them onto a feature map.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorGenerator {
    reference: Vec<[f32; 4]>,
    stride: usize,
}

impl AnchorGenerator {
    pub fn new(config: &AnchorConfig) -> Result<Self, AnchorError> {
        if config.stride == 0 {
            return Err(AnchorError::ZeroStride);
        }
        Ok(Self {
            reference: generate_reference_anchors(
                config.base_size,
                &config.ratios,
                &config.scales,
            )?,
            stride: config.stride,
        })
    }

    pub fn reference(&self) -> &[[f32; 4]] {
        &self.reference
    }

    pub fn num_anchors(&self) -> usize {
        self.reference.len()
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn grid(&self, height: usize, width: usize) -> Vec<[f32; 4]> {
        expand_grid(&self.reference, height, width, self.stride)
    }

    /// Grid for a `[1, C, H, W]` feature map as a `[H * W * A, 4]` tensor.
    pub fn grid_for<B: Backend>(&self, feature_map: &Tensor<B, 4>) -> Tensor<B, 2> {
        let [_, _, h, w] = feature_map.dims();
        models::boxes::boxes_to_tensor(&self.grid(h, w), &feature_map.device())
    }
}
