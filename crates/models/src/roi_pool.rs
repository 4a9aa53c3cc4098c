use burn::module::Module;
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::{backend::Backend, Tensor};

use crate::boxes;

#[derive(Debug, Clone)]
pub struct RoiPrediction<B: Backend> {
    /// `[num_proposals, C, pooled_size, pooled_size]`.
    pub pooled: Tensor<B, 4>,
}

/// Crops every proposal out of the feature map and pools it to a fixed grid.
/// Gradients flow back into the feature map through the crops.
#[derive(Module, Clone, Debug)]
pub struct RoiPooling {
    pooled_size: usize,
}

impl RoiPooling {
    pub fn new(pooled_size: usize) -> Self {
        Self {
            pooled_size: pooled_size.max(1),
        }
    }

    pub fn pooled_size(&self) -> usize {
        self.pooled_size
    }

    /// Feature-map cell range `[start, end)` covered by `[lo, hi]` pixels.
    fn cell_range(lo: f32, hi: f32, scale: f32, cells: usize) -> (usize, usize) {
        let last = cells.saturating_sub(1) as f32;
        let start = (lo * scale).floor().clamp(0.0, last) as usize;
        let end = ((hi * scale).ceil() as usize).clamp(start + 1, cells.max(1));
        (start, end)
    }

    /// `image_shape` is `(height, width)` in pixels.
    pub fn forward<B: Backend>(
        &self,
        proposals: Tensor<B, 2>,
        feature_map: Tensor<B, 4>,
        image_shape: (usize, usize),
    ) -> RoiPrediction<B> {
        let [_, channels, fh, fw] = feature_map.dims();
        let scale_y = fh as f32 / image_shape.0.max(1) as f32;
        let scale_x = fw as f32 / image_shape.1.max(1) as f32;
        let p = self.pooled_size;

        let crops: Vec<Tensor<B, 4>> = boxes::tensor_to_boxes(proposals)
            .iter()
            .map(|b| {
                let (x0, x1) = Self::cell_range(b[0], b[2], scale_x, fw);
                let (y0, y1) = Self::cell_range(b[1], b[3], scale_y, fh);
                let crop = feature_map
                    .clone()
                    .slice([0..1, 0..channels, y0..y1, x0..x1]);
                adaptive_avg_pool2d(crop, [p, p])
            })
            .collect();

        RoiPrediction {
            pooled: Tensor::cat(crops, 0),
        }
    }
}
