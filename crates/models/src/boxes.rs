//! Host-side box geometry in absolute `[x1, y1, x2, y2]` pixel coordinates.
//!
//! Widths are `x2 - x1` (continuous convention); the anchor generator builds
//! boxes the same way so encode/decode round-trips exactly.

use burn::tensor::{backend::Backend, Tensor, TensorData};

/// Upper bound on `dw`/`dh` before `exp`, i.e. a box may grow at most
/// 1000/16 times in one regression step.
pub const BBOX_XFORM_CLIP: f32 = 4.135_166_5;

pub fn width(b: &[f32; 4]) -> f32 {
    b[2] - b[0]
}

pub fn height(b: &[f32; 4]) -> f32 {
    b[3] - b[1]
}

pub fn area(b: &[f32; 4]) -> f32 {
    width(b).max(0.0) * height(b).max(0.0)
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x0 = a[0].max(b[0]);
    let y0 = a[1].max(b[1]);
    let x1 = a[2].min(b[2]);
    let y1 = a[3].min(b[3]);
    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Row-major `[boxes.len(), query.len()]` overlap table.
pub fn iou_matrix(boxes: &[[f32; 4]], query: &[[f32; 4]]) -> Vec<f32> {
    let mut out = Vec::with_capacity(boxes.len() * query.len());
    for b in boxes {
        for q in query {
            out.push(iou(b, q));
        }
    }
    out
}

/// Regression target `(dx, dy, dw, dh)` that moves `reference` onto `target`.
pub fn encode(reference: &[f32; 4], target: &[f32; 4]) -> [f32; 4] {
    let rw = width(reference).max(1e-6);
    let rh = height(reference).max(1e-6);
    let rcx = reference[0] + 0.5 * rw;
    let rcy = reference[1] + 0.5 * rh;

    let tw = width(target).max(1e-6);
    let th = height(target).max(1e-6);
    let tcx = target[0] + 0.5 * tw;
    let tcy = target[1] + 0.5 * th;

    [
        (tcx - rcx) / rw,
        (tcy - rcy) / rh,
        (tw / rw).ln(),
        (th / rh).ln(),
    ]
}

/// Inverse of [`encode`].
pub fn decode(reference: &[f32; 4], deltas: &[f32; 4]) -> [f32; 4] {
    let rw = width(reference);
    let rh = height(reference);
    let rcx = reference[0] + 0.5 * rw;
    let rcy = reference[1] + 0.5 * rh;

    let cx = deltas[0] * rw + rcx;
    let cy = deltas[1] * rh + rcy;
    let w = deltas[2].min(BBOX_XFORM_CLIP).exp() * rw;
    let h = deltas[3].min(BBOX_XFORM_CLIP).exp() * rh;

    [cx - 0.5 * w, cy - 0.5 * h, cx + 0.5 * w, cy + 0.5 * h]
}

/// Clamp into `[0, width] x [0, height]`; `image_shape` is `(height, width)`.
pub fn clip(b: &[f32; 4], image_shape: (usize, usize)) -> [f32; 4] {
    let (h, w) = (image_shape.0 as f32, image_shape.1 as f32);
    [
        b[0].clamp(0.0, w),
        b[1].clamp(0.0, h),
        b[2].clamp(0.0, w),
        b[3].clamp(0.0, h),
    ]
}

pub fn is_inside(b: &[f32; 4], image_shape: (usize, usize), border: f32) -> bool {
    let (h, w) = (image_shape.0 as f32, image_shape.1 as f32);
    b[0] >= -border && b[1] >= -border && b[2] <= w + border && b[3] <= h + border
}

/// Greedy non-maximum suppression. Returns kept indices, best score first.
pub fn nms(boxes: &[[f32; 4]], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..boxes.len()).collect();
    // Ascending so `pop` yields the highest score.
    idxs.sort_by(|a, b| {
        scores[*a]
            .partial_cmp(&scores[*b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    while let Some(i) = idxs.pop() {
        keep.push(i);
        idxs.retain(|&j| iou(&boxes[i], &boxes[j]) <= iou_thresh);
    }
    keep
}

/// Indices of `scores` sorted descending, truncated to `top_n`.
pub fn top_n(scores: &[f32], top_n: usize) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..scores.len()).collect();
    idxs.sort_by(|a, b| {
        scores[*b]
            .partial_cmp(&scores[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    idxs.truncate(top_n);
    idxs
}

pub fn boxes_to_tensor<B: Backend>(boxes: &[[f32; 4]], device: &B::Device) -> Tensor<B, 2> {
    let flat: Vec<f32> = boxes.iter().flatten().copied().collect();
    Tensor::from_data(TensorData::new(flat, [boxes.len(), 4]), device)
}

pub fn tensor_to_boxes<B: Backend>(tensor: Tensor<B, 2>) -> Vec<[f32; 4]> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect()
}
