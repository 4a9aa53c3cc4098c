//! Label assignment and minibatch sampling shared by both detection stages.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Per-row best match against the ground truth: `(argmax, max_iou)`.
/// Rows with no ground truth get `(0, 0.0)`.
pub fn best_matches(overlaps: &[f32], rows: usize, cols: usize) -> Vec<(usize, f32)> {
    (0..rows)
        .map(|r| {
            let row = &overlaps[r * cols..(r + 1) * cols];
            row.iter()
                .enumerate()
                .fold((0usize, 0.0f32), |best, (c, &v)| {
                    if v > best.1 {
                        (c, v)
                    } else {
                        best
                    }
                })
        })
        .collect()
}

/// Randomly demote members of `label` beyond `max_count` to `-1` (ignored).
pub fn subsample(labels: &mut [i64], label: i64, max_count: usize, rng: &mut StdRng) {
    let mut members: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, l)| **l == label)
        .map(|(i, _)| i)
        .collect();
    if members.len() <= max_count {
        return;
    }
    members.shuffle(rng);
    for &i in &members[max_count..] {
        labels[i] = -1;
    }
}
