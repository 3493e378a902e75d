//! Core math kernels for inference.

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn relu_inplace(x: &mut [f32]) {
    for v in x {
        *v = v.max(0.0);
    }
}

/// Gated linear unit over a channel-major `[channels, length]` buffer.
///
/// The first half of the channels is gated by the sigmoid of the second half;
/// the result has `channels / 2` rows.
pub fn glu_channels(input: &[f32], channels: usize, length: usize) -> Vec<f32> {
    debug_assert_eq!(channels % 2, 0);
    debug_assert_eq!(input.len(), channels * length);

    let half = (channels / 2) * length;
    let (a, b) = input.split_at(half);
    a.iter().zip(b).map(|(&a, &b)| a * sigmoid(b)).collect()
}

/// Unbiased (n-1) standard deviation. Returns 0 for fewer than two samples.
pub fn std_unbiased(x: &[f32]) -> f32 {
    if x.len() < 2 {
        return 0.0;
    }
    let n = x.len() as f64;
    let mean = x.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let var = x
        .iter()
        .map(|&v| {
            let d = f64::from(v) - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    var.sqrt() as f32
}

pub fn scale_inplace(x: &mut [f32], factor: f32) {
    for v in x {
        *v *= factor;
    }
}

pub fn all_finite(x: &[f32]) -> bool {
    x.iter().all(|v| v.is_finite())
}
