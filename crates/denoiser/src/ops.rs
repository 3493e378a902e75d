//! Inference ops shared by the encoder, bottleneck and decoder.

use rayon::prelude::*;

/// Channel-major activation buffer: `data[c * length + t]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub channels: usize,
    pub length: usize,
    pub data: Vec<f32>,
}

impl Signal {
    #[must_use]
    pub fn new(channels: usize, length: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), channels * length);
        Self {
            channels,
            length,
            data,
        }
    }

    #[must_use]
    pub fn mono(samples: Vec<f32>) -> Self {
        let length = samples.len();
        Self::new(1, length, samples)
    }

    pub fn row(&self, c: usize) -> &[f32] {
        &self.data[c * self.length..(c + 1) * self.length]
    }

    /// Add the first `self.length` samples of each `skip` channel.
    pub fn add_truncated(&mut self, skip: &Signal) -> bool {
        if skip.channels != self.channels || skip.length < self.length {
            return false;
        }
        let len = self.length;
        for c in 0..self.channels {
            add_inplace(&mut self.data[c * len..(c + 1) * len], &skip.row(c)[..len]);
        }
        true
    }

    /// `[channels, length]` -> row-major `[length, channels]`.
    pub fn to_time_major(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.data.len()];
        for c in 0..self.channels {
            for (t, &v) in self.row(c).iter().enumerate() {
                out[t * self.channels + c] = v;
            }
        }
        out
    }

    /// Row-major `[length, channels]` -> channel-major signal.
    #[must_use]
    pub fn from_time_major(rows: &[f32], length: usize, channels: usize) -> Self {
        debug_assert_eq!(rows.len(), length * channels);
        let mut data = vec![0.0f32; rows.len()];
        for t in 0..length {
            for c in 0..channels {
                data[c * length + t] = rows[t * channels + c];
            }
        }
        Self::new(channels, length, data)
    }
}

/// Linear layer: `y = x * W^T + b`.
///
/// Shapes:
/// - `input`: `[n_rows, in_dim]`
/// - `weight`: `[out_dim, in_dim]`
/// - output: `[n_rows, out_dim]`
pub fn linear(
    input: &[f32],
    n_rows: usize,
    in_dim: usize,
    weight: &[f32],
    out_dim: usize,
    bias: Option<&[f32]>,
) -> Vec<f32> {
    debug_assert_eq!(input.len(), n_rows * in_dim);
    debug_assert_eq!(weight.len(), out_dim * in_dim);
    if let Some(b) = bias {
        debug_assert_eq!(b.len(), out_dim);
    }

    let mut out = vec![0.0f32; n_rows * out_dim];
    if out.is_empty() {
        return out;
    }
    out.par_chunks_mut(out_dim).enumerate().for_each(|(r, y)| {
        let x = &input[r * in_dim..(r + 1) * in_dim];
        for (o, y_o) in y.iter_mut().enumerate() {
            let w = &weight[o * in_dim..(o + 1) * in_dim];
            *y_o = bias.map_or(0.0, |b| b[o]) + dot(x, w);
        }
    });
    out
}

/// Matrix-vector product accumulated into `out`: `out += W * x`.
pub fn matvec_acc(out: &mut [f32], weight: &[f32], x: &[f32]) {
    let in_dim = x.len();
    debug_assert_eq!(weight.len(), out.len() * in_dim);
    for (o, y) in out.iter_mut().enumerate() {
        *y += dot(x, &weight[o * in_dim..(o + 1) * in_dim]);
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

pub fn add_inplace(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter().copied()) {
        *d += s;
    }
}

#[cfg(test)]
mod tests {
    use super::{Signal, linear, matvec_acc};

    #[test]
    fn linear_smoke() {
        // x: [2,3], W: [2,3]
        let x = [1.0f32, 2.0, 3.0, -1.0, 0.0, 1.0];
        let w = [1.0f32, 0.0, -1.0, 2.0, 1.0, 0.0];
        let b = [0.5f32, -1.0];
        let y = linear(&x, 2, 3, &w, 2, Some(&b));
        // row0: [1-3+0.5, 2+2-1] = [-1.5, 3.0]
        // row1: [-1-1+0.5, -2+0-1] = [-1.5, -3.0]
        assert!((y[0] + 1.5).abs() < 1e-6);
        assert!((y[1] - 3.0).abs() < 1e-6);
        assert!((y[2] + 1.5).abs() < 1e-6);
        assert!((y[3] + 3.0).abs() < 1e-6);
    }

    #[test]
    fn matvec_accumulates() {
        let w = [1.0f32, 2.0, 3.0, 4.0];
        let mut out = [1.0f32, 1.0];
        matvec_acc(&mut out, &w, &[1.0, -1.0]);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn truncate_and_add_skip() {
        let mut x = Signal::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let skip = Signal::new(2, 3, vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        assert!(x.add_truncated(&skip));
        assert_eq!(x.data, vec![11.0, 22.0, 43.0, 54.0]);

        assert!(!Signal::new(1, 4, vec![0.0; 4]).add_truncated(&skip));
    }

    #[test]
    fn time_major_round_trip() {
        let x = Signal::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rows = x.to_time_major();
        assert_eq!(rows, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(Signal::from_time_major(&rows, 3, 2), x);
    }
}
