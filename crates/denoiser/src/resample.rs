//! Band-limited (windowed-sinc) polyphase resampling.
//!
//! Rates are reduced by their gcd; each of the `new` output phases owns a Hann
//! windowed sinc kernel of `2 * width + orig` taps. The input is zero-padded by
//! `width` on the left and `width + orig` on the right, convolved with stride
//! `orig`, the phases are interleaved and the result is cut to
//! `ceil(new * len / orig)` samples.

use crate::constants::{RESAMPLE_LOWPASS_WIDTH, RESAMPLE_ROLLOFF};

#[derive(Debug, Clone)]
pub struct SincResampler {
    orig: usize,
    new: usize,
    width: usize,
    taps: usize,
    kernel: Vec<f32>, // [new, taps]
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

impl SincResampler {
    /// Resampler from `src_hz` to `dst_hz`. Both rates must be non-zero.
    #[must_use]
    pub fn new(src_hz: usize, dst_hz: usize) -> Self {
        debug_assert!(src_hz > 0 && dst_hz > 0);
        let g = gcd(src_hz, dst_hz).max(1);
        let orig = src_hz / g;
        let new = dst_hz / g;

        if orig == new {
            return Self {
                orig,
                new,
                width: 0,
                taps: 1,
                kernel: vec![1.0],
            };
        }

        let lowpass = RESAMPLE_LOWPASS_WIDTH as f64;
        let base_freq = (orig.min(new) as f64) * RESAMPLE_ROLLOFF;
        let width = (lowpass * orig as f64 / base_freq).ceil() as usize;
        let taps = 2 * width + orig;
        let scale = base_freq / orig as f64;

        let mut kernel = Vec::with_capacity(new * taps);
        for phase in 0..new {
            for tap in 0..taps {
                let idx = (tap as f64 - width as f64) / orig as f64;
                let t = (idx - phase as f64 / new as f64) * base_freq;
                let t = t.clamp(-lowpass, lowpass);
                let window = (t * std::f64::consts::PI / lowpass / 2.0).cos().powi(2);
                let t = t * std::f64::consts::PI;
                let sinc = if t == 0.0 { 1.0 } else { t.sin() / t };
                kernel.push((sinc * window * scale) as f32);
            }
        }

        Self {
            orig,
            new,
            width,
            taps,
            kernel,
        }
    }

    /// Integer upsampler used inside the model (`factor` times the rate).
    #[must_use]
    pub fn upsample(factor: usize) -> Self {
        Self::new(1, factor)
    }

    #[must_use]
    pub fn downsample(factor: usize) -> Self {
        Self::new(factor, 1)
    }

    pub fn is_identity(&self) -> bool {
        self.orig == self.new
    }

    pub fn output_len(&self, input_len: usize) -> usize {
        (self.new * input_len).div_ceil(self.orig)
    }

    pub fn process(&self, input: &[f32]) -> Vec<f32> {
        if self.is_identity() || input.is_empty() {
            return input.to_vec();
        }

        let len = input.len();
        let target = self.output_len(len);
        let n_frames = len / self.orig + 1;
        let mut out = Vec::with_capacity(n_frames * self.new);

        // Padded sample at position p (0-based in the padded signal).
        let sample = |p: usize| -> f32 {
            p.checked_sub(self.width)
                .and_then(|i| input.get(i))
                .copied()
                .unwrap_or(0.0)
        };

        'frames: for frame in 0..n_frames {
            let start = frame * self.orig;
            for phase in 0..self.new {
                if out.len() == target {
                    break 'frames;
                }
                let k = &self.kernel[phase * self.taps..(phase + 1) * self.taps];
                let mut acc = 0.0f32;
                for (tap, &w) in k.iter().enumerate() {
                    acc += sample(start + tap) * w;
                }
                out.push(acc);
            }
        }

        debug_assert_eq!(out.len(), target);
        out
    }
}
