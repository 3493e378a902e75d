//! 1-D convolution kernels for the encoder and decoder stages.
//!
//! Inputs and outputs are **channel-major** (`data[c * length + t]`). Neither
//! kernel pads: the length bookkeeping in `DemucsConfig::valid_length` guarantees
//! the strided round trip lands exactly on the padded input length.

use rayon::prelude::*;

use crate::ops::Signal;

/// Output length of an unpadded strided convolution. `0` when the input is shorter
/// than the kernel.
#[inline]
pub fn conv1d_out_len(length: usize, kernel: usize, stride: usize) -> usize {
    if length < kernel {
        0
    } else {
        (length - kernel) / stride + 1
    }
}

#[inline]
pub fn conv_transpose1d_out_len(length: usize, kernel: usize, stride: usize) -> usize {
    if length == 0 {
        0
    } else {
        (length - 1) * stride + kernel
    }
}

/// Strided 1-D convolution without padding.
///
/// Weights are stored as `[channels_out, channels_in, kernel]` contiguous.
pub fn conv1d(
    input: &Signal,
    weight: &[f32],
    bias: &[f32],
    channels_out: usize,
    kernel: usize,
    stride: usize,
) -> Signal {
    let channels_in = input.channels;
    let length = input.length;
    let out_length = conv1d_out_len(length, kernel, stride);

    debug_assert_eq!(weight.len(), channels_out * channels_in * kernel);
    debug_assert_eq!(bias.len(), channels_out);

    let mut output = vec![0.0f32; channels_out * out_length];
    if out_length == 0 {
        return Signal::new(channels_out, 0, output);
    }

    output
        .par_chunks_mut(out_length)
        .enumerate()
        .for_each(|(oc, out_row)| {
            out_row.fill(bias[oc]);
            for ic in 0..channels_in {
                let in_row = input.row(ic);
                let w_base = (oc * channels_in + ic) * kernel;
                for k in 0..kernel {
                    let w = weight[w_base + k];
                    if w == 0.0 {
                        continue;
                    }
                    for (ol, out_elem) in out_row.iter_mut().enumerate() {
                        *out_elem += in_row[ol * stride + k] * w;
                    }
                }
            }
        });

    Signal::new(channels_out, out_length, output)
}

/// Pointwise (kernel=1) convolution: a per-timestep linear map over channels.
pub fn conv1x1(input: &Signal, weight: &[f32], bias: &[f32], channels_out: usize) -> Signal {
    conv1d(input, weight, bias, channels_out, 1, 1)
}

/// Strided transposed 1-D convolution without padding or output padding.
///
/// Weights are stored as `[channels_in, channels_out, kernel]` contiguous.
pub fn conv_transpose1d(
    input: &Signal,
    weight: &[f32],
    bias: &[f32],
    channels_out: usize,
    kernel: usize,
    stride: usize,
) -> Signal {
    let channels_in = input.channels;
    let length = input.length;
    let out_length = conv_transpose1d_out_len(length, kernel, stride);

    debug_assert_eq!(weight.len(), channels_in * channels_out * kernel);
    debug_assert_eq!(bias.len(), channels_out);

    let mut output = vec![0.0f32; channels_out * out_length];
    if out_length == 0 {
        return Signal::new(channels_out, 0, output);
    }

    output
        .par_chunks_mut(out_length)
        .enumerate()
        .for_each(|(oc, out_row)| {
            out_row.fill(bias[oc]);
            for ic in 0..channels_in {
                let in_row = input.row(ic);
                let w_base = (ic * channels_out + oc) * kernel;
                for k in 0..kernel {
                    let w = weight[w_base + k];
                    if w == 0.0 {
                        continue;
                    }
                    for (t, &x) in in_row.iter().enumerate() {
                        out_row[t * stride + k] += x * w;
                    }
                }
            }
        });

    Signal::new(channels_out, out_length, output)
}
