//! Load-time numeric precision policies.
//!
//! A policy rewrites parameter values in place once, right after loading. The
//! forward pass always computes in `f32`; reduced precision only changes the
//! values it sees.

use std::str::FromStr;

use crate::stage::ParamSpec;
use crate::{DenoiserError, Result};

pub trait PrecisionPolicy: Send + Sync {
    fn name(&self) -> String;

    fn apply(&self, spec: &ParamSpec, data: &mut [f32]);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FullPrecision;

impl PrecisionPolicy for FullPrecision {
    fn name(&self) -> String {
        "f32".to_string()
    }

    fn apply(&self, _spec: &ParamSpec, _data: &mut [f32]) {}
}

/// Round every parameter through bfloat16 (round to nearest, ties to even).
#[derive(Debug, Clone, Copy, Default)]
pub struct Bf16Precision;

pub fn round_bf16(x: f32) -> f32 {
    if x.is_nan() {
        return x;
    }
    let bits = x.to_bits();
    let lsb = (bits >> 16) & 1;
    let rounded = bits.wrapping_add(0x7fff + lsb) & 0xffff_0000;
    f32::from_bits(rounded)
}

impl PrecisionPolicy for Bf16Precision {
    fn name(&self) -> String {
        "bf16".to_string()
    }

    fn apply(&self, _spec: &ParamSpec, data: &mut [f32]) {
        for v in data.iter_mut() {
            *v = round_bf16(*v);
        }
    }
}

/// Symmetric per-output-row int8 fake quantization of weight matrices.
///
/// Biases and the decoder are left in full precision.
#[derive(Debug, Clone, Copy)]
pub struct Int8Precision {
    pub encoder: bool,
    pub lstm: bool,
}

impl Default for Int8Precision {
    fn default() -> Self {
        Self {
            encoder: true,
            lstm: true,
        }
    }
}

impl Int8Precision {
    fn selects(&self, spec: &ParamSpec) -> bool {
        !spec.is_bias
            && ((self.encoder && spec.role.is_encoder()) || (self.lstm && spec.role.is_bottleneck()))
    }
}

pub fn fake_quantize_rows(data: &mut [f32], row_len: usize) {
    if row_len == 0 {
        return;
    }
    for row in data.chunks_mut(row_len) {
        let max_abs = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        if max_abs == 0.0 || !max_abs.is_finite() {
            continue;
        }
        let scale = max_abs / 127.0;
        for v in row.iter_mut() {
            *v = (*v / scale).round().clamp(-127.0, 127.0) * scale;
        }
    }
}

impl PrecisionPolicy for Int8Precision {
    fn name(&self) -> String {
        match (self.encoder, self.lstm) {
            (true, true) => "int8".to_string(),
            (true, false) => "int8-encoder".to_string(),
            (false, true) => "int8-lstm".to_string(),
            (false, false) => "f32".to_string(),
        }
    }

    fn apply(&self, spec: &ParamSpec, data: &mut [f32]) {
        if !self.selects(spec) {
            return;
        }
        let rows = spec.shape.first().copied().unwrap_or(1).max(1);
        fake_quantize_rows(data, data.len() / rows);
    }
}

/// Named policy choice, parseable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    F32,
    Bf16,
    Int8,
    Int8Encoder,
    Int8Lstm,
}

impl Precision {
    pub fn policy(self) -> Box<dyn PrecisionPolicy> {
        match self {
            Self::F32 => Box::new(FullPrecision),
            Self::Bf16 => Box::new(Bf16Precision),
            Self::Int8 => Box::new(Int8Precision::default()),
            Self::Int8Encoder => Box::new(Int8Precision {
                encoder: true,
                lstm: false,
            }),
            Self::Int8Lstm => Box::new(Int8Precision {
                encoder: false,
                lstm: true,
            }),
        }
    }
}

impl FromStr for Precision {
    type Err = DenoiserError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" | "full" => Ok(Self::F32),
            "bf16" => Ok(Self::Bf16),
            "int8" => Ok(Self::Int8),
            "int8-encoder" => Ok(Self::Int8Encoder),
            "int8-lstm" => Ok(Self::Int8Lstm),
            other => Err(DenoiserError::Configuration(format!(
                "unknown precision {other:?}, expected f32, bf16, int8, int8-encoder or int8-lstm"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::ParamRole;

    fn spec(role: ParamRole, is_bias: bool, shape: Vec<usize>) -> ParamSpec {
        ParamSpec {
            name: "p".to_string(),
            role,
            is_bias,
            shape,
            fan_in: 1,
        }
    }

    #[test]
    fn bf16_rounding_ties_to_even() {
        assert_eq!(round_bf16(1.0), 1.0);
        // 1 + 2^-8 is exactly halfway between two bf16 values; ties go to the even one (1.0).
        assert_eq!(round_bf16(1.0 + 1.0 / 256.0), 1.0);
        // 1 + 3 * 2^-8 rounds up to 1 + 2^-6.
        assert_eq!(round_bf16(1.0 + 3.0 / 256.0), 1.0 + 1.0 / 64.0);
        assert!(round_bf16(f32::NAN).is_nan());
        assert_eq!(round_bf16(-2.0), -2.0);
    }

    #[test]
    fn int8_keeps_row_extrema_and_bounds_error() {
        let mut w = vec![1.0f32, 0.3, -0.5, 0.0, 10.0, -7.0];
        let orig = w.clone();
        Int8Precision::default().apply(&spec(ParamRole::EncoderConv, false, vec![2, 3, 1]), &mut w);
        assert!((w[0] - 1.0).abs() < 1e-6);
        assert!((w[4] - 10.0).abs() < 1e-5);
        assert_eq!(w[3], 0.0);
        for (row, (a, b)) in w.chunks(3).zip(orig.chunks(3)).enumerate() {
            let scale = if row == 0 { 1.0 / 127.0 } else { 10.0 / 127.0 };
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() <= scale / 2.0 + 1e-6);
            }
        }
    }

    #[test]
    fn int8_skips_decoder_and_biases() {
        let policy = Int8Precision::default();
        let orig = vec![0.123f32, -0.456];

        let mut dec = orig.clone();
        policy.apply(&spec(ParamRole::DecoderConvTranspose, false, vec![1, 2, 1]), &mut dec);
        assert_eq!(dec, orig);

        let mut bias = orig.clone();
        policy.apply(&spec(ParamRole::EncoderConv, true, vec![2]), &mut bias);
        assert_eq!(bias, orig);

        let mut lstm = orig.clone();
        let enc_only = Int8Precision {
            encoder: true,
            lstm: false,
        };
        enc_only.apply(&spec(ParamRole::Recurrent, false, vec![1, 2]), &mut lstm);
        assert_eq!(lstm, orig);

        let mut dec_pw = orig.clone();
        policy.apply(&spec(ParamRole::DecoderPointwise, false, vec![2, 1, 1]), &mut dec_pw);
        assert_eq!(dec_pw, orig);
    }

    #[test]
    fn int8_lstm_covers_projection() {
        let lstm_only = Int8Precision {
            encoder: false,
            lstm: true,
        };
        let orig = vec![0.123f32, -0.456, 0.0101, 0.5];

        let mut proj = orig.clone();
        lstm_only.apply(&spec(ParamRole::Projection, false, vec![1, 4]), &mut proj);
        assert_ne!(proj, orig);
        assert!((proj[3] - 0.5).abs() < 1e-6);

        let mut enc = orig.clone();
        lstm_only.apply(&spec(ParamRole::EncoderPointwise, false, vec![1, 4, 1]), &mut enc);
        assert_eq!(enc, orig);
    }

    #[test]
    fn parse_precision_names() {
        for (s, p) in [
            ("f32", Precision::F32),
            ("bf16", Precision::Bf16),
            ("int8", Precision::Int8),
            ("int8-encoder", Precision::Int8Encoder),
            ("int8-lstm", Precision::Int8Lstm),
        ] {
            assert_eq!(s.parse::<Precision>().expect("parse"), p);
            if p != Precision::F32 {
                assert_eq!(p.policy().name(), s);
            }
        }
        assert!("fp8".parse::<Precision>().is_err());
    }
}
