//! Model hyperparameters (`config.json`) and named presets.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_LSTM_LAYERS, SAMPLE_RATE_HZ, SUPPORTED_RESAMPLE};
use crate::{DenoiserError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemucsConfig {
    pub hidden: usize,
    pub depth: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub causal: bool,
    pub resample: usize,
    pub growth: f32,
    pub max_hidden: usize,
    pub normalize: bool,
    pub floor: f32,
    pub sample_rate: u32,
    pub lstm_layers: usize,
}

impl Default for DemucsConfig {
    fn default() -> Self {
        Self {
            hidden: 48,
            depth: 5,
            kernel_size: 8,
            stride: 4,
            causal: true,
            resample: 4,
            growth: 2.0,
            max_hidden: 10_000,
            normalize: true,
            floor: 1e-3,
            sample_rate: SAMPLE_RATE_HZ,
            lstm_layers: DEFAULT_LSTM_LAYERS,
        }
    }
}

impl DemucsConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("parse config.json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let json = std::fs::read_to_string(path_ref)
            .with_context(|| format!("read {}", path_ref.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        fn ensure(cond: bool, msg: &str) -> Result<()> {
            if cond {
                Ok(())
            } else {
                Err(DenoiserError::Configuration(msg.to_string()))
            }
        }

        if !SUPPORTED_RESAMPLE.contains(&self.resample) {
            return Err(DenoiserError::Configuration(format!(
                "resample must be one of {SUPPORTED_RESAMPLE:?}, got {}",
                self.resample
            )));
        }
        ensure(self.depth > 0, "depth must be > 0")?;
        ensure(self.hidden > 0, "hidden must be > 0")?;
        ensure(self.kernel_size > 0, "kernel_size must be > 0")?;
        ensure(self.stride > 0, "stride must be > 0")?;
        ensure(self.max_hidden > 0, "max_hidden must be > 0")?;
        ensure(self.lstm_layers > 0, "lstm_layers must be > 0")?;
        ensure(self.sample_rate > 0, "sample_rate must be > 0")?;
        ensure(
            self.growth.is_finite() && self.growth > 0.0,
            "growth must be finite and > 0",
        )?;
        ensure(
            self.floor.is_finite() && self.floor >= 0.0,
            "floor must be finite and >= 0",
        )?;
        let receptive = u32::try_from(self.depth)
            .ok()
            .and_then(|d| self.stride.checked_pow(d))
            .and_then(|p| p.checked_mul(self.kernel_size))
            .and_then(|p| p.checked_mul(self.resample));
        ensure(
            receptive.is_some(),
            "kernel_size * stride^depth * resample overflows",
        )?;

        let mut hidden = self.hidden;
        for index in 0..self.depth {
            if hidden == 0 {
                return Err(DenoiserError::Configuration(format!(
                    "stage {index} has zero channels (hidden={}, growth={})",
                    self.hidden, self.growth
                )));
            }
            hidden = next_hidden(hidden, self.growth, self.max_hidden);
        }
        Ok(())
    }

    /// Smallest length `>= length` for which the encoder/decoder round trip leaves no
    /// samples over at any stage.
    pub fn valid_length(&self, length: usize) -> usize {
        let mut length = length.saturating_mul(self.resample);
        for _ in 0..self.depth {
            // ceil((len - k) / s) + 1, floored at 1
            length = length.saturating_sub(self.kernel_size).div_ceil(self.stride) + 1;
            length = length.max(1);
        }
        for _ in 0..self.depth {
            length = (length - 1)
                .saturating_mul(self.stride)
                .saturating_add(self.kernel_size);
        }
        length.div_ceil(self.resample)
    }

    pub fn total_stride(&self) -> usize {
        self.stride.pow(self.depth as u32) / self.resample
    }
}

pub(crate) fn next_hidden(hidden: usize, growth: f32, max_hidden: usize) -> usize {
    let grown = (f64::from(growth) * hidden as f64).floor() as usize;
    grown.min(max_hidden)
}

/// Published checkpoint families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Dns48,
    Dns64,
    Master64,
    Valentini,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::Dns48,
        Preset::Dns64,
        Preset::Master64,
        Preset::Valentini,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Dns48 => "dns48",
            Self::Dns64 => "dns64",
            Self::Master64 => "master64",
            Self::Valentini => "valentini",
        }
    }

    pub fn config(self) -> DemucsConfig {
        let base = DemucsConfig::default();
        match self {
            Self::Dns48 => DemucsConfig { hidden: 48, ..base },
            Self::Dns64 | Self::Master64 => DemucsConfig { hidden: 64, ..base },
            Self::Valentini => DemucsConfig {
                hidden: 64,
                causal: false,
                stride: 2,
                resample: 2,
                ..base
            },
        }
    }
}

impl FromStr for Preset {
    type Err = DenoiserError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Self::ALL.iter().map(|p| p.name()).collect();
                DenoiserError::Configuration(format!("unknown preset {s:?}, expected one of {names:?}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{DemucsConfig, Preset};
    use crate::DenoiserError;

    #[test]
    fn parse_config_with_defaults() {
        let json = r#"{ "hidden": 64, "causal": false, "stride": 2, "resample": 2 }"#;
        let c = DemucsConfig::from_json_str(json).expect("config parse");
        assert_eq!(c, Preset::Valentini.config());
        assert_eq!(c.depth, 5);
        assert_eq!(c.lstm_layers, 2);
        assert!((c.floor - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn rejects_unsupported_resample() {
        let c = DemucsConfig {
            resample: 3,
            ..DemucsConfig::default()
        };
        assert!(matches!(c.validate(), Err(DenoiserError::Configuration(_))));
        assert!(DemucsConfig::from_json_str(r#"{ "resample": 8 }"#).is_err());
    }

    #[test]
    fn rejects_vanishing_stage_width() {
        let c = DemucsConfig {
            hidden: 2,
            growth: 0.4,
            ..DemucsConfig::default()
        };
        assert!(matches!(c.validate(), Err(DenoiserError::Configuration(_))));
    }

    #[test]
    fn valid_length_matches_reference_values() {
        let c = DemucsConfig::default();
        assert_eq!(c.valid_length(1), 597);
        assert_eq!(c.valid_length(16_000), 16_213);
        assert_eq!(c.total_stride(), 256);

        let v = Preset::Valentini.config();
        assert_eq!(v.total_stride(), 16);
        assert!(v.valid_length(16_000) >= 16_000);
    }

    #[test]
    fn rejects_overflowing_receptive_field() {
        let c = DemucsConfig {
            kernel_size: usize::MAX / 2,
            ..DemucsConfig::default()
        };
        assert!(matches!(c.validate(), Err(DenoiserError::Configuration(_))));
        // Lengths saturate instead of overflowing on unvalidated configs.
        assert!(c.valid_length(16_000) >= 16_000);
    }

    #[test]
    fn valid_length_is_idempotent_and_not_shorter() {
        for resample in [1usize, 2, 4] {
            for depth in 1..=5usize {
                for (kernel_size, stride) in [(8usize, 4usize), (4, 4), (3, 1)] {
                    let c = DemucsConfig {
                        resample,
                        depth,
                        kernel_size,
                        stride,
                        ..DemucsConfig::default()
                    };
                    for n in [1usize, 2, 7, 100, 1_023, 16_000] {
                        let v = c.valid_length(n);
                        assert!(v >= n, "valid_length({n}) = {v} for {c:?}");
                        assert_eq!(c.valid_length(v), v, "not idempotent at {n} for {c:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn preset_names_round_trip() {
        for p in Preset::ALL {
            assert_eq!(p.name().parse::<Preset>().expect("preset"), p);
            p.config().validate().expect("preset validates");
        }
        assert!("dns32".parse::<Preset>().is_err());
    }
}
