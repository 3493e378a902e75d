//! Demucs forward pass and model-directory loading.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info, instrument};

use crate::config::DemucsConfig;
use crate::constants::{CONFIG_FILE, WEIGHTS_FILE};
use crate::conv::{conv_transpose1d, conv1d, conv1x1};
use crate::lstm::LstmState;
use crate::math::{all_finite, glu_channels, relu_inplace, scale_inplace, std_unbiased};
use crate::ops::Signal;
use crate::quantize::PrecisionPolicy;
use crate::resample::SincResampler;
use crate::stage::{
    Conv1dParams, DecoderStage, EncoderStage, ModelWeights, StagePlan, plan_stages,
};
use crate::weights::WeightStore;
use crate::{DenoiserError, Result};

/// LIFO of encoder outputs consumed by the decoder.
#[derive(Debug, Default)]
struct SkipStack {
    items: Vec<Signal>,
}

impl SkipStack {
    fn push(&mut self, skip: Signal) {
        self.items.push(skip);
    }

    fn pop(&mut self) -> Result<Signal> {
        self.items
            .pop()
            .ok_or_else(|| DenoiserError::Computation("skip stack underflow".into()))
    }

    fn finish(self) -> Result<()> {
        if self.items.is_empty() {
            Ok(())
        } else {
            Err(DenoiserError::Computation(format!(
                "{} skip connections left unconsumed",
                self.items.len()
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct Demucs {
    config: DemucsConfig,
    stages: Vec<StagePlan>,
    weights: ModelWeights,
    upsampler: SincResampler,
    downsampler: SincResampler,
}

impl Demucs {
    /// Validate `config` and allocate zeroed parameters.
    pub fn build(config: DemucsConfig) -> Result<Self> {
        config.validate()?;
        let stages = plan_stages(&config);
        let weights = ModelWeights::zeros(&config, &stages);
        debug!(
            depth = config.depth,
            hidden = config.hidden,
            causal = config.causal,
            resample = config.resample,
            "built demucs"
        );
        Ok(Self {
            upsampler: SincResampler::upsample(config.resample),
            downsampler: SincResampler::downsample(config.resample),
            config,
            stages,
            weights,
        })
    }

    /// Build and fill with deterministic `fan_in`-scaled uniform values.
    pub fn with_seed(config: DemucsConfig, seed: u32) -> Result<Self> {
        let mut model = Self::build(config)?;
        model.weights.init_uniform(seed);
        Ok(model)
    }

    pub fn config(&self) -> &DemucsConfig {
        &self.config
    }

    pub fn stages(&self) -> &[StagePlan] {
        &self.stages
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut ModelWeights {
        &mut self.weights
    }

    pub fn is_causal(&self) -> bool {
        !self.weights.bottleneck.is_bidirectional()
    }

    /// Replace all parameters from a weight file, then apply `policy`.
    pub fn load_weights(&mut self, store: &WeightStore, policy: &dyn PrecisionPolicy) -> Result<()> {
        self.weights.load_from_store(store)?;
        self.weights.apply_precision(policy);
        debug!(precision = %policy.name(), "applied precision policy");
        Ok(())
    }

    pub fn valid_length(&self, length: usize) -> usize {
        self.config.valid_length(length)
    }

    pub fn total_stride(&self) -> usize {
        self.config.total_stride()
    }

    /// Fresh recurrent state for chunked processing; `None` for bidirectional models.
    pub fn initial_state(&self) -> Option<LstmState> {
        self.is_causal()
            .then(|| LstmState::zeros(self.config.lstm_layers, self.weights.bottleneck.dim))
    }

    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
        self.forward_with_state(input, None).map(|(out, _)| out)
    }

    /// Denoise `input`, optionally continuing from a carried recurrent state.
    ///
    /// The output has exactly `input.len()` samples.
    #[instrument(level = "debug", skip_all, fields(samples = input.len()))]
    pub fn forward_with_state(
        &self,
        input: &[f32],
        state: Option<LstmState>,
    ) -> Result<(Vec<f32>, Option<LstmState>)> {
        if state.is_some() && !self.is_causal() {
            return Err(DenoiserError::Configuration(
                "carried recurrent state requires a causal model".into(),
            ));
        }
        let length = input.len();
        if length == 0 {
            return Ok((Vec::new(), state));
        }
        if !all_finite(input) {
            return Err(DenoiserError::Computation(
                "input contains non-finite samples".into(),
            ));
        }

        let mut x = input.to_vec();
        let std = if self.config.normalize {
            let std = std_unbiased(&x);
            let denom = self.config.floor + std;
            if denom > 0.0 {
                scale_inplace(&mut x, 1.0 / denom);
            }
            std
        } else {
            1.0
        };

        let padded = self.valid_length(length);
        x.resize(padded, 0.0);
        let (mut out, state) = self.decode_padded(&x, state)?;
        out.truncate(length);
        if self.config.normalize {
            scale_inplace(&mut out, std);
        }
        if !all_finite(&out) {
            return Err(DenoiserError::Computation(
                "output contains non-finite samples".into(),
            ));
        }
        debug!(padded, "forward done");
        Ok((out, state))
    }

    /// Run resampling, encoder, bottleneck and decoder on an already padded buffer.
    ///
    /// The decoded signal must have exactly `padded.len()` samples.
    pub(crate) fn decode_padded(
        &self,
        padded: &[f32],
        state: Option<LstmState>,
    ) -> Result<(Vec<f32>, Option<LstmState>)> {
        let x = self.upsampler.process(padded);

        let mut skips = SkipStack::default();
        let mut x = Signal::mono(x);
        for stage in &self.weights.encoder {
            x = self.encode(stage, &x)?;
            skips.push(x.clone());
        }

        let (rows, state) = self.weights.bottleneck.forward(
            &x.to_time_major(),
            x.length,
            state,
        )?;
        x = Signal::from_time_major(&rows, x.length, x.channels);

        for stage in &self.weights.decoder {
            let skip = skips.pop()?;
            if !x.add_truncated(&skip) {
                return Err(DenoiserError::Computation(format!(
                    "skip connection shape {}x{} does not cover decoder input {}x{}",
                    skip.channels, skip.length, x.channels, x.length
                )));
            }
            x = decode(stage, &x, self.config.stride);
        }
        skips.finish()?;

        let out = self.downsampler.process(&x.data);
        if out.len() != padded.len() {
            return Err(DenoiserError::Computation(format!(
                "decoded signal has {} samples, padded input had {}",
                out.len(),
                padded.len()
            )));
        }
        Ok((out, state))
    }

    fn encode(&self, stage: &EncoderStage, x: &Signal) -> Result<Signal> {
        let conv = &stage.conv;
        let mut y = conv1d(
            x,
            &conv.weight,
            &conv.bias,
            conv.chout,
            conv.kernel,
            self.config.stride,
        );
        if y.length == 0 {
            return Err(DenoiserError::Computation(format!(
                "encoder input of {} samples is shorter than the kernel",
                x.length
            )));
        }
        relu_inplace(&mut y.data);
        Ok(pointwise_glu(&stage.pointwise, &y))
    }
}

fn pointwise_glu(params: &Conv1dParams, x: &Signal) -> Signal {
    let y = conv1x1(x, &params.weight, &params.bias, params.chout);
    let data = glu_channels(&y.data, y.channels, y.length);
    Signal::new(y.channels / 2, y.length, data)
}

fn decode(stage: &DecoderStage, x: &Signal, stride: usize) -> Signal {
    let y = pointwise_glu(&stage.pointwise, x);
    let tr = &stage.conv_tr;
    let mut y = conv_transpose1d(&y, &tr.weight, &tr.bias, tr.chout, tr.kernel, stride);
    if stage.relu {
        relu_inplace(&mut y.data);
    }
    y
}

/// A model directory: `config.json` next to `model.safetensors`.
#[derive(Debug)]
pub struct ModelBundle {
    pub dir: PathBuf,
    pub precision: String,
    pub model: Demucs,
}

fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

fn weights_path(dir: &Path) -> PathBuf {
    dir.join(WEIGHTS_FILE)
}

impl ModelBundle {
    pub fn load_from_dir(
        dir: impl AsRef<Path>,
        policy: &dyn PrecisionPolicy,
    ) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let config = DemucsConfig::from_path(config_path(dir)).context("load config.json")?;
        let mut model = Demucs::build(config)?;
        let store = WeightStore::open(weights_path(dir)).context("open model.safetensors")?;
        model
            .load_weights(&store, policy)
            .context("load model.safetensors")?;
        info!(
            dir = %dir.display(),
            precision = %policy.name(),
            params = model.weights().parameter_count(),
            "loaded model bundle"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            precision: policy.name(),
            model,
        })
    }

    /// Write `model` as a model directory, creating `dir` if needed.
    pub fn save_to_dir(model: &Demucs, dir: impl AsRef<Path>) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let json = serde_json::to_string_pretty(model.config()).context("encode config.json")?;
        std::fs::write(config_path(dir), json).context("write config.json")?;
        model
            .weights()
            .save(weights_path(dir))
            .context("write model.safetensors")?;
        Ok(())
    }
}
