//! Stage plan and parameter records derived from a `DemucsConfig`.
//!
//! Tensor names follow the exported state-dict layout:
//! - `encoder.{i}.0` strided conv, `encoder.{i}.2` pointwise conv
//! - `decoder.{j}.0` pointwise conv, `decoder.{j}.2` transposed conv, with
//!   `j = depth - 1 - i` (decoder entries are stored innermost first)
//! - `lstm.lstm.*_l{k}[_reverse]`, `lstm.linear.*`

use std::convert::Infallible;
use std::path::Path;

use tracing::debug;

use crate::config::{DemucsConfig, next_hidden};
use crate::constants::{CH_SCALE, LSTM_GATES};
use crate::lstm::{Bottleneck, LstmDirection};
use crate::quantize::PrecisionPolicy;
use crate::weights::{TensorF32, WeightError, WeightStore, save_f32};
use crate::{DenoiserError, Result};

/// Channel counts of one encoder/decoder pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    pub index: usize,
    pub chin: usize,
    pub hidden: usize,
    pub chout: usize,
}

pub fn plan_stages(config: &DemucsConfig) -> Vec<StagePlan> {
    let mut stages = Vec::with_capacity(config.depth);
    let (mut chin, mut chout, mut hidden) = (1usize, 1usize, config.hidden);
    for index in 0..config.depth {
        stages.push(StagePlan {
            index,
            chin,
            hidden,
            chout,
        });
        chin = hidden;
        chout = hidden;
        hidden = next_hidden(hidden, config.growth, config.max_hidden);
    }
    stages
}

#[derive(Debug, Clone)]
pub struct Conv1dParams {
    pub chin: usize,
    pub chout: usize,
    pub kernel: usize,
    pub weight: Vec<f32>, // [chout, chin, kernel]
    pub bias: Vec<f32>,   // [chout]
}

impl Conv1dParams {
    fn zeros(chin: usize, chout: usize, kernel: usize) -> Self {
        Self {
            chin,
            chout,
            kernel,
            weight: vec![0.0; chout * chin * kernel],
            bias: vec![0.0; chout],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvTranspose1dParams {
    pub chin: usize,
    pub chout: usize,
    pub kernel: usize,
    pub weight: Vec<f32>, // [chin, chout, kernel]
    pub bias: Vec<f32>,   // [chout]
}

#[derive(Debug, Clone)]
pub struct EncoderStage {
    pub conv: Conv1dParams,
    pub pointwise: Conv1dParams,
}

#[derive(Debug, Clone)]
pub struct DecoderStage {
    pub pointwise: Conv1dParams,
    pub conv_tr: ConvTranspose1dParams,
    pub relu: bool,
}

/// What a parameter tensor feeds; precision policies key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    EncoderConv,
    EncoderPointwise,
    DecoderPointwise,
    DecoderConvTranspose,
    Recurrent,
    Projection,
}

impl ParamRole {
    pub fn is_encoder(self) -> bool {
        matches!(self, Self::EncoderConv | Self::EncoderPointwise)
    }

    pub fn is_bottleneck(self) -> bool {
        matches!(self, Self::Recurrent | Self::Projection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub role: ParamRole,
    pub is_bias: bool,
    pub shape: Vec<usize>,
    pub fan_in: usize,
}

impl ParamSpec {
    fn new(name: String, role: ParamRole, is_bias: bool, shape: Vec<usize>, fan_in: usize) -> Self {
        Self {
            name,
            role,
            is_bias,
            shape,
            fan_in,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// All learned parameters, laid out in execution order.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub encoder: Vec<EncoderStage>,
    /// Innermost stage first.
    pub decoder: Vec<DecoderStage>,
    pub bottleneck: Bottleneck,
}

impl ModelWeights {
    /// Zero-initialised parameters for the given configuration.
    pub fn zeros(config: &DemucsConfig, stages: &[StagePlan]) -> Self {
        let k = config.kernel_size;
        let encoder = stages
            .iter()
            .map(|s| EncoderStage {
                conv: Conv1dParams::zeros(s.chin, s.hidden, k),
                pointwise: Conv1dParams::zeros(s.hidden, CH_SCALE * s.hidden, 1),
            })
            .collect();
        let decoder = stages
            .iter()
            .rev()
            .map(|s| DecoderStage {
                pointwise: Conv1dParams::zeros(s.hidden, CH_SCALE * s.hidden, 1),
                conv_tr: ConvTranspose1dParams {
                    chin: s.hidden,
                    chout: s.chout,
                    kernel: k,
                    weight: vec![0.0; s.hidden * s.chout * k],
                    bias: vec![0.0; s.chout],
                },
                relu: s.index > 0,
            })
            .collect();
        let dim = stages.last().map_or(config.hidden, |s| s.hidden);
        let bottleneck = Bottleneck::zeros(dim, config.lstm_layers, !config.causal);
        Self {
            encoder,
            decoder,
            bottleneck,
        }
    }

    /// Visit every parameter in a fixed order, stopping at the first error.
    pub fn visit<E>(
        &self,
        mut f: impl FnMut(&ParamSpec, &[f32]) -> Result<(), E>,
    ) -> Result<(), E> {
        for (i, st) in self.encoder.iter().enumerate() {
            for (spec, data) in conv_specs(&format!("encoder.{i}.0"), ParamRole::EncoderConv, &st.conv)
                .into_iter()
                .zip([&st.conv.weight, &st.conv.bias])
            {
                f(&spec, data.as_slice())?;
            }
            for (spec, data) in conv_specs(
                &format!("encoder.{i}.2"),
                ParamRole::EncoderPointwise,
                &st.pointwise,
            )
            .into_iter()
            .zip([&st.pointwise.weight, &st.pointwise.bias])
            {
                f(&spec, data.as_slice())?;
            }
        }
        for (j, st) in self.decoder.iter().enumerate() {
            for (spec, data) in conv_specs(
                &format!("decoder.{j}.0"),
                ParamRole::DecoderPointwise,
                &st.pointwise,
            )
            .into_iter()
            .zip([&st.pointwise.weight, &st.pointwise.bias])
            {
                f(&spec, data.as_slice())?;
            }
            for (spec, data) in conv_tr_specs(&format!("decoder.{j}.2"), &st.conv_tr)
                .into_iter()
                .zip([&st.conv_tr.weight, &st.conv_tr.bias])
            {
                f(&spec, data.as_slice())?;
            }
        }
        for (k, layer) in self.bottleneck.layers.iter().enumerate() {
            let dirs = std::iter::once((&layer.forward, "")).chain(layer.reverse.iter().map(|r| (r, "_reverse")));
            for (dir, suffix) in dirs {
                for (spec, data) in lstm_specs(k, suffix, dir).into_iter().zip([
                    &dir.weight_ih,
                    &dir.weight_hh,
                    &dir.bias_ih,
                    &dir.bias_hh,
                ]) {
                    f(&spec, data.as_slice())?;
                }
            }
        }
        if let (Some(w), Some(b)) = (&self.bottleneck.linear_weight, &self.bottleneck.linear_bias) {
            for (spec, data) in projection_specs(self.bottleneck.dim).into_iter().zip([w, b]) {
                f(&spec, data.as_slice())?;
            }
        }
        Ok(())
    }

    /// Mutable counterpart of [`ModelWeights::visit`], same order.
    pub fn visit_mut<E>(
        &mut self,
        mut f: impl FnMut(&ParamSpec, &mut Vec<f32>) -> Result<(), E>,
    ) -> Result<(), E> {
        for (i, st) in self.encoder.iter_mut().enumerate() {
            let [w, b] = conv_specs(&format!("encoder.{i}.0"), ParamRole::EncoderConv, &st.conv);
            f(&w, &mut st.conv.weight)?;
            f(&b, &mut st.conv.bias)?;
            let [w, b] = conv_specs(
                &format!("encoder.{i}.2"),
                ParamRole::EncoderPointwise,
                &st.pointwise,
            );
            f(&w, &mut st.pointwise.weight)?;
            f(&b, &mut st.pointwise.bias)?;
        }
        for (j, st) in self.decoder.iter_mut().enumerate() {
            let [w, b] = conv_specs(
                &format!("decoder.{j}.0"),
                ParamRole::DecoderPointwise,
                &st.pointwise,
            );
            f(&w, &mut st.pointwise.weight)?;
            f(&b, &mut st.pointwise.bias)?;
            let [w, b] = conv_tr_specs(&format!("decoder.{j}.2"), &st.conv_tr);
            f(&w, &mut st.conv_tr.weight)?;
            f(&b, &mut st.conv_tr.bias)?;
        }
        let dim = self.bottleneck.dim;
        for (k, layer) in self.bottleneck.layers.iter_mut().enumerate() {
            visit_direction_mut(k, "", &mut layer.forward, &mut f)?;
            if let Some(rev) = layer.reverse.as_mut() {
                visit_direction_mut(k, "_reverse", rev, &mut f)?;
            }
        }
        if let (Some(w), Some(b)) = (
            self.bottleneck.linear_weight.as_mut(),
            self.bottleneck.linear_bias.as_mut(),
        ) {
            let [ws, bs] = projection_specs(dim);
            f(&ws, w)?;
            f(&bs, b)?;
        }
        Ok(())
    }

    pub fn for_each_param(&self, mut f: impl FnMut(&ParamSpec, &[f32])) {
        let Ok(()) = self.visit(|spec, data| -> Result<(), Infallible> {
            f(spec, data);
            Ok(())
        });
    }

    pub fn for_each_param_mut(&mut self, mut f: impl FnMut(&ParamSpec, &mut Vec<f32>)) {
        let Ok(()) = self.visit_mut(|spec, data| -> Result<(), Infallible> {
            f(spec, data);
            Ok(())
        });
    }

    pub fn specs(&self) -> Vec<ParamSpec> {
        let mut specs = Vec::new();
        self.for_each_param(|spec, _| specs.push(spec.clone()));
        specs
    }

    pub fn parameter_count(&self) -> usize {
        self.specs().iter().map(ParamSpec::numel).sum()
    }

    /// Replace a single named tensor after checking its shape.
    pub fn assign(&mut self, name: &str, tensor: TensorF32) -> Result<()> {
        let mut tensor = Some(tensor);
        self.visit_mut(|spec, data| -> Result<()> {
            if spec.name != name {
                return Ok(());
            }
            if let Some(t) = tensor.take() {
                check_shape(spec, &t)?;
                *data = t.data;
            }
            Ok(())
        })?;
        match tensor {
            None => Ok(()),
            Some(_) => Err(WeightError::Unexpected(vec![name.to_string()]).into()),
        }
    }

    /// Load every parameter from `store`.
    ///
    /// All tensors are read and shape-checked before any parameter is replaced, so a
    /// failed load leaves the current values untouched.
    pub fn load_from_store(&mut self, store: &WeightStore) -> Result<()> {
        let specs = self.specs();
        let mut loaded = Vec::with_capacity(specs.len());
        for spec in &specs {
            let t = store.tensor_f32(&spec.name)?;
            check_shape(spec, &t)?;
            loaded.push(t.data);
        }

        let extra: Vec<String> = store
            .names()?
            .into_iter()
            .filter(|n| !specs.iter().any(|s| &s.name == n))
            .collect();
        if !extra.is_empty() {
            return Err(WeightError::Unexpected(extra).into());
        }

        let mut loaded = loaded.into_iter();
        self.visit_mut(|spec, data| -> Result<()> {
            let values = loaded.next().ok_or_else(|| {
                DenoiserError::Computation(format!("parameter {} missing after load", spec.name))
            })?;
            *data = values;
            Ok(())
        })?;
        debug!(tensors = specs.len(), "loaded weights");
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors = Vec::new();
        self.for_each_param(|spec, data| {
            tensors.push((
                spec.name.clone(),
                TensorF32 {
                    shape: spec.shape.clone(),
                    data: data.to_vec(),
                },
            ));
        });
        save_f32(path, tensors.iter().map(|(n, t)| (n.clone(), t)))?;
        Ok(())
    }

    /// Deterministic `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` initialisation.
    pub fn init_uniform(&mut self, seed: u32) {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            // [-1, 1]
            let v = (state >> 8) as f32 / ((1u32 << 24) as f32);
            (v * 2.0) - 1.0
        };
        self.for_each_param_mut(|spec, data| {
            let bound = 1.0 / (spec.fan_in.max(1) as f32).sqrt();
            for v in data.iter_mut() {
                *v = next() * bound;
            }
        });
    }

    pub fn apply_precision(&mut self, policy: &dyn PrecisionPolicy) {
        self.for_each_param_mut(|spec, data| policy.apply(spec, data));
    }
}

fn check_shape(spec: &ParamSpec, t: &TensorF32) -> Result<()> {
    if t.shape != spec.shape || t.data.len() != spec.numel() {
        return Err(DenoiserError::WeightShape {
            name: spec.name.clone(),
            expected: spec.shape.clone(),
            actual: t.shape.clone(),
        });
    }
    Ok(())
}

fn conv_specs(prefix: &str, role: ParamRole, p: &Conv1dParams) -> [ParamSpec; 2] {
    let fan_in = p.chin * p.kernel;
    [
        ParamSpec::new(
            format!("{prefix}.weight"),
            role,
            false,
            vec![p.chout, p.chin, p.kernel],
            fan_in,
        ),
        ParamSpec::new(format!("{prefix}.bias"), role, true, vec![p.chout], fan_in),
    ]
}

fn conv_tr_specs(prefix: &str, p: &ConvTranspose1dParams) -> [ParamSpec; 2] {
    let role = ParamRole::DecoderConvTranspose;
    let fan_in = p.chout * p.kernel;
    [
        ParamSpec::new(
            format!("{prefix}.weight"),
            role,
            false,
            vec![p.chin, p.chout, p.kernel],
            fan_in,
        ),
        ParamSpec::new(format!("{prefix}.bias"), role, true, vec![p.chout], fan_in),
    ]
}

fn lstm_specs(layer: usize, suffix: &str, d: &LstmDirection) -> [ParamSpec; 4] {
    let role = ParamRole::Recurrent;
    let gates = LSTM_GATES * d.hidden_size;
    let fan_in = d.hidden_size;
    [
        ParamSpec::new(
            format!("lstm.lstm.weight_ih_l{layer}{suffix}"),
            role,
            false,
            vec![gates, d.input_size],
            fan_in,
        ),
        ParamSpec::new(
            format!("lstm.lstm.weight_hh_l{layer}{suffix}"),
            role,
            false,
            vec![gates, d.hidden_size],
            fan_in,
        ),
        ParamSpec::new(
            format!("lstm.lstm.bias_ih_l{layer}{suffix}"),
            role,
            true,
            vec![gates],
            fan_in,
        ),
        ParamSpec::new(
            format!("lstm.lstm.bias_hh_l{layer}{suffix}"),
            role,
            true,
            vec![gates],
            fan_in,
        ),
    ]
}

fn visit_direction_mut<E>(
    layer: usize,
    suffix: &str,
    d: &mut LstmDirection,
    f: &mut impl FnMut(&ParamSpec, &mut Vec<f32>) -> Result<(), E>,
) -> Result<(), E> {
    let [w_ih, w_hh, b_ih, b_hh] = lstm_specs(layer, suffix, d);
    f(&w_ih, &mut d.weight_ih)?;
    f(&w_hh, &mut d.weight_hh)?;
    f(&b_ih, &mut d.bias_ih)?;
    f(&b_hh, &mut d.bias_hh)
}

fn projection_specs(dim: usize) -> [ParamSpec; 2] {
    let role = ParamRole::Projection;
    [
        ParamSpec::new(
            "lstm.linear.weight".to_string(),
            role,
            false,
            vec![dim, 2 * dim],
            2 * dim,
        ),
        ParamSpec::new("lstm.linear.bias".to_string(), role, true, vec![dim], 2 * dim),
    ]
}
