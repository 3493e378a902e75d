//! Recurrent bottleneck: stacked (bi)directional LSTM.
//!
//! Gate order inside the stacked weight matrices is `input, forget, cell, output`,
//! the layout of exported PyTorch checkpoints. Sequences are row-major
//! `[seq_len, features]`.

use crate::constants::LSTM_GATES;
use crate::math::sigmoid;
use crate::ops::{linear, matvec_acc};
use crate::{DenoiserError, Result};

/// Parameters of one LSTM direction of one layer.
#[derive(Debug, Clone)]
pub struct LstmDirection {
    pub input_size: usize,
    pub hidden_size: usize,
    pub weight_ih: Vec<f32>, // [4*hidden, input]
    pub weight_hh: Vec<f32>, // [4*hidden, hidden]
    pub bias_ih: Vec<f32>,   // [4*hidden]
    pub bias_hh: Vec<f32>,   // [4*hidden]
}

impl LstmDirection {
    #[must_use]
    pub fn zeros(input_size: usize, hidden_size: usize) -> Self {
        let gates = LSTM_GATES * hidden_size;
        Self {
            input_size,
            hidden_size,
            weight_ih: vec![0.0; gates * input_size],
            weight_hh: vec![0.0; gates * hidden_size],
            bias_ih: vec![0.0; gates],
            bias_hh: vec![0.0; gates],
        }
    }

    /// Run the direction over `input` starting from `(h, c)`, updating them in place.
    /// Returns the hidden sequence `[seq_len, hidden]` in input order.
    fn run(
        &self,
        input: &[f32],
        seq_len: usize,
        h: &mut [f32],
        c: &mut [f32],
        reverse: bool,
    ) -> Vec<f32> {
        let hs = self.hidden_size;
        let gates = LSTM_GATES * hs;
        debug_assert_eq!(input.len(), seq_len * self.input_size);
        debug_assert_eq!(h.len(), hs);
        debug_assert_eq!(c.len(), hs);

        let bias: Vec<f32> = self
            .bias_ih
            .iter()
            .zip(&self.bias_hh)
            .map(|(a, b)| a + b)
            .collect();
        let projected = linear(
            input,
            seq_len,
            self.input_size,
            &self.weight_ih,
            gates,
            Some(&bias),
        );

        let mut out = vec![0.0f32; seq_len * hs];
        let mut g = vec![0.0f32; gates];
        for step in 0..seq_len {
            let t = if reverse { seq_len - 1 - step } else { step };
            g.copy_from_slice(&projected[t * gates..(t + 1) * gates]);
            matvec_acc(&mut g, &self.weight_hh, h);

            let (i_g, rest) = g.split_at(hs);
            let (f_g, rest) = rest.split_at(hs);
            let (c_g, o_g) = rest.split_at(hs);
            for j in 0..hs {
                let i = sigmoid(i_g[j]);
                let f = sigmoid(f_g[j]);
                let cand = c_g[j].tanh();
                let o = sigmoid(o_g[j]);
                c[j] = f * c[j] + i * cand;
                h[j] = o * c[j].tanh();
            }
            out[t * hs..(t + 1) * hs].copy_from_slice(h);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct LstmLayer {
    pub forward: LstmDirection,
    pub reverse: Option<LstmDirection>,
}

/// Carried hidden/cell state of a unidirectional LSTM stack.
///
/// Both buffers are `[layers, hidden]` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmState {
    pub hidden: Vec<f32>,
    pub cell: Vec<f32>,
}

impl LstmState {
    #[must_use]
    pub fn zeros(layers: usize, hidden_size: usize) -> Self {
        Self {
            hidden: vec![0.0; layers * hidden_size],
            cell: vec![0.0; layers * hidden_size],
        }
    }
}

/// LSTM stack followed, when bidirectional, by a `2*dim -> dim` projection.
#[derive(Debug, Clone)]
pub struct Bottleneck {
    pub dim: usize,
    pub layers: Vec<LstmLayer>,
    pub linear_weight: Option<Vec<f32>>, // [dim, 2*dim]
    pub linear_bias: Option<Vec<f32>>,   // [dim]
}

impl Bottleneck {
    #[must_use]
    pub fn zeros(dim: usize, num_layers: usize, bidirectional: bool) -> Self {
        let dirs = if bidirectional { 2 } else { 1 };
        let layers = (0..num_layers)
            .map(|layer| {
                let input_size = if layer == 0 { dim } else { dirs * dim };
                LstmLayer {
                    forward: LstmDirection::zeros(input_size, dim),
                    reverse: bidirectional.then(|| LstmDirection::zeros(input_size, dim)),
                }
            })
            .collect();
        Self {
            dim,
            layers,
            linear_weight: bidirectional.then(|| vec![0.0; dim * 2 * dim]),
            linear_bias: bidirectional.then(|| vec![0.0; dim]),
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        self.linear_weight.is_some()
    }

    /// Run the stack over `[seq_len, dim]` rows, returning `[seq_len, dim]` rows.
    ///
    /// `state` is only meaningful for unidirectional stacks; the returned state is
    /// `None` for bidirectional ones.
    pub fn forward(
        &self,
        input: &[f32],
        seq_len: usize,
        state: Option<LstmState>,
    ) -> Result<(Vec<f32>, Option<LstmState>)> {
        let dim = self.dim;
        if input.len() != seq_len * dim {
            return Err(DenoiserError::Computation(format!(
                "bottleneck input has {} values, expected {seq_len}x{dim}",
                input.len()
            )));
        }

        if self.is_bidirectional() {
            if state.is_some() {
                return Err(DenoiserError::Configuration(
                    "carried recurrent state requires a causal (unidirectional) model".into(),
                ));
            }
            return Ok((self.forward_bidirectional(input, seq_len), None));
        }

        let n_layers = self.layers.len();
        let mut state = state.unwrap_or_else(|| LstmState::zeros(n_layers, dim));
        if state.hidden.len() != n_layers * dim || state.cell.len() != n_layers * dim {
            return Err(DenoiserError::Computation(format!(
                "recurrent state shape mismatch: expected {n_layers}x{dim}, got {}/{}",
                state.hidden.len(),
                state.cell.len()
            )));
        }

        let mut x = input.to_vec();
        for (l, layer) in self.layers.iter().enumerate() {
            let h = &mut state.hidden[l * dim..(l + 1) * dim];
            let c = &mut state.cell[l * dim..(l + 1) * dim];
            x = layer.forward.run(&x, seq_len, h, c, false);
        }
        Ok((x, Some(state)))
    }

    fn forward_bidirectional(&self, input: &[f32], seq_len: usize) -> Vec<f32> {
        let dim = self.dim;
        let mut x = input.to_vec();
        for layer in &self.layers {
            let mut h = vec![0.0f32; dim];
            let mut c = vec![0.0f32; dim];
            let fwd = layer.forward.run(&x, seq_len, &mut h, &mut c, false);

            let bwd = match &layer.reverse {
                Some(rev) => {
                    h.fill(0.0);
                    c.fill(0.0);
                    rev.run(&x, seq_len, &mut h, &mut c, true)
                }
                None => vec![0.0f32; seq_len * dim],
            };

            let mut cat = vec![0.0f32; seq_len * 2 * dim];
            for t in 0..seq_len {
                let row = &mut cat[t * 2 * dim..(t + 1) * 2 * dim];
                row[..dim].copy_from_slice(&fwd[t * dim..(t + 1) * dim]);
                row[dim..].copy_from_slice(&bwd[t * dim..(t + 1) * dim]);
            }
            x = cat;
        }

        match (&self.linear_weight, &self.linear_bias) {
            (Some(w), bias) => linear(&x, seq_len, 2 * dim, w, dim, bias.as_deref()),
            (None, _) => x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_unit(w_ih: f32, w_hh: f32, bias: f32) -> Bottleneck {
        let mut b = Bottleneck::zeros(1, 1, false);
        let d = &mut b.layers[0].forward;
        d.weight_ih = vec![w_ih; 4];
        d.weight_hh = vec![w_hh; 4];
        d.bias_ih = vec![bias; 4];
        b
    }

    #[test]
    fn single_step_matches_closed_form() {
        let b = single_unit(1.0, 0.0, 0.0);
        let (y, st) = b.forward(&[0.5], 1, None).expect("forward");
        let gate = sigmoid(0.5);
        let c = gate * 0.5f32.tanh();
        let h = gate * c.tanh();
        assert!((y[0] - h).abs() < 1e-6);
        let st = st.expect("causal state");
        assert!((st.cell[0] - c).abs() < 1e-6);
        assert!((st.hidden[0] - h).abs() < 1e-6);
    }

    #[test]
    fn threaded_state_matches_single_pass() {
        let b = single_unit(0.7, -0.3, 0.1);
        let seq = [0.1f32, -0.4, 0.9, 0.3, -0.2, 0.5];

        let (full, full_state) = b.forward(&seq, 6, None).expect("full");

        let (a, st) = b.forward(&seq[..2], 2, None).expect("first");
        let (rest, st2) = b.forward(&seq[2..], 4, st).expect("second");
        let mut chunked = a;
        chunked.extend(rest);

        assert_eq!(chunked, full);
        assert_eq!(st2, full_state);
    }

    #[test]
    fn bidirectional_rejects_carried_state() {
        let b = Bottleneck::zeros(2, 2, true);
        let st = LstmState::zeros(2, 2);
        assert!(matches!(
            b.forward(&[0.0; 6], 3, Some(st)),
            Err(DenoiserError::Configuration(_))
        ));
        let (y, st) = b.forward(&[0.0; 6], 3, None).expect("forward");
        assert_eq!(y.len(), 6);
        assert!(st.is_none());
    }

    #[test]
    fn reverse_direction_sees_future() {
        // Only the reverse direction and the second half of the projection are active:
        // the first output must depend on the last input.
        let mut b = Bottleneck::zeros(1, 1, true);
        let rev = b.layers[0].reverse.as_mut().expect("reverse");
        rev.weight_ih = vec![1.0; 4];
        b.linear_weight = Some(vec![0.0, 1.0]);

        let (y0, _) = b.forward(&[0.0, 0.0, 0.0], 3, None).expect("zeros");
        let (y1, _) = b.forward(&[0.0, 0.0, 1.0], 3, None).expect("impulse");
        assert_eq!(y0[0], 0.0);
        assert!(y1[0] != 0.0);
    }

    #[test]
    fn rejects_malformed_state() {
        let b = Bottleneck::zeros(2, 2, false);
        let bad = LstmState::zeros(1, 2);
        assert!(matches!(
            b.forward(&[0.0; 4], 2, Some(bad)),
            Err(DenoiserError::Computation(_))
        ));
    }
}
