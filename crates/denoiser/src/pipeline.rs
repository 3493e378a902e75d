//! Batch and chunked processing on top of [`Demucs`].

use rayon::prelude::*;
use tracing::debug;

use crate::lstm::LstmState;
use crate::model::Demucs;
use crate::{DenoiserError, Result};

/// Denoise independent buffers in parallel. Results keep the input order.
pub fn denoise_batch<B>(model: &Demucs, buffers: &[B]) -> Vec<Result<Vec<f32>>>
where
    B: AsRef<[f32]> + Sync,
{
    debug!(buffers = buffers.len(), "denoise batch");
    buffers
        .par_iter()
        .map(|b| model.forward(b.as_ref()))
        .collect()
}

/// Splits long audio into fixed-size chunks.
///
/// Causal models carry the recurrent state from one chunk to the next;
/// bidirectional models process every chunk independently.
#[derive(Debug)]
pub struct ChunkedDenoiser<'m> {
    model: &'m Demucs,
    chunk_len: usize,
    state: Option<LstmState>,
    processed: usize,
}

impl<'m> ChunkedDenoiser<'m> {
    pub fn new(model: &'m Demucs, chunk_len: usize) -> Result<Self> {
        if chunk_len == 0 {
            return Err(DenoiserError::Configuration(
                "chunk length must be > 0".into(),
            ));
        }
        Ok(Self {
            model,
            chunk_len,
            state: model.initial_state(),
            processed: 0,
        })
    }

    /// Samples consumed so far.
    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn state(&self) -> Option<&LstmState> {
        self.state.as_ref()
    }

    pub fn reset(&mut self) {
        self.state = self.model.initial_state();
        self.processed = 0;
    }

    /// Denoise one chunk of at most `chunk_len` samples.
    pub fn push_chunk(&mut self, chunk: &[f32]) -> Result<Vec<f32>> {
        if chunk.len() > self.chunk_len {
            return Err(DenoiserError::Configuration(format!(
                "chunk of {} samples exceeds chunk length {}",
                chunk.len(),
                self.chunk_len
            )));
        }
        let (out, state) = self.model.forward_with_state(chunk, self.state.take())?;
        self.state = state;
        self.processed += chunk.len();
        Ok(out)
    }

    /// Denoise a whole signal chunk by chunk. The output has `input.len()` samples.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(input.len());
        for chunk in input.chunks(self.chunk_len) {
            out.extend(self.push_chunk(chunk)?);
        }
        debug!(
            samples = input.len(),
            chunks = input.len().div_ceil(self.chunk_len),
            "chunked denoise"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemucsConfig;

    fn model(causal: bool) -> Demucs {
        let c = DemucsConfig {
            hidden: 4,
            depth: 3,
            causal,
            ..DemucsConfig::default()
        };
        Demucs::with_seed(c, 17).expect("build")
    }

    fn ramp(n: usize, k: f32) -> Vec<f32> {
        (0..n).map(|i| ((i as f32) * k).sin() * 0.3).collect()
    }

    #[test]
    fn batch_matches_sequential_and_keeps_order() {
        let m = model(false);
        let buffers = vec![ramp(100, 0.1), ramp(3, 0.2), Vec::new(), ramp(1_000, 0.05)];
        let out = denoise_batch(&m, &buffers);
        assert_eq!(out.len(), buffers.len());
        for (b, y) in buffers.iter().zip(out) {
            let y = y.expect("forward");
            assert_eq!(y, m.forward(b).expect("sequential"));
        }
    }

    #[test]
    fn chunked_output_has_input_length_and_advances_state() {
        let m = model(true);
        let mut d = ChunkedDenoiser::new(&m, 256).expect("chunker");
        let initial = d.state().cloned().expect("causal state");
        let y = d.process(&ramp(1_000, 0.07)).expect("process");
        assert_eq!(y.len(), 1_000);
        assert_eq!(d.processed(), 1_000);
        assert_ne!(d.state().cloned().expect("state"), initial);

        d.reset();
        assert_eq!(d.processed(), 0);
        assert_eq!(d.state().cloned().expect("state"), initial);
    }

    #[test]
    fn chunked_bidirectional_processes_independently() {
        let m = model(false);
        let mut d = ChunkedDenoiser::new(&m, 300).expect("chunker");
        assert!(d.state().is_none());
        let x = ramp(600, 0.03);
        let y = d.process(&x).expect("process");
        let first = m.forward(&x[..300]).expect("first");
        assert_eq!(&y[..300], first.as_slice());
    }

    #[test]
    fn rejects_oversized_chunk_and_zero_length() {
        let m = model(true);
        assert!(ChunkedDenoiser::new(&m, 0).is_err());
        let mut d = ChunkedDenoiser::new(&m, 4).expect("chunker");
        assert!(matches!(
            d.push_chunk(&[0.0; 5]),
            Err(DenoiserError::Configuration(_))
        ));
    }
}
