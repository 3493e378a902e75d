//! Model and signal-processing constants.

// Internal operating rate of the pretrained checkpoints.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

// Channel expansion of the 1x1 convolution in front of every GLU.
pub const CH_SCALE: usize = 2;
pub const LSTM_GATES: usize = 4;
pub const DEFAULT_LSTM_LAYERS: usize = 2;

// Sinc resampling (Hann window), matching the kernels the checkpoints were trained with.
pub const RESAMPLE_LOWPASS_WIDTH: usize = 6;
pub const RESAMPLE_ROLLOFF: f64 = 0.99;

pub const SUPPORTED_RESAMPLE: [usize; 3] = [1, 2, 4];

// Model directory layout.
pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
