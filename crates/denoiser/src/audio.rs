//! WAV I/O and sample-rate conversion at the model boundary.
//!
//! Reading accepts 8/16/24/32-bit integer PCM and 32-bit float at any channel
//! count and returns mono `f32` in `[-1, 1]`. Writing produces 16-bit PCM.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use thiserror::Error;

use crate::resample::SincResampler;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
    #[error("unsupported wav format: {format:?} with {bits} bits per sample")]
    UnsupportedFormat { format: SampleFormat, bits: u16 },
    #[error("wav file declares zero channels")]
    NoChannels,
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WavAudio {
    pub sample_rate_hz: u32,
    /// Channel count of the source file before downmixing.
    pub channels: u16,
    pub samples_mono: Vec<f32>,
}

impl WavAudio {
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.samples_mono.len() as f32 / self.sample_rate_hz as f32
    }
}

pub fn read_wav(path: impl AsRef<Path>) -> Result<WavAudio, AudioError> {
    let reader = WavReader::open(path)?;
    decode_wav(reader)
}

pub fn read_wav_bytes(bytes: &[u8]) -> Result<WavAudio, AudioError> {
    let reader = WavReader::new(std::io::Cursor::new(bytes))?;
    decode_wav(reader)
}

fn decode_wav<R: std::io::Read>(reader: WavReader<R>) -> Result<WavAudio, AudioError> {
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(AudioError::NoChannels);
    }
    if spec.sample_rate == 0 {
        return Err(AudioError::InvalidSampleRate(0));
    }

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<hound::Result<_>>()?,
        (SampleFormat::Int, bits @ (8 | 16 | 24 | 32)) => {
            let full_scale = (1u64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<hound::Result<_>>()?
        }
        (format, bits) => return Err(AudioError::UnsupportedFormat { format, bits }),
    };

    Ok(WavAudio {
        sample_rate_hz: spec.sample_rate,
        channels: spec.channels,
        samples_mono: downmix(&interleaved, usize::from(spec.channels)),
    })
}

/// Average interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Write mono samples as 16-bit PCM, clamping to `[-1, 1]`.
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate_hz: u32) -> Result<(), AudioError> {
    if sample_rate_hz == 0 {
        return Err(AudioError::InvalidSampleRate(0));
    }
    let spec = WavSpec {
        channels: 1,
        sample_rate: sample_rate_hz,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(to_i16(s))?;
    }
    writer.finalize()?;
    Ok(())
}

fn to_i16(s: f32) -> i16 {
    let s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };
    (s * f32::from(i16::MAX)).round() as i16
}

/// Band-limited conversion from `src_hz` to `dst_hz`.
pub fn resample_to(samples: &[f32], src_hz: u32, dst_hz: u32) -> Result<Vec<f32>, AudioError> {
    if src_hz == 0 {
        return Err(AudioError::InvalidSampleRate(src_hz));
    }
    if dst_hz == 0 {
        return Err(AudioError::InvalidSampleRate(dst_hz));
    }
    if src_hz == dst_hz {
        return Ok(samples.to_vec());
    }
    Ok(SincResampler::new(src_hz as usize, dst_hz as usize).process(samples))
}

/// Convert model output back to the source rate, trimmed or zero-padded to `len`
/// samples so the result lines up with the source signal.
pub fn resample_back(
    samples: &[f32],
    model_hz: u32,
    src_hz: u32,
    len: usize,
) -> Result<Vec<f32>, AudioError> {
    let mut out = resample_to(samples, model_hz, src_hz)?;
    out.resize(len, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use hound::{SampleFormat, WavSpec, WavWriter};

    use super::*;

    fn tmp_wav(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("denoiser-audio-test-{name}-{nanos}.wav"));
        p
    }

    #[test]
    fn reads_stereo_16_bit_and_downmixes() {
        let path = tmp_wav("stereo16");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(&path, spec).expect("create");
        for (l, r) in [(16_384i16, 0i16), (-32_768, -32_768), (8_192, 8_192)] {
            w.write_sample(l).expect("l");
            w.write_sample(r).expect("r");
        }
        w.finalize().expect("finalize");

        let audio = read_wav(&path).expect("read");
        assert_eq!(audio.sample_rate_hz, 22_050);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.samples_mono, vec![0.25, -1.0, 0.25]);
        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn reads_24_bit_and_float() {
        let path = tmp_wav("pcm24");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 24,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(&path, spec).expect("create");
        w.write_sample(1i32 << 22).expect("s0");
        w.write_sample(-(1i32 << 23)).expect("s1");
        w.finalize().expect("finalize");
        assert_eq!(read_wav(&path).expect("read").samples_mono, vec![0.5, -1.0]);
        std::fs::remove_file(&path).expect("cleanup");

        let path = tmp_wav("float");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut w = WavWriter::create(&path, spec).expect("create");
        w.write_sample(0.125f32).expect("s0");
        w.write_sample(-0.75f32).expect("s1");
        w.finalize().expect("finalize");
        let audio = read_wav(&path).expect("read");
        assert_eq!(audio.samples_mono, vec![0.125, -0.75]);
        assert_eq!(audio.sample_rate_hz, 48_000);
        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn write_then_read_16_bit() {
        let path = tmp_wav("write");
        let samples = [0.0f32, 0.5, -0.5, 2.0, f32::NAN];
        write_wav(&path, &samples, 16_000).expect("write");
        let audio = read_wav(&path).expect("read");
        assert_eq!(audio.samples_mono.len(), samples.len());
        assert!((audio.samples_mono[1] - 0.5).abs() < 1e-4);
        assert!((audio.samples_mono[3] - 32_767.0 / 32_768.0).abs() < 1e-6);
        assert_eq!(audio.samples_mono[4], 0.0);
        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(matches!(
            read_wav_bytes(b"not a wav file"),
            Err(AudioError::Wav(_))
        ));
    }

    #[test]
    fn resample_to_model_rate() {
        let x = vec![0.1f32; 4_800];
        let y = resample_to(&x, 48_000, 16_000).expect("resample");
        assert_eq!(y.len(), 1_600);
        assert_eq!(resample_to(&x, 16_000, 16_000).expect("identity"), x);
        assert!(resample_to(&x, 0, 16_000).is_err());
    }

    #[test]
    fn boundary_round_trip_keeps_source_length() {
        for src_hz in [44_100u32, 22_050, 48_000] {
            let n = src_hz as usize + 1;
            let x: Vec<f32> = (0..n).map(|i| (i as f32 * 0.01).sin() * 0.2).collect();
            let model = resample_to(&x, src_hz, 16_000).expect("to model rate");
            let back = resample_back(&model, 16_000, src_hz, x.len()).expect("back");
            assert_eq!(back.len(), n, "length at {src_hz} Hz");
        }
        let short = resample_back(&[0.5; 10], 16_000, 48_000, 40).expect("pad");
        assert_eq!(short.len(), 40);
        assert_eq!(short[39], 0.0);
        assert!(resample_back(&[0.0; 4], 16_000, 0, 4).is_err());
    }
}
