use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use denoiser::audio::{read_wav, resample_back, resample_to, write_wav};
use denoiser::config::Preset;
use denoiser::model::{Demucs, ModelBundle};
use denoiser::pipeline::ChunkedDenoiser;
use denoiser::quantize::Precision;
use denoiser::weights::WeightStore;
use rayon::prelude::*;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "denoiser")]
#[command(about = "Demucs speech enhancement (Rust)", long_about = None)]
struct Args {
    /// Path to a WAV file to denoise.
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Output WAV path for --audio (default: `<stem>_enhanced.wav` next to the input).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Denoise every `.wav` file in this directory, in parallel.
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Output directory for --input-dir.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Model directory with config.json / model.safetensors.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Architecture preset used when no --model-dir is given.
    #[arg(long, default_value = "dns48", value_parser = parse_preset)]
    preset: Preset,

    /// Safetensors file for the chosen preset.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Seed for random initialisation when no weights are given (smoke runs).
    #[arg(long)]
    seed: Option<u32>,

    /// Numeric precision applied at load time: f32, bf16, int8, int8-encoder, int8-lstm.
    #[arg(long, default_value = "f32", value_parser = parse_precision)]
    precision: Precision,

    /// Process in chunks of this many seconds, carrying recurrent state (causal models).
    #[arg(long)]
    chunk_secs: Option<f32>,

    /// Validate the model and print its geometry without processing audio.
    #[arg(long, default_value_t = false)]
    inspect_model: bool,

    /// Write the loaded model out as a model directory.
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// Worker threads (default: one per core).
    #[arg(long)]
    threads: Option<usize>,

    /// Enable debug logging.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn parse_preset(s: &str) -> Result<Preset, String> {
    s.parse().map_err(|e: denoiser::DenoiserError| e.to_string())
}

fn parse_precision(s: &str) -> Result<Precision, String> {
    s.parse().map_err(|e: denoiser::DenoiserError| e.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    if let Some(n) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .context("configure thread pool")?;
    }

    let model = load_model(&args)?;

    if let Some(dir) = &args.export_dir {
        ModelBundle::save_to_dir(&model, dir)
            .with_context(|| format!("export model to {}", dir.display()))?;
        info!(dir = %dir.display(), "exported model");
    }

    if args.inspect_model {
        inspect_model(&model);
        return Ok(());
    }

    let chunk_len = match args.chunk_secs {
        Some(secs) => {
            anyhow::ensure!(
                secs > 0.0 && secs.is_finite(),
                "--chunk-secs must be > 0, got {secs}"
            );
            Some(((secs * model.config().sample_rate as f32) as usize).max(1))
        }
        None => None,
    };

    match (&args.audio, &args.input_dir) {
        (Some(path), None) => {
            let output = args.output.clone().unwrap_or_else(|| default_output(path));
            denoise_file(&model, path, &output, chunk_len)
        }
        (None, Some(dir)) => {
            let output_dir = args
                .output_dir
                .as_ref()
                .context("--input-dir requires --output-dir")?;
            denoise_dir(&model, dir, output_dir, chunk_len)
        }
        (None, None) if args.export_dir.is_some() => Ok(()),
        _ => anyhow::bail!("choose exactly one input mode: --audio or --input-dir"),
    }
}

fn load_model(args: &Args) -> Result<Demucs> {
    let policy = args.precision.policy();

    if let Some(dir) = &args.model_dir {
        let bundle = ModelBundle::load_from_dir(dir, policy.as_ref())
            .with_context(|| format!("load model dir {}", dir.display()))?;
        info!(dir = %dir.display(), precision = %bundle.precision, "loaded model");
        return Ok(bundle.model);
    }

    let config = args.preset.config();
    if let Some(path) = &args.weights {
        let mut model = Demucs::build(config)?;
        let store = WeightStore::open(path).with_context(|| format!("open {}", path.display()))?;
        model
            .load_weights(&store, policy.as_ref())
            .with_context(|| format!("load weights {}", path.display()))?;
        info!(preset = args.preset.name(), weights = %path.display(), "loaded model");
        return Ok(model);
    }

    let Some(seed) = args.seed else {
        anyhow::bail!("no weights: pass --model-dir, --weights, or --seed for a random model");
    };
    warn!(preset = args.preset.name(), seed, "using randomly initialised weights");
    let mut model = Demucs::with_seed(config, seed)?;
    model.weights_mut().apply_precision(policy.as_ref());
    Ok(model)
}

fn inspect_model(model: &Demucs) {
    let c = model.config();
    eprintln!(
        "model ok: depth={} hidden={} causal={} resample={} lstm_layers={} params={}",
        c.depth,
        c.hidden,
        c.causal,
        c.resample,
        c.lstm_layers,
        model.weights().parameter_count()
    );
    for s in model.stages() {
        eprintln!(
            "  stage {}: chin={} hidden={} chout={}",
            s.index, s.chin, s.hidden, s.chout
        );
    }
    let sr = c.sample_rate as usize;
    eprintln!(
        "valid_length({sr})={} total_stride={}",
        model.valid_length(sr),
        model.total_stride()
    );
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string());
    input.with_file_name(format!("{stem}_enhanced.wav"))
}

fn denoise_file(model: &Demucs, input: &Path, output: &Path, chunk_len: Option<usize>) -> Result<()> {
    let start = Instant::now();
    let wav = read_wav(input).with_context(|| format!("read wav {}", input.display()))?;
    let model_rate = model.config().sample_rate;
    let samples = resample_to(&wav.samples_mono, wav.sample_rate_hz, model_rate)
        .context("resample to model rate")?;

    let enhanced = match chunk_len {
        Some(len) => ChunkedDenoiser::new(model, len)?.process(&samples)?,
        None => model.forward(&samples)?,
    };

    let enhanced = resample_back(&enhanced, model_rate, wav.sample_rate_hz, wav.samples_mono.len())
        .context("resample to source rate")?;
    write_wav(output, &enhanced, wav.sample_rate_hz)
        .with_context(|| format!("write wav {}", output.display()))?;

    let elapsed = start.elapsed().as_secs_f32();
    let duration = wav.duration_secs();
    let rtf = if duration > 0.0 { elapsed / duration } else { 0.0 };
    info!(
        input = %input.display(),
        output = %output.display(),
        duration_s = duration,
        rtf,
        "denoised"
    );
    Ok(())
}

fn denoise_dir(model: &Demucs, input_dir: &Path, output_dir: &Path, chunk_len: Option<usize>) -> Result<()> {
    let mut inputs = Vec::new();
    for entry in std::fs::read_dir(input_dir).with_context(|| format!("read dir {}", input_dir.display()))? {
        let path = entry?.path();
        let is_wav = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
        if path.is_file() && is_wav {
            inputs.push(path);
        }
    }
    inputs.sort();
    std::fs::create_dir_all(output_dir).with_context(|| format!("create {}", output_dir.display()))?;
    info!(files = inputs.len(), dir = %input_dir.display(), "denoising directory");

    let failures: Vec<(PathBuf, anyhow::Error)> = inputs
        .par_iter()
        .filter_map(|input| {
            let name = input.file_name()?;
            let output = output_dir.join(name);
            denoise_file(model, input, &output, chunk_len)
                .err()
                .map(|e| (input.clone(), e))
        })
        .collect();

    for (path, err) in &failures {
        warn!(file = %path.display(), error = %format!("{err:#}"), "failed");
    }
    if !failures.is_empty() {
        anyhow::bail!("{} of {} files failed", failures.len(), inputs.len());
    }
    Ok(())
}
