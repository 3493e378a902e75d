use denoiser::model::ModelBundle;
use denoiser::quantize::FullPrecision;

/// Optional integration test against a real exported model directory.
///
/// Run locally with:
/// `DENOISER_MODEL_DIR=/path/to/dns48 cargo test -p denoiser --test e2e_model_env -- --nocapture`
#[test]
fn model_dir_env_smoke() {
    let Some(model_dir) = std::env::var_os("DENOISER_MODEL_DIR") else {
        eprintln!("skipping: DENOISER_MODEL_DIR is not set");
        return;
    };

    let bundle = ModelBundle::load_from_dir(&model_dir, &FullPrecision).expect("load bundle");
    let model = &bundle.model;
    let sr = model.config().sample_rate as usize;

    let x: Vec<f32> = (0..sr)
        .map(|i| 0.1 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / sr as f32).sin())
        .collect();
    let y = model.forward(&x).expect("forward");
    assert_eq!(y.len(), x.len());
    assert!(y.iter().all(|v| v.is_finite()));
    eprintln!(
        "stages={} valid_length({})={} total_stride={}",
        model.stages().len(),
        x.len(),
        model.valid_length(x.len()),
        model.total_stride()
    );
}
