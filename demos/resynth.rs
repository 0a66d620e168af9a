//! Analyzes a wav file, optionally transforms it, and writes the
//! resynthesis next to the input.
//!
//! ```text
//! RUST_LOG=worldvox=debug cargo run --example resynth -- voice.wav [semitones] [speed]
//! ```

mod wav;

use tracing_subscriber::EnvFilter;
use worldvox::{transforms, Engine, EngineConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let file = args.next().unwrap_or_else(|| "voice.wav".to_string());
    let semitones: f64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(0.0);
    let speed: f64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(1.0);

    let (spec, audio) = wav::load(&file)?;
    let mut engine = Engine::new(EngineConfig::default())?;

    let start = std::time::Instant::now();
    let mut params = engine.analyze(&audio, spec.sample_rate)?;
    if let Some(report) = engine.last_report() {
        tracing::info!(
            frames = report.frame_count,
            workers = report.workers,
            elapsed_ms = report.total.as_secs_f64() * 1000.0,
            budget_exceeded = report.budget_exceeded,
            "analyzed {file}"
        );
    }

    if semitones != 0.0 {
        transforms::shift_pitch(&mut params, semitones)?;
    }
    if speed != 1.0 {
        transforms::stretch_timing(&mut params, speed)?;
    }

    let mut output = Vec::with_capacity(params.audio_length);
    engine.synthesize_streaming(&params, 1024, |chunk| {
        output.extend_from_slice(chunk);
        true
    })?;
    tracing::info!(samples = output.len(), elapsed = ?start.elapsed(), "synthesized");

    wav::save(file.replace(".wav", "_resynth.wav"), spec, &output)?;
    Ok(())
}
