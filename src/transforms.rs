//! In-place rewrites of an [`AnalysisResult`] that change what synthesis
//! produces: pitch, loudness, timing and pitch-bend curves.

use std::f64::consts::TAU;

use crate::{
    error::{ensure_positive, Error, Result},
    params::{AnalysisResult, ENVELOPE_FLOOR},
    scratch,
};

/// Voiced F0 after a transform stays inside this band.
pub const MIN_TRANSFORMED_F0: f64 = 50.0;
pub const MAX_TRANSFORMED_F0: f64 = 1000.0;
pub const MAX_BEND_CENTS: f64 = 2400.0;
const MAX_VIBRATO_CENTS: f64 = 50.0;

pub fn cents_to_ratio(cents: f64) -> f64 {
    2f64.powf(cents / 1200.0)
}

/// Inverse of [`cents_to_ratio`]; non-positive ratios map to 0 cents.
pub fn ratio_to_cents(ratio: f64) -> f64 {
    if ratio <= 0.0 {
        return 0.0;
    }
    1200.0 * ratio.log2()
}

/// Linear resampling of `curve` onto `len` evenly spaced points spanning
/// the same first-to-last range.
pub fn resample_curve(curve: &[f64], len: usize) -> Result<Vec<f64>> {
    if curve.is_empty() {
        return Err(Error::invalid_arg("curve", "empty"));
    }
    let mut out = scratch::try_zeroed(len, "resampled curve")?;
    if len == curve.len() {
        out.copy_from_slice(curve);
        return Ok(out);
    }
    let step = if len > 1 {
        (curve.len() - 1) as f64 / (len - 1) as f64
    } else {
        0.0
    };
    for (i, value) in out.iter_mut().enumerate() {
        let position = i as f64 * step;
        let lo = position.floor() as usize;
        *value = match curve.get(lo + 1) {
            Some(&hi) => {
                let fraction = position - lo as f64;
                (1.0 - fraction) * curve[lo] + fraction * hi
            }
            None => curve[curve.len() - 1],
        };
    }
    Ok(out)
}

fn clamp_f0(f0: f64) -> f64 {
    f0.clamp(MIN_TRANSFORMED_F0, MAX_TRANSFORMED_F0)
}

fn ensure_frames(result: &AnalysisResult) -> Result<()> {
    if result.frame_count() == 0 {
        return Err(Error::InvalidState("analysis has no frames"));
    }
    Ok(())
}

/// Transposes voiced frames by `semitones`.
pub fn shift_pitch(result: &mut AnalysisResult, semitones: f64) -> Result<()> {
    if !semitones.is_finite() || semitones.abs() * 100.0 > MAX_BEND_CENTS {
        return Err(Error::invalid_arg(
            "semitones",
            format!("{semitones} outside ±{}", MAX_BEND_CENTS / 100.0),
        ));
    }
    let ratio = cents_to_ratio(semitones * 100.0);
    for f in result.f0.iter_mut().filter(|f| **f > 0.0) {
        *f = clamp_f0(*f * ratio);
    }
    Ok(())
}

/// Scales every envelope by `volume` in `[0, 2]`. Output loudness follows
/// linearly through the per-frame gain.
pub fn scale_volume(result: &mut AnalysisResult, volume: f64) -> Result<()> {
    if !(0.0..=2.0).contains(&volume) {
        return Err(Error::invalid_arg("volume", format!("{volume} not in [0, 2]")));
    }
    ensure_frames(result)?;
    for e in result.spectral_envelope.as_mut_slice() {
        *e = (*e * volume).max(ENVELOPE_FLOOR);
    }
    Ok(())
}

/// Plays the utterance `scale` times faster, `scale` in `(0.1, 3]`.
pub fn stretch_timing(result: &mut AnalysisResult, scale: f64) -> Result<()> {
    if !(scale > 0.1 && scale <= 3.0) {
        return Err(Error::invalid_arg("scale", format!("{scale} not in (0.1, 3]")));
    }
    ensure_frames(result)?;
    for t in result.time_axis.iter_mut() {
        *t /= scale;
    }
    result.frame_period /= scale;
    result.audio_length = (result.audio_length as f64 / scale) as usize;
    Ok(())
}

/// Replaces voiced F0 with `target_pitch` bent by `cents`, resampled over
/// the frames.
pub fn apply_pitch_bend(result: &mut AnalysisResult, cents: &[f64], target_pitch: f64) -> Result<()> {
    ensure_positive("target_pitch", target_pitch)?;
    if let Some(bad) = cents.iter().find(|c| !(c.abs() <= MAX_BEND_CENTS)) {
        return Err(Error::invalid_arg(
            "cents",
            format!("{bad} outside ±{MAX_BEND_CENTS}"),
        ));
    }
    ensure_frames(result)?;
    let bend = resample_curve(cents, result.frame_count())?;
    for (f, &c) in result.f0.iter_mut().zip(&bend) {
        if *f > 0.0 {
            *f = clamp_f0(target_pitch * cents_to_ratio(c));
        }
    }
    Ok(())
}

/// Sinusoidal F0 modulation of up to ±50 cents at full `depth`.
pub fn apply_vibrato(result: &mut AnalysisResult, depth: f64, rate: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&depth) {
        return Err(Error::invalid_arg("depth", format!("{depth} not in [0, 1]")));
    }
    if !(0.1..=20.0).contains(&rate) {
        return Err(Error::invalid_arg("rate", format!("{rate} Hz not in [0.1, 20]")));
    }
    ensure_frames(result)?;
    let extent = MAX_VIBRATO_CENTS * depth;
    for (f, &t) in result.f0.iter_mut().zip(&result.time_axis) {
        if *f > 0.0 {
            *f = clamp_f0(*f * cents_to_ratio(extent * (TAU * rate * t).sin()));
        }
    }
    Ok(())
}
