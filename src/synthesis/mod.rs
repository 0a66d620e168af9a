//! Pitch-synchronous overlap-add resynthesis.
//!
//! Batch synthesis is the streaming path run as one chunk that spans the
//! whole utterance, so both produce identical samples for the same seed.

mod overlap;
mod pulse;

use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_pcg::Pcg32;
use tracing::{debug, trace};

pub use overlap::OverlapBuffer;
pub use pulse::{Pulse, PulseRenderer};

use crate::{
    config::SynthesisConfig,
    error::{ensure_positive, Error, Result, Stage},
    fft,
    params::AnalysisResult,
    scratch::Scratch,
};

/// Pulse rate used to lay noise over unvoiced frames.
pub const UNVOICED_PULSE_RATE: f64 = 500.0;

/// Pulse cursor and output accumulator of one rendering pass.
#[derive(Debug, Clone)]
struct Cursor {
    chunk_size: usize,
    current_frame_index: usize,
    samples_processed: usize,
    next_pulse: f64,
    overlap: OverlapBuffer,
    rng: Pcg32,
}

impl Cursor {
    fn new(chunk_size: usize, fft_size: usize, seed: u64) -> Result<Self> {
        Ok(Self {
            chunk_size,
            current_frame_index: 0,
            samples_processed: 0,
            next_pulse: 0.0,
            overlap: OverlapBuffer::new(chunk_size + fft_size)?,
            rng: Pcg32::seed_from_u64(seed),
        })
    }

    fn reset(&mut self, seed: u64) {
        self.current_frame_index = 0;
        self.samples_processed = 0;
        self.next_pulse = 0.0;
        self.overlap.clear();
        self.rng = Pcg32::seed_from_u64(seed);
    }

    fn is_finished(&self, params: &AnalysisResult) -> bool {
        params.is_empty() || self.samples_processed >= params.audio_length
    }
}

#[derive(Debug)]
struct Stream {
    params: AnalysisResult,
    cursor: Cursor,
}

#[derive(Debug, Default)]
enum StreamState {
    #[default]
    Uninitialized,
    Initialized(Box<Stream>),
}

pub struct Synthesizer {
    config: SynthesisConfig,
    state: Scratch,
    renderer: Option<PulseRenderer>,
    stream: StreamState,
    level: u8,
    last_chunk_time: Option<Duration>,
}

impl Synthesizer {
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            level: config.optimization_level,
            config,
            state: Scratch::default(),
            renderer: None,
            stream: StreamState::Uninitialized,
            last_chunk_time: None,
        })
    }

    /// Renders the whole utterance. Empty parameters give an empty waveform.
    pub fn synthesize(&mut self, params: &AnalysisResult) -> Result<Vec<f32>> {
        if !check_params(params)? {
            return Ok(Vec::new());
        }
        let renderer = ensure_renderer(&mut self.renderer, &mut self.state, params)?;
        let mut cursor = Cursor::new(params.audio_length, params.fft_size, self.config.seed)?;
        let mut output = Vec::new();
        render_chunk(renderer, params, &mut cursor, 0, &mut output)?;
        Ok(output)
    }

    /// Renders `params` in chunks of `chunk_size`, handing each to
    /// `callback` until it returns `false` or the utterance ends. Returns
    /// the number of samples delivered. The active stream, if any, is left
    /// untouched.
    pub fn synthesize_streaming(
        &mut self,
        params: &AnalysisResult,
        chunk_size: usize,
        mut callback: impl FnMut(&[f32]) -> bool,
    ) -> Result<usize> {
        check_chunk_size(chunk_size)?;
        if !check_params(params)? {
            return Ok(0);
        }
        let renderer = ensure_renderer(&mut self.renderer, &mut self.state, params)?;
        let mut cursor = Cursor::new(chunk_size, params.fft_size, self.config.seed)?;
        let mut chunk = Vec::new();
        let mut delivered = 0;
        while !cursor.is_finished(params) {
            render_chunk(renderer, params, &mut cursor, self.level, &mut chunk)?;
            delivered += chunk.len();
            if !callback(&chunk) {
                break;
            }
        }
        Ok(delivered)
    }

    /// Takes ownership of `params` and starts a stream at its first sample.
    /// A stream already in progress is discarded.
    pub fn init_stream(&mut self, params: AnalysisResult, chunk_size: usize) -> Result<()> {
        check_chunk_size(chunk_size)?;
        if check_params(&params)? {
            ensure_renderer(&mut self.renderer, &mut self.state, &params)?;
        }
        if matches!(self.stream, StreamState::Initialized(_)) {
            debug!("replacing active synthesis stream");
        }
        let cursor = Cursor::new(chunk_size, params.fft_size, self.config.seed)?;
        self.stream = StreamState::Initialized(Box::new(Stream { params, cursor }));
        self.level = self.config.optimization_level;
        self.last_chunk_time = None;
        Ok(())
    }

    /// Next `chunk_size` samples of the stream; the final chunk is cut at
    /// the end of the utterance.
    pub fn process_chunk(&mut self) -> Result<Vec<f32>> {
        let StreamState::Initialized(stream) = &mut self.stream else {
            return Err(Error::InvalidState("stream not initialized"));
        };
        if stream.cursor.is_finished(&stream.params) {
            return Err(Error::InvalidState("stream exhausted"));
        }
        let started = Instant::now();
        let renderer = ensure_renderer(&mut self.renderer, &mut self.state, &stream.params)?;
        let mut chunk = Vec::new();
        render_chunk(renderer, &stream.params, &mut stream.cursor, self.level, &mut chunk)?;
        let elapsed = started.elapsed();
        trace!(
            samples = chunk.len(),
            processed = stream.cursor.samples_processed,
            elapsed_us = elapsed.as_micros() as u64,
            "synthesized chunk"
        );
        self.last_chunk_time = Some(elapsed);
        Ok(chunk)
    }

    /// Rewinds the stream to its first sample and reseeds its noise.
    pub fn reset_stream(&mut self) -> Result<()> {
        let StreamState::Initialized(stream) = &mut self.stream else {
            return Err(Error::InvalidState("stream not initialized"));
        };
        stream.cursor.reset(self.config.seed);
        self.last_chunk_time = None;
        Ok(())
    }

    /// Ends the stream and hands its parameters back.
    pub fn release_stream(&mut self) -> Option<AnalysisResult> {
        match std::mem::take(&mut self.stream) {
            StreamState::Initialized(stream) => Some(stream.params),
            StreamState::Uninitialized => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.stream, StreamState::Initialized(_))
    }

    pub fn is_stream_finished(&self) -> bool {
        match &self.stream {
            StreamState::Initialized(stream) => stream.cursor.is_finished(&stream.params),
            StreamState::Uninitialized => true,
        }
    }

    pub fn samples_processed(&self) -> usize {
        match &self.stream {
            StreamState::Initialized(stream) => stream.cursor.samples_processed,
            StreamState::Uninitialized => 0,
        }
    }

    /// Frame of the most recently rendered pulse.
    pub fn current_frame_index(&self) -> usize {
        match &self.stream {
            StreamState::Initialized(stream) => stream.cursor.current_frame_index,
            StreamState::Uninitialized => 0,
        }
    }

    pub fn optimization_level(&self) -> u8 {
        self.level
    }

    /// Switches the response truncation level of the active stream and
    /// returns its estimated latency in milliseconds.
    pub fn set_optimization_level(&mut self, level: u8) -> Result<f64> {
        let latency = self.estimated_latency_ms(level)?;
        self.level = level;
        debug!(level, latency_ms = latency, "streaming optimization level set");
        Ok(latency)
    }

    /// Chunk plus carried tail, in milliseconds, for `level`.
    pub fn estimated_latency_ms(&self, level: u8) -> Result<f64> {
        if level > SynthesisConfig::MAX_OPTIMIZATION_LEVEL {
            return Err(Error::invalid_arg(
                "optimization_level",
                format!("{level} not in 0..={}", SynthesisConfig::MAX_OPTIMIZATION_LEVEL),
            ));
        }
        let StreamState::Initialized(stream) = &self.stream else {
            return Err(Error::InvalidState("stream not initialized"));
        };
        ensure_positive("sample_rate", stream.params.sample_rate as f64)?;
        let tail = stream.params.fft_size >> level;
        Ok((stream.cursor.chunk_size + tail) as f64 * 1000.0 / stream.params.sample_rate as f64)
    }

    /// Picks the lowest level whose latency estimate meets `target_ms`, or
    /// the highest level when none does.
    pub fn adapt_to_latency(&mut self, target_ms: f64) -> Result<u8> {
        ensure_positive("target_ms", target_ms)?;
        let mut chosen = SynthesisConfig::MAX_OPTIMIZATION_LEVEL;
        for level in 0..=SynthesisConfig::MAX_OPTIMIZATION_LEVEL {
            if self.estimated_latency_ms(level)? <= target_ms {
                chosen = level;
                break;
            }
        }
        self.set_optimization_level(chosen)?;
        Ok(chosen)
    }

    /// Wall time spent producing the previous chunk.
    pub fn last_chunk_time(&self) -> Option<Duration> {
        self.last_chunk_time
    }
}

/// Validates `params`; `Ok(false)` means there is nothing to render.
fn check_params(params: &AnalysisResult) -> Result<bool> {
    params.validate()?;
    if params.is_empty() {
        return Ok(false);
    }
    ensure_positive("sample_rate", params.sample_rate as f64)?;
    fft::check_size(params.fft_size)?;
    Ok(true)
}

fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::invalid_arg("chunk_size", "must be at least 1"));
    }
    Ok(())
}

fn ensure_renderer<'a>(
    slot: &'a mut Option<PulseRenderer>,
    state: &mut Scratch,
    params: &AnalysisResult,
) -> Result<&'a mut PulseRenderer> {
    let stale = slot
        .as_ref()
        .map_or(true, |renderer| renderer.fft_size() != params.fft_size);
    if stale || state.needs_rebuild(params.sample_rate, params.fft_size) {
        *slot = Some(PulseRenderer::new(params.fft_size)?);
        state.mark_built("synthesis", params.sample_rate, params.fft_size);
    }
    slot.as_mut().ok_or(Error::InvalidState("synthesis renderer missing"))
}

/// Nearest frame to `position` and the F0 there, interpolated when both
/// surrounding frames are voiced.
fn locate(params: &AnalysisResult, position: f64) -> (usize, f64) {
    let last = params.frame_count() - 1;
    let t = position * 1000.0 / (params.sample_rate as f64 * params.frame_period);
    let lo = (t.floor().max(0.0) as usize).min(last);
    let hi = (lo + 1).min(last);
    let fraction = (t - lo as f64).clamp(0.0, 1.0);
    let nearest = if fraction < 0.5 { lo } else { hi };
    let (a, b) = (params.f0[lo], params.f0[hi]);
    let f0 = if a > 0.0 && b > 0.0 {
        a + (b - a) * fraction
    } else {
        params.f0[nearest]
    };
    (nearest, f0)
}

/// Renders every pulse starting before the end of the next chunk and moves
/// the finished chunk into `out`.
fn render_chunk(
    renderer: &mut PulseRenderer,
    params: &AnalysisResult,
    cursor: &mut Cursor,
    level: u8,
    out: &mut Vec<f32>,
) -> Result<()> {
    let sample_rate = params.sample_rate as f64;
    let len = cursor
        .chunk_size
        .min(params.audio_length.saturating_sub(cursor.samples_processed));
    let end = cursor.samples_processed + len;

    while cursor.next_pulse < end as f64 {
        let position = cursor.next_pulse;
        let (frame, f0) = locate(params, position);
        let voiced = f0 > 0.0 && f0.is_finite();
        let interval = sample_rate / if voiced { f0 } else { UNVOICED_PULSE_RATE };
        cursor.current_frame_index = frame;
        cursor.next_pulse += interval;

        let gain = params.gain[frame];
        if !(gain > 0.0 && gain.is_finite()) {
            continue;
        }
        let pulse = Pulse {
            position,
            interval,
            voiced,
            envelope: params.spectral_envelope.row(frame),
            aperiodicity: params.aperiodicity.row(frame),
            gain,
        };
        let response = renderer
            .render(&pulse, &mut cursor.rng, level)
            .map_err(|e| e.at(Stage::Synthesis, frame))?;
        if !cursor.overlap.overlap_add(position as usize, response) {
            return Err(Error::InvalidState("pulse response outside overlap window").at(Stage::Synthesis, frame));
        }
    }

    out.clear();
    out.try_reserve_exact(len)
        .map_err(|_| Error::out_of_memory("synthesis chunk", len))?;
    out.resize(len, 0.0);
    if !cursor.overlap.read(out) {
        return Err(Error::InvalidState("synthesis chunk larger than overlap window")
            .at(Stage::Synthesis, cursor.current_frame_index));
    }
    cursor.samples_processed = end;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, power};

    const RATE: u32 = 16000;
    const FFT: usize = 1024;

    /// Steady voiced frames with a flat envelope scaled to `level` RMS.
    fn steady_voice(f0: f64, level: f64, seconds: f64) -> AnalysisResult {
        let audio_length = (RATE as f64 * seconds) as usize;
        let frames = crate::frame_count_for(audio_length, RATE, 5.0);
        let mut params = AnalysisResult::new(RATE, audio_length, 5.0, FFT, frames).unwrap();
        params.f0.fill(f0);
        params.spectral_envelope.as_mut_slice().fill(1.0);
        params.aperiodicity.as_mut_slice().fill(0.001);
        params.gain.fill(level);
        params
    }

    fn synthesizer() -> Synthesizer {
        Synthesizer::new(SynthesisConfig::default()).unwrap()
    }

    #[test]
    fn test_chunk_wider_than_overlap_window_fails() {
        let params = steady_voice(200.0, 0.0, 0.05);
        let mut slot = None;
        let mut state = Scratch::default();
        let renderer = ensure_renderer(&mut slot, &mut state, &params).unwrap();
        let mut cursor = Cursor::new(256, FFT, 0).unwrap();
        cursor.overlap = OverlapBuffer::new(128).unwrap();

        let mut out = Vec::new();
        let err = render_chunk(renderer, &params, &mut cursor, 0, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(matches!(err, Error::Stage { stage: Stage::Synthesis, .. }));
        assert_eq!(cursor.samples_processed, 0);
    }

    #[test]
    fn test_empty_parameters_give_empty_output() {
        let params = AnalysisResult::new(RATE, 0, 5.0, FFT, 0).unwrap();
        assert!(synthesizer().synthesize(&params).unwrap().is_empty());
    }

    #[test]
    fn test_output_length_and_level() {
        let params = steady_voice(200.0, 0.1, 0.3);
        let output = synthesizer().synthesize(&params).unwrap();
        assert_eq!(output.len(), params.audio_length);
        let middle: Vec<f64> = output[1000..4000].iter().map(|&x| x as f64).collect();
        let rms = power(&middle);
        assert!((rms - 0.1).abs() < 0.02, "rms {rms}");
    }

    #[test]
    fn test_silent_frames_render_silence() {
        let mut params = steady_voice(200.0, 0.1, 0.1);
        params.gain.fill(0.0);
        let output = synthesizer().synthesize(&params).unwrap();
        assert!(output.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_stream_matches_batch() {
        let mut params = steady_voice(180.0, 0.2, 0.25);
        for (i, f) in params.f0.iter_mut().enumerate() {
            if i % 10 < 3 {
                *f = 0.0;
            }
        }
        let mut synth = synthesizer();
        let batch = synth.synthesize(&params).unwrap();

        synth.init_stream(params.clone(), 300).unwrap();
        let mut streamed = Vec::new();
        while !synth.is_stream_finished() {
            streamed.extend(synth.process_chunk().unwrap());
        }
        assert_eq!(streamed, batch);
        assert_eq!(synth.samples_processed(), params.audio_length);
        assert!(synth.last_chunk_time().is_some());
    }

    #[test]
    fn test_callback_streaming_matches_batch_and_stops_early() {
        let params = steady_voice(220.0, 0.2, 0.2);
        let mut synth = synthesizer();
        let batch = synth.synthesize(&params).unwrap();

        let mut collected = Vec::new();
        let delivered = synth
            .synthesize_streaming(&params, 512, |chunk| {
                collected.extend_from_slice(chunk);
                true
            })
            .unwrap();
        assert_eq!(delivered, batch.len());
        assert_eq!(collected, batch);

        let mut calls = 0;
        let delivered = synth
            .synthesize_streaming(&params, 512, |_| {
                calls += 1;
                calls < 2
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(delivered, 1024);
    }

    #[test]
    fn test_state_machine() {
        let mut synth = synthesizer();
        assert_eq!(synth.process_chunk().unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(synth.reset_stream().unwrap_err().kind(), ErrorKind::InvalidState);
        assert!(synth.release_stream().is_none());

        let params = steady_voice(200.0, 0.1, 0.05);
        synth.init_stream(params, 1000).unwrap();
        let first = synth.process_chunk().unwrap();
        assert_eq!(first.len(), 800);
        assert_eq!(synth.process_chunk().unwrap_err().kind(), ErrorKind::InvalidState);

        synth.reset_stream().unwrap();
        assert_eq!(synth.samples_processed(), 0);
        assert_eq!(synth.process_chunk().unwrap(), first);

        let params = synth.release_stream().unwrap();
        assert_eq!(params.audio_length, 800);
        assert!(!synth.is_streaming());
    }

    #[test]
    fn test_rejects_zero_chunk() {
        let params = steady_voice(200.0, 0.1, 0.05);
        let err = synthesizer().init_stream(params, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_latency_controls() {
        let mut synth = synthesizer();
        assert!(synth.set_optimization_level(1).is_err());

        synth.init_stream(steady_voice(200.0, 0.1, 0.1), 160).unwrap();
        let exact = synth.set_optimization_level(0).unwrap();
        assert!((exact - (160.0 + 1024.0) / 16.0).abs() < 1e-9);
        let fast = synth.set_optimization_level(3).unwrap();
        assert!((fast - (160.0 + 128.0) / 16.0).abs() < 1e-9);
        assert!(synth.set_optimization_level(4).is_err());

        assert_eq!(synth.adapt_to_latency(50.0).unwrap(), 1);
        assert_eq!(synth.optimization_level(), 1);
        assert_eq!(synth.adapt_to_latency(1.0).unwrap(), 3);
        assert_eq!(synth.adapt_to_latency(500.0).unwrap(), 0);
    }

    #[test]
    fn test_truncated_stream_stays_close_to_exact() {
        let params = steady_voice(200.0, 0.1, 0.2);
        let mut synth = synthesizer();
        let exact = synth.synthesize(&params).unwrap();
        synth.init_stream(params, 400).unwrap();
        synth.set_optimization_level(1).unwrap();
        let mut truncated = Vec::new();
        while !synth.is_stream_finished() {
            truncated.extend(synth.process_chunk().unwrap());
        }
        assert_eq!(truncated.len(), exact.len());
        let diff: Vec<f64> = exact
            .iter()
            .zip(&truncated)
            .map(|(a, b)| (a - b) as f64)
            .collect();
        assert!(power(&diff) < 0.01);
    }
}
