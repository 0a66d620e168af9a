use std::time::Duration;

use crate::{
    config::EngineConfig,
    error::{Error, Result},
    params::AnalysisResult,
    scheduler::{AnalysisReport, Scheduler},
    scratch,
    synthesis::Synthesizer,
};

/// Analysis and synthesis context. Owns its worker pool, analyzer
/// instances and streaming state; dropping it releases all of them.
pub struct Engine {
    config: EngineConfig,
    scheduler: Scheduler,
    synthesizer: Synthesizer,
    last_report: Option<AnalysisReport>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scheduler: Scheduler::new(&config)?,
            synthesizer: Synthesizer::new(config.synthesis.clone())?,
            config,
            last_report: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workers(&self) -> usize {
        self.scheduler.workers()
    }

    /// Decomposes `audio` into F0, spectral envelope and aperiodicity.
    ///
    /// Results are bit-for-bit repeatable when the scheduler budget is
    /// `None` or never reached. Once a budget runs out the remaining stages
    /// switch to their fast variants, so which frames are affected depends
    /// on wall-clock timing.
    pub fn analyze(&mut self, audio: &[f32], sample_rate: u32) -> Result<AnalysisResult> {
        self.last_report = None;
        if audio.is_empty() {
            return Err(Error::invalid_arg("audio", "empty buffer"));
        }
        if let Some(index) = audio.iter().position(|x| !x.is_finite()) {
            return Err(Error::invalid_arg(
                "audio",
                format!("non-finite sample at index {index}"),
            ));
        }
        let mut samples = Vec::new();
        scratch::ensure_len(&mut samples, audio.len(), 0.0, "analysis input")?;
        for (dst, &src) in samples.iter_mut().zip(audio) {
            *dst = src as f64;
        }

        let (result, report) = self.scheduler.analyze(&samples, sample_rate)?;
        self.last_report = Some(report);
        Ok(result)
    }

    /// Report of the most recent successful [`Engine::analyze`] call.
    pub fn last_report(&self) -> Option<&AnalysisReport> {
        self.last_report.as_ref()
    }

    pub fn synthesize(&mut self, params: &AnalysisResult) -> Result<Vec<f32>> {
        self.synthesizer.synthesize(params)
    }

    pub fn synthesize_streaming(
        &mut self,
        params: &AnalysisResult,
        chunk_size: usize,
        callback: impl FnMut(&[f32]) -> bool,
    ) -> Result<usize> {
        self.synthesizer.synthesize_streaming(params, chunk_size, callback)
    }

    pub fn init_stream(&mut self, params: AnalysisResult, chunk_size: usize) -> Result<()> {
        self.synthesizer.init_stream(params, chunk_size)
    }

    pub fn process_chunk(&mut self) -> Result<Vec<f32>> {
        self.synthesizer.process_chunk()
    }

    pub fn reset_stream(&mut self) -> Result<()> {
        self.synthesizer.reset_stream()
    }

    pub fn release_stream(&mut self) -> Option<AnalysisResult> {
        self.synthesizer.release_stream()
    }

    pub fn is_stream_finished(&self) -> bool {
        self.synthesizer.is_stream_finished()
    }

    pub fn set_optimization_level(&mut self, level: u8) -> Result<f64> {
        self.synthesizer.set_optimization_level(level)
    }

    pub fn adapt_to_latency(&mut self, target_ms: f64) -> Result<u8> {
        self.synthesizer.adapt_to_latency(target_ms)
    }

    pub fn last_chunk_time(&self) -> Option<Duration> {
        self.synthesizer.last_chunk_time()
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }
}
