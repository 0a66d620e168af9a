//! Frame-parallel execution of the three analysis stages under a wall-clock
//! budget.
//!
//! Each stage splits the frame axis into contiguous partitions, one per
//! worker, and every partition works on its own clone of the stage's
//! analyzer. Partitions write disjoint rows of the pre-sized result, and the
//! stage's whole-contour pass runs on the calling thread once all of them
//! have finished. Elapsed time is checked between stages: a stage that
//! starts after its share of the budget is gone runs its fast variant.

use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    aperiodicity::{smooth_across_frames, AperiodicityAnalyzer},
    config::{EngineConfig, F0Algorithm, Quality, SchedulerConfig},
    error::{Result, Stage},
    f0::F0Extractor,
    params::{frame_center, AnalysisResult},
    spectral::{envelope_rms, SpectralAnalyzer},
};

pub const MAX_WORKERS: usize = 8;
/// Cumulative budget shares at which the spectral and aperiodicity stages
/// fall back to their fast variants.
const SPECTRAL_DEADLINE: f64 = 0.4;
const APERIODICITY_DEADLINE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub quality: Quality,
    pub elapsed: Duration,
}

/// Timing and variant choices of one analysis call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisReport {
    pub stages: Vec<StageReport>,
    pub total: Duration,
    pub budget_exceeded: bool,
    pub workers: usize,
    pub frame_count: usize,
}

impl AnalysisReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }

    fn record(&mut self, stage: Stage, quality: Quality, started: Instant) {
        let elapsed = started.elapsed();
        debug!(%stage, ?quality, elapsed_us = elapsed.as_micros() as u64, "stage finished");
        self.stages.push(StageReport {
            stage,
            quality,
            elapsed,
        });
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    pool: rayon::ThreadPool,
    workers: usize,
    extractor: F0Extractor,
    spectral: SpectralAnalyzer,
    aperiodicity: AperiodicityAnalyzer,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let workers = config
            .scheduler
            .workers
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get))
            .min(MAX_WORKERS);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("worldvox-analysis-{i}"))
            .build()?;
        debug!(workers, "analysis worker pool started");

        let range = config.extractor.f0_range();
        Ok(Self {
            config: config.scheduler.clone(),
            pool,
            workers,
            extractor: F0Extractor::new(config.extractor.clone())?,
            spectral: SpectralAnalyzer::new(config.spectrum.clone(), range)?,
            aperiodicity: AperiodicityAnalyzer::new(config.aperiodicity.clone(), range)?,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn rows_per_task(&self, frame_count: usize) -> usize {
        frame_count.div_ceil(self.workers).max(1)
    }

    pub fn analyze(&mut self, audio: &[f64], sample_rate: u32) -> Result<(AnalysisResult, AnalysisReport)> {
        let started = Instant::now();
        let signal = self.extractor.prepare(audio, sample_rate)?;
        let fft_size = self.spectral.prepare(sample_rate)?;
        self.aperiodicity.prepare(sample_rate, fft_size)?;

        let frame_count = signal.frame_count;
        let frame_period = self.extractor.config().frame_period;
        let mut result = AnalysisResult::new(sample_rate, audio.len(), frame_period, fft_size, frame_count)?;
        let bins = result.bins();
        let mut report = AnalysisReport {
            workers: self.workers,
            frame_count,
            ..AnalysisReport::default()
        };

        let stage_started = Instant::now();
        self.run_stage(&self.extractor, Stage::F0, &mut result.f0, 1, |extractor, frame, out| {
            out[0] = extractor.estimate_frame(&signal, frame)?;
            Ok(())
        })?;
        self.extractor.postprocess(signal.algorithm, &mut result.f0);
        let f0_quality = match signal.algorithm {
            F0Algorithm::Fast => Quality::Fast,
            F0Algorithm::Precise => Quality::Precise,
        };
        report.record(Stage::F0, f0_quality, stage_started);

        let quality = self.choose_quality(Stage::Spectral, started, SPECTRAL_DEADLINE, &mut report);
        let stage_started = Instant::now();
        let f0 = &result.f0;
        // The fast variant analyzes frames two at a time.
        let cols = match quality {
            Quality::Fast => 2 * bins,
            Quality::Precise => bins,
        };
        self.run_stage(
            &self.spectral,
            Stage::Spectral,
            result.spectral_envelope.as_mut_slice(),
            cols,
            |analyzer, index, rows| {
                if quality == Quality::Precise {
                    let center = frame_center(index, frame_period, sample_rate);
                    return analyzer.analyze_frame_into(audio, center, f0[index], sample_rate, rows);
                }
                let frames = [2 * index, 2 * index + 1];
                let centers = frames.map(|frame| frame_center(frame, frame_period, sample_rate));
                let outcome = if rows.len() == bins {
                    analyzer.analyze_frame_into(audio, centers[0], f0[frames[0]], sample_rate, rows)
                } else {
                    analyzer.analyze_pair_into(audio, centers, [f0[frames[0]], f0[frames[1]]], sample_rate, rows)
                };
                outcome.map_err(|e| e.at(Stage::Spectral, frames[0]))
            },
        )?;
        self.run_stage(&self.spectral, Stage::Spectral, &mut result.gain, 1, |analyzer, frame, out| {
            let center = frame_center(frame, frame_period, sample_rate);
            out[0] = analyzer.frame_level(audio, center, f0[frame], sample_rate)?;
            Ok(())
        })?;
        for (gain, row) in result.gain.iter_mut().zip(result.spectral_envelope.iter_rows()) {
            let rms = envelope_rms(row);
            *gain = if rms > 0.0 { *gain / rms } else { 0.0 };
        }
        report.record(Stage::Spectral, quality, stage_started);

        let quality = self.choose_quality(Stage::Aperiodicity, started, APERIODICITY_DEADLINE, &mut report);
        let stage_started = Instant::now();
        self.run_stage(
            &self.aperiodicity,
            Stage::Aperiodicity,
            result.aperiodicity.as_mut_slice(),
            bins,
            |analyzer, frame, row| {
                let center = frame_center(frame, frame_period, sample_rate);
                analyzer.analyze_frame_into(audio, center, f0[frame], sample_rate, quality, row)
            },
        )?;
        smooth_across_frames(&mut result.aperiodicity, &result.f0);
        report.record(Stage::Aperiodicity, quality, stage_started);

        report.total = started.elapsed();
        if let Some(budget) = self.config.budget {
            report.budget_exceeded |= report.total > budget;
        }
        debug!(
            frames = frame_count,
            total_us = report.total.as_micros() as u64,
            budget_exceeded = report.budget_exceeded,
            "analysis finished"
        );
        Ok((result, report))
    }

    /// Fast variant once the elapsed time passes `deadline` of the budget.
    fn choose_quality(&self, stage: Stage, started: Instant, deadline: f64, report: &mut AnalysisReport) -> Quality {
        let Some(budget) = self.config.budget else {
            return Quality::Precise;
        };
        let elapsed = started.elapsed();
        let allotted = budget.mul_f64(deadline);
        if elapsed <= allotted {
            return Quality::Precise;
        }
        warn!(
            %stage,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            allotted_ms = allotted.as_secs_f64() * 1000.0,
            "analysis over budget, using fast variant"
        );
        report.budget_exceeded = true;
        Quality::Fast
    }

    /// Runs `job` once per row of `data` (`cols` values per job), in
    /// parallel partitions unless the stage is too small to be worth it.
    /// The first failing partition, in frame order, decides the error.
    fn run_stage<A, F>(&self, prototype: &A, stage: Stage, data: &mut [f64], cols: usize, job: F) -> Result<()>
    where
        A: Clone + Send + Sync,
        F: Fn(&mut A, usize, &mut [f64]) -> Result<()> + Sync,
    {
        let cols = cols.max(1);
        let frames = data.len().div_ceil(cols);
        if frames == 0 {
            return Ok(());
        }
        if frames < self.config.parallel_threshold || self.workers == 1 {
            let mut analyzer = prototype.clone();
            return run_partition(&mut analyzer, &job, stage, 0, cols, data);
        }

        let rows = self.rows_per_task(frames);
        let results: Vec<Result<()>> = self.pool.install(|| {
            data.par_chunks_mut(rows * cols)
                .enumerate()
                .map_init(
                    || prototype.clone(),
                    |analyzer, (index, block)| run_partition(analyzer, &job, stage, index * rows, cols, block),
                )
                .collect()
        });
        results.into_iter().collect()
    }
}

fn run_partition<A, F>(analyzer: &mut A, job: &F, stage: Stage, first: usize, cols: usize, block: &mut [f64]) -> Result<()>
where
    F: Fn(&mut A, usize, &mut [f64]) -> Result<()>,
{
    for (offset, row) in block.chunks_mut(cols).enumerate() {
        let frame = first + offset;
        job(analyzer, frame, row).map_err(|e| e.at(stage, frame))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};

    fn config(workers: usize, budget: Option<Duration>) -> EngineConfig {
        EngineConfig {
            scheduler: SchedulerConfig {
                workers: Some(workers),
                budget,
                parallel_threshold: 16,
            },
            ..EngineConfig::default()
        }
    }

    fn vowel(seconds: f64, sample_rate: u32) -> Vec<f64> {
        let len = (seconds * sample_rate as f64) as usize;
        (0..len)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                (1..=8)
                    .map(|h| 0.3 * (std::f64::consts::TAU * 150.0 * h as f64 * t).sin() / h as f64)
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_partitioning() {
        let scheduler = Scheduler::new(&config(4, None)).unwrap();
        assert_eq!(scheduler.workers(), 4);
        assert_eq!(scheduler.rows_per_task(201), 51);
        assert_eq!(scheduler.rows_per_task(3), 1);
        assert_eq!(scheduler.rows_per_task(0), 1);
    }

    #[test]
    fn test_worker_count_is_capped() {
        let scheduler = Scheduler::new(&config(64, None)).unwrap();
        assert_eq!(scheduler.workers(), MAX_WORKERS);
    }

    #[test]
    fn test_partitioning_does_not_change_results() {
        let audio = vowel(0.2, 16000);
        let (single, _) = Scheduler::new(&config(1, None)).unwrap().analyze(&audio, 16000).unwrap();
        let (parallel, report) = Scheduler::new(&config(4, None)).unwrap().analyze(&audio, 16000).unwrap();
        assert_eq!(single, parallel);
        assert_eq!(report.workers, 4);
        assert_eq!(report.stages.len(), 3);
        assert!(!report.budget_exceeded);
        assert_eq!(report.stage(Stage::Aperiodicity).unwrap().quality, Quality::Precise);
    }

    #[test]
    fn test_exhausted_budget_selects_fast_variants() {
        let audio = vowel(0.2, 16000);
        let mut scheduler = Scheduler::new(&config(2, Some(Duration::from_nanos(1)))).unwrap();
        let (result, report) = scheduler.analyze(&audio, 16000).unwrap();
        assert!(report.budget_exceeded);
        assert_eq!(report.stage(Stage::Spectral).unwrap().quality, Quality::Fast);
        assert_eq!(report.stage(Stage::Aperiodicity).unwrap().quality, Quality::Fast);
        assert!(result.validate().is_ok());
        for frame in 0..result.frame_count() {
            if result.is_voiced(frame) {
                let row = result.spectral_envelope.row(frame);
                let max = row.iter().fold(0.0f64, |m, &x| m.max(x));
                assert!((max - 1.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_gain_tracks_input_level() {
        let audio = vowel(0.2, 16000);
        let louder: Vec<f64> = audio.iter().map(|x| x * 2.0).collect();
        let mut scheduler = Scheduler::new(&config(2, None)).unwrap();
        let (quiet, _) = scheduler.analyze(&audio, 16000).unwrap();
        let (loud, _) = scheduler.analyze(&louder, 16000).unwrap();
        let middle = quiet.frame_count() / 2;
        assert!(quiet.gain[middle] > 0.0);
        assert!((loud.gain[middle] / quiet.gain[middle] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_input_fails_before_any_stage() {
        let mut scheduler = Scheduler::new(&config(2, None)).unwrap();
        assert_eq!(scheduler.analyze(&[], 16000).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            scheduler.analyze(&[0.0; 1000], 1000).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_fast_variants_stay_close_to_precise() {
        let audio = vowel(0.2, 16000);
        let (precise, _) = Scheduler::new(&config(2, None)).unwrap().analyze(&audio, 16000).unwrap();
        let (fast, report) = Scheduler::new(&config(2, Some(Duration::from_nanos(1))))
            .unwrap()
            .analyze(&audio, 16000)
            .unwrap();
        assert_eq!(report.stage(Stage::Spectral).unwrap().quality, Quality::Fast);
        assert_eq!(fast.f0, precise.f0);
        for (name, a, b) in [
            ("envelope", &fast.spectral_envelope, &precise.spectral_envelope),
            ("aperiodicity", &fast.aperiodicity, &precise.aperiodicity),
        ] {
            for (i, (x, y)) in a.as_slice().iter().zip(b.as_slice()).enumerate() {
                assert!((x - y).abs() < 0.1, "{name} frame {} bin {}: {x} vs {y}", i / a.cols(), i % a.cols());
            }
        }
    }

    #[test]
    fn test_first_failure_in_frame_order_is_reported() {
        let scheduler = Scheduler::new(&config(4, None)).unwrap();
        let mut data = vec![0.0; 40];
        // Four partitions of ten frames; the second and fourth fail.
        let err = scheduler
            .run_stage(&(), Stage::Spectral, &mut data, 1, |_, frame, out| {
                if frame == 13 || frame == 31 {
                    return Err(Error::InvalidState("frame rejected"));
                }
                out[0] = frame as f64;
                Ok(())
            })
            .unwrap_err();
        match err {
            Error::Stage { stage, frame, .. } => {
                assert_eq!(stage, Stage::Spectral);
                assert_eq!(frame, 13);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(&data[..3], &[0.0, 1.0, 2.0]);
    }
}
