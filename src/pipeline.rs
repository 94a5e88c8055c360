//! End-to-end processing pipeline
//!
//! Runs the configured stages in order:
//! 1. Filter (design + streaming application)
//! 2. Resample (event indices are rescaled with the data)
//! 3. Epoch against the event stream
//! 4. Spectral and time-frequency estimates, over the epochs when present,
//!    otherwise over the continuous recording
//!
//! Each stage produces a new artifact. A cancelled stage ends the run; the
//! output then holds everything that completed, marked as cancelled.

use crate::config::ProcessingConfig;
use crate::control::{Completion, RunControl};
use crate::epochs::{EpochExtractor, EpochSet};
use crate::error::{DspError, Result};
use crate::events::{Annotation, EventStream};
use crate::filter::FilterDesigner;
use crate::resample::Resampler;
use crate::spectral::{EpochSpectra, SpectralEstimator, SpectralResult};
use crate::streaming::StreamingFilterEngine;
use crate::tfr::{EpochsTfr, TimeFrequencyResult, TimeFrequencyTransformer};
use crate::types::Recording;
use std::time::Instant;

/// Everything a pipeline run produced
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Continuous data after filtering and resampling
    pub recording: Recording,
    /// Events re-indexed to `recording`'s rate
    pub events: Option<EventStream>,
    pub epochs: Option<EpochSet>,
    pub spectrum: Option<SpectralResult>,
    pub epoch_spectra: Option<EpochSpectra>,
    pub tfr: Option<TimeFrequencyResult>,
    pub epochs_tfr: Option<EpochsTfr>,
    pub completion: Completion,
    /// Key of the configuration that produced this output
    pub cache_key: String,
    pub processing_time_ms: f64,
}

impl PipelineOutput {
    fn new(recording: Recording, events: Option<EventStream>, cache_key: String) -> Self {
        Self {
            recording,
            events,
            epochs: None,
            spectrum: None,
            epoch_spectra: None,
            tfr: None,
            epochs_tfr: None,
            completion: Completion::Complete,
            cache_key,
            processing_time_ms: 0.0,
        }
    }
}

pub struct Pipeline {
    config: ProcessingConfig,
}

impl Pipeline {
    pub fn new(config: ProcessingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn run(
        &self,
        recording: &Recording,
        events: Option<&EventStream>,
        annotations: &[Annotation],
        control: &RunControl,
    ) -> Result<PipelineOutput> {
        let start = Instant::now();
        let cache_key = self.config.cache_key()?;
        log::info!(
            "Pipeline run on {} channels x {} samples (config {})",
            recording.n_channels(),
            recording.n_samples(),
            &cache_key[..12]
        );

        let mut out = PipelineOutput::new(recording.clone(), events.cloned(), cache_key);
        let result = self.run_stages(&mut out, annotations, control);
        out.processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        result?;

        if !out.completion.is_complete() {
            log::warn!("Pipeline cancelled: {:?}", out.completion);
        }
        log::info!("Pipeline finished in {:.1} ms", out.processing_time_ms);
        Ok(out)
    }

    fn run_stages(
        &self,
        out: &mut PipelineOutput,
        annotations: &[Annotation],
        control: &RunControl,
    ) -> Result<()> {
        let engine = StreamingFilterEngine::new(self.config.streaming);

        if let Some(spec) = &self.config.filter {
            let filter = FilterDesigner::for_recording(&out.recording).design(spec)?;
            let processed = engine.apply(&out.recording, &filter, control)?;
            out.recording = processed.recording;
            if stop(out, processed.completion) {
                return Ok(());
            }
        }

        if let Some(resample) = &self.config.resample {
            let resampler = Resampler::new(out.recording.sample_rate(), resample)?;
            let processed = resampler.apply(&out.recording, control)?;
            out.recording = processed.recording;
            out.events = out
                .events
                .as_ref()
                .map(|e| e.resampled(resample.target_rate))
                .transpose()?;
            if stop(out, processed.completion) {
                return Ok(());
            }
        }

        if let Some(epoch_config) = &self.config.epochs {
            let events = out.events.as_ref().ok_or_else(|| {
                DspError::parameter("events", "epoching requires an event stream")
            })?;
            let set = EpochExtractor::new(epoch_config.clone())
                .with_annotations(annotations.to_vec())
                .extract_recording(&out.recording, events, control)?;
            let completion = set.completion();
            out.epochs = Some(set);
            if stop(out, completion) {
                return Ok(());
            }
        }

        if let Some(spectral) = &self.config.spectral {
            let estimator = SpectralEstimator::new(*spectral);
            let completion = match &out.epochs {
                Some(epochs) => {
                    let spectra = estimator.estimate_epochs(epochs, control)?;
                    let completion = spectra.completion;
                    out.epoch_spectra = Some(spectra);
                    completion
                }
                None => {
                    let spectrum = estimator.estimate(&out.recording, control)?;
                    let completion = spectrum.completion();
                    out.spectrum = Some(spectrum);
                    completion
                }
            };
            if stop(out, completion) {
                return Ok(());
            }
        }

        if let Some(tfr) = &self.config.tfr {
            let transformer = TimeFrequencyTransformer::new(tfr.clone()).with_engine(engine);
            let completion = match &out.epochs {
                Some(epochs) => {
                    let result = transformer.transform_epochs(epochs, control)?;
                    let completion = result.completion;
                    out.epochs_tfr = Some(result);
                    completion
                }
                None => {
                    let result = transformer.transform(&out.recording, control)?;
                    let completion = result.completion;
                    out.tfr = Some(result);
                    completion
                }
            };
            stop(out, completion);
        }

        Ok(())
    }
}

/// Record a stage's completion; true when the run must end here
fn stop(out: &mut PipelineOutput, completion: Completion) -> bool {
    if completion.is_complete() {
        return false;
    }
    out.completion = completion;
    true
}
