//! Power spectral density estimation
//!
//! Two estimators are available, selected once per [`SpectralConfig`]:
//! - Welch: overlapping segments, one window, averaged periodograms
//! - Multitaper: DPSS tapers over the whole signal, periodograms averaged
//!   with the tapers' concentration ratios as weights
//!
//! Tapers and windows are computed once per call and shared by every
//! channel and epoch.

mod dpss;
mod periodogram;

pub use dpss::{dpss, Dpss};

use crate::control::{Completion, RunControl};
use crate::epochs::EpochSet;
use crate::error::{DspError, Result};
use crate::profile_scope;
use crate::source::{read_channel, SampleSource};
use crate::types::ChannelInfo;
use crate::window::WindowKind;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Tapers below this concentration are dropped when `low_bias` is set
const LOW_BIAS_THRESHOLD: f64 = 0.9;

/// Welch segment length when none is given and the signal is long enough
const DEFAULT_SEGMENT_LENGTH: usize = 256;

fn default_half_bandwidth() -> f64 {
    4.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detrend {
    None,
    #[default]
    Constant,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SpectralMethod {
    Welch {
        /// Samples per segment. When unset, 256 or the whole signal if it
        /// is shorter; an explicit length longer than the signal is an error
        #[serde(default)]
        segment_length: Option<usize>,
        /// Samples shared by consecutive segments; half a segment if unset
        #[serde(default)]
        overlap: Option<usize>,
        #[serde(default)]
        window: WindowKind,
    },
    Multitaper {
        /// Time-half-bandwidth product `NW`
        #[serde(default = "default_half_bandwidth")]
        half_bandwidth: f64,
        /// Defaults to `floor(2 NW)`
        #[serde(default)]
        n_tapers: Option<usize>,
        #[serde(default = "default_true")]
        low_bias: bool,
    },
}

impl SpectralMethod {
    pub fn welch(segment_length: usize) -> Self {
        SpectralMethod::Welch {
            segment_length: Some(segment_length),
            overlap: None,
            window: WindowKind::Hann,
        }
    }

    pub fn multitaper(half_bandwidth: f64) -> Self {
        SpectralMethod::Multitaper {
            half_bandwidth,
            n_tapers: None,
            low_bias: true,
        }
    }
}

impl Default for SpectralMethod {
    fn default() -> Self {
        SpectralMethod::Welch {
            segment_length: None,
            overlap: None,
            window: WindowKind::Hann,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpectralConfig {
    #[serde(flatten)]
    pub method: SpectralMethod,
    /// Lowest reported frequency (Hz)
    #[serde(default)]
    pub fmin: f64,
    /// Highest reported frequency (Hz); Nyquist if unset
    #[serde(default)]
    pub fmax: Option<f64>,
    #[serde(default)]
    pub detrend: Detrend,
}

impl SpectralConfig {
    pub fn new(method: SpectralMethod) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn with_range(mut self, fmin: f64, fmax: f64) -> Self {
        self.fmin = fmin;
        self.fmax = Some(fmax);
        self
    }

    pub fn cache_key(&self) -> Result<String> {
        crate::config::cache_key(self)
    }
}

/// Parameters actually used for an estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralParams {
    pub method: SpectralMethod,
    pub detrend: Detrend,
    /// Transform length (segment length for Welch, signal length for
    /// multitaper)
    pub n_fft: usize,
    pub n_segments: usize,
    pub n_tapers: usize,
    /// Concentration ratio of each taper used (multitaper only)
    pub concentrations: Vec<f64>,
}

/// Per-channel one-sided power spectral density
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectralResult {
    channels: Vec<ChannelInfo>,
    sample_rate: f64,
    freqs: Vec<f64>,
    /// `[channel][frequency]`, unit^2/Hz
    psd: Vec<Vec<f64>>,
    params: SpectralParams,
    completion: Completion,
}

impl SpectralResult {
    pub fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label.clone()).collect()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn freqs(&self) -> &[f64] {
        &self.freqs
    }

    pub fn psd(&self) -> &[Vec<f64>] {
        &self.psd
    }

    pub fn params(&self) -> &SpectralParams {
        &self.params
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    /// Bin spacing in Hz
    pub fn frequency_resolution(&self) -> f64 {
        self.sample_rate / self.params.n_fft as f64
    }

    pub fn channel_psd(&self, label: &str) -> Result<&[f64]> {
        self.channels
            .iter()
            .position(|c| c.label == label)
            .map(|i| self.psd[i].as_slice())
            .ok_or_else(|| DspError::ChannelNotFound(label.to_string()))
    }

    /// Integrated power in `[fmin, fmax]` for each channel
    pub fn band_power(&self, fmin: f64, fmax: f64) -> Vec<f64> {
        let df = self.frequency_resolution();
        self.psd
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&self.freqs)
                    .filter(|(_, f)| **f >= fmin && **f <= fmax)
                    .map(|(p, _)| p * df)
                    .sum()
            })
            .collect()
    }

    /// Frequency of the largest density on channel `index`
    pub fn peak_frequency(&self, index: usize) -> Option<f64> {
        let row = self.psd.get(index)?;
        row.iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| self.freqs[k])
    }
}

/// Spectrum of one epoch, all channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochPsd {
    pub event_index: usize,
    pub condition: String,
    /// `[channel][frequency]`
    pub psd: Vec<Vec<f64>>,
}

/// Per-epoch spectra of the retained epochs of an [`EpochSet`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSpectra {
    pub channels: Vec<ChannelInfo>,
    pub sample_rate: f64,
    pub freqs: Vec<f64>,
    pub params: SpectralParams,
    /// Completed epochs only, in epoch order
    pub epochs: Vec<EpochPsd>,
    pub completion: Completion,
}

impl EpochSpectra {
    /// Average over the completed epochs
    pub fn mean(&self) -> Result<SpectralResult> {
        let first = self.epochs.first().ok_or_else(|| {
            DspError::parameter("epochs", "no completed epoch spectra to average")
        })?;
        let mut acc: Vec<Vec<f64>> = first.psd.iter().map(|r| vec![0.0; r.len()]).collect();
        for epoch in &self.epochs {
            for (a_row, row) in acc.iter_mut().zip(&epoch.psd) {
                for (a, v) in a_row.iter_mut().zip(row) {
                    *a += v;
                }
            }
        }
        let n = self.epochs.len() as f64;
        for row in acc.iter_mut() {
            for v in row.iter_mut() {
                *v /= n;
            }
        }
        Ok(SpectralResult {
            channels: self.channels.clone(),
            sample_rate: self.sample_rate,
            freqs: self.freqs.clone(),
            psd: acc,
            params: self.params.clone(),
            completion: self.completion,
        })
    }
}

enum Plan {
    Welch { window: Vec<f64>, step: usize },
    Multitaper { tapers: Vec<Vec<f64>>, weights: Vec<f64> },
}

/// Everything that depends only on signal length and rate
struct Prepared {
    plan: Plan,
    detrend: Detrend,
    sample_rate: f64,
    bins: Range<usize>,
    freqs: Vec<f64>,
    params: SpectralParams,
}

impl Prepared {
    fn psd(&self, signal: &[f64]) -> Vec<f64> {
        let full = match &self.plan {
            Plan::Welch { window, step } => {
                periodogram::welch(signal, window, *step, self.detrend, self.sample_rate).0
            }
            Plan::Multitaper { tapers, weights } => {
                periodogram::multitaper(signal, tapers, weights, self.detrend, self.sample_rate)
            }
        };
        full[self.bins.clone()].to_vec()
    }
}

/// Welch / multitaper PSD estimator
#[derive(Debug, Clone, Default)]
pub struct SpectralEstimator {
    config: SpectralConfig,
}

impl SpectralEstimator {
    pub fn new(config: SpectralConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SpectralConfig {
        &self.config
    }

    /// PSD of every channel of a continuous source
    pub fn estimate<S: SampleSource + ?Sized>(
        &self,
        source: &S,
        control: &RunControl,
    ) -> Result<SpectralResult> {
        let n = source.n_samples();
        let prepared = self.prepare(n, source.sample_rate())?;

        profile_scope!("psd");
        log::info!(
            "Estimating PSD of {} channels x {} samples ({} tapers, {} segments)",
            source.channels().len(),
            n,
            prepared.params.n_tapers,
            prepared.params.n_segments
        );

        let (slots, completion) = control.fan_out(source.channels().len(), |ch, _| {
            Some(read_channel(source, ch, 0..n).map(|row| prepared.psd(&row)))
        });

        let mut channels = Vec::new();
        let mut psd = Vec::new();
        for (info, slot) in source.channels().iter().zip(slots) {
            if let Some(row) = slot {
                channels.push(info.clone());
                psd.push(row?);
            }
        }

        Ok(SpectralResult {
            channels,
            sample_rate: source.sample_rate(),
            freqs: prepared.freqs,
            psd,
            params: prepared.params,
            completion,
        })
    }

    /// PSD of every retained epoch, cancellable between epochs
    pub fn estimate_epochs(&self, epochs: &EpochSet, control: &RunControl) -> Result<EpochSpectra> {
        let prepared = self.prepare(epochs.n_times(), epochs.sample_rate())?;
        let retained: Vec<_> = epochs.retained().collect();

        profile_scope!("epoch psd");
        log::info!(
            "Estimating PSD of {} epochs x {} channels",
            retained.len(),
            epochs.channels().len()
        );

        let (slots, completion) = control.fan_out(retained.len(), |i, cancel| {
            let epoch = retained[i];
            let mut psd = Vec::with_capacity(epoch.data.len());
            for row in &epoch.data {
                if cancel.is_cancelled() {
                    return None;
                }
                psd.push(prepared.psd(row));
            }
            Some(EpochPsd {
                event_index: epoch.event_index,
                condition: epoch.condition.clone(),
                psd,
            })
        });

        Ok(EpochSpectra {
            channels: epochs.channels().to_vec(),
            sample_rate: epochs.sample_rate(),
            freqs: prepared.freqs,
            params: prepared.params,
            epochs: slots.into_iter().flatten().collect(),
            completion,
        })
    }

    fn prepare(&self, n: usize, sample_rate: f64) -> Result<Prepared> {
        let SpectralConfig {
            method,
            fmin,
            fmax,
            detrend,
        } = self.config;

        let (plan, n_fft, n_segments, concentrations) = match method {
            SpectralMethod::Welch {
                segment_length,
                overlap,
                window,
            } => {
                let segment_length = segment_length.unwrap_or(DEFAULT_SEGMENT_LENGTH.min(n));
                if segment_length == 0 {
                    return Err(DspError::parameter("segment_length", "must be at least 1"));
                }
                if n < segment_length {
                    return Err(DspError::InsufficientSamples {
                        required: segment_length,
                        available: n,
                    });
                }
                let overlap = overlap.unwrap_or(segment_length / 2);
                if overlap >= segment_length {
                    return Err(DspError::parameter(
                        "overlap",
                        format!("must be below the segment length {}", segment_length),
                    ));
                }
                let step = segment_length - overlap;
                let n_segments = (n - segment_length) / step + 1;
                let plan = Plan::Welch {
                    window: window.periodic(segment_length),
                    step,
                };
                (plan, segment_length, n_segments, Vec::new())
            }
            SpectralMethod::Multitaper {
                half_bandwidth,
                n_tapers,
                low_bias,
            } => {
                let n_tapers = n_tapers
                    .unwrap_or((2.0 * half_bandwidth).floor() as usize)
                    .max(1);
                let Dpss {
                    tapers,
                    concentrations,
                } = dpss(n, half_bandwidth, n_tapers)?;

                let mut kept: Vec<(Vec<f64>, f64)> = tapers
                    .into_iter()
                    .zip(concentrations)
                    .collect();
                if low_bias {
                    let best = kept.first().cloned();
                    kept.retain(|(_, c)| *c > LOW_BIAS_THRESHOLD);
                    if kept.is_empty() {
                        log::warn!(
                            "No taper concentrated above {}; keeping the first",
                            LOW_BIAS_THRESHOLD
                        );
                        kept.extend(best);
                    }
                }
                let (tapers, weights): (Vec<_>, Vec<_>) = kept.into_iter().unzip();
                let concentrations = weights.clone();
                (Plan::Multitaper { tapers, weights }, n, 1, concentrations)
            }
        };

        let nyquist = sample_rate / 2.0;
        let fmax = fmax.unwrap_or(nyquist);
        if !(fmin >= 0.0 && fmax <= nyquist && fmin <= fmax) {
            return Err(DspError::parameter(
                "fmin/fmax",
                format!("[{}, {}] Hz is not within [0, {}] Hz", fmin, fmax, nyquist),
            ));
        }
        let df = sample_rate / n_fft as f64;
        let all: Vec<f64> = (0..periodogram::n_bins(n_fft))
            .map(|k| k as f64 * df)
            .collect();
        let first = all.iter().position(|&f| f >= fmin).unwrap_or(all.len());
        let last = all.iter().rposition(|&f| f <= fmax).map_or(0, |k| k + 1);
        if first >= last {
            return Err(DspError::parameter(
                "fmin/fmax",
                format!("[{}, {}] Hz contains no frequency bin", fmin, fmax),
            ));
        }

        let n_tapers = match &plan {
            Plan::Welch { .. } => 1,
            Plan::Multitaper { tapers, .. } => tapers.len(),
        };
        Ok(Prepared {
            plan,
            detrend,
            sample_rate,
            bins: first..last,
            freqs: all[first..last].to_vec(),
            params: SpectralParams {
                method,
                detrend,
                n_fft,
                n_segments,
                n_tapers,
                concentrations,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Recording;
    use std::f64::consts::PI;

    fn sine_recording(freq: f64, fs: f64, n: usize) -> Recording {
        let x: Vec<f64> = (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
            .collect();
        Recording::from_labels(&["Oz"], vec![x], fs).unwrap()
    }

    #[test]
    fn test_welch_peak_and_resolution() {
        let rec = sine_recording(12.0, 256.0, 2048);
        let result = SpectralEstimator::new(SpectralConfig::new(SpectralMethod::welch(256)))
            .estimate(&rec, &RunControl::default())
            .unwrap();
        assert_eq!(result.frequency_resolution(), 1.0);
        assert_eq!(result.freqs().len(), 129);
        assert_eq!(result.peak_frequency(0), Some(12.0));
        assert_eq!(result.params().n_segments, 15);
    }

    #[test]
    fn test_multitaper_peak_and_taper_count() {
        let rec = sine_recording(20.0, 200.0, 400);
        let config = SpectralConfig::new(SpectralMethod::multitaper(4.0)).with_range(5.0, 50.0);
        let result = SpectralEstimator::new(config)
            .estimate(&rec, &RunControl::default())
            .unwrap();
        // the taper spectra spread a line over +/- NW / duration
        let peak = result.peak_frequency(0).unwrap();
        assert!((peak - 20.0).abs() <= 4.0 * 200.0 / 400.0);
        assert!(result.params().n_tapers >= 6 && result.params().n_tapers <= 8);
        assert!(result.freqs().first().copied().unwrap() >= 5.0);
        assert!(result.freqs().last().copied().unwrap() <= 50.0);
    }

    #[test]
    fn test_segment_longer_than_signal() {
        let rec = sine_recording(10.0, 100.0, 100);
        let err = SpectralEstimator::new(SpectralConfig::new(SpectralMethod::welch(256)))
            .estimate(&rec, &RunControl::default())
            .unwrap_err();
        assert_eq!(
            err,
            DspError::InsufficientSamples {
                required: 256,
                available: 100
            }
        );
    }

    #[test]
    fn test_band_power_of_sine() {
        let rec = sine_recording(10.0, 100.0, 1000);
        let result = SpectralEstimator::new(SpectralConfig::new(SpectralMethod::welch(100)))
            .estimate(&rec, &RunControl::default())
            .unwrap();
        let power = result.band_power(5.0, 15.0)[0];
        assert!((power - 0.5).abs() < 0.01, "power {}", power);
        assert!(result.band_power(30.0, 50.0)[0] < 1e-6);
    }

    #[test]
    fn test_default_welch_fits_short_epochs() {
        use crate::epochs::{EpochConfig, EpochExtractor};
        use crate::events::{EventMarker, EventStream};

        let fs = 250.0;
        // 20 Hz sits on a bin of the 175-sample transform
        let rec = sine_recording(20.0, fs, 2500);
        let markers = vec![EventMarker::new(500, 1i64), EventMarker::new(1500, 1i64)];
        let events = EventStream::new(fs, markers).unwrap();
        let epochs = EpochExtractor::new(EpochConfig::default())
            .extract(&rec, &events, &RunControl::default())
            .unwrap();
        assert_eq!(epochs.n_times(), 175);

        let spectra = SpectralEstimator::default()
            .estimate_epochs(&epochs, &RunControl::default())
            .unwrap();
        assert_eq!(spectra.params.n_fft, 175);
        assert_eq!(spectra.params.n_segments, 1);
        assert_eq!(spectra.epochs.len(), 2);
        let peak = spectra.mean().unwrap().peak_frequency(0).unwrap();
        assert!((peak - 20.0).abs() < 1e-9, "peak {}", peak);

        // long signals keep the 256-sample default
        let long = SpectralEstimator::default()
            .estimate(&rec, &RunControl::default())
            .unwrap();
        assert_eq!(long.params().n_fft, 256);
    }

    /// Source whose reads come back with no rows
    struct Hollow(Recording);

    impl SampleSource for Hollow {
        fn sample_rate(&self) -> f64 {
            self.0.sample_rate()
        }

        fn channels(&self) -> &[ChannelInfo] {
            self.0.channels()
        }

        fn n_samples(&self) -> usize {
            self.0.n_samples()
        }

        fn read(&self, _channels: &[usize], _range: Range<usize>) -> Result<Vec<Vec<f64>>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_empty_source_reply_is_an_error() {
        let source = Hollow(sine_recording(10.0, 100.0, 1000));
        let err = SpectralEstimator::new(SpectralConfig::new(SpectralMethod::welch(100)))
            .estimate(&source, &RunControl::default())
            .unwrap_err();
        assert!(matches!(err, DspError::Source(_)));
    }
}
