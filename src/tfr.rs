//! Time-frequency decomposition
//!
//! Morlet mode convolves each channel with a complex Gaussian-windowed
//! sinusoid per frequency. Hilbert mode band-passes each channel around
//! each frequency with a zero-phase FIR and takes the analytic signal.
//! Neither mode filters beyond the requested bands.

use crate::control::{Completion, RunControl};
use crate::epochs::EpochSet;
use crate::error::{DspError, Result};
use crate::fft;
use crate::filter::{DesignedFilter, FilterDesigner, FilterSpec};
use crate::profile_scope;
use crate::source::{read_channel, SampleSource};
use crate::streaming::StreamingFilterEngine;
use crate::types::ChannelInfo;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Wavelet support in standard deviations on each side
const MORLET_SUPPORT_SIGMAS: f64 = 5.0;

fn default_n_cycles() -> f64 {
    7.0
}

fn default_bandwidth() -> f64 {
    4.0
}

fn default_decim() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TfrMethod {
    Morlet {
        /// Oscillations under the Gaussian envelope
        #[serde(default = "default_n_cycles")]
        n_cycles: f64,
    },
    Hilbert {
        /// Pass-band width around each frequency (Hz)
        #[serde(default = "default_bandwidth")]
        bandwidth: f64,
    },
}

impl Default for TfrMethod {
    fn default() -> Self {
        TfrMethod::Morlet {
            n_cycles: default_n_cycles(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TfrConfig {
    #[serde(flatten)]
    pub method: TfrMethod,
    /// Centre frequencies (Hz)
    pub frequencies: Vec<f64>,
    /// Keep every `decim`-th time sample of the output
    #[serde(default = "default_decim")]
    pub decim: usize,
}

impl TfrConfig {
    pub fn morlet(frequencies: Vec<f64>, n_cycles: f64) -> Self {
        Self {
            method: TfrMethod::Morlet { n_cycles },
            frequencies,
            decim: 1,
        }
    }

    pub fn hilbert(frequencies: Vec<f64>, bandwidth: f64) -> Self {
        Self {
            method: TfrMethod::Hilbert { bandwidth },
            frequencies,
            decim: 1,
        }
    }

    pub fn with_decim(mut self, decim: usize) -> Self {
        self.decim = decim;
        self
    }

    pub fn cache_key(&self) -> Result<String> {
        crate::config::cache_key(self)
    }
}

/// Complex Morlet wavelet at `freq`, scaled so that a unit-amplitude
/// sinusoid at `freq` convolves to magnitude 1
pub fn morlet_wavelet(freq: f64, n_cycles: f64, sample_rate: f64) -> Vec<Complex<f64>> {
    let sigma_t = n_cycles / (2.0 * PI * freq);
    let half = (MORLET_SUPPORT_SIGMAS * sigma_t * sample_rate).ceil().max(1.0) as isize;
    let mut wavelet: Vec<Complex<f64>> = (-(half - 1)..half)
        .map(|i| {
            let t = i as f64 / sample_rate;
            let envelope = (-t * t / (2.0 * sigma_t * sigma_t)).exp();
            Complex::from_polar(envelope, 2.0 * PI * freq * t)
        })
        .collect();
    let envelope_sum: f64 = wavelet.iter().map(|c| c.norm()).sum();
    let scale = 2.0 / envelope_sum;
    for c in wavelet.iter_mut() {
        *c *= scale;
    }
    wavelet
}

enum Kernels {
    Morlet(Vec<Vec<Complex<f64>>>),
    Hilbert(Vec<DesignedFilter>),
}

/// Magnitude and phase, `[frequency][time]`, for one signal
struct Decomposition {
    magnitude: Vec<Vec<f64>>,
    phase: Vec<Vec<f64>>,
}

/// Per-channel, per-frequency, per-time decomposition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeFrequencyResult {
    pub channels: Vec<ChannelInfo>,
    /// Rate of the time axis after decimation
    pub sample_rate: f64,
    pub freqs: Vec<f64>,
    /// Seconds, relative to the first input sample (or to the event for
    /// epochs)
    pub times: Vec<f64>,
    /// `[channel][frequency][time]`
    pub magnitude: Vec<Vec<Vec<f64>>>,
    /// `[channel][frequency][time]`, radians
    pub phase: Vec<Vec<Vec<f64>>>,
    pub method: TfrMethod,
    pub decim: usize,
    pub completion: Completion,
}

impl TimeFrequencyResult {
    /// Squared magnitude
    pub fn power(&self) -> Vec<Vec<Vec<f64>>> {
        square(&self.magnitude)
    }

    pub fn channel_magnitude(&self, label: &str) -> Result<&[Vec<f64>]> {
        self.channels
            .iter()
            .position(|c| c.label == label)
            .map(|i| self.magnitude[i].as_slice())
            .ok_or_else(|| DspError::ChannelNotFound(label.to_string()))
    }
}

fn square(values: &[Vec<Vec<f64>>]) -> Vec<Vec<Vec<f64>>> {
    values
        .iter()
        .map(|ch| {
            ch.iter()
                .map(|row| row.iter().map(|m| m * m).collect())
                .collect()
        })
        .collect()
}

/// Decomposition of one retained epoch, `[channel][frequency][time]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochTfr {
    pub event_index: usize,
    pub condition: String,
    pub magnitude: Vec<Vec<Vec<f64>>>,
    pub phase: Vec<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochsTfr {
    pub channels: Vec<ChannelInfo>,
    pub sample_rate: f64,
    pub freqs: Vec<f64>,
    pub times: Vec<f64>,
    pub method: TfrMethod,
    pub decim: usize,
    /// Completed epochs only, in epoch order
    pub epochs: Vec<EpochTfr>,
    pub completion: Completion,
}

impl EpochsTfr {
    /// Mean power over the completed epochs
    pub fn average_power(&self) -> Result<Vec<Vec<Vec<f64>>>> {
        let mut acc = self.zeros()?;
        for epoch in &self.epochs {
            accumulate(&mut acc, &square(&epoch.magnitude));
        }
        Ok(scale(acc, 1.0 / self.epochs.len() as f64))
    }

    /// Phase locking across epochs: `|mean(exp(i phase))|`, in `[0, 1]`
    pub fn inter_trial_coherence(&self) -> Result<Vec<Vec<Vec<f64>>>> {
        let mut re = self.zeros()?;
        let mut im = self.zeros()?;
        for epoch in &self.epochs {
            accumulate(&mut re, &map3(&epoch.phase, f64::cos));
            accumulate(&mut im, &map3(&epoch.phase, f64::sin));
        }
        let n = self.epochs.len() as f64;
        Ok(re
            .iter()
            .zip(&im)
            .map(|(rc, ic)| {
                rc.iter()
                    .zip(ic)
                    .map(|(rr, ir)| {
                        rr.iter()
                            .zip(ir)
                            .map(|(r, i)| (r * r + i * i).sqrt() / n)
                            .collect()
                    })
                    .collect()
            })
            .collect())
    }

    fn zeros(&self) -> Result<Vec<Vec<Vec<f64>>>> {
        let first = self.epochs.first().ok_or_else(|| {
            DspError::parameter("epochs", "no completed epoch decompositions")
        })?;
        Ok(first
            .magnitude
            .iter()
            .map(|ch| ch.iter().map(|row| vec![0.0; row.len()]).collect())
            .collect())
    }
}

fn map3(values: &[Vec<Vec<f64>>], f: fn(f64) -> f64) -> Vec<Vec<Vec<f64>>> {
    values
        .iter()
        .map(|ch| ch.iter().map(|row| row.iter().map(|&v| f(v)).collect()).collect())
        .collect()
}

fn accumulate(acc: &mut [Vec<Vec<f64>>], values: &[Vec<Vec<f64>>]) {
    for (a_ch, v_ch) in acc.iter_mut().zip(values) {
        for (a_row, v_row) in a_ch.iter_mut().zip(v_ch) {
            for (a, v) in a_row.iter_mut().zip(v_row) {
                *a += v;
            }
        }
    }
}

fn scale(mut values: Vec<Vec<Vec<f64>>>, factor: f64) -> Vec<Vec<Vec<f64>>> {
    for ch in values.iter_mut() {
        for row in ch.iter_mut() {
            for v in row.iter_mut() {
                *v *= factor;
            }
        }
    }
    values
}

/// Morlet / Hilbert time-frequency transformer
#[derive(Debug, Clone)]
pub struct TimeFrequencyTransformer {
    config: TfrConfig,
    engine: StreamingFilterEngine,
}

impl TimeFrequencyTransformer {
    pub fn new(config: TfrConfig) -> Self {
        Self {
            config,
            engine: StreamingFilterEngine::default(),
        }
    }

    /// Engine used for Hilbert-mode band-pass filtering
    pub fn with_engine(mut self, engine: StreamingFilterEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn config(&self) -> &TfrConfig {
        &self.config
    }

    pub fn transform<S: SampleSource + ?Sized>(
        &self,
        source: &S,
        control: &RunControl,
    ) -> Result<TimeFrequencyResult> {
        let n = source.n_samples();
        let sample_rate = source.sample_rate();
        let kernels = self.prepare(n, sample_rate)?;

        profile_scope!("tfr");
        log::info!(
            "Time-frequency transform of {} channels x {} samples at {} frequencies",
            source.channels().len(),
            n,
            self.config.frequencies.len()
        );

        let (slots, completion) = control.fan_out(source.channels().len(), |ch, _| {
            Some(read_channel(source, ch, 0..n).and_then(|row| self.decompose(&kernels, &row)))
        });

        let mut channels = Vec::new();
        let mut magnitude = Vec::new();
        let mut phase = Vec::new();
        for (info, slot) in source.channels().iter().zip(slots) {
            if let Some(result) = slot {
                let d = result?;
                channels.push(info.clone());
                magnitude.push(d.magnitude);
                phase.push(d.phase);
            }
        }

        Ok(TimeFrequencyResult {
            channels,
            sample_rate: sample_rate / self.config.decim as f64,
            freqs: self.config.frequencies.clone(),
            times: self.times(n, sample_rate, 0.0),
            magnitude,
            phase,
            method: self.config.method,
            decim: self.config.decim,
            completion,
        })
    }

    /// Decompose every retained epoch, cancellable between epochs
    pub fn transform_epochs(&self, epochs: &EpochSet, control: &RunControl) -> Result<EpochsTfr> {
        let n = epochs.n_times();
        let kernels = self.prepare(n, epochs.sample_rate())?;
        let retained: Vec<_> = epochs.retained().collect();

        profile_scope!("epoch tfr");
        log::info!(
            "Time-frequency transform of {} epochs at {} frequencies",
            retained.len(),
            self.config.frequencies.len()
        );

        let (slots, completion) = control.fan_out(retained.len(), |i, cancel| {
            let epoch = retained[i];
            let mut magnitude = Vec::with_capacity(epoch.data.len());
            let mut phase = Vec::with_capacity(epoch.data.len());
            for row in &epoch.data {
                if cancel.is_cancelled() {
                    return None;
                }
                match self.decompose(&kernels, row) {
                    Ok(d) => {
                        magnitude.push(d.magnitude);
                        phase.push(d.phase);
                    }
                    Err(err) => return Some(Err(err)),
                }
            }
            Some(Ok(EpochTfr {
                event_index: epoch.event_index,
                condition: epoch.condition.clone(),
                magnitude,
                phase,
            }))
        });

        let epochs_out = slots.into_iter().flatten().collect::<Result<Vec<_>>>()?;
        Ok(EpochsTfr {
            channels: epochs.channels().to_vec(),
            sample_rate: epochs.sample_rate() / self.config.decim as f64,
            freqs: self.config.frequencies.clone(),
            times: self.times(n, epochs.sample_rate(), epochs.tmin()),
            method: self.config.method,
            decim: self.config.decim,
            epochs: epochs_out,
            completion,
        })
    }

    fn times(&self, n: usize, sample_rate: f64, t0: f64) -> Vec<f64> {
        (0..n)
            .step_by(self.config.decim)
            .map(|i| t0 + i as f64 / sample_rate)
            .collect()
    }

    fn prepare(&self, n: usize, sample_rate: f64) -> Result<Kernels> {
        let TfrConfig {
            method,
            frequencies,
            decim,
        } = &self.config;
        if frequencies.is_empty() {
            return Err(DspError::parameter("frequencies", "must not be empty"));
        }
        if *decim == 0 {
            return Err(DspError::parameter("decim", "must be at least 1"));
        }
        let nyquist = sample_rate / 2.0;
        if let Some(&bad) = frequencies
            .iter()
            .find(|&&f| !(f.is_finite() && f > 0.0 && f < nyquist))
        {
            return Err(DspError::parameter(
                "frequencies",
                format!("{} Hz is not within (0, {}) Hz", bad, nyquist),
            ));
        }

        match *method {
            TfrMethod::Morlet { n_cycles } => {
                if !(n_cycles.is_finite() && n_cycles > 0.0) {
                    return Err(DspError::parameter(
                        "n_cycles",
                        format!("must be positive, got {}", n_cycles),
                    ));
                }
                let wavelets: Vec<_> = frequencies
                    .iter()
                    .map(|&f| morlet_wavelet(f, n_cycles, sample_rate))
                    .collect();
                let longest = wavelets.iter().map(Vec::len).max().unwrap_or(0);
                if longest > n {
                    return Err(DspError::InsufficientSamples {
                        required: longest,
                        available: n,
                    });
                }
                Ok(Kernels::Morlet(wavelets))
            }
            TfrMethod::Hilbert { bandwidth } => {
                if !(bandwidth.is_finite() && bandwidth > 0.0) {
                    return Err(DspError::parameter(
                        "bandwidth",
                        format!("must be positive, got {}", bandwidth),
                    ));
                }
                let designer = FilterDesigner::new(sample_rate);
                let filters = frequencies
                    .iter()
                    .map(|&f| {
                        designer.design(&FilterSpec::bandpass(
                            f - bandwidth / 2.0,
                            f + bandwidth / 2.0,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Kernels::Hilbert(filters))
            }
        }
    }

    fn decompose(&self, kernels: &Kernels, signal: &[f64]) -> Result<Decomposition> {
        let analytic: Vec<Vec<Complex<f64>>> = match kernels {
            Kernels::Morlet(wavelets) => wavelets
                .iter()
                .map(|w| fft::convolve_complex_same(signal, w))
                .collect(),
            Kernels::Hilbert(filters) => filters
                .iter()
                .map(|filter| {
                    self.engine
                        .filter_signal(signal, filter)
                        .map(|band| fft::analytic_signal(&band))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let decim = self.config.decim;
        let mut magnitude = Vec::with_capacity(analytic.len());
        let mut phase = Vec::with_capacity(analytic.len());
        for row in analytic {
            let kept: Vec<Complex<f64>> = row.into_iter().step_by(decim).collect();
            magnitude.push(kept.iter().map(|c| c.norm()).collect());
            phase.push(kept.iter().map(|c| c.arg()).collect());
        }
        Ok(Decomposition { magnitude, phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Recording;

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn test_morlet_wavelet_is_symmetric_and_odd_length() {
        let w = morlet_wavelet(10.0, 7.0, 1000.0);
        assert_eq!(w.len() % 2, 1);
        let mid = w.len() / 2;
        assert!((w[mid].im).abs() < 1e-12);
        assert!((w[mid - 5].re - w[mid + 5].re).abs() < 1e-12);
    }

    #[test]
    fn test_morlet_magnitude_tracks_amplitude() {
        let fs = 500.0;
        let rec = Recording::from_labels(&["C3"], vec![sine(20.0, fs, 2000)], fs).unwrap();
        let result = TimeFrequencyTransformer::new(TfrConfig::morlet(vec![10.0, 20.0], 7.0))
            .transform(&rec, &RunControl::default())
            .unwrap();
        let at_20 = result.magnitude[0][1][1000];
        let at_10 = result.magnitude[0][0][1000];
        assert!(at_20 > 0.9 && at_20 < 1.1, "magnitude {}", at_20);
        assert!(at_10 < 0.05 * at_20);
    }

    #[test]
    fn test_hilbert_envelope_and_decimation() {
        let fs = 1000.0;
        let rec = Recording::from_labels(&["C4"], vec![sine(40.0, fs, 4000)], fs).unwrap();
        let result = TimeFrequencyTransformer::new(TfrConfig::hilbert(vec![40.0], 10.0).with_decim(4))
            .transform(&rec, &RunControl::default())
            .unwrap();
        assert_eq!(result.times.len(), 1000);
        assert_eq!(result.sample_rate, 250.0);
        let mid = result.magnitude[0][0][500];
        assert!((mid - 1.0).abs() < 0.05, "envelope {}", mid);
    }

    #[test]
    fn test_wavelet_longer_than_signal() {
        let rec = Recording::from_labels(&["C3"], vec![sine(2.0, 100.0, 50)], 100.0).unwrap();
        let err = TimeFrequencyTransformer::new(TfrConfig::morlet(vec![2.0], 7.0))
            .transform(&rec, &RunControl::default())
            .unwrap_err();
        assert!(matches!(err, DspError::InsufficientSamples { available: 50, .. }));
    }
}
