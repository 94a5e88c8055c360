//! Polyphase rational resampling
//!
//! The rate ratio is reduced to `up / down`. A Kaiser-windowed sinc
//! anti-aliasing kernel is designed at the up-sampled rate with its cutoff
//! at the lower of the two Nyquist frequencies, and each output sample is
//! evaluated from a single phase of that kernel, so the zero-stuffed
//! intermediate signal is never built.
//!
//! Stim channels skip the kernel: each output sample takes the first
//! non-zero trigger value in the input span it covers, so onsets land at
//! their rescaled index and pulses shorter than the decimation factor
//! survive.

use crate::control::RunControl;
use crate::error::{DspError, Result};
use crate::profile_scope;
use crate::streaming::{padded_sample, EdgePadding, Processed};
use crate::types::{ChannelKind, Recording};
use crate::window::WindowKind;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Kaiser beta of the anti-aliasing window
const KAISER_BETA: f64 = 5.0;
/// Kernel half-length in taps per unit of `max(up, down)`
const HALF_LENGTH_FACTOR: usize = 10;
const MAX_DENOMINATOR: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResampleConfig {
    /// Output sampling rate in Hz
    pub target_rate: f64,
    /// Signal extension used by the kernel near either end
    #[serde(default)]
    pub padding: EdgePadding,
}

impl ResampleConfig {
    pub fn new(target_rate: f64) -> Self {
        Self {
            target_rate,
            padding: EdgePadding::default(),
        }
    }

    pub fn cache_key(&self) -> Result<String> {
        crate::config::cache_key(self)
    }
}

/// Reduce `target / source` to the smallest integer pair `(up, down)`
pub fn rational_ratio(source_rate: f64, target_rate: f64) -> Result<(usize, usize)> {
    if !(target_rate.is_finite() && target_rate > 0.0) {
        return Err(DspError::filter_spec(
            "target_rate",
            format!("must be positive, got {}", target_rate),
        ));
    }
    if !(source_rate.is_finite() && source_rate > 0.0) {
        return Err(DspError::filter_spec(
            "source_rate",
            format!("must be positive, got {}", source_rate),
        ));
    }

    let ratio = target_rate / source_rate;
    for down in 1..=MAX_DENOMINATOR {
        let scaled = ratio * down as f64;
        let up = scaled.round();
        if up >= 1.0 && (scaled - up).abs() <= 1e-9 * scaled.max(1.0) {
            return Ok((up as usize, down));
        }
    }
    Err(DspError::filter_spec(
        "target_rate",
        format!(
            "{} Hz / {} Hz is not a rational ratio with denominator <= {}",
            target_rate, source_rate, MAX_DENOMINATOR
        ),
    ))
}

/// Polyphase resampler for a fixed `up / down` pair
#[derive(Debug, Clone)]
pub struct Resampler {
    source_rate: f64,
    target_rate: f64,
    up: usize,
    down: usize,
    kernel: Vec<f64>,
    padding: EdgePadding,
}

impl Resampler {
    pub fn new(source_rate: f64, config: &ResampleConfig) -> Result<Self> {
        let (up, down) = rational_ratio(source_rate, config.target_rate)?;
        let kernel = anti_alias_kernel(up, down);
        log::debug!(
            "Resampler {} Hz -> {} Hz (up {}, down {}, {} taps)",
            source_rate,
            config.target_rate,
            up,
            down,
            kernel.len()
        );
        Ok(Self {
            source_rate,
            target_rate: config.target_rate,
            up,
            down,
            kernel,
            padding: config.padding,
        })
    }

    pub fn ratio(&self) -> (usize, usize) {
        (self.up, self.down)
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    pub fn kernel_len(&self) -> usize {
        self.kernel.len()
    }

    /// `floor(n * up / down)`
    pub fn output_len(&self, n: usize) -> usize {
        n * self.up / self.down
    }

    /// Resample one channel
    pub fn process(&self, signal: &[f64]) -> Vec<f64> {
        let n_out = self.output_len(signal.len());
        if self.up == 1 && self.down == 1 {
            return signal.to_vec();
        }

        let up = self.up as isize;
        let delay = (self.kernel.len() / 2) as isize;
        (0..n_out)
            .map(|j| {
                // position in the up-sampled stream aligned with output j
                let m = j as isize * self.down as isize + delay;
                let phase = m.rem_euclid(up);
                let base = m.div_euclid(up);
                self.kernel
                    .iter()
                    .skip(phase as usize)
                    .step_by(self.up)
                    .enumerate()
                    .map(|(t, &h)| h * padded_sample(signal, base - t as isize, self.padding))
                    .sum()
            })
            .collect()
    }

    /// Resample one trigger channel without interpolating between codes
    pub fn process_stim(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        let n_out = self.output_len(n);
        (0..n_out)
            .map(|j| {
                let start = (j * self.down / self.up).min(n.saturating_sub(1));
                let end = ((j + 1) * self.down / self.up).clamp(start + 1, n);
                signal[start..end]
                    .iter()
                    .copied()
                    .find(|v| *v != 0.0)
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// Resample every channel of `recording`; stim channels go through
    /// [`Resampler::process_stim`]
    pub fn apply(&self, recording: &Recording, control: &RunControl) -> Result<Processed> {
        if (recording.sample_rate() - self.source_rate).abs() > 1e-9 * self.source_rate {
            return Err(DspError::SamplingRateMismatch {
                expected: self.source_rate,
                actual: recording.sample_rate(),
                context: "resampler source rate".to_string(),
            });
        }
        if recording.n_samples() == 0 {
            return Err(DspError::InsufficientSamples {
                required: 1,
                available: 0,
            });
        }

        profile_scope!("resample");
        log::info!(
            "Resampling {} channels x {} samples: {} Hz -> {} Hz",
            recording.n_channels(),
            recording.n_samples(),
            self.source_rate,
            self.target_rate
        );

        let (slots, completion) = control.fan_out(recording.n_channels(), |ch, _| {
            let signal = recording.channel_data(ch);
            Some(match recording.channels()[ch].kind {
                ChannelKind::Stim => self.process_stim(signal),
                _ => self.process(signal),
            })
        });

        let mut channels = Vec::new();
        let mut data = Vec::new();
        for (info, row) in recording.channels().iter().zip(slots) {
            if let Some(row) = row {
                channels.push(info.clone());
                data.push(row);
            }
        }

        let mut step = format!("resample {} Hz -> {} Hz", self.source_rate, self.target_rate);
        if !completion.is_complete() {
            step.push_str(" (cancelled)");
        }
        let recording = recording.derive(step, channels, data, self.target_rate)?;
        Ok(Processed {
            recording,
            completion,
        })
    }
}

/// Kaiser-windowed sinc at the up-sampled rate, DC gain `up`
fn anti_alias_kernel(up: usize, down: usize) -> Vec<f64> {
    let max_rate = up.max(down);
    let len = 2 * HALF_LENGTH_FACTOR * max_rate + 1;
    // cutoff as a fraction of the up-sampled rate
    let fc = 0.5 / max_rate as f64;
    let centre = (len - 1) as f64 / 2.0;
    let window = WindowKind::Kaiser { beta: KAISER_BETA }.coefficients(len);

    let mut h: Vec<f64> = (0..len)
        .map(|i| {
            let x = 2.0 * fc * (i as f64 - centre);
            let sinc = if x.abs() < 1e-12 {
                1.0
            } else {
                (PI * x).sin() / (PI * x)
            };
            2.0 * fc * sinc * window[i]
        })
        .collect();

    let sum: f64 = h.iter().sum();
    let scale = up as f64 / sum;
    for v in h.iter_mut() {
        *v *= scale;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{find_events, FindEventsConfig};
    use crate::types::ChannelInfo;

    #[test]
    fn test_rational_ratio() {
        assert_eq!(rational_ratio(1000.0, 250.0).unwrap(), (1, 4));
        assert_eq!(rational_ratio(250.0, 1000.0).unwrap(), (4, 1));
        assert_eq!(rational_ratio(44100.0, 48000.0).unwrap(), (160, 147));
        assert_eq!(rational_ratio(600.0, 600.0).unwrap(), (1, 1));
    }

    #[test]
    fn test_non_positive_target_is_invalid_spec() {
        for target in [0.0, -10.0] {
            match rational_ratio(1000.0, target) {
                Err(DspError::InvalidFilterSpec { parameter, .. }) => {
                    assert_eq!(parameter, "target_rate")
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_output_length_and_dc() {
        let resampler = Resampler::new(1000.0, &ResampleConfig::new(250.0)).unwrap();
        let out = resampler.process(&vec![1.5; 4000]);
        assert_eq!(out.len(), 1000);
        for v in &out {
            assert!((v - 1.5).abs() < 1e-3);
        }

        let odd = Resampler::new(1000.0, &ResampleConfig::new(300.0)).unwrap();
        assert_eq!(odd.ratio(), (3, 10));
        assert_eq!(odd.process(&vec![0.0; 1001]).len(), 300);
    }

    #[test]
    fn test_stim_codes_survive_resampling() {
        let mut sti = vec![0.0; 4000];
        sti[1000..1010].iter_mut().for_each(|v| *v = 5.0);
        sti[2001] = 3.0;
        let rec = Recording::new(
            vec![ChannelInfo::eeg("Cz"), ChannelInfo::stim("STI")],
            vec![vec![0.0; 4000], sti],
            1000.0,
        )
        .unwrap();

        let out = Resampler::new(1000.0, &ResampleConfig::new(250.0))
            .unwrap()
            .apply(&rec, &RunControl::default())
            .unwrap();
        let stim = out.recording.channel_data(1);
        assert_eq!(stim.len(), 1000);
        assert_eq!(&stim[249..254], &[0.0, 5.0, 5.0, 5.0, 0.0]);
        // single-sample trigger shorter than the decimation factor
        assert_eq!(stim[500], 3.0);
        assert!(stim.iter().all(|v| [0.0, 3.0, 5.0].contains(v)));

        let events = find_events(
            &out.recording,
            "STI",
            &FindEventsConfig {
                shortest_event: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let found: Vec<usize> = events.markers().iter().map(|m| m.sample).collect();
        assert_eq!(found, vec![250, 500]);
    }

    #[test]
    fn test_stim_upsampling_holds_codes() {
        let resampler = Resampler::new(250.0, &ResampleConfig::new(1000.0)).unwrap();
        let out = resampler.process_stim(&[0.0, 2.0, 2.0, 0.0]);
        let mut expected = vec![0.0; 16];
        expected[4..12].iter_mut().for_each(|v| *v = 2.0);
        assert_eq!(out, expected);
    }
}
