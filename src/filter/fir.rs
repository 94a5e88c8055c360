//! Windowed-sinc FIR design

use super::spec::{FilterBand, FirWindow};
use crate::window::WindowKind;
use std::f64::consts::PI;

/// Transition bandwidths (Hz) chosen for the low and high edge of a band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionBands {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl TransitionBands {
    pub fn narrowest(&self) -> f64 {
        match (self.low, self.high) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => f64::INFINITY,
        }
    }
}

/// Automatic transition width for a lower edge at `f`
pub fn auto_low_transition(f: f64) -> f64 {
    (0.25 * f).max(2.0).min(f)
}

/// Automatic transition width for an upper edge at `f`
pub fn auto_high_transition(f: f64, nyquist: f64) -> f64 {
    (0.25 * f).max(2.0).min(nyquist - f)
}

/// Which edges of `band` carry a transition band below (low) or above (high)
/// the passband
pub fn transition_bands(band: &FilterBand, explicit: Option<f64>, nyquist: f64) -> TransitionBands {
    match *band {
        FilterBand::Lowpass { cutoff } => TransitionBands {
            low: None,
            high: Some(explicit.unwrap_or_else(|| auto_high_transition(cutoff, nyquist))),
        },
        FilterBand::Highpass { cutoff } => TransitionBands {
            low: Some(explicit.unwrap_or_else(|| auto_low_transition(cutoff))),
            high: None,
        },
        FilterBand::Bandpass { low, high } => TransitionBands {
            low: Some(explicit.unwrap_or_else(|| auto_low_transition(low))),
            high: Some(explicit.unwrap_or_else(|| auto_high_transition(high, nyquist))),
        },
        // cutoffs sit on the stop band edges; transitions may not overlap
        FilterBand::Bandstop { low, high } => {
            let width = (high - low) / 2.0;
            TransitionBands {
                low: Some(explicit.unwrap_or_else(|| auto_high_transition(low, nyquist).min(width))),
                high: Some(explicit.unwrap_or_else(|| auto_low_transition(high).min(width))),
            }
        }
    }
}

/// Kernel length for the narrowest transition band, forced odd
pub fn kernel_length(window: &FirWindow, transition: f64, sample_rate: f64) -> usize {
    let n = match *window {
        FirWindow::Hann => 3.1 * sample_rate / transition,
        FirWindow::Hamming => 3.3 * sample_rate / transition,
        FirWindow::Blackman => 5.0 * sample_rate / transition,
        FirWindow::Kaiser { attenuation_db } => {
            let dw = 2.0 * PI * transition / sample_rate;
            (attenuation_db - 7.95) / (2.285 * dw) + 1.0
        }
    };
    force_odd(n.round().max(1.0) as usize)
}

pub fn force_odd(n: usize) -> usize {
    if n % 2 == 0 {
        n + 1
    } else {
        n
    }
}

/// Kaiser beta for a stopband attenuation in dB
pub fn kaiser_beta(attenuation_db: f64) -> f64 {
    if attenuation_db > 50.0 {
        0.1102 * (attenuation_db - 8.7)
    } else if attenuation_db >= 21.0 {
        let a = attenuation_db - 21.0;
        0.5842 * a.powf(0.4) + 0.07886 * a
    } else {
        0.0
    }
}

fn window_kind(window: &FirWindow) -> WindowKind {
    match *window {
        FirWindow::Hann => WindowKind::Hann,
        FirWindow::Hamming => WindowKind::Hamming,
        FirWindow::Blackman => WindowKind::Blackman,
        FirWindow::Kaiser { attenuation_db } => WindowKind::Kaiser {
            beta: kaiser_beta(attenuation_db),
        },
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Windowed ideal lowpass with unit DC gain; `cutoff` in Hz
pub fn lowpass_kernel(cutoff: f64, len: usize, sample_rate: f64, window: &[f64]) -> Vec<f64> {
    let fc = cutoff / sample_rate;
    let centre = (len as f64 - 1.0) / 2.0;
    let mut h: Vec<f64> = (0..len)
        .map(|i| 2.0 * fc * sinc(2.0 * fc * (i as f64 - centre)) * window[i])
        .collect();
    let sum: f64 = h.iter().sum();
    if sum.abs() > f64::EPSILON {
        for v in h.iter_mut() {
            *v /= sum;
        }
    }
    h
}

/// Magnitude of the kernel's response at `freq` Hz
pub fn magnitude(kernel: &[f64], freq: f64, sample_rate: f64) -> f64 {
    let w = 2.0 * PI * freq / sample_rate;
    let (re, im) = kernel
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(re, im), (n, &h)| {
            (re + h * (w * n as f64).cos(), im - h * (w * n as f64).sin())
        });
    (re * re + im * im).sqrt()
}

/// Build the kernel for `band`. Pass band edges are shifted outward by half
/// a transition band; band-stop cutoffs sit on the stop band edges.
pub fn design_kernel(
    band: &FilterBand,
    transitions: &TransitionBands,
    len: usize,
    window: &FirWindow,
    sample_rate: f64,
) -> Vec<f64> {
    let win = window_kind(window).coefficients(len);
    let nyquist = sample_rate / 2.0;
    let half = |tb: Option<f64>| tb.unwrap_or(0.0) / 2.0;

    let mut h = match *band {
        FilterBand::Lowpass { cutoff } => {
            lowpass_kernel(cutoff + half(transitions.high), len, sample_rate, &win)
        }
        FilterBand::Highpass { cutoff } => {
            let lp = lowpass_kernel(cutoff - half(transitions.low), len, sample_rate, &win);
            spectral_inversion(lp)
        }
        FilterBand::Bandpass { low, high } => {
            let upper = lowpass_kernel(high + half(transitions.high), len, sample_rate, &win);
            let lower = lowpass_kernel(low - half(transitions.low), len, sample_rate, &win);
            upper.iter().zip(&lower).map(|(a, b)| a - b).collect()
        }
        FilterBand::Bandstop { low, high } => {
            let upper = lowpass_kernel(high, len, sample_rate, &win);
            let lower = lowpass_kernel(low, len, sample_rate, &win);
            let pass: Vec<f64> = upper.iter().zip(&lower).map(|(a, b)| a - b).collect();
            spectral_inversion(pass)
        }
    };

    // unit gain in the passband
    let reference = match *band {
        FilterBand::Lowpass { .. } | FilterBand::Bandstop { .. } => 0.0,
        FilterBand::Highpass { .. } => nyquist,
        FilterBand::Bandpass { low, high } => (low + high) / 2.0,
    };
    let gain = magnitude(&h, reference, sample_rate);
    if gain > f64::EPSILON {
        for v in h.iter_mut() {
            *v /= gain;
        }
    }
    h
}

/// `delta - h` for an odd-length symmetric kernel
fn spectral_inversion(mut h: Vec<f64>) -> Vec<f64> {
    let centre = h.len() / 2;
    for v in h.iter_mut() {
        *v = -*v;
    }
    h[centre] += 1.0;
    h
}
