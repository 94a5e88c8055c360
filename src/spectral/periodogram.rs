//! One-sided periodogram estimators
//!
//! Both estimators return a density in `unit^2 / Hz` over the bins
//! `0..=n_fft/2`. Interior bins are doubled to fold in the negative
//! frequencies; DC and (for even `n_fft`) Nyquist are not.

use super::Detrend;
use crate::fft;

pub(crate) fn n_bins(n_fft: usize) -> usize {
    n_fft / 2 + 1
}

pub(crate) fn detrend(segment: &mut [f64], mode: Detrend) {
    let n = segment.len();
    if n == 0 {
        return;
    }
    match mode {
        Detrend::None => {}
        Detrend::Constant => {
            let mean = segment.iter().sum::<f64>() / n as f64;
            for v in segment.iter_mut() {
                *v -= mean;
            }
        }
        Detrend::Linear => {
            let t_mean = (n as f64 - 1.0) / 2.0;
            let y_mean = segment.iter().sum::<f64>() / n as f64;
            let (mut sxy, mut sxx) = (0.0, 0.0);
            for (i, &y) in segment.iter().enumerate() {
                let dt = i as f64 - t_mean;
                sxy += dt * (y - y_mean);
                sxx += dt * dt;
            }
            let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
            for (i, v) in segment.iter_mut().enumerate() {
                *v -= y_mean + slope * (i as f64 - t_mean);
            }
        }
    }
}

/// `|FFT(taper * x)|^2`, one-sided, without scaling
fn tapered_power(signal: &[f64], taper: &[f64]) -> Vec<f64> {
    let tapered: Vec<f64> = signal.iter().zip(taper).map(|(x, w)| x * w).collect();
    let n_fft = signal.len();
    fft::real_fft(&tapered, n_fft)
        .iter()
        .take(n_bins(n_fft))
        .map(|c| c.norm_sqr())
        .collect()
}

fn fold_one_sided(psd: &mut [f64], n_fft: usize) {
    let last = psd.len() - 1;
    for (k, v) in psd.iter_mut().enumerate() {
        let is_nyquist = n_fft % 2 == 0 && k == last;
        if k != 0 && !is_nyquist {
            *v *= 2.0;
        }
    }
}

/// Averaged modified periodograms of overlapping segments
///
/// Returns the density and the number of segments averaged.
pub(crate) fn welch(
    signal: &[f64],
    window: &[f64],
    step: usize,
    detrend_mode: Detrend,
    sample_rate: f64,
) -> (Vec<f64>, usize) {
    let seg_len = window.len();
    let mut acc = vec![0.0; n_bins(seg_len)];
    let mut n_segments = 0;
    let mut start = 0;
    while start + seg_len <= signal.len() {
        let mut segment = signal[start..start + seg_len].to_vec();
        detrend(&mut segment, detrend_mode);
        for (a, p) in acc.iter_mut().zip(tapered_power(&segment, window)) {
            *a += p;
        }
        n_segments += 1;
        start += step;
    }

    let window_energy: f64 = window.iter().map(|w| w * w).sum();
    let scale = 1.0 / (sample_rate * window_energy * n_segments.max(1) as f64);
    for v in acc.iter_mut() {
        *v *= scale;
    }
    fold_one_sided(&mut acc, seg_len);
    (acc, n_segments)
}

/// Eigenvalue-weighted average of unit-energy taper periodograms
pub(crate) fn multitaper(
    signal: &[f64],
    tapers: &[Vec<f64>],
    weights: &[f64],
    detrend_mode: Detrend,
    sample_rate: f64,
) -> Vec<f64> {
    let mut segment = signal.to_vec();
    detrend(&mut segment, detrend_mode);

    let mut acc = vec![0.0; n_bins(segment.len())];
    for (taper, &weight) in tapers.iter().zip(weights) {
        for (a, p) in acc.iter_mut().zip(tapered_power(&segment, taper)) {
            *a += weight * p;
        }
    }
    let total: f64 = weights.iter().sum();
    let scale = 1.0 / (sample_rate * total);
    for v in acc.iter_mut() {
        *v *= scale;
    }
    fold_one_sided(&mut acc, segment.len());
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowKind;
    use std::f64::consts::PI;

    #[test]
    fn test_linear_detrend_removes_ramp() {
        let mut x: Vec<f64> = (0..50).map(|i| 3.0 + 0.5 * i as f64).collect();
        detrend(&mut x, Detrend::Linear);
        assert!(x.iter().all(|v| v.abs() < 1e-10));
    }

    #[test]
    fn test_welch_power_matches_variance() {
        // Sum of density times bin width equals the signal variance
        let fs = 200.0;
        let n = 4000;
        let signal: Vec<f64> = (0..n)
            .map(|i| (2.0 * PI * 25.0 * i as f64 / fs).sin())
            .collect();
        let window = WindowKind::Hann.periodic(200);
        let (psd, n_segments) = welch(&signal, &window, 100, Detrend::Constant, fs);
        assert_eq!(n_segments, 39);
        let power: f64 = psd.iter().sum::<f64>() * fs / 200.0;
        assert!((power - 0.5).abs() < 0.01, "power {}", power);
    }
}
