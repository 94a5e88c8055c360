//! FFT helpers shared by the filter engine and the spectral estimators

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::cell::RefCell;
use std::sync::Arc;

// Thread-local FFT planner so rayon workers reuse plans without locking
thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

pub(crate) fn forward_plan(len: usize) -> Arc<dyn Fft<f64>> {
    FFT_PLANNER.with(|planner| planner.borrow_mut().plan_fft_forward(len))
}

pub(crate) fn inverse_plan(len: usize) -> Arc<dyn Fft<f64>> {
    FFT_PLANNER.with(|planner| planner.borrow_mut().plan_fft_inverse(len))
}

/// Forward FFT of a real signal zero-padded to `n_fft`
pub(crate) fn real_fft(signal: &[f64], n_fft: usize) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = signal
        .iter()
        .take(n_fft)
        .map(|&x| Complex::new(x, 0.0))
        .collect();
    buffer.resize(n_fft, Complex::new(0.0, 0.0));
    forward_plan(n_fft).process(&mut buffer);
    buffer
}

/// Inverse FFT, normalized by the transform length
pub(crate) fn inverse_fft(spectrum: &mut [Complex<f64>]) {
    let n = spectrum.len();
    inverse_plan(n).process(spectrum);
    let scale = 1.0 / n as f64;
    for v in spectrum.iter_mut() {
        *v *= scale;
    }
}

/// Full linear convolution of two real sequences
pub fn convolve(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    if signal.is_empty() || kernel.is_empty() {
        return Vec::new();
    }
    let out_len = signal.len() + kernel.len() - 1;
    let n_fft = out_len.next_power_of_two();
    let kernel_spectrum = real_fft(kernel, n_fft);
    convolve_with_spectrum(signal, &kernel_spectrum, out_len)
}

/// Convolution against a precomputed kernel spectrum of length `n_fft`
pub(crate) fn convolve_with_spectrum(
    signal: &[f64],
    kernel_spectrum: &[Complex<f64>],
    out_len: usize,
) -> Vec<f64> {
    let n_fft = kernel_spectrum.len();
    let mut buffer = real_fft(signal, n_fft);
    for (x, h) in buffer.iter_mut().zip(kernel_spectrum) {
        *x *= h;
    }
    inverse_fft(&mut buffer);
    buffer.iter().take(out_len).map(|c| c.re).collect()
}

/// Complex-kernel convolution, cropped to the signal length and centred
/// on the kernel midpoint ("same" mode)
pub(crate) fn convolve_complex_same(signal: &[f64], kernel: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let n = signal.len();
    let k = kernel.len();
    if n == 0 || k == 0 {
        return Vec::new();
    }
    let n_fft = (n + k - 1).next_power_of_two();

    let mut sig = real_fft(signal, n_fft);
    let mut ker: Vec<Complex<f64>> = kernel.to_vec();
    ker.resize(n_fft, Complex::new(0.0, 0.0));
    forward_plan(n_fft).process(&mut ker);

    for (x, h) in sig.iter_mut().zip(&ker) {
        *x *= h;
    }
    inverse_fft(&mut sig);

    let offset = (k - 1) / 2;
    sig[offset..offset + n].to_vec()
}

/// Analytic signal `x + i·H{x}` via the frequency-domain Hilbert transform
pub fn analytic_signal(signal: &[f64]) -> Vec<Complex<f64>> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let mut spectrum = real_fft(signal, n);

    // Keep DC (and Nyquist for even n), double positive, zero negative bins
    let half = n / 2;
    for (k, value) in spectrum.iter_mut().enumerate() {
        let gain = if k == 0 || (n % 2 == 0 && k == half) {
            1.0
        } else if k < half || (n % 2 == 1 && k == half) {
            2.0
        } else {
            0.0
        };
        *value *= gain;
    }
    inverse_fft(&mut spectrum);
    spectrum
}
