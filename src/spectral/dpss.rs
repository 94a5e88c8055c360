//! Discrete prolate spheroidal sequences (Slepian tapers)
//!
//! The tapers are the eigenvectors of the symmetric tridiagonal matrix
//!
//! ```text
//! diag[i]   = ((N - 1 - 2i) / 2)^2 * cos(2 pi W)
//! off[i]    = i (N - i) / 2
//! ```
//!
//! with `W = NW / N`, ordered by decreasing eigenvalue. Eigenvalues are
//! located by Sturm-sequence bisection and the vectors recovered by
//! inverse iteration, so the cost stays linear in `N` per taper.

use crate::error::{DspError, Result};
use crate::fft;
use std::f64::consts::PI;

const BISECTION_STEPS: usize = 200;
const INVERSE_ITERATIONS: usize = 4;

/// A set of unit-energy tapers with their concentration ratios
#[derive(Debug, Clone)]
pub struct Dpss {
    pub tapers: Vec<Vec<f64>>,
    /// Fraction of each taper's energy inside `[-W, W]`
    pub concentrations: Vec<f64>,
}

/// Compute the first `n_tapers` DPSS of length `n` for time-half-bandwidth
/// product `nw`
pub fn dpss(n: usize, nw: f64, n_tapers: usize) -> Result<Dpss> {
    if n < 2 {
        return Err(DspError::InsufficientSamples {
            required: 2,
            available: n,
        });
    }
    if !(nw.is_finite() && nw > 0.0 && nw < n as f64 / 2.0) {
        return Err(DspError::parameter(
            "half_bandwidth",
            format!("must be in (0, {}), got {}", n as f64 / 2.0, nw),
        ));
    }
    if n_tapers == 0 || n_tapers > n {
        return Err(DspError::parameter(
            "n_tapers",
            format!("must be in 1..={}, got {}", n, n_tapers),
        ));
    }

    let w = nw / n as f64;
    let cos_w = (2.0 * PI * w).cos();
    let diag: Vec<f64> = (0..n)
        .map(|i| {
            let c = (n as f64 - 1.0 - 2.0 * i as f64) / 2.0;
            c * c * cos_w
        })
        .collect();
    // off[i] couples rows i - 1 and i; off[0] is unused
    let off: Vec<f64> = (0..n)
        .map(|i| i as f64 * (n - i) as f64 / 2.0)
        .collect();

    let mut tapers: Vec<Vec<f64>> = Vec::with_capacity(n_tapers);
    for k in 0..n_tapers {
        let lambda = kth_eigenvalue(&diag, &off, n - 1 - k);
        let mut v = inverse_iteration(&diag, &off, lambda, k, &tapers);
        fix_sign(&mut v, k);
        tapers.push(v);
    }

    let concentrations = tapers.iter().map(|t| concentration(t, w)).collect();
    Ok(Dpss {
        tapers,
        concentrations,
    })
}

/// Number of eigenvalues strictly below `x`
fn sturm_count(diag: &[f64], off: &[f64], x: f64) -> usize {
    let mut count = 0;
    let mut q = 1.0;
    for i in 0..diag.len() {
        let coupling = if i == 0 { 0.0 } else { off[i] * off[i] / q };
        q = diag[i] - x - coupling;
        if q == 0.0 {
            q = -f64::EPSILON * (diag[i].abs() + x.abs()).max(1.0);
        }
        if q < 0.0 {
            count += 1;
        }
    }
    count
}

/// The `index`-th smallest eigenvalue (0-based)
fn kth_eigenvalue(diag: &[f64], off: &[f64], index: usize) -> f64 {
    let n = diag.len();
    let radius = |i: usize| {
        let left = if i > 0 { off[i].abs() } else { 0.0 };
        let right = if i + 1 < n { off[i + 1].abs() } else { 0.0 };
        left + right
    };
    let mut lo = (0..n)
        .map(|i| diag[i] - radius(i))
        .fold(f64::INFINITY, f64::min);
    let mut hi = (0..n)
        .map(|i| diag[i] + radius(i))
        .fold(f64::NEG_INFINITY, f64::max);

    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        if sturm_count(diag, off, mid) > index {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Eigenvector for `lambda` by shifted inverse iteration, orthogonalized
/// against the tapers already found
fn inverse_iteration(
    diag: &[f64],
    off: &[f64],
    lambda: f64,
    seed: usize,
    previous: &[Vec<f64>],
) -> Vec<f64> {
    let n = diag.len();
    let shift = lambda + f64::EPSILON * lambda.abs().max(1.0) * 8.0;
    let shifted: Vec<f64> = diag.iter().map(|d| d - shift).collect();

    // Deterministic start vector with components of both parities
    let mut v: Vec<f64> = (0..n)
        .map(|i| 1.0 + ((i * 7 + seed * 13) % 17) as f64 / 17.0)
        .collect();
    normalize(&mut v);

    for _ in 0..INVERSE_ITERATIONS {
        v = solve_tridiagonal(&shifted, off, &v);
        for p in previous {
            let proj: f64 = v.iter().zip(p).map(|(a, b)| a * b).sum();
            for (a, b) in v.iter_mut().zip(p) {
                *a -= proj * b;
            }
        }
        normalize(&mut v);
    }
    v
}

/// Thomas algorithm for a symmetric tridiagonal system
fn solve_tridiagonal(diag: &[f64], off: &[f64], rhs: &[f64]) -> Vec<f64> {
    let n = diag.len();
    let tiny = 1e-300;
    let mut c_prime = vec![0.0; n];
    let mut d_prime = vec![0.0; n];

    let mut pivot = if diag[0].abs() < tiny { tiny } else { diag[0] };
    c_prime[0] = if n > 1 { off[1] / pivot } else { 0.0 };
    d_prime[0] = rhs[0] / pivot;
    for i in 1..n {
        pivot = diag[i] - off[i] * c_prime[i - 1];
        if pivot.abs() < tiny {
            pivot = tiny;
        }
        c_prime[i] = if i + 1 < n { off[i + 1] / pivot } else { 0.0 };
        d_prime[i] = (rhs[i] - off[i] * d_prime[i - 1]) / pivot;
    }

    let mut x = vec![0.0; n];
    x[n - 1] = d_prime[n - 1];
    for i in (0..n - 1).rev() {
        x[i] = d_prime[i] - c_prime[i] * x[i + 1];
    }
    x
}

fn normalize(v: &mut [f64]) {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Symmetric tapers sum positive; antisymmetric tapers start positive
fn fix_sign(v: &mut [f64], k: usize) {
    let flip = if k % 2 == 0 {
        v.iter().sum::<f64>() < 0.0
    } else {
        let threshold = (1.0 / v.len() as f64).max(1e-7);
        v.iter()
            .find(|x| x.abs() > threshold)
            .map(|&x| x < 0.0)
            .unwrap_or(false)
    };
    if flip {
        for x in v.iter_mut() {
            *x = -*x;
        }
    }
}

/// Energy fraction of a unit-energy taper within `[-w, w]` cycles/sample
fn concentration(taper: &[f64], w: f64) -> f64 {
    let n = taper.len();
    let reversed: Vec<f64> = taper.iter().rev().copied().collect();
    let full = fft::convolve(taper, &reversed);
    // full[n - 1 + k] is the autocorrelation at lag k
    let mut ratio = 2.0 * w * full[n - 1];
    for k in 1..n {
        let x = 2.0 * PI * w * k as f64;
        ratio += full[n - 1 + k] * 4.0 * w * x.sin() / x;
    }
    ratio
}
