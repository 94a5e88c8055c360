//! Window functions (symmetric, as used for filter design and spectra)

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Window family
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowKind {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
    Kaiser { beta: f64 },
}

impl Default for WindowKind {
    fn default() -> Self {
        Self::Hann
    }
}

impl WindowKind {
    /// Generate `len` symmetric window coefficients
    pub fn coefficients(&self, len: usize) -> Vec<f64> {
        if len == 0 {
            return Vec::new();
        }
        if len == 1 {
            return vec![1.0];
        }
        let m = (len - 1) as f64;
        (0..len)
            .map(|i| {
                let x = i as f64 / m;
                match *self {
                    WindowKind::Rectangular => 1.0,
                    WindowKind::Hann => 0.5 - 0.5 * (2.0 * PI * x).cos(),
                    WindowKind::Hamming => 0.54 - 0.46 * (2.0 * PI * x).cos(),
                    WindowKind::Blackman => {
                        0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
                    }
                    WindowKind::Kaiser { beta } => {
                        let r = 2.0 * x - 1.0;
                        bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / bessel_i0(beta)
                    }
                }
            })
            .collect()
    }

    /// Periodic variant (length `len + 1` symmetric window, last point dropped),
    /// used for spectral segments
    pub fn periodic(&self, len: usize) -> Vec<f64> {
        let mut w = self.coefficients(len + 1);
        w.truncate(len);
        w
    }
}

/// Zeroth-order modified Bessel function of the first kind (power series)
pub fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    let mut k = 1.0;
    loop {
        term *= (half / k) * (half / k);
        sum += term;
        if term < sum * 1e-16 {
            break;
        }
        k += 1.0;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_are_symmetric_with_unit_peak() {
        for kind in [
            WindowKind::Hann,
            WindowKind::Hamming,
            WindowKind::Blackman,
            WindowKind::Kaiser { beta: 5.0 },
        ] {
            let w = kind.coefficients(33);
            for i in 0..33 {
                assert!((w[i] - w[32 - i]).abs() < 1e-12, "{:?}", kind);
            }
            assert!((w[16] - 1.0).abs() < 1e-12, "{:?}", kind);
        }
    }

    #[test]
    fn test_bessel_i0_known_values() {
        assert!((bessel_i0(0.0) - 1.0).abs() < 1e-15);
        assert!((bessel_i0(1.0) - 1.266_065_877_752_008_4).abs() < 1e-12);
        assert!((bessel_i0(5.0) - 27.239_871_823_604_44).abs() < 1e-9);
    }

    #[test]
    fn test_periodic_hann_starts_at_zero() {
        let w = WindowKind::Hann.periodic(8);
        assert_eq!(w.len(), 8);
        assert!(w[0].abs() < 1e-15);
        assert!((w[4] - 1.0).abs() < 1e-12);
    }
}
