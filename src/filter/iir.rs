//! Butterworth IIR design and second-order-section filtering
//!
//! Designs go through the analog zero-pole-gain prototype, the matching
//! band transform and the bilinear transform, and are then grouped into
//! biquads. Filtering uses Direct Form II Transposed sections.

use super::spec::FilterBand;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

type Root = Complex<f64>;

/// Second-order section (biquad) coefficients
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Complex response at normalized angular frequency `w` (rad/sample)
    pub fn response(&self, w: f64) -> Complex<f64> {
        let z1 = Complex::from_polar(1.0, -w);
        let z2 = z1 * z1;
        let num = Complex::new(self.b0, 0.0) + z1 * self.b1 + z2 * self.b2;
        let den = Complex::new(1.0, 0.0) + z1 * self.a1 + z2 * self.a2;
        num / den
    }

    /// Both poles strictly inside the unit circle (stability triangle)
    pub fn is_stable(&self) -> bool {
        self.a2.abs() < 1.0 && self.a1.abs() < 1.0 + self.a2
    }
}

/// State for a single biquad section (Direct Form II Transposed)
#[derive(Debug, Clone, Default)]
struct BiquadState {
    z1: f64,
    z2: f64,
}

/// Single biquad filter section
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    state: BiquadState,
}

impl BiquadFilter {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: BiquadState::default(),
        }
    }

    /// Process a single sample using Direct Form II Transposed
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.coeffs.b0 * input + self.state.z1;
        self.state.z1 = self.coeffs.b1 * input - self.coeffs.a1 * output + self.state.z2;
        self.state.z2 = self.coeffs.b2 * input - self.coeffs.a2 * output;
        output
    }

    /// Load the steady-state response to a constant `input`; returns the
    /// steady output
    fn prime(&mut self, input: f64) -> f64 {
        let c = self.coeffs;
        let denom = 1.0 + c.a1 + c.a2;
        let output = if denom.abs() > 1e-12 {
            input * (c.b0 + c.b1 + c.b2) / denom
        } else {
            0.0
        };
        self.state.z1 = output - c.b0 * input;
        self.state.z2 = c.b2 * input - c.a2 * output;
        output
    }

    pub fn reset(&mut self) {
        self.state = BiquadState::default();
    }
}

/// Cascaded second-order sections filter
#[derive(Debug, Clone)]
pub struct SosFilter {
    sections: Vec<BiquadFilter>,
    gain: f64,
}

impl SosFilter {
    pub fn new(sections: Vec<BiquadCoeffs>, gain: f64) -> Self {
        Self {
            sections: sections.into_iter().map(BiquadFilter::new).collect(),
            gain,
        }
    }

    /// Process a single sample through all sections
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let mut output = input * self.gain;
        for section in &mut self.sections {
            output = section.process(output);
        }
        output
    }

    /// Process an entire signal array in-place
    pub fn process_signal(&mut self, signal: &mut [f64]) {
        for sample in signal.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Process a signal and return a new array (original unchanged)
    pub fn filter(&mut self, signal: &[f64]) -> Vec<f64> {
        signal.iter().map(|&s| self.process(s)).collect()
    }

    /// Set every section to the state it would reach after an infinitely
    /// long constant input `value`
    pub fn prime(&mut self, value: f64) {
        let mut v = value * self.gain;
        for section in &mut self.sections {
            v = section.prime(v);
        }
    }

    /// Reset all section states
    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset();
        }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn coefficients(&self) -> Vec<BiquadCoeffs> {
        self.sections.iter().map(|s| s.coeffs).collect()
    }

    pub fn is_stable(&self) -> bool {
        self.sections.iter().all(|s| s.coeffs.is_stable())
    }

    /// Magnitude response at `freq` Hz
    pub fn magnitude(&self, freq: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * freq / sample_rate;
        self.sections
            .iter()
            .fold(Complex::new(self.gain, 0.0), |acc, s| acc * s.coeffs.response(w))
            .norm()
    }

    /// Samples until the impulse response stays below `threshold` of its
    /// peak, capped at `max_len`
    pub fn ringing_length(&self, threshold: f64, max_len: usize) -> usize {
        let mut ringing = self.clone();
        ringing.reset();

        let mut peak = 0.0f64;
        let mut last_significant = 0usize;
        for i in 0..max_len {
            let h = ringing.process(if i == 0 { 1.0 } else { 0.0 }).abs();
            if h > peak {
                peak = h;
            }
            if h >= threshold * peak {
                last_significant = i;
            }
            if i > last_significant + last_significant.max(100) {
                break;
            }
        }
        last_significant + 1
    }
}

/// Butterworth filter designer
pub struct ButterworthFilter;

impl ButterworthFilter {
    /// Design a digital Butterworth filter of `order` per band edge
    pub fn design(band: &FilterBand, order: usize, sample_rate: f64) -> SosFilter {
        let prototype = Zpk::analog_prototype(order);
        let warp = |f: f64| Self::prewarp(f, sample_rate);

        let analog = match *band {
            FilterBand::Lowpass { cutoff } => prototype.lp2lp(warp(cutoff)),
            FilterBand::Highpass { cutoff } => prototype.lp2hp(warp(cutoff)),
            FilterBand::Bandpass { low, high } => {
                let (w1, w2) = (warp(low), warp(high));
                prototype.lp2bp((w1 * w2).sqrt(), w2 - w1)
            }
            FilterBand::Bandstop { low, high } => {
                let (w1, w2) = (warp(low), warp(high));
                prototype.lp2bs((w1 * w2).sqrt(), w2 - w1)
            }
        };
        let digital = analog.bilinear(sample_rate);
        let (sections, gain) = digital.into_sections();
        SosFilter::new(sections, gain)
    }

    /// Butterworth order reaching the asymptotic roll-off (6.02 dB/octave per order)
    pub fn order_for_rolloff(rolloff_db_per_octave: f64) -> usize {
        ((rolloff_db_per_octave / 6.02).ceil() as usize).max(1)
    }

    /// Prewarp frequency for bilinear transform (analog rad/s)
    fn prewarp(freq: f64, sample_rate: f64) -> f64 {
        2.0 * sample_rate * (PI * freq / sample_rate).tan()
    }
}

/// Zero-pole-gain representation used during design
#[derive(Debug, Clone)]
struct Zpk {
    zeros: Vec<Root>,
    poles: Vec<Root>,
    gain: f64,
}

impl Zpk {
    /// Normalized analog lowpass with poles evenly spaced on the left half
    /// of the unit circle
    fn analog_prototype(order: usize) -> Self {
        let n = order as i64;
        let poles = (0..n)
            .map(|i| {
                let m = (-n + 1 + 2 * i) as f64;
                -Complex::from_polar(1.0, PI * m / (2.0 * order as f64))
            })
            .collect();
        Self {
            zeros: Vec::new(),
            poles,
            gain: 1.0,
        }
    }

    fn degree(&self) -> usize {
        self.poles.len() - self.zeros.len()
    }

    fn lp2lp(self, wo: f64) -> Self {
        let degree = self.degree();
        Self {
            zeros: self.zeros.iter().map(|&z| z * wo).collect(),
            poles: self.poles.iter().map(|&p| p * wo).collect(),
            gain: self.gain * wo.powi(degree as i32),
        }
    }

    fn lp2hp(self, wo: f64) -> Self {
        let degree = self.degree();
        let gain = self.gain * (product_neg(&self.zeros) / product_neg(&self.poles)).re;
        let wo_c = Complex::new(wo, 0.0);
        let mut zeros: Vec<Root> = self.zeros.iter().map(|&z| wo_c / z).collect();
        zeros.extend(std::iter::repeat(Complex::new(0.0, 0.0)).take(degree));
        Self {
            zeros,
            poles: self.poles.iter().map(|&p| wo_c / p).collect(),
            gain,
        }
    }

    fn lp2bp(self, wo: f64, bw: f64) -> Self {
        let degree = self.degree();
        let split = |roots: &[Root]| -> Vec<Root> {
            let scaled: Vec<Root> = roots.iter().map(|&r| r * (bw / 2.0)).collect();
            let mut out: Vec<Root> = scaled
                .iter()
                .map(|&r| r + (r * r - wo * wo).sqrt())
                .collect();
            out.extend(scaled.iter().map(|&r| r - (r * r - wo * wo).sqrt()));
            out
        };
        let mut zeros = split(&self.zeros);
        zeros.extend(std::iter::repeat(Complex::new(0.0, 0.0)).take(degree));
        Self {
            zeros,
            poles: split(&self.poles),
            gain: self.gain * bw.powi(degree as i32),
        }
    }

    fn lp2bs(self, wo: f64, bw: f64) -> Self {
        let degree = self.degree();
        let gain = self.gain * (product_neg(&self.zeros) / product_neg(&self.poles)).re;
        let split = |roots: &[Root]| -> Vec<Root> {
            let half_bw = Complex::new(bw / 2.0, 0.0);
            let inverted: Vec<Root> = roots.iter().map(|&r| half_bw / r).collect();
            let mut out: Vec<Root> = inverted
                .iter()
                .map(|&r| r + (r * r - wo * wo).sqrt())
                .collect();
            out.extend(inverted.iter().map(|&r| r - (r * r - wo * wo).sqrt()));
            out
        };
        let mut zeros = split(&self.zeros);
        zeros.extend(std::iter::repeat(Complex::new(0.0, wo)).take(degree));
        zeros.extend(std::iter::repeat(Complex::new(0.0, -wo)).take(degree));
        Self {
            zeros,
            poles: split(&self.poles),
            gain,
        }
    }

    fn bilinear(self, sample_rate: f64) -> Self {
        let fs2 = Complex::new(2.0 * sample_rate, 0.0);
        let degree = self.degree();

        let num: Root = self.zeros.iter().map(|&z| fs2 - z).product();
        let den: Root = self.poles.iter().map(|&p| fs2 - p).product();
        let gain = self.gain * (num / den).re;

        let mut zeros: Vec<Root> = self.zeros.iter().map(|&z| (fs2 + z) / (fs2 - z)).collect();
        zeros.extend(std::iter::repeat(Complex::new(-1.0, 0.0)).take(degree));
        Self {
            zeros,
            poles: self.poles.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect(),
            gain,
        }
    }

    /// Group roots into real-coefficient biquads
    fn into_sections(self) -> (Vec<BiquadCoeffs>, f64) {
        let mut pole_polys = quadratic_factors(&self.poles);
        let mut zero_polys = quadratic_factors(&self.zeros);

        // Poles nearest the unit circle last, so they see the most attenuated input
        pole_polys.sort_by(|a, b| a[2].abs().total_cmp(&b[2].abs()));

        let n = pole_polys.len().max(zero_polys.len());
        pole_polys.resize(n, [1.0, 0.0, 0.0]);
        zero_polys.resize(n, [1.0, 0.0, 0.0]);

        let sections = pole_polys
            .iter()
            .zip(&zero_polys)
            .map(|(a, b)| BiquadCoeffs {
                b0: b[0],
                b1: b[1],
                b2: b[2],
                a1: a[1],
                a2: a[2],
            })
            .collect();
        (sections, self.gain)
    }
}

fn product_neg(roots: &[Root]) -> Root {
    roots
        .iter()
        .map(|&r| -r)
        .fold(Complex::new(1.0, 0.0), |acc, r| acc * r)
}

/// Monic polynomials `[1, c1, c2]` whose roots cover `roots`. Complex
/// roots are expected in conjugate pairs.
fn quadratic_factors(roots: &[Root]) -> Vec<[f64; 3]> {
    let mut polys = Vec::new();
    let mut reals = Vec::new();

    for r in roots {
        let tol = 1e-10 * r.norm().max(1.0);
        if r.im > tol {
            polys.push([1.0, -2.0 * r.re, r.norm_sqr()]);
        } else if r.im.abs() <= tol {
            reals.push(r.re);
        }
    }

    reals.sort_by(|a, b| a.total_cmp(b));
    for pair in reals.chunks(2) {
        match pair {
            [a, b] => polys.push([1.0, -(a + b), a * b]),
            [a] => polys.push([1.0, -a, 0.0]),
            _ => {}
        }
    }
    polys
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 1000.0;

    #[test]
    fn test_lowpass_response() {
        let filter = ButterworthFilter::design(&FilterBand::Lowpass { cutoff: 10.0 }, 4, FS);
        assert!(filter.is_stable());
        assert!((filter.magnitude(0.0, FS) - 1.0).abs() < 1e-9);
        assert!((filter.magnitude(10.0, FS) - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(filter.magnitude(100.0, FS) < 1e-3);
    }

    #[test]
    fn test_highpass_response() {
        let filter = ButterworthFilter::design(&FilterBand::Highpass { cutoff: 1.0 }, 3, FS);
        assert!(filter.is_stable());
        assert!(filter.magnitude(0.0, FS) < 1e-9);
        assert!((filter.magnitude(1.0, FS) - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((filter.magnitude(100.0, FS) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_bandpass_and_bandstop_edges() {
        let bp = ButterworthFilter::design(&FilterBand::Bandpass { low: 8.0, high: 12.0 }, 4, FS);
        assert!(bp.is_stable());
        assert_eq!(bp.coefficients().len(), 4);
        let centre = (8.0f64 * 12.0).sqrt();
        // analog centre maps near but not exactly to the geometric mean
        assert!((bp.magnitude(centre, FS) - 1.0).abs() < 1e-3);
        assert!((bp.magnitude(8.0, FS) - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((bp.magnitude(12.0, FS) - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(bp.magnitude(40.0, FS) < 1e-3);

        let bs = ButterworthFilter::design(&FilterBand::Bandstop { low: 45.0, high: 55.0 }, 2, FS);
        assert!(bs.is_stable());
        assert!((bs.magnitude(0.0, FS) - 1.0).abs() < 1e-9);
        assert!(bs.magnitude((45.0f64 * 55.0).sqrt(), FS) < 1e-2);
        assert!((bs.magnitude(200.0, FS) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_primed_filter_passes_constant_without_transient() {
        let mut filter = ButterworthFilter::design(&FilterBand::Lowpass { cutoff: 5.0 }, 4, FS);
        filter.prime(3.0);
        for _ in 0..200 {
            assert!((filter.process(3.0) - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_ringing_length_grows_with_order() {
        let low = ButterworthFilter::design(&FilterBand::Lowpass { cutoff: 20.0 }, 2, FS);
        let high = ButterworthFilter::design(&FilterBand::Lowpass { cutoff: 20.0 }, 8, FS);
        let a = low.ringing_length(1e-3, 100_000);
        let b = high.ringing_length(1e-3, 100_000);
        assert!(a > 10 && a < b, "{} vs {}", a, b);
    }

    #[test]
    fn test_order_for_rolloff() {
        assert_eq!(ButterworthFilter::order_for_rolloff(24.0), 4);
        assert_eq!(ButterworthFilter::order_for_rolloff(6.0), 1);
        assert_eq!(ButterworthFilter::order_for_rolloff(48.2), 9);
    }
}
