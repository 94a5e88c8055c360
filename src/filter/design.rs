use super::fir::{self, TransitionBands};
use super::iir::{ButterworthFilter, SosFilter};
use super::spec::{FilterBand, FilterMethod, FilterSpec, PhaseMode};
use crate::error::{DspError, Result};
use crate::types::Recording;

/// Default Butterworth order when neither order nor roll-off is given
pub const DEFAULT_IIR_ORDER: usize = 4;

/// Relative amplitude below which IIR ringing is considered finished
const RINGING_THRESHOLD: f64 = 1e-3;
const MAX_RINGING: usize = 100_000;

/// Coefficients produced by [`FilterDesigner`]
#[derive(Debug, Clone)]
pub enum FilterKernel {
    /// Symmetric FIR taps
    Fir(Vec<f64>),
    /// Butterworth second-order sections (state reset)
    Iir(SosFilter),
}

/// A designed filter, ready for [`crate::StreamingFilterEngine`]
#[derive(Debug, Clone)]
pub struct DesignedFilter {
    spec: FilterSpec,
    sample_rate: f64,
    kernel: FilterKernel,
    length: usize,
    transitions: Option<TransitionBands>,
    order: Option<usize>,
}

impl DesignedFilter {
    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn kernel(&self) -> &FilterKernel {
        &self.kernel
    }

    pub fn phase(&self) -> PhaseMode {
        self.spec.phase
    }

    /// FIR tap count, or the IIR impulse-response ringing length
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn transition_bands(&self) -> Option<TransitionBands> {
        self.transitions
    }

    pub fn order(&self) -> Option<usize> {
        self.order
    }

    /// Single-pass magnitude response at `freq` Hz
    pub fn magnitude(&self, freq: f64) -> f64 {
        match &self.kernel {
            FilterKernel::Fir(taps) => fir::magnitude(taps, freq, self.sample_rate),
            FilterKernel::Iir(sos) => sos.magnitude(freq, self.sample_rate),
        }
    }

    /// Short human-readable description, used as a provenance step
    pub fn describe(&self) -> String {
        let edges = self
            .spec
            .band
            .edges()
            .iter()
            .map(|f| format!("{}", f))
            .collect::<Vec<_>>()
            .join("-");
        let design = match &self.kernel {
            FilterKernel::Fir(_) => format!("FIR {} taps", self.length),
            FilterKernel::Iir(_) => format!("IIR order {}", self.order.unwrap_or(0)),
        };
        let phase = match self.spec.phase {
            PhaseMode::ZeroPhase => "zero-phase",
            PhaseMode::Causal => "causal",
        };
        format!("{} {} Hz ({}, {})", self.spec.band.name(), edges, design, phase)
    }
}

/// Computes kernels from a [`FilterSpec`] at a fixed sampling rate
#[derive(Debug, Clone, Copy)]
pub struct FilterDesigner {
    sample_rate: f64,
    max_length: Option<usize>,
}

impl FilterDesigner {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            max_length: None,
        }
    }

    /// Designer that refuses derived kernels longer than `recording`
    pub fn for_recording(recording: &Recording) -> Self {
        Self::new(recording.sample_rate()).with_max_length(recording.n_samples())
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn design(&self, spec: &FilterSpec) -> Result<DesignedFilter> {
        spec.validate(self.sample_rate)?;

        let designed = match spec.method {
            FilterMethod::Fir {
                transition_bandwidth,
                length,
                window,
            } => {
                let nyquist = self.sample_rate / 2.0;
                if let Some(tb) = transition_bandwidth {
                    self.check_transition(&spec.band, tb)?;
                }
                let transitions = fir::transition_bands(&spec.band, transition_bandwidth, nyquist);

                let len = match length {
                    Some(requested) => {
                        let len = fir::force_odd(requested);
                        if len != requested {
                            log::debug!("FIR length {} rounded up to odd length {}", requested, len);
                        }
                        len
                    }
                    None => {
                        let len = fir::kernel_length(&window, transitions.narrowest(), self.sample_rate);
                        self.check_derived_length("transition_bandwidth", len)?;
                        len
                    }
                };

                let taps = fir::design_kernel(&spec.band, &transitions, len, &window, self.sample_rate);
                DesignedFilter {
                    spec: *spec,
                    sample_rate: self.sample_rate,
                    kernel: FilterKernel::Fir(taps),
                    length: len,
                    transitions: Some(transitions),
                    order: None,
                }
            }
            FilterMethod::Iir {
                order,
                rolloff_db_per_octave,
            } => {
                let order = order
                    .or_else(|| rolloff_db_per_octave.map(ButterworthFilter::order_for_rolloff))
                    .unwrap_or(DEFAULT_IIR_ORDER);
                if order > super::spec::MAX_IIR_ORDER {
                    return Err(DspError::filter_spec(
                        "rolloff_db_per_octave",
                        format!("requires order {} (max {})", order, super::spec::MAX_IIR_ORDER),
                    ));
                }

                let sos = ButterworthFilter::design(&spec.band, order, self.sample_rate);
                if !sos.is_stable() {
                    return Err(DspError::filter_spec(
                        "order",
                        format!("order {} is numerically unstable at these edges", order),
                    ));
                }
                let len = sos.ringing_length(RINGING_THRESHOLD, MAX_RINGING);
                self.check_derived_length("order", len)?;

                DesignedFilter {
                    spec: *spec,
                    sample_rate: self.sample_rate,
                    kernel: FilterKernel::Iir(sos),
                    length: len,
                    transitions: None,
                    order: Some(order),
                }
            }
        };

        log::debug!("Designed {}", designed.describe());
        Ok(designed)
    }

    /// Explicit transition bands must keep every cutoff inside `(0, nyquist)`
    fn check_transition(&self, band: &FilterBand, tb: f64) -> Result<()> {
        let nyquist = self.sample_rate / 2.0;
        let half = tb / 2.0;
        let fits = match *band {
            FilterBand::Lowpass { cutoff } => cutoff + half < nyquist,
            FilterBand::Highpass { cutoff } => cutoff - half > 0.0,
            FilterBand::Bandpass { low, high } => low - half > 0.0 && high + half < nyquist,
            FilterBand::Bandstop { low, high } => tb <= high - low,
        };
        if fits {
            Ok(())
        } else {
            Err(DspError::filter_spec(
                "transition_bandwidth",
                format!(
                    "{} Hz pushes a {} cutoff outside 0..{} Hz",
                    tb,
                    band.name(),
                    nyquist
                ),
            ))
        }
    }

    fn check_derived_length(&self, parameter: &str, len: usize) -> Result<()> {
        match self.max_length {
            Some(max) if len > max => Err(DspError::filter_spec(
                parameter,
                format!(
                    "requires a {}-sample kernel but only {} samples are available",
                    len, max
                ),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fir_lowpass_at_five_hz() {
        let filter = FilterDesigner::new(1000.0)
            .design(&FilterSpec::lowpass(5.0))
            .unwrap();
        assert_eq!(filter.length(), 1651);
        assert!((filter.magnitude(0.0) - 1.0).abs() < 1e-12);
        assert!(filter.magnitude(10.0) < 0.01);
        assert!(matches!(filter.kernel(), FilterKernel::Fir(_)));
    }

    #[test]
    fn test_explicit_length_is_not_capped() {
        let filter = FilterDesigner::new(1000.0)
            .with_max_length(500)
            .design(&FilterSpec::lowpass(40.0).with_length(800))
            .unwrap();
        assert_eq!(filter.length(), 801);
    }

    #[test]
    fn test_derived_length_longer_than_recording_is_rejected() {
        let err = FilterDesigner::new(1000.0)
            .with_max_length(500)
            .design(&FilterSpec::highpass(1.0))
            .unwrap_err();
        match err {
            DspError::InvalidFilterSpec { parameter, .. } => {
                assert_eq!(parameter, "transition_bandwidth")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_transition_outside_band_is_rejected() {
        let designer = FilterDesigner::new(1000.0);
        assert!(designer
            .design(&FilterSpec::highpass(1.0).with_transition_bandwidth(4.0))
            .is_err());
        assert!(designer
            .design(&FilterSpec::lowpass(490.0).with_transition_bandwidth(30.0))
            .is_err());
    }

    #[test]
    fn test_iir_from_rolloff() {
        let spec = FilterSpec::bandpass(1.0, 40.0).with_method(FilterMethod::Iir {
            order: None,
            rolloff_db_per_octave: Some(24.0),
        });
        let filter = FilterDesigner::new(250.0).design(&spec).unwrap();
        assert_eq!(filter.order(), Some(4));
        assert!(filter.length() > 50);
        assert!(filter.describe().contains("IIR order 4"));
    }
}
