use crate::error::{DspError, Result};
use serde::{Deserialize, Serialize};

/// Frequency response family and its edge frequencies (Hz)
///
/// Edges are passband edges: for a lowpass at 40 Hz the passband ends at
/// 40 Hz and the transition band lies above it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterBand {
    Lowpass { cutoff: f64 },
    Highpass { cutoff: f64 },
    Bandpass { low: f64, high: f64 },
    Bandstop { low: f64, high: f64 },
}

impl FilterBand {
    /// Edge frequencies in ascending order
    pub fn edges(&self) -> Vec<f64> {
        match *self {
            FilterBand::Lowpass { cutoff } | FilterBand::Highpass { cutoff } => vec![cutoff],
            FilterBand::Bandpass { low, high } | FilterBand::Bandstop { low, high } => {
                vec![low, high]
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterBand::Lowpass { .. } => "lowpass",
            FilterBand::Highpass { .. } => "highpass",
            FilterBand::Bandpass { .. } => "bandpass",
            FilterBand::Bandstop { .. } => "bandstop",
        }
    }
}

/// Whether the filter may shift the signal in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMode {
    /// Forward then time-reversed pass; no group delay
    ZeroPhase,
    /// Single forward pass; never reads future samples
    Causal,
}

impl Default for PhaseMode {
    fn default() -> Self {
        PhaseMode::ZeroPhase
    }
}

/// Window used to taper the ideal FIR response
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FirWindow {
    Hann,
    Hamming,
    Blackman,
    /// Kaiser window sized for the given stopband attenuation
    Kaiser { attenuation_db: f64 },
}

impl Default for FirWindow {
    fn default() -> Self {
        FirWindow::Hamming
    }
}

/// Design method: FIR windowed sinc or Butterworth IIR
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "design", rename_all = "snake_case")]
pub enum FilterMethod {
    Fir {
        /// Width of each transition band in Hz; chosen per edge when absent
        #[serde(default)]
        transition_bandwidth: Option<f64>,
        /// Explicit kernel length in samples; overrides the transition width
        #[serde(default)]
        length: Option<usize>,
        #[serde(default)]
        window: FirWindow,
    },
    Iir {
        /// Butterworth order (per band edge)
        #[serde(default)]
        order: Option<usize>,
        /// Requested asymptotic roll-off in dB/octave, used when no order is given
        #[serde(default)]
        rolloff_db_per_octave: Option<f64>,
    },
}

impl Default for FilterMethod {
    fn default() -> Self {
        FilterMethod::Fir {
            transition_bandwidth: None,
            length: None,
            window: FirWindow::default(),
        }
    }
}

/// Frequency-domain description of a filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub band: FilterBand,
    #[serde(default)]
    pub method: FilterMethod,
    #[serde(default)]
    pub phase: PhaseMode,
}

impl FilterSpec {
    pub fn new(band: FilterBand) -> Self {
        Self {
            band,
            method: FilterMethod::default(),
            phase: PhaseMode::default(),
        }
    }

    pub fn lowpass(cutoff: f64) -> Self {
        Self::new(FilterBand::Lowpass { cutoff })
    }

    pub fn highpass(cutoff: f64) -> Self {
        Self::new(FilterBand::Highpass { cutoff })
    }

    pub fn bandpass(low: f64, high: f64) -> Self {
        Self::new(FilterBand::Bandpass { low, high })
    }

    pub fn bandstop(low: f64, high: f64) -> Self {
        Self::new(FilterBand::Bandstop { low, high })
    }

    pub fn with_method(mut self, method: FilterMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_phase(mut self, phase: PhaseMode) -> Self {
        self.phase = phase;
        self
    }

    /// FIR with an explicit transition bandwidth (Hz)
    pub fn with_transition_bandwidth(mut self, width: f64) -> Self {
        let window = match self.method {
            FilterMethod::Fir { window, .. } => window,
            FilterMethod::Iir { .. } => FirWindow::default(),
        };
        self.method = FilterMethod::Fir {
            transition_bandwidth: Some(width),
            length: None,
            window,
        };
        self
    }

    /// FIR with an explicit kernel length
    pub fn with_length(mut self, length: usize) -> Self {
        let window = match self.method {
            FilterMethod::Fir { window, .. } => window,
            FilterMethod::Iir { .. } => FirWindow::default(),
        };
        self.method = FilterMethod::Fir {
            transition_bandwidth: None,
            length: Some(length),
            window,
        };
        self
    }

    /// Butterworth IIR of the given order
    pub fn butterworth(mut self, order: usize) -> Self {
        self.method = FilterMethod::Iir {
            order: Some(order),
            rolloff_db_per_octave: None,
        };
        self
    }

    /// Check every edge against `(0, nyquist)` and the method parameters
    pub fn validate(&self, sample_rate: f64) -> Result<()> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(DspError::filter_spec(
                "sample_rate",
                format!("must be positive, got {}", sample_rate),
            ));
        }
        let nyquist = sample_rate / 2.0;

        let check_edge = |name: &str, f: f64| -> Result<()> {
            if !f.is_finite() || f <= 0.0 || f >= nyquist {
                return Err(DspError::filter_spec(
                    name,
                    format!("{} Hz must lie strictly between 0 and Nyquist ({} Hz)", f, nyquist),
                ));
            }
            Ok(())
        };

        match self.band {
            FilterBand::Lowpass { cutoff } | FilterBand::Highpass { cutoff } => {
                check_edge("cutoff", cutoff)?
            }
            FilterBand::Bandpass { low, high } | FilterBand::Bandstop { low, high } => {
                check_edge("low", low)?;
                check_edge("high", high)?;
                if low >= high {
                    return Err(DspError::filter_spec(
                        "low",
                        format!("{} Hz must be below high edge {} Hz", low, high),
                    ));
                }
            }
        }

        match self.method {
            FilterMethod::Fir {
                transition_bandwidth,
                length,
                window,
            } => {
                if let Some(tb) = transition_bandwidth {
                    if !tb.is_finite() || tb <= 0.0 {
                        return Err(DspError::filter_spec(
                            "transition_bandwidth",
                            format!("must be positive, got {}", tb),
                        ));
                    }
                }
                if length == Some(0) {
                    return Err(DspError::filter_spec("length", "must be at least 1"));
                }
                if let FirWindow::Kaiser { attenuation_db } = window {
                    if !attenuation_db.is_finite() || attenuation_db <= 0.0 {
                        return Err(DspError::filter_spec(
                            "attenuation_db",
                            format!("must be positive, got {}", attenuation_db),
                        ));
                    }
                }
            }
            FilterMethod::Iir {
                order,
                rolloff_db_per_octave,
            } => {
                if let Some(order) = order {
                    if order == 0 || order > MAX_IIR_ORDER {
                        return Err(DspError::filter_spec(
                            "order",
                            format!("must be in 1..={}, got {}", MAX_IIR_ORDER, order),
                        ));
                    }
                }
                if let Some(rolloff) = rolloff_db_per_octave {
                    if !rolloff.is_finite() || rolloff <= 0.0 {
                        return Err(DspError::filter_spec(
                            "rolloff_db_per_octave",
                            format!("must be positive, got {}", rolloff),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Hex SHA-256 over the serialized spec
    pub fn cache_key(&self) -> Result<String> {
        crate::config::cache_key(self)
    }
}

pub(crate) const MAX_IIR_ORDER: usize = 16;
