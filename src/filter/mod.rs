//! Filter design
//!
//! Turns a [`FilterSpec`] into coefficients:
//! - FIR: windowed sinc, length chosen from the transition bandwidth and
//!   window (or an explicit length / Kaiser attenuation)
//! - IIR: Butterworth via the bilinear transform, as second-order sections
//!
//! Designs are pure computations. Applying them is the job of
//! [`crate::streaming::StreamingFilterEngine`].

mod design;
pub mod fir;
mod iir;
mod spec;

pub use design::{DesignedFilter, FilterDesigner, FilterKernel, DEFAULT_IIR_ORDER};
pub use fir::TransitionBands;
pub use iir::{BiquadCoeffs, BiquadFilter, ButterworthFilter, SosFilter};
pub use spec::{FilterBand, FilterMethod, FilterSpec, FirWindow, PhaseMode};
