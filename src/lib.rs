pub mod config;
pub mod control;
pub mod epochs;
pub mod error;
pub mod events;
pub mod fft;
pub mod filter;
pub mod pipeline;
pub mod profiling;
pub mod resample;
pub mod source;
pub mod spectral;
pub mod streaming;
pub mod tfr;
pub mod types;
pub mod window;

pub use config::{cache_key, ProcessingConfig};
pub use control::{CancellationToken, Completion, RunControl};
pub use epochs::{
    Baseline, Epoch, EpochConfig, EpochExtractor, EpochSet, EpochStatus, Evoked,
    RejectionCriteria, RejectionReason, SkippedEvent,
};
pub use error::{DspError, Result};
pub use events::{
    find_events, Annotation, EventCode, EventMarker, EventSource, EventStream, FindEventsConfig,
};
pub use filter::{
    DesignedFilter, FilterBand, FilterDesigner, FilterKernel, FilterMethod, FilterSpec, FirWindow,
    PhaseMode,
};
pub use pipeline::{Pipeline, PipelineOutput};
pub use resample::{ResampleConfig, Resampler};
pub use source::{ChunkReader, SampleSource};
pub use spectral::{
    Detrend, EpochSpectra, SpectralConfig, SpectralEstimator, SpectralMethod, SpectralResult,
};
pub use streaming::{EdgePadding, Processed, StreamingConfig, StreamingFilterEngine};
pub use tfr::{EpochsTfr, TfrConfig, TfrMethod, TimeFrequencyResult, TimeFrequencyTransformer};
pub use types::{ChannelInfo, ChannelKind, Provenance, Recording};
pub use window::WindowKind;
