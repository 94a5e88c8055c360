//! Chunked filter application
//!
//! Channels are independent and fan out over the rayon pool. Within a
//! channel, chunks are fed in sample order through a [`ChunkFilter`] that
//! carries the continuity state (the overlap-add tail for FIR, the biquad
//! state for IIR), so cutting a recording into chunks gives the same
//! output as filtering it whole.
//!
//! Edge policy: zero-phase filtering pads both ends with `kernel_length - 1`
//! samples according to [`EdgePadding`] and crops the padding afterwards.
//! Causal filtering never reads ahead and starts from a zero state.

use crate::control::{CancellationToken, Completion, RunControl};
use crate::error::{DspError, Result};
use crate::fft;
use crate::filter::{DesignedFilter, FilterKernel, PhaseMode, SosFilter};
use crate::profile_scope;
use crate::source::{read_channel, single_row, ChunkReader, SampleSource};
use crate::types::{ChannelKind, Recording};
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// How samples beyond either end of a signal are synthesized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgePadding {
    /// Point reflection about the edge sample: `2*x[0] - x[k]`
    OddReflect,
    /// Mirror reflection excluding the edge sample: `x[k]`
    Reflect,
    Zero,
}

impl Default for EdgePadding {
    fn default() -> Self {
        EdgePadding::OddReflect
    }
}

/// Sample at `idx` of `signal`, padded beyond either end. Reflection is
/// limited to the available samples.
pub(crate) fn padded_sample(signal: &[f64], idx: isize, padding: EdgePadding) -> f64 {
    let n = signal.len() as isize;
    if idx >= 0 && idx < n {
        return signal[idx as usize];
    }
    if n == 0 {
        return 0.0;
    }
    let (edge, mirrored) = if idx < 0 {
        (signal[0], (-idx).min(n - 1))
    } else {
        (signal[(n - 1) as usize], (2 * (n - 1) - idx).max(0))
    };
    match padding {
        EdgePadding::Zero => 0.0,
        EdgePadding::Reflect => signal[mirrored as usize],
        EdgePadding::OddReflect => 2.0 * edge - signal[mirrored as usize],
    }
}

fn default_chunk_len() -> usize {
    16_384
}

/// Engine settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Samples read from the source per step
    #[serde(default = "default_chunk_len")]
    pub chunk_len: usize,
    #[serde(default)]
    pub padding: EdgePadding,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_len: default_chunk_len(),
            padding: EdgePadding::default(),
        }
    }
}

impl StreamingConfig {
    pub fn cache_key(&self) -> Result<String> {
        crate::config::cache_key(self)
    }
}

/// Overlap-add FFT convolution over consecutive blocks
///
/// Each call to [`OverlapAdd::process`] returns exactly as many samples as
/// it was given; the part of the convolution that extends past the block
/// is kept and added to the next block.
#[derive(Debug, Clone)]
pub struct OverlapAdd {
    kernel_len: usize,
    block_len: usize,
    spectrum: Vec<Complex<f64>>,
    tail: Vec<f64>,
}

impl OverlapAdd {
    pub fn new(kernel: &[f64], block_len: usize) -> Self {
        let block_len = block_len.max(1);
        let kernel_len = kernel.len().max(1);
        let n_fft = (block_len + kernel_len - 1).next_power_of_two();
        Self {
            kernel_len,
            block_len,
            spectrum: fft::real_fft(kernel, n_fft),
            tail: vec![0.0; kernel_len - 1],
        }
    }

    pub fn process(&mut self, input: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(input.len());
        for block in input.chunks(self.block_len) {
            let m = block.len();
            let mut conv =
                fft::convolve_with_spectrum(block, &self.spectrum, m + self.kernel_len - 1);
            for (c, t) in conv.iter_mut().zip(&self.tail) {
                *c += t;
            }
            out.extend_from_slice(&conv[..m]);
            self.tail = conv.split_off(m);
        }
        out
    }

    /// Convolution tail not yet emitted
    pub fn pending(&self) -> &[f64] {
        &self.tail
    }
}

/// Causal single-pass filter with continuity state carried across chunks
#[derive(Debug, Clone)]
pub enum ChunkFilter {
    Fir(OverlapAdd),
    Iir(SosFilter),
}

impl ChunkFilter {
    pub fn new(filter: &DesignedFilter, block_len: usize) -> Self {
        match filter.kernel() {
            FilterKernel::Fir(taps) => ChunkFilter::Fir(OverlapAdd::new(taps, block_len)),
            FilterKernel::Iir(sos) => {
                let mut sos = sos.clone();
                sos.reset();
                ChunkFilter::Iir(sos)
            }
        }
    }

    /// Start an IIR pass from the steady state for a constant `value`
    fn prime(&mut self, value: f64) {
        if let ChunkFilter::Iir(sos) = self {
            sos.prime(value);
        }
    }

    pub fn process(&mut self, chunk: &[f64]) -> Vec<f64> {
        match self {
            ChunkFilter::Fir(ola) => ola.process(chunk),
            ChunkFilter::Iir(sos) => sos.filter(chunk),
        }
    }
}

/// A derived recording plus whether every channel was completed
#[derive(Debug, Clone)]
pub struct Processed {
    /// Completed channels only when cancelled
    pub recording: Recording,
    pub completion: Completion,
}

/// Applies designed filters to recordings or arbitrary sample sources
#[derive(Debug, Clone, Default)]
pub struct StreamingFilterEngine {
    config: StreamingConfig,
}

impl StreamingFilterEngine {
    pub fn new(config: StreamingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Filter every non-stim channel of `recording`; stim channels are
    /// copied unchanged
    pub fn apply(
        &self,
        recording: &Recording,
        filter: &DesignedFilter,
        control: &RunControl,
    ) -> Result<Processed> {
        let (rows, completion) = self.apply_source(recording, filter, control)?;

        let mut channels = Vec::new();
        let mut data = Vec::new();
        for (info, row) in recording.channels().iter().zip(rows) {
            if let Some(row) = row {
                channels.push(info.clone());
                data.push(row);
            }
        }

        let mut step = filter.describe();
        if !completion.is_complete() {
            step.push_str(" (cancelled)");
        }
        let recording = recording.derive(step, channels, data, recording.sample_rate())?;
        Ok(Processed {
            recording,
            completion,
        })
    }

    /// Filter each channel of `source`; a `None` row was not completed
    /// before cancellation
    pub fn apply_source<S: SampleSource + ?Sized>(
        &self,
        source: &S,
        filter: &DesignedFilter,
        control: &RunControl,
    ) -> Result<(Vec<Option<Vec<f64>>>, Completion)> {
        let n = source.n_samples();
        self.check(source.sample_rate(), n, filter)?;
        let n_channels = source.channels().len();

        profile_scope!(format!("filter {} channels", n_channels));
        log::info!(
            "Filtering {} channels x {} samples: {}",
            n_channels,
            n,
            filter.describe()
        );

        let chunk_len = self.config.chunk_len;
        let (slots, completion) = control.fan_out(n_channels, |ch, cancel| {
            let chunks = match ChunkReader::new(source, vec![ch], chunk_len) {
                Ok(reader) => reader.map(move |chunk| {
                    chunk.and_then(|c| {
                        let expected = chunk_len.min(n - c.start);
                        single_row(c.data, ch, expected)
                    })
                }),
                Err(err) => return Some(Err(err)),
            };
            if source.channels()[ch].kind == ChannelKind::Stim {
                return copy_chunks(n, chunks, cancel).transpose();
            }
            let read_edge = |range: Range<usize>| read_channel(source, ch, range);
            self.run_channel(n, chunks, read_edge, filter, cancel)
                .transpose()
        });

        let rows = slots
            .into_iter()
            .map(|slot| slot.transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok((rows, completion))
    }

    /// Filter one in-memory signal without cancellation
    pub fn filter_signal(&self, signal: &[f64], filter: &DesignedFilter) -> Result<Vec<f64>> {
        let n = signal.len();
        self.check(filter.sample_rate(), n, filter)?;
        let chunks = signal
            .chunks(self.config.chunk_len.max(1))
            .map(|c| Ok::<_, DspError>(c.to_vec()));
        let read_edge = |range: Range<usize>| -> Result<Vec<f64>> { Ok(signal[range].to_vec()) };
        let never = CancellationToken::new();
        self.run_channel(n, chunks, read_edge, filter, &never)?
            .ok_or_else(|| DspError::Source("filtering interrupted".to_string()))
    }

    fn check(&self, sample_rate: f64, n: usize, filter: &DesignedFilter) -> Result<()> {
        if self.config.chunk_len == 0 {
            return Err(DspError::parameter("chunk_len", "must be at least 1"));
        }
        if (sample_rate - filter.sample_rate()).abs() > 1e-9 * sample_rate {
            return Err(DspError::SamplingRateMismatch {
                expected: filter.sample_rate(),
                actual: sample_rate,
                context: "filter was designed for a different rate".to_string(),
            });
        }
        if n < filter.length() || n == 0 {
            return Err(DspError::InsufficientSamples {
                required: filter.length().max(1),
                available: n,
            });
        }
        Ok(())
    }

    /// Returns `Ok(None)` when cancelled between chunks
    fn run_channel<I, E>(
        &self,
        n: usize,
        chunks: I,
        read_edge: E,
        filter: &DesignedFilter,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<f64>>>
    where
        I: Iterator<Item = Result<Vec<f64>>>,
        E: Fn(Range<usize>) -> Result<Vec<f64>>,
    {
        let block_len = self.config.chunk_len;

        if filter.phase() == PhaseMode::Causal {
            let mut pass = ChunkFilter::new(filter, block_len);
            let mut out = Vec::with_capacity(n);
            for chunk in chunks {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                out.extend(pass.process(&chunk?));
            }
            return Ok(Some(out));
        }

        let pad = filter.length().saturating_sub(1).min(n - 1);
        let head = read_edge(0..pad + 1)?;
        let tail = read_edge(n - pad - 1..n)?;
        let padding = self.config.padding;
        let left: Vec<f64> = (0..pad)
            .map(|i| padded_sample(&head, i as isize - pad as isize, padding))
            .collect();
        let right: Vec<f64> = (0..pad)
            .map(|i| padded_sample(&tail, (pad + 1 + i) as isize, padding))
            .collect();

        // forward pass over left pad, source chunks, right pad
        let mut forward = ChunkFilter::new(filter, block_len);
        forward.prime(left.first().copied().unwrap_or(head[0]));
        let mut y = Vec::with_capacity(n + 2 * pad);
        y.extend(forward.process(&left));
        for chunk in chunks {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            y.extend(forward.process(&chunk?));
        }
        y.extend(forward.process(&right));

        // backward pass over the reversed forward output
        y.reverse();
        let mut backward = ChunkFilter::new(filter, block_len);
        backward.prime(y[0]);
        let mut z = Vec::with_capacity(y.len());
        for block in y.chunks(block_len) {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            z.extend(backward.process(block));
        }
        z.reverse();

        Ok(Some(z[pad..pad + n].to_vec()))
    }
}

/// Unfiltered copy of a channel, read chunk by chunk
fn copy_chunks<I>(n: usize, chunks: I, cancel: &CancellationToken) -> Result<Option<Vec<f64>>>
where
    I: Iterator<Item = Result<Vec<f64>>>,
{
    let mut out = Vec::with_capacity(n);
    for chunk in chunks {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        out.extend(chunk?);
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterDesigner, FilterSpec};
    use crate::types::ChannelInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_overlap_add_matches_full_convolution() {
        let signal: Vec<f64> = (0..500).map(|i| ((i * 37) % 101) as f64 / 50.0 - 1.0).collect();
        let kernel: Vec<f64> = (0..31).map(|i| 1.0 / (1.0 + i as f64)).collect();
        let full = fft::convolve(&signal, &kernel);

        for chunk_len in [1usize, 7, 30, 64, 500] {
            let mut ola = OverlapAdd::new(&kernel, 64);
            let mut out = Vec::new();
            for chunk in signal.chunks(chunk_len) {
                out.extend(ola.process(chunk));
            }
            assert_eq!(out.len(), signal.len());
            for (a, b) in out.iter().zip(&full) {
                assert!((a - b).abs() < 1e-9, "chunk_len {}", chunk_len);
            }
            assert_eq!(ola.pending().len(), kernel.len() - 1);
        }
    }

    #[test]
    fn test_padded_sample_policies() {
        let x = [1.0, 2.0, 4.0];
        assert_eq!(padded_sample(&x, -1, EdgePadding::OddReflect), 0.0);
        assert_eq!(padded_sample(&x, -2, EdgePadding::Reflect), 4.0);
        assert_eq!(padded_sample(&x, 3, EdgePadding::OddReflect), 6.0);
        assert_eq!(padded_sample(&x, 4, EdgePadding::Reflect), 1.0);
        assert_eq!(padded_sample(&x, 9, EdgePadding::Zero), 0.0);
    }

    #[test]
    fn test_chunk_size_does_not_change_output() {
        let fs = 250.0;
        let signal: Vec<f64> = (0..3000)
            .map(|i| {
                let t = i as f64 / fs;
                (2.0 * std::f64::consts::PI * 3.0 * t).sin() + 0.3 * (i % 7) as f64
            })
            .collect();
        let filter = FilterDesigner::new(fs)
            .design(&FilterSpec::bandpass(1.0, 30.0))
            .unwrap();

        let whole = StreamingFilterEngine::new(StreamingConfig {
            chunk_len: 10_000,
            ..Default::default()
        })
        .filter_signal(&signal, &filter)
        .unwrap();
        let pieces = StreamingFilterEngine::new(StreamingConfig {
            chunk_len: 97,
            ..Default::default()
        })
        .filter_signal(&signal, &filter)
        .unwrap();

        assert_eq!(whole.len(), signal.len());
        for (a, b) in whole.iter().zip(&pieces) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_iir_zero_phase_keeps_constant() {
        let filter = FilterDesigner::new(500.0)
            .design(&FilterSpec::lowpass(20.0).butterworth(4))
            .unwrap();
        let signal = vec![2.5; 2000];
        let out = StreamingFilterEngine::default()
            .filter_signal(&signal, &filter)
            .unwrap();
        for v in out {
            assert!((v - 2.5).abs() < 1e-9);
        }
    }

    #[test]
    fn test_recording_too_short_for_kernel() {
        let filter = FilterDesigner::new(1000.0)
            .design(&FilterSpec::lowpass(40.0).with_length(801))
            .unwrap();
        let err = StreamingFilterEngine::default()
            .filter_signal(&vec![0.0; 500], &filter)
            .unwrap_err();
        assert_eq!(
            err,
            DspError::InsufficientSamples {
                required: 801,
                available: 500
            }
        );
    }

    fn mixed_signal(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                (t * 0.05).sin() + 0.4 * (t * 0.31).cos() + 0.1 * (i % 5) as f64
            })
            .collect()
    }

    #[test]
    fn test_causal_filters_never_read_ahead() {
        let designer = FilterDesigner::new(500.0);
        let specs = [
            FilterSpec::bandpass(5.0, 30.0).with_phase(PhaseMode::Causal),
            FilterSpec::lowpass(20.0)
                .butterworth(4)
                .with_phase(PhaseMode::Causal),
        ];
        let n = 3000;
        let k = 1500;
        let signal = mixed_signal(n);
        let mut altered = signal.clone();
        altered[k..].iter_mut().for_each(|v| *v = -3.0 * *v + 7.0);

        let short = StreamingFilterEngine::new(StreamingConfig {
            chunk_len: 33,
            ..Default::default()
        });
        let long = StreamingFilterEngine::new(StreamingConfig {
            chunk_len: 10_000,
            ..Default::default()
        });

        for spec in specs {
            let filter = designer.design(&spec).unwrap();
            let a = short.filter_signal(&signal, &filter).unwrap();
            let b = long.filter_signal(&signal, &filter).unwrap();
            let c = short.filter_signal(&altered, &filter).unwrap();

            assert_eq!(a.len(), n);
            assert_eq!(b.len(), n);
            let label = filter.describe();
            for i in 0..n {
                assert!((a[i] - b[i]).abs() < 1e-12, "{}: chunking at {}", label, i);
            }
            for i in 0..k {
                assert!((a[i] - c[i]).abs() < 1e-12, "{}: look-ahead at {}", label, i);
            }
            assert!(a[k..].iter().zip(&c[k..]).any(|(x, y)| (x - y).abs() > 1e-3));
        }
    }

    #[test]
    fn test_causal_fir_impulse_response_is_kernel() {
        let filter = FilterDesigner::new(500.0)
            .design(&FilterSpec::lowpass(40.0).with_phase(PhaseMode::Causal))
            .unwrap();
        let taps = match filter.kernel() {
            FilterKernel::Fir(taps) => taps.clone(),
            FilterKernel::Iir(_) => panic!("expected an FIR kernel"),
        };
        let mut impulse = vec![0.0; 2 * taps.len()];
        impulse[0] = 1.0;

        let out = StreamingFilterEngine::new(StreamingConfig {
            chunk_len: 50,
            ..Default::default()
        })
        .filter_signal(&impulse, &filter)
        .unwrap();
        for (i, h) in taps.iter().enumerate() {
            assert!((out[i] - h).abs() < 1e-12, "tap {}", i);
        }
        assert!(out[taps.len()..].iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_edge_padding_policies_through_engine() {
        let filter = FilterDesigner::new(1000.0)
            .design(&FilterSpec::lowpass(40.0))
            .unwrap();
        let signal = vec![2.0; 4000];

        let reflect = StreamingFilterEngine::new(StreamingConfig {
            padding: EdgePadding::Reflect,
            ..Default::default()
        })
        .filter_signal(&signal, &filter)
        .unwrap();
        assert!(reflect.iter().all(|v| (v - 2.0).abs() < 1e-6));

        let zero = StreamingFilterEngine::new(StreamingConfig {
            padding: EdgePadding::Zero,
            ..Default::default()
        })
        .filter_signal(&signal, &filter)
        .unwrap();
        assert_eq!(zero.len(), signal.len());
        assert!((zero[0] - 2.0).abs() > 0.1);
        assert!((zero[3999] - 2.0).abs() > 0.1);
        assert!((zero[2000] - 2.0).abs() < 1e-6);
    }

    /// Source that records the largest read it was asked for
    struct MeteredSource {
        inner: Recording,
        largest_read: AtomicUsize,
    }

    impl SampleSource for MeteredSource {
        fn sample_rate(&self) -> f64 {
            self.inner.sample_rate()
        }

        fn channels(&self) -> &[ChannelInfo] {
            self.inner.channels()
        }

        fn n_samples(&self) -> usize {
            self.inner.n_samples()
        }

        fn read(&self, channels: &[usize], range: Range<usize>) -> Result<Vec<Vec<f64>>> {
            self.largest_read.fetch_max(range.len(), Ordering::SeqCst);
            self.inner.read(channels, range)
        }
    }

    #[test]
    fn test_stim_copy_reads_in_chunks() {
        let mut sti = vec![0.0; 5000];
        sti[1200..1210].iter_mut().for_each(|v| *v = 4.0);
        let rec =
            Recording::new(vec![ChannelInfo::stim("STI")], vec![sti.clone()], 1000.0).unwrap();
        let filter = FilterDesigner::new(1000.0)
            .design(&FilterSpec::lowpass(40.0))
            .unwrap();
        let source = MeteredSource {
            inner: rec,
            largest_read: AtomicUsize::new(0),
        };

        let engine = StreamingFilterEngine::new(StreamingConfig {
            chunk_len: 256,
            ..Default::default()
        });
        let (rows, completion) = engine
            .apply_source(&source, &filter, &RunControl::default())
            .unwrap();

        assert!(completion.is_complete());
        assert_eq!(rows[0].as_deref(), Some(sti.as_slice()));
        assert!(source.largest_read.load(Ordering::SeqCst) <= 256);
    }
}
