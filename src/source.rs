//! Sample source abstraction and bounded chunk iteration
//!
//! Readers of on-disk formats live outside this crate; they only need to
//! implement [`SampleSource`]. The engine pulls data through [`ChunkReader`],
//! which never holds more than one chunk per requested channel.

use crate::error::{DspError, Result};
use crate::types::{ChannelInfo, Recording};
use std::ops::Range;

/// Random-access sample provider
pub trait SampleSource: Send + Sync {
    /// Sampling rate in Hz
    fn sample_rate(&self) -> f64;

    /// Channel descriptors, in storage order
    fn channels(&self) -> &[ChannelInfo];

    /// Samples per channel
    fn n_samples(&self) -> usize;

    /// Read `range` for each channel index in `channels`
    ///
    /// Returns one vector per requested channel. Ranges need not align with
    /// any chunk size used by the caller.
    fn read(&self, channels: &[usize], range: Range<usize>) -> Result<Vec<Vec<f64>>>;
}

impl SampleSource for Recording {
    fn sample_rate(&self) -> f64 {
        Recording::sample_rate(self)
    }

    fn channels(&self) -> &[ChannelInfo] {
        Recording::channels(self)
    }

    fn n_samples(&self) -> usize {
        Recording::n_samples(self)
    }

    fn read(&self, channels: &[usize], range: Range<usize>) -> Result<Vec<Vec<f64>>> {
        check_read(self, channels, &range)?;
        Ok(channels
            .iter()
            .map(|&ch| self.channel_data(ch)[range.clone()].to_vec())
            .collect())
    }
}

/// Validate a read request against a source's shape
pub fn check_read<S: SampleSource + ?Sized>(
    source: &S,
    channels: &[usize],
    range: &Range<usize>,
) -> Result<()> {
    let n_channels = source.channels().len();
    if let Some(&bad) = channels.iter().find(|&&ch| ch >= n_channels) {
        return Err(DspError::Source(format!(
            "channel index {} out of range ({} channels)",
            bad, n_channels
        )));
    }
    if range.start > range.end || range.end > source.n_samples() {
        return Err(DspError::Source(format!(
            "sample range {:?} outside 0..{}",
            range,
            source.n_samples()
        )));
    }
    Ok(())
}

/// Read `range` of a single channel, rejecting replies of the wrong shape
pub fn read_channel<S: SampleSource + ?Sized>(
    source: &S,
    channel: usize,
    range: Range<usize>,
) -> Result<Vec<f64>> {
    let expected = range.len();
    let rows = source.read(&[channel], range)?;
    single_row(rows, channel, expected)
}

/// The only row of a one-channel read
pub(crate) fn single_row(rows: Vec<Vec<f64>>, channel: usize, expected: usize) -> Result<Vec<f64>> {
    let row = rows.into_iter().next().ok_or_else(|| {
        DspError::Source(format!("read of channel {} returned no rows", channel))
    })?;
    if row.len() != expected {
        return Err(DspError::Source(format!(
            "read of channel {} returned {} samples, expected {}",
            channel,
            row.len(),
            expected
        )));
    }
    Ok(row)
}

/// One block of consecutive samples for a channel set
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Absolute index of the first sample
    pub start: usize,
    /// One row per requested channel
    pub data: Vec<Vec<f64>>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over fixed-size chunks of a source, in sample order
pub struct ChunkReader<'a, S: SampleSource + ?Sized> {
    source: &'a S,
    channels: Vec<usize>,
    next: usize,
    end: usize,
    chunk_len: usize,
}

impl<'a, S: SampleSource + ?Sized> ChunkReader<'a, S> {
    pub fn new(source: &'a S, channels: Vec<usize>, chunk_len: usize) -> Result<Self> {
        let end = source.n_samples();
        Self::with_range(source, channels, 0..end, chunk_len)
    }

    pub fn with_range(
        source: &'a S,
        channels: Vec<usize>,
        range: Range<usize>,
        chunk_len: usize,
    ) -> Result<Self> {
        if chunk_len == 0 {
            return Err(DspError::parameter("chunk_len", "must be at least 1"));
        }
        check_read(source, &channels, &range)?;
        Ok(Self {
            source,
            channels,
            next: range.start,
            end: range.end,
            chunk_len,
        })
    }

    pub fn remaining(&self) -> usize {
        self.end - self.next
    }
}

impl<S: SampleSource + ?Sized> Iterator for ChunkReader<'_, S> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let stop = (start + self.chunk_len).min(self.end);
        self.next = stop;
        Some(
            self.source
                .read(&self.channels, start..stop)
                .map(|data| Chunk { start, data }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining().div_ceil(self.chunk_len);
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Recording {
        let a: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..n).map(|i| 2.0 * i as f64).collect();
        Recording::from_labels(&["A", "B"], vec![a, b], 10.0).unwrap()
    }

    #[test]
    fn test_chunks_cover_range_in_order() {
        let rec = ramp(23);
        let chunks: Vec<Chunk> = ChunkReader::new(&rec, vec![1], 5)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].len(), 3);
        let joined: Vec<f64> = chunks.iter().flat_map(|c| c.data[0].clone()).collect();
        assert_eq!(joined, rec.channel_data(1));
        assert_eq!(chunks[2].start, 10);
    }

    #[test]
    fn test_unaligned_read() {
        let rec = ramp(50);
        let block = rec.read(&[0, 1], 7..19).unwrap();
        assert_eq!(block[0].len(), 12);
        assert_eq!(block[1][0], 14.0);
    }

    #[test]
    fn test_out_of_range_read_fails() {
        let rec = ramp(10);
        assert!(rec.read(&[0], 5..11).is_err());
        assert!(rec.read(&[2], 0..1).is_err());
        assert!(ChunkReader::new(&rec, vec![0], 0).is_err());
    }

    /// Source whose reads come back with no rows
    struct Hollow(Recording);

    impl SampleSource for Hollow {
        fn sample_rate(&self) -> f64 {
            self.0.sample_rate()
        }

        fn channels(&self) -> &[ChannelInfo] {
            self.0.channels()
        }

        fn n_samples(&self) -> usize {
            self.0.n_samples()
        }

        fn read(&self, _channels: &[usize], _range: Range<usize>) -> Result<Vec<Vec<f64>>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_read_channel_checks_reply_shape() {
        let rec = ramp(20);
        assert_eq!(read_channel(&rec, 1, 2..5).unwrap(), vec![4.0, 6.0, 8.0]);
        assert!(matches!(
            read_channel(&Hollow(rec.clone()), 0, 0..20),
            Err(DspError::Source(_))
        ));
        assert!(matches!(
            single_row(vec![vec![1.0]], 0, 2),
            Err(DspError::Source(_))
        ));
    }
}
