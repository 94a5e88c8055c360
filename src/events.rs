//! Event markers, event streams and annotations
//!
//! Events are sample-indexed and carry the sampling rate they were
//! indexed at, so a stream can never be silently applied to a recording
//! at another rate.

use crate::error::{DspError, Result};
use crate::types::{ChannelKind, Recording};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer trigger value or string label
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventCode {
    Int(i64),
    Label(String),
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCode::Int(v) => write!(f, "{}", v),
            EventCode::Label(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for EventCode {
    fn from(v: i64) -> Self {
        EventCode::Int(v)
    }
}

impl From<&str> for EventCode {
    fn from(v: &str) -> Self {
        EventCode::Label(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMarker {
    /// Sample index relative to the first sample of the recording
    pub sample: usize,
    pub code: EventCode,
}

impl EventMarker {
    pub fn new(sample: usize, code: impl Into<EventCode>) -> Self {
        Self {
            sample,
            code: code.into(),
        }
    }
}

/// Provider of event markers for a recording
pub trait EventSource {
    /// Rate at which the sample indices were taken
    fn sample_rate(&self) -> f64;

    /// Markers in time order
    fn events(&self) -> Result<Vec<EventMarker>>;
}

/// Time-ordered event markers. Several markers may share a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStream {
    sample_rate: f64,
    markers: Vec<EventMarker>,
}

impl EventStream {
    /// Markers are sorted by sample; ties keep their given order
    pub fn new(sample_rate: f64, mut markers: Vec<EventMarker>) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(DspError::parameter(
                "sample_rate",
                format!("must be positive, got {}", sample_rate),
            ));
        }
        markers.sort_by_key(|m| m.sample);
        Ok(Self {
            sample_rate,
            markers,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn markers(&self) -> &[EventMarker] {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Distinct codes, sorted
    pub fn codes(&self) -> Vec<EventCode> {
        let mut codes: Vec<EventCode> = self.markers.iter().map(|m| m.code.clone()).collect();
        codes.sort();
        codes.dedup();
        codes
    }

    /// Keep only markers whose code is in `codes`
    pub fn select(&self, codes: &[EventCode]) -> EventStream {
        EventStream {
            sample_rate: self.sample_rate,
            markers: self
                .markers
                .iter()
                .filter(|m| codes.contains(&m.code))
                .cloned()
                .collect(),
        }
    }

    /// Re-index markers for a recording resampled to `target_rate`
    pub fn resampled(&self, target_rate: f64) -> Result<EventStream> {
        if !(target_rate.is_finite() && target_rate > 0.0) {
            return Err(DspError::filter_spec(
                "target_rate",
                format!("must be positive, got {}", target_rate),
            ));
        }
        let scale = target_rate / self.sample_rate;
        let markers = self
            .markers
            .iter()
            .map(|m| EventMarker {
                sample: (m.sample as f64 * scale).round() as usize,
                code: m.code.clone(),
            })
            .collect();
        EventStream::new(target_rate, markers)
    }
}

impl EventSource for EventStream {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn events(&self) -> Result<Vec<EventMarker>> {
        Ok(self.markers.clone())
    }
}

/// Labelled time span of a recording, in seconds from its first sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub onset: f64,
    pub duration: f64,
    pub description: String,
}

impl Annotation {
    pub fn new(onset: f64, duration: f64, description: impl Into<String>) -> Self {
        Self {
            onset,
            duration,
            description: description.into(),
        }
    }

    /// Descriptions starting with "bad" (any case) mark unusable data
    pub fn is_bad(&self) -> bool {
        self.description
            .get(..3)
            .map(|p| p.eq_ignore_ascii_case("bad"))
            .unwrap_or(false)
    }

    /// Covered samples `[start, stop)` at `sample_rate`
    pub fn sample_range(&self, sample_rate: f64) -> (i64, i64) {
        let start = (self.onset * sample_rate).round() as i64;
        let stop = ((self.onset + self.duration) * sample_rate).round() as i64;
        (start, stop.max(start + 1))
    }

    /// Whether the annotation covers any sample of `[start, stop)`
    pub fn overlaps(&self, start: i64, stop: i64, sample_rate: f64) -> bool {
        let (a, b) = self.sample_range(sample_rate);
        a < stop && start < b
    }
}

fn default_shortest_event() -> usize {
    2
}

/// Settings for stim-channel event detection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FindEventsConfig {
    /// Minimum time (s) a value must persist to count as an event
    #[serde(default)]
    pub min_duration: f64,
    /// Minimum number of samples a value must persist
    #[serde(default = "default_shortest_event")]
    pub shortest_event: usize,
    /// Interpret values as 16-bit unsigned trigger words
    #[serde(default)]
    pub uint_cast: bool,
    /// Report a non-zero value already present at the first sample
    #[serde(default)]
    pub initial_event: bool,
}

impl Default for FindEventsConfig {
    fn default() -> Self {
        Self {
            min_duration: 0.0,
            shortest_event: default_shortest_event(),
            uint_cast: false,
            initial_event: false,
        }
    }
}

/// Detect step onsets on a stim channel
///
/// An event is emitted wherever the (integer) channel value changes to a
/// non-zero value. Steps shorter than `shortest_event` samples or
/// `min_duration` seconds are dropped.
pub fn find_events(
    recording: &Recording,
    stim_channel: &str,
    config: &FindEventsConfig,
) -> Result<EventStream> {
    let idx = recording.channel_index(stim_channel)?;
    if recording.channels()[idx].kind != ChannelKind::Stim {
        log::warn!("Channel '{}' is not a stim channel", stim_channel);
    }

    let values: Vec<i64> = recording
        .channel_data(idx)
        .iter()
        .map(|&v| {
            let v = v.round() as i64;
            if config.uint_cast {
                v & 0xFFFF
            } else {
                v
            }
        })
        .collect();

    let min_len = config
        .shortest_event
        .max((config.min_duration * recording.sample_rate()).ceil() as usize)
        .max(1);

    let mut markers = Vec::new();
    let mut dropped = 0usize;
    let mut i = 0;
    while i < values.len() {
        let value = values[i];
        let mut end = i + 1;
        while end < values.len() && values[end] == value {
            end += 1;
        }
        let is_onset = value != 0 && (i > 0 || config.initial_event);
        if is_onset {
            if end - i >= min_len {
                markers.push(EventMarker::new(i, value));
            } else {
                dropped += 1;
            }
        }
        i = end;
    }

    if dropped > 0 {
        log::warn!(
            "Dropped {} events shorter than {} samples on '{}'",
            dropped,
            min_len,
            stim_channel
        );
    }
    log::info!("Found {} events on '{}'", markers.len(), stim_channel);
    EventStream::new(recording.sample_rate(), markers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelInfo;

    fn stim_recording(values: Vec<f64>) -> Recording {
        Recording::new(vec![ChannelInfo::stim("STI 014")], vec![values], 100.0).unwrap()
    }

    #[test]
    fn test_find_events_onsets() {
        let mut stim = vec![0.0; 50];
        stim[10..15].iter_mut().for_each(|v| *v = 1.0);
        stim[15..18].iter_mut().for_each(|v| *v = 3.0);
        stim[30] = 2.0; // single sample, below shortest_event
        stim[40..44].iter_mut().for_each(|v| *v = 2.0);

        let events =
            find_events(&stim_recording(stim), "STI 014", &FindEventsConfig::default()).unwrap();
        let found: Vec<(usize, EventCode)> = events
            .markers()
            .iter()
            .map(|m| (m.sample, m.code.clone()))
            .collect();
        assert_eq!(
            found,
            vec![
                (10, EventCode::Int(1)),
                (15, EventCode::Int(3)),
                (40, EventCode::Int(2))
            ]
        );
    }

    #[test]
    fn test_initial_event_and_uint_cast() {
        let stim = vec![-1.0, -1.0, 0.0, 0.0, 5.0, 5.0];
        let config = FindEventsConfig {
            uint_cast: true,
            initial_event: true,
            ..Default::default()
        };
        let events = find_events(&stim_recording(stim.clone()), "STI 014", &config).unwrap();
        assert_eq!(events.markers()[0], EventMarker::new(0, 0xFFFF_i64));
        assert_eq!(events.len(), 2);

        let events =
            find_events(&stim_recording(stim), "STI 014", &FindEventsConfig::default()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_resampled_stream() {
        let stream = EventStream::new(
            1000.0,
            vec![EventMarker::new(1002, 1i64), EventMarker::new(10, "start")],
        )
        .unwrap();
        assert_eq!(stream.markers()[0].sample, 10);

        let down = stream.resampled(250.0).unwrap();
        assert_eq!(down.sample_rate(), 250.0);
        assert_eq!(down.markers()[1].sample, 251);
        assert_eq!(
            stream.codes(),
            vec![EventCode::Int(1), EventCode::Label("start".into())]
        );
    }

    #[test]
    fn test_bad_annotation_overlap() {
        let ann = Annotation::new(1.0, 0.5, "BAD_blink");
        assert!(ann.is_bad());
        assert!(!Annotation::new(0.0, 1.0, "stimulus").is_bad());
        assert!(ann.overlaps(140, 200, 100.0));
        assert!(!ann.overlaps(150, 200, 100.0));
        assert!(!ann.overlaps(0, 100, 100.0));
    }
}
