//! Event-anchored epoch extraction, baseline correction and rejection
//!
//! Every event yields exactly one outcome: a retained epoch, a rejected
//! epoch (with every reason that applied), or a skipped event (with the
//! error that prevented extraction). Rejection is a status, never an
//! error. Per-event work fans out into pre-allocated slots indexed by the
//! event's position, so the epoch order always follows the event order.

use crate::control::{Completion, RunControl};
use crate::error::{DspError, Result};
use crate::events::{Annotation, EventCode, EventMarker, EventSource};
use crate::profile_scope;
use crate::source::SampleSource;
use crate::types::{ChannelInfo, ChannelKind, Provenance, Recording};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Baseline interval in seconds relative to the event; `None` extends to
/// the corresponding epoch bound. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
}

impl Baseline {
    pub fn new(start: Option<f64>, end: Option<f64>) -> Self {
        Self { start, end }
    }
}

/// Peak-to-peak thresholds by channel kind, with per-label overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectionCriteria {
    #[serde(default)]
    pub by_kind: BTreeMap<ChannelKind, f64>,
    #[serde(default)]
    pub by_channel: BTreeMap<String, f64>,
}

impl RejectionCriteria {
    pub fn kind(mut self, kind: ChannelKind, threshold: f64) -> Self {
        self.by_kind.insert(kind, threshold);
        self
    }

    pub fn channel(mut self, label: impl Into<String>, threshold: f64) -> Self {
        self.by_channel.insert(label.into(), threshold);
        self
    }

    pub fn threshold_for(&self, channel: &ChannelInfo) -> Option<f64> {
        self.by_channel
            .get(&channel.label)
            .or_else(|| self.by_kind.get(&channel.kind))
            .copied()
    }
}

fn default_tmin() -> f64 {
    -0.2
}

fn default_tmax() -> f64 {
    0.5
}

fn default_baseline() -> Option<Baseline> {
    Some(Baseline::new(None, Some(0.0)))
}

fn default_true() -> bool {
    true
}

/// Epoching parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochConfig {
    /// Window start relative to the event (s)
    #[serde(default = "default_tmin")]
    pub tmin: f64,
    /// Window end relative to the event (s), exclusive
    #[serde(default = "default_tmax")]
    pub tmax: f64,
    #[serde(default = "default_baseline")]
    pub baseline: Option<Baseline>,
    /// Condition name to event code; when absent every event is epoched
    /// under its own code
    #[serde(default)]
    pub event_id: Option<BTreeMap<String, EventCode>>,
    /// Maximum peak-to-peak amplitude per channel
    #[serde(default)]
    pub reject: Option<RejectionCriteria>,
    /// Minimum peak-to-peak amplitude per channel
    #[serde(default)]
    pub flat: Option<RejectionCriteria>,
    /// Reject epochs overlapping a "BAD" annotation
    #[serde(default = "default_true")]
    pub reject_by_annotation: bool,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            tmin: default_tmin(),
            tmax: default_tmax(),
            baseline: default_baseline(),
            event_id: None,
            reject: None,
            flat: None,
            reject_by_annotation: true,
        }
    }
}

impl EpochConfig {
    pub fn new(tmin: f64, tmax: f64) -> Self {
        Self {
            tmin,
            tmax,
            ..Default::default()
        }
    }

    pub fn cache_key(&self) -> Result<String> {
        crate::config::cache_key(self)
    }
}

/// Why an epoch was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    PeakToPeak {
        channel: String,
        peak_to_peak: f64,
        threshold: f64,
    },
    Flat {
        channel: String,
        peak_to_peak: f64,
        threshold: f64,
    },
    BadSegment {
        description: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EpochStatus {
    Retained,
    /// Every offending channel and annotation, in channel order
    Rejected { reasons: Vec<RejectionReason> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    /// Position of the anchoring event in the event source
    pub event_index: usize,
    pub event: EventMarker,
    pub condition: String,
    /// First source sample of the window
    pub start_sample: usize,
    /// `[channel][time]`, baseline-corrected
    pub data: Vec<Vec<f64>>,
    /// Channels that failed a reject or flat threshold
    pub channel_flags: Vec<bool>,
    pub status: EpochStatus,
}

impl Epoch {
    pub fn is_retained(&self) -> bool {
        matches!(self.status, EpochStatus::Retained)
    }

    pub fn reasons(&self) -> &[RejectionReason] {
        match &self.status {
            EpochStatus::Retained => &[],
            EpochStatus::Rejected { reasons } => reasons,
        }
    }
}

/// An event that produced no epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEvent {
    pub event_index: usize,
    pub event: EventMarker,
    pub reason: DspError,
}

/// Resolved sample geometry of an epoch window
#[derive(Debug, Clone, PartialEq)]
struct EpochWindow {
    /// Offset of the first sample from the event
    offset: i64,
    n_times: usize,
    baseline: Option<Range<usize>>,
}

/// Epochs extracted from one recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSet {
    channels: Vec<ChannelInfo>,
    sample_rate: f64,
    tmin: f64,
    n_times: usize,
    epochs: Vec<Epoch>,
    skipped: Vec<SkippedEvent>,
    config: EpochConfig,
    completion: Completion,
    provenance: Provenance,
}

impl EpochSet {
    pub fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label.clone()).collect()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Time of the first epoch sample relative to the event (s)
    pub fn tmin(&self) -> f64 {
        self.tmin
    }

    pub fn n_times(&self) -> usize {
        self.n_times
    }

    pub fn times(&self) -> Vec<f64> {
        (0..self.n_times)
            .map(|i| self.tmin + i as f64 / self.sample_rate)
            .collect()
    }

    /// All extracted epochs, retained and rejected, in event order
    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn skipped(&self) -> &[SkippedEvent] {
        &self.skipped
    }

    pub fn config(&self) -> &EpochConfig {
        &self.config
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn retained(&self) -> impl Iterator<Item = &Epoch> {
        self.epochs.iter().filter(|e| e.is_retained())
    }

    pub fn rejected(&self) -> impl Iterator<Item = &Epoch> {
        self.epochs.iter().filter(|e| !e.is_retained())
    }

    pub fn n_retained(&self) -> usize {
        self.retained().count()
    }

    /// Distinct condition names, sorted
    pub fn conditions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.epochs.iter().map(|e| e.condition.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Mean of the retained epochs, optionally restricted to one condition
    pub fn average(&self, condition: Option<&str>) -> Result<Evoked> {
        let selected: Vec<&Epoch> = self
            .retained()
            .filter(|e| condition.map_or(true, |c| e.condition == c))
            .collect();
        if selected.is_empty() {
            return Err(DspError::parameter(
                "condition",
                format!("no retained epochs for {:?}", condition),
            ));
        }

        let n_channels = self.channels.len();
        let mut data = vec![vec![0.0; self.n_times]; n_channels];
        for epoch in &selected {
            for (acc, row) in data.iter_mut().zip(&epoch.data) {
                for (a, v) in acc.iter_mut().zip(row) {
                    *a += v;
                }
            }
        }
        let nave = selected.len();
        for row in data.iter_mut() {
            for v in row.iter_mut() {
                *v /= nave as f64;
            }
        }

        Ok(Evoked {
            channels: self.channels.clone(),
            sample_rate: self.sample_rate,
            tmin: self.tmin,
            data,
            nave,
            condition: condition.map(str::to_string),
            provenance: self
                .provenance
                .child(format!("average of {} epochs", nave)),
        })
    }
}

/// Average response over retained epochs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evoked {
    pub channels: Vec<ChannelInfo>,
    pub sample_rate: f64,
    pub tmin: f64,
    /// `[channel][time]`
    pub data: Vec<Vec<f64>>,
    /// Number of epochs averaged
    pub nave: usize,
    pub condition: Option<String>,
    pub provenance: Provenance,
}

impl Evoked {
    pub fn times(&self) -> Vec<f64> {
        let n = self.data.first().map(|r| r.len()).unwrap_or(0);
        (0..n)
            .map(|i| self.tmin + i as f64 / self.sample_rate)
            .collect()
    }

    pub fn channel_data(&self, label: &str) -> Result<&[f64]> {
        self.channels
            .iter()
            .position(|c| c.label == label)
            .map(|i| self.data[i].as_slice())
            .ok_or_else(|| DspError::ChannelNotFound(label.to_string()))
    }
}

/// Slices continuous data into event-anchored epochs
#[derive(Debug, Clone, Default)]
pub struct EpochExtractor {
    config: EpochConfig,
    annotations: Vec<Annotation>,
}

impl EpochExtractor {
    pub fn new(config: EpochConfig) -> Self {
        Self {
            config,
            annotations: Vec::new(),
        }
    }

    pub fn with_annotations(mut self, annotations: Vec<Annotation>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn config(&self) -> &EpochConfig {
        &self.config
    }

    /// Extract epochs from a recording, recording it as the parent
    pub fn extract_recording<E: EventSource + ?Sized>(
        &self,
        recording: &Recording,
        events: &E,
        control: &RunControl,
    ) -> Result<EpochSet> {
        let mut set = self.extract(recording, events, control)?;
        set.provenance = recording.provenance().child(format!(
            "epochs [{}, {}) s, {} extracted",
            self.config.tmin,
            self.config.tmax,
            set.epochs.len()
        ));
        Ok(set)
    }

    pub fn extract<S, E>(&self, source: &S, events: &E, control: &RunControl) -> Result<EpochSet>
    where
        S: SampleSource + ?Sized,
        E: EventSource + ?Sized,
    {
        let sample_rate = source.sample_rate();
        if (events.sample_rate() - sample_rate).abs() > 1e-9 * sample_rate {
            return Err(DspError::SamplingRateMismatch {
                expected: sample_rate,
                actual: events.sample_rate(),
                context: "event stream".to_string(),
            });
        }
        let window = self.window(sample_rate)?;

        let candidates: Vec<(usize, EventMarker, String)> = events
            .events()?
            .into_iter()
            .enumerate()
            .filter_map(|(idx, marker)| {
                let condition = self.condition_for(&marker.code)?;
                Some((idx, marker, condition))
            })
            .collect();

        profile_scope!("epochs");
        log::info!(
            "Extracting {} epochs of {} samples",
            candidates.len(),
            window.n_times
        );

        let n_channels = source.channels().len();
        let all_channels: Vec<usize> = (0..n_channels).collect();
        let (slots, completion) = control.fan_out(candidates.len(), |i, _| {
            let (idx, marker, condition) = &candidates[i];
            Some(self.extract_one(source, &all_channels, &window, *idx, marker, condition))
        });

        let mut epochs = Vec::new();
        let mut skipped = Vec::new();
        for (slot, (idx, marker, _)) in slots.into_iter().zip(&candidates) {
            match slot {
                Some(Ok(epoch)) => epochs.push(epoch),
                Some(Err(err)) if !err.is_fatal() => {
                    log::warn!("Skipping event {} at sample {}: {}", idx, marker.sample, err);
                    skipped.push(SkippedEvent {
                        event_index: *idx,
                        event: marker.clone(),
                        reason: err,
                    });
                }
                Some(Err(err)) => return Err(err),
                None => {}
            }
        }

        let n_rejected = epochs.iter().filter(|e| !e.is_retained()).count();
        log::info!(
            "{} epochs extracted ({} rejected), {} events skipped",
            epochs.len(),
            n_rejected,
            skipped.len()
        );

        Ok(EpochSet {
            channels: source.channels().to_vec(),
            sample_rate,
            tmin: window.offset as f64 / sample_rate,
            n_times: window.n_times,
            epochs,
            skipped,
            config: self.config.clone(),
            completion,
            provenance: Provenance::root("epochs"),
        })
    }

    fn condition_for(&self, code: &EventCode) -> Option<String> {
        match &self.config.event_id {
            None => Some(code.to_string()),
            Some(map) => map
                .iter()
                .find(|(_, c)| *c == code)
                .map(|(name, _)| name.clone()),
        }
    }

    fn window(&self, sample_rate: f64) -> Result<EpochWindow> {
        let EpochConfig { tmin, tmax, .. } = self.config;
        let first = (tmin * sample_rate).round() as i64;
        let last = (tmax * sample_rate).round() as i64;
        if !(tmin.is_finite() && tmax.is_finite()) || last <= first {
            return Err(DspError::parameter(
                "tmin/tmax",
                format!("window [{}, {}) s holds no samples", tmin, tmax),
            ));
        }
        let n_times = (last - first) as usize;

        let baseline = match self.config.baseline {
            None => None,
            Some(Baseline { start, end }) => {
                let eps = 0.5 / sample_rate;
                let b_start = start.unwrap_or(tmin);
                let b_end = end.unwrap_or(tmax);
                if b_start < tmin - eps || b_end > tmax + eps || b_start > b_end {
                    return Err(DspError::parameter(
                        "baseline",
                        format!(
                            "[{}, {}] s is not inside the epoch window [{}, {}) s",
                            b_start, b_end, tmin, tmax
                        ),
                    ));
                }
                let lo = start.map_or(0, |t| (t * sample_rate).round() as i64 - first);
                let hi = end.map_or(n_times as i64, |t| {
                    (t * sample_rate).round() as i64 - first + 1
                });
                let lo = lo.clamp(0, n_times as i64) as usize;
                let hi = hi.clamp(0, n_times as i64) as usize;
                if lo >= hi {
                    return Err(DspError::parameter(
                        "baseline",
                        format!("[{}, {}] s covers no samples", b_start, b_end),
                    ));
                }
                Some(lo..hi)
            }
        };

        Ok(EpochWindow {
            offset: first,
            n_times,
            baseline,
        })
    }

    fn extract_one<S: SampleSource + ?Sized>(
        &self,
        source: &S,
        channels: &[usize],
        window: &EpochWindow,
        event_index: usize,
        marker: &EventMarker,
        condition: &str,
    ) -> Result<Epoch> {
        let n = source.n_samples();
        if marker.sample >= n {
            return Err(DspError::MissingEvent {
                sample: marker.sample,
                n_samples: n,
            });
        }

        let start = marker.sample as i64 + window.offset;
        let stop = start + window.n_times as i64;
        if start < 0 || stop > n as i64 {
            let available = (stop.min(n as i64) - start.max(0)).max(0) as usize;
            return Err(DspError::InsufficientSamples {
                required: window.n_times,
                available,
            });
        }
        let (start, stop) = (start as usize, stop as usize);

        let mut data = source.read(channels, start..stop)?;
        let infos = source.channels();

        if let Some(range) = &window.baseline {
            for (row, info) in data.iter_mut().zip(infos) {
                if info.kind == ChannelKind::Stim {
                    continue;
                }
                let mean = row[range.clone()].iter().sum::<f64>() / range.len() as f64;
                for v in row.iter_mut() {
                    *v -= mean;
                }
            }
        }

        let mut reasons = Vec::new();
        let mut channel_flags = vec![false; data.len()];
        for (ch, (row, info)) in data.iter().zip(infos).enumerate() {
            let ptp = peak_to_peak(row);
            if let Some(threshold) = self.config.reject.as_ref().and_then(|r| r.threshold_for(info)) {
                if ptp > threshold {
                    channel_flags[ch] = true;
                    reasons.push(RejectionReason::PeakToPeak {
                        channel: info.label.clone(),
                        peak_to_peak: ptp,
                        threshold,
                    });
                }
            }
            if let Some(threshold) = self.config.flat.as_ref().and_then(|r| r.threshold_for(info)) {
                if ptp < threshold {
                    channel_flags[ch] = true;
                    reasons.push(RejectionReason::Flat {
                        channel: info.label.clone(),
                        peak_to_peak: ptp,
                        threshold,
                    });
                }
            }
        }

        if self.config.reject_by_annotation {
            let rate = source.sample_rate();
            for ann in &self.annotations {
                if ann.is_bad() && ann.overlaps(start as i64, stop as i64, rate) {
                    reasons.push(RejectionReason::BadSegment {
                        description: ann.description.clone(),
                    });
                }
            }
        }

        let status = if reasons.is_empty() {
            EpochStatus::Retained
        } else {
            EpochStatus::Rejected { reasons }
        };

        Ok(Epoch {
            event_index,
            event: marker.clone(),
            condition: condition.to_string(),
            start_sample: start,
            data,
            channel_flags,
            status,
        })
    }
}

fn peak_to_peak(row: &[f64]) -> f64 {
    let (min, max) = row
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if row.is_empty() {
        0.0
    } else {
        max - min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStream;

    fn ramp_recording(n: usize) -> Recording {
        let a: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Recording::from_labels(&["Cz"], vec![a], 1000.0).unwrap()
    }

    #[test]
    fn test_window_geometry() {
        let rec = ramp_recording(3000);
        let events = EventStream::new(1000.0, vec![EventMarker::new(1000, 1i64)]).unwrap();
        let config = EpochConfig {
            baseline: None,
            ..EpochConfig::new(-0.2, 0.5)
        };
        let set = EpochExtractor::new(config)
            .extract_recording(&rec, &events, &RunControl::default())
            .unwrap();

        let epoch = &set.epochs()[0];
        assert_eq!(epoch.data[0].len(), 700);
        assert_eq!(epoch.start_sample, 800);
        assert_eq!(epoch.data[0][0], 800.0);
        assert_eq!(epoch.data[0][699], 1499.0);
        assert!((set.tmin() + 0.2).abs() < 1e-12);
        assert_eq!(epoch.condition, "1");
    }

    #[test]
    fn test_baseline_outside_window_is_invalid() {
        let rec = ramp_recording(3000);
        let events = EventStream::new(1000.0, vec![EventMarker::new(1000, 1i64)]).unwrap();
        let config = EpochConfig {
            baseline: Some(Baseline::new(Some(-0.5), Some(0.0))),
            ..EpochConfig::new(-0.2, 0.5)
        };
        let err = EpochExtractor::new(config)
            .extract(&rec, &events, &RunControl::default())
            .unwrap_err();
        assert!(matches!(err, DspError::InvalidParameter { ref name, .. } if name == "baseline"));
    }

    #[test]
    fn test_event_selection_by_condition() {
        let rec = ramp_recording(5000);
        let events = EventStream::new(
            1000.0,
            vec![
                EventMarker::new(1000, 1i64),
                EventMarker::new(2000, 2i64),
                EventMarker::new(3000, 1i64),
            ],
        )
        .unwrap();
        let mut event_id = BTreeMap::new();
        event_id.insert("auditory".to_string(), EventCode::Int(1));
        let config = EpochConfig {
            event_id: Some(event_id),
            ..Default::default()
        };
        let set = EpochExtractor::new(config)
            .extract(&rec, &events, &RunControl::default())
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.epochs()[1].event_index, 2);
        assert_eq!(set.conditions(), vec!["auditory".to_string()]);
    }

    #[test]
    fn test_flat_and_annotation_rejection() {
        let flat = vec![0.0; 2000];
        let rec = Recording::from_labels(&["Cz"], vec![flat], 1000.0).unwrap();
        let events = EventStream::new(
            1000.0,
            vec![EventMarker::new(500, 1i64), EventMarker::new(1500, 1i64)],
        )
        .unwrap();
        let config = EpochConfig {
            flat: Some(RejectionCriteria::default().kind(ChannelKind::Eeg, 1e-6)),
            ..EpochConfig::new(-0.1, 0.1)
        };
        let set = EpochExtractor::new(config)
            .with_annotations(vec![Annotation::new(1.45, 0.1, "bad_movement")])
            .extract(&rec, &events, &RunControl::default())
            .unwrap();

        assert_eq!(set.n_retained(), 0);
        assert!(matches!(set.epochs()[0].reasons(), [RejectionReason::Flat { .. }]));
        assert_eq!(set.epochs()[1].reasons().len(), 2);
        assert!(matches!(
            set.epochs()[1].reasons()[1],
            RejectionReason::BadSegment { .. }
        ));
    }

    #[test]
    fn test_rate_mismatch() {
        let rec = ramp_recording(3000);
        let events = EventStream::new(500.0, vec![EventMarker::new(100, 1i64)]).unwrap();
        let err = EpochExtractor::default()
            .extract(&rec, &events, &RunControl::default())
            .unwrap_err();
        assert!(matches!(err, DspError::SamplingRateMismatch { .. }));
    }
}
