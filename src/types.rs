//! Recording model shared by every processing stage.
//!
//! A [`Recording`] is never mutated by a stage. Each transformation builds a
//! new Recording through [`Recording::derive`], which records the parent's
//! provenance id and the step that produced it.

use crate::error::{DspError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Physiological channel category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Eeg,
    Meg,
    Eog,
    Ecg,
    Emg,
    Stim,
    EyeGaze,
    Pupil,
    Misc,
}

/// Channel identifier plus measurement metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel label (e.g. "Fp1", "MEG 0111", "DIN")
    pub label: String,
    pub kind: ChannelKind,
    /// Physical unit (e.g. "µV", "fT", "AU")
    pub unit: String,
}

impl ChannelInfo {
    pub fn new(label: impl Into<String>, kind: ChannelKind, unit: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind,
            unit: unit.into(),
        }
    }

    pub fn eeg(label: impl Into<String>) -> Self {
        Self::new(label, ChannelKind::Eeg, "µV")
    }

    pub fn stim(label: impl Into<String>) -> Self {
        Self::new(label, ChannelKind::Stim, "")
    }
}

/// Creation tag of an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Artifact this one was derived from
    pub parent: Option<Uuid>,
    /// Processing step that produced this artifact
    pub step: String,
}

impl Provenance {
    pub fn root(step: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            parent: None,
            step: step.into(),
        }
    }

    pub fn child(&self, step: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            parent: Some(self.id),
            step: step.into(),
        }
    }
}

/// Continuous multi-channel recording, stored channel-major
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    channels: Vec<ChannelInfo>,
    data: Vec<Vec<f64>>,
    sample_rate: f64,
    provenance: Provenance,
}

impl Recording {
    /// Create a root recording after validating its invariants
    pub fn new(channels: Vec<ChannelInfo>, data: Vec<Vec<f64>>, sample_rate: f64) -> Result<Self> {
        Self::build(channels, data, sample_rate, Provenance::root("source"))
    }

    /// Convenience constructor for EEG channels from plain labels
    pub fn from_labels<S: AsRef<str>>(
        labels: &[S],
        data: Vec<Vec<f64>>,
        sample_rate: f64,
    ) -> Result<Self> {
        let channels = labels.iter().map(|l| ChannelInfo::eeg(l.as_ref())).collect();
        Self::new(channels, data, sample_rate)
    }

    fn build(
        channels: Vec<ChannelInfo>,
        data: Vec<Vec<f64>>,
        sample_rate: f64,
        provenance: Provenance,
    ) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(DspError::parameter(
                "sample_rate",
                format!("must be a positive finite number, got {}", sample_rate),
            ));
        }
        if channels.len() != data.len() {
            return Err(DspError::parameter(
                "channels",
                format!(
                    "{} channel descriptors for {} data rows",
                    channels.len(),
                    data.len()
                ),
            ));
        }

        let mut seen = HashSet::with_capacity(channels.len());
        for ch in &channels {
            if !seen.insert(ch.label.as_str()) {
                return Err(DspError::parameter(
                    "channels",
                    format!("duplicate channel label '{}'", ch.label),
                ));
            }
        }

        if let Some(first) = data.first() {
            let n = first.len();
            if let Some((idx, row)) = data.iter().enumerate().find(|(_, r)| r.len() != n) {
                return Err(DspError::parameter(
                    "data",
                    format!(
                        "channel '{}' has {} samples, expected {}",
                        channels[idx].label,
                        row.len(),
                        n
                    ),
                ));
            }
        }

        Ok(Self {
            channels,
            data,
            sample_rate,
            provenance,
        })
    }

    /// Build a new recording derived from this one
    pub fn derive(
        &self,
        step: impl Into<String>,
        channels: Vec<ChannelInfo>,
        data: Vec<Vec<f64>>,
        sample_rate: f64,
    ) -> Result<Recording> {
        Self::build(channels, data, sample_rate, self.provenance.child(step))
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn nyquist(&self) -> f64 {
        self.sample_rate / 2.0
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn n_samples(&self) -> usize {
        self.data.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn duration(&self) -> f64 {
        self.n_samples() as f64 / self.sample_rate
    }

    pub fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label.clone()).collect()
    }

    pub fn channel_index(&self, label: &str) -> Result<usize> {
        self.channels
            .iter()
            .position(|c| c.label == label)
            .ok_or_else(|| DspError::ChannelNotFound(label.to_string()))
    }

    pub fn channel_data(&self, index: usize) -> &[f64] {
        &self.data[index]
    }

    pub fn data(&self) -> &[Vec<f64>] {
        &self.data
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Sample times in seconds relative to the first sample
    pub fn times(&self) -> Vec<f64> {
        (0..self.n_samples())
            .map(|i| i as f64 / self.sample_rate)
            .collect()
    }

    /// Keep samples in `[tmin, tmax)` seconds; `None` keeps the end
    pub fn crop(&self, tmin: f64, tmax: Option<f64>) -> Result<Recording> {
        let n = self.n_samples();
        let start = (tmin * self.sample_rate).round();
        let stop = tmax
            .map(|t| (t * self.sample_rate).round())
            .unwrap_or(n as f64);

        if start < 0.0 || stop > n as f64 || start >= stop {
            return Err(DspError::parameter(
                "tmin/tmax",
                format!(
                    "crop window [{}, {:?}) s is outside 0..{} s",
                    tmin,
                    tmax,
                    self.duration()
                ),
            ));
        }

        let (start, stop) = (start as usize, stop as usize);
        let data = self.data.iter().map(|c| c[start..stop].to_vec()).collect();
        self.derive(
            format!("crop {}..{} samples", start, stop),
            self.channels.clone(),
            data,
            self.sample_rate,
        )
    }

    /// Keep the named channels, in the order given
    pub fn pick_channels<S: AsRef<str>>(&self, labels: &[S]) -> Result<Recording> {
        let indices = labels
            .iter()
            .map(|l| self.channel_index(l.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.pick_indices(&indices, "pick channels")
    }

    /// Keep channels of the given kinds, preserving recording order
    pub fn pick_kinds(&self, kinds: &[ChannelKind]) -> Result<Recording> {
        let indices: Vec<usize> = self
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| kinds.contains(&c.kind))
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            return Err(DspError::parameter(
                "kinds",
                format!("no channels of kind {:?}", kinds),
            ));
        }
        self.pick_indices(&indices, "pick kinds")
    }

    pub(crate) fn pick_indices(&self, indices: &[usize], step: &str) -> Result<Recording> {
        let channels = indices.iter().map(|&i| self.channels[i].clone()).collect();
        let data = indices.iter().map(|&i| self.data[i].clone()).collect();
        self.derive(step, channels, data, self.sample_rate)
    }

    /// Join recordings end to end; all inputs must share rate and channels
    pub fn concatenate(recordings: &[Recording]) -> Result<Recording> {
        let first = recordings
            .first()
            .ok_or_else(|| DspError::parameter("recordings", "nothing to concatenate"))?;

        for other in &recordings[1..] {
            if (other.sample_rate - first.sample_rate).abs() > f64::EPSILON * first.sample_rate {
                return Err(DspError::SamplingRateMismatch {
                    expected: first.sample_rate,
                    actual: other.sample_rate,
                    context: "concatenate".to_string(),
                });
            }
            if other.channels != first.channels {
                return Err(DspError::parameter(
                    "recordings",
                    "channel sets differ between recordings",
                ));
            }
        }

        let total: usize = recordings.iter().map(|r| r.n_samples()).sum();
        let data = (0..first.n_channels())
            .map(|ch| {
                let mut joined = Vec::with_capacity(total);
                for rec in recordings {
                    joined.extend_from_slice(&rec.data[ch]);
                }
                joined
            })
            .collect();

        first.derive(
            format!("concatenate {} recordings", recordings.len()),
            first.channels.clone(),
            data,
            first.sample_rate,
        )
    }
}
