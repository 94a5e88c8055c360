//! Stage configuration bundle and cache keys
//!
//! Derived results are only valid for the exact parameters that produced
//! them. [`cache_key`] hashes the full serialized parameter set so any
//! change, however small, yields a different key.

use crate::epochs::EpochConfig;
use crate::error::{DspError, Result};
use crate::filter::FilterSpec;
use crate::resample::ResampleConfig;
use crate::spectral::SpectralConfig;
use crate::streaming::StreamingConfig;
use crate::tfr::TfrConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Hex SHA-256 of the JSON form of `value`
pub fn cache_key<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Parameters for every stage of a [`crate::pipeline::Pipeline`] run.
/// Absent stages are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub filter: Option<FilterSpec>,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub resample: Option<ResampleConfig>,
    #[serde(default)]
    pub epochs: Option<EpochConfig>,
    #[serde(default)]
    pub spectral: Option<SpectralConfig>,
    #[serde(default)]
    pub tfr: Option<TfrConfig>,
}

impl ProcessingConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DspError::Io(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json(&text)?;
        log::debug!("Loaded processing config from {}", path.display());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .map_err(|e| DspError::Io(format!("{}: {}", path.display(), e)))
    }

    pub fn cache_key(&self) -> Result<String> {
        cache_key(self)
    }
}
