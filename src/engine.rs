//! The processing engine: feature extraction from a file's scans and the spectral
//! similarity primitive used for matching.
//!
//! Both are traits so an embedding application can substitute its own signal
//! processing. The defaults, [`PrecursorClusterEngine`] and [`EntropySimilarity`],
//! need nothing beyond centroided tandem scans.
use std::fs;
use std::io;
use std::path::Path;

use mzpeaks::Tolerance;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, ProcessingError};
use crate::spectrum::{Polarity, ScanCatalogue, ScanId, ScanRecord};

mod features;
mod scoring;

pub use features::PrecursorClusterEngine;
pub use scoring::{EntropySimilarity, SimilarityScorer};

/// Configuration owned by the engine. The workflow only reads `profiles`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Names of the acquisition parameter profiles scan routing keys may refer to
    pub profiles: Vec<String>,
    /// Precursor m/z tolerance for grouping tandem scans into one feature
    pub feature_mz_tolerance_ppm: f64,
    /// Retention time window, in minutes, for grouping tandem scans into one feature
    pub feature_rt_window: f64,
    /// Tandem scans with fewer peaks are not attached to their feature
    pub min_tandem_peaks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profiles: vec!["ms1".to_string(), "ms2".to_string()],
            feature_mz_tolerance_ppm: 5.0,
            feature_rt_window: 0.5,
            min_tandem_peaks: 1,
        }
    }
}

impl EngineConfig {
    pub fn feature_tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.feature_mz_tolerance_ppm)
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, serde_json::Error> {
        serde_json::from_reader(reader)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigurationError::MissingEngineConfig(path.to_path_buf()));
        }
        let handle = fs::File::open(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(io::BufReader::new(handle)).map_err(|source| {
            ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

/// A chromatographic feature observed in one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedFeature {
    pub id: usize,
    pub mz: f64,
    /// Retention time of the apex, in minutes
    pub retention_time: f64,
    pub polarity: Polarity,
    pub apex_intensity: f32,
    pub isotopologue: bool,
    pub tandem_scans: Vec<ScanId>,
}

impl ObservedFeature {
    pub fn has_tandem(&self) -> bool {
        !self.tandem_scans.is_empty()
    }
}

/// The output of feature extraction: features and the tandem scans attached to them
#[derive(Debug, Clone, Default)]
pub struct ExtractedFeatures {
    pub features: Vec<ObservedFeature>,
    pub spectra: Vec<ScanRecord>,
}

impl ExtractedFeatures {
    /// Observed precursor masses of the features that carry tandem data
    pub fn precursor_masses(&self) -> Vec<f64> {
        self.features
            .iter()
            .filter(|f| f.has_tandem())
            .map(|f| f.mz)
            .collect()
    }
}

pub trait ProcessingEngine: Send + Sync {
    fn extract(
        &self,
        catalogue: &ScanCatalogue,
        config: &EngineConfig,
        polarity: Polarity,
    ) -> Result<ExtractedFeatures, ProcessingError>;
}
