//! The error taxonomy of a batch run.
//!
//! Each component reports its own error type and every one of them converts into
//! [`WorkflowError`], which knows whether a failure ends the whole batch or only
//! the file it happened in.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::routing::ResolutionTier;
use crate::spectrum::ScanId;

/// Problems with the run configuration, detected before any file is touched.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Engine configuration file {0} does not exist")]
    MissingEngineConfig(PathBuf),
    #[error("Reference library {0} does not exist")]
    MissingReferenceLibrary(PathBuf),
    #[error("Output directory {0} does not exist")]
    MissingOutputDirectory(PathBuf),
    #[error("Scan routing table {0} does not exist")]
    MissingRouteTable(PathBuf),
    #[error("Input file {0} does not exist")]
    MissingInputFile(PathBuf),
    #[error("Input file {0} does not have a recognized extension")]
    UnrecognizedExtension(PathBuf),
    #[error("No input files were provided")]
    NoInputFiles,
    #[error("Input files {first} and {second} would both write their outputs under {stem}")]
    DuplicateOutputStem {
        stem: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("Requested {0} workers, at least one is required")]
    InvalidWorkerCount(usize),
    #[error("Invalid scan filter {filter:?} for routing key {key}: {source}")]
    InvalidScanFilter {
        key: String,
        filter: String,
        #[source]
        source: regex::Error,
    },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// A file's scans are inconsistent with the scan routing table.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Routing key {0} does not name a known acquisition parameter profile")]
    UnknownProfile(String),
    #[error("Routing key {key} (scan filter {filter:?}) matched no tandem scans")]
    NoScansMatched { key: String, filter: String },
    #[error("Scans {scans:?} are claimed by more than one routing key: {keys:?}")]
    OverlappingScans {
        scans: Vec<ScanId>,
        keys: Vec<String>,
    },
}

/// Failure to build a polarity's reference index.
#[derive(Debug, Error)]
pub enum LibraryBuildError {
    #[error(
        "The {tier} tier peak merge distance ({merge_distance} Da) must be exactly twice its window tolerance ({window_tolerance} Da)"
    )]
    TierInvariant {
        tier: ResolutionTier,
        merge_distance: f64,
        window_tolerance: f64,
    },
    #[error("Cannot build a reference index for unknown polarity")]
    UnknownPolarity,
    #[error("No reference catalog reader is available for {0}")]
    UnsupportedCatalog(PathBuf),
    #[error("Malformed reference catalog {path} at line {line}: {reason}")]
    MalformedCatalog {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("Reference entry {0} is not in the catalog")]
    MissingEntry(usize),
    #[error("Failed to read reference data from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to persist reference index {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure while processing a single file.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("No scan reader is available for {format} files ({path})")]
    NoReader { format: String, path: PathBuf },
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed scan data in {path}: {reason}")]
    MalformedInput { path: PathBuf, reason: String },
    #[error("Could not determine the polarity of {0}")]
    UnknownPolarity(PathBuf),
    #[error("{0} contains scans of more than one polarity")]
    MixedPolarity(PathBuf),
    #[error("Feature extraction failed: {0}")]
    Engine(String),
    #[error("Failed to read intermediate artifact {path}: {reason}")]
    Artifact { path: PathBuf, reason: String },
    #[error("Scans {scans:?} are routed to the {tier} tier but no {tier} reference index was built")]
    MissingTierIndex {
        tier: ResolutionTier,
        scans: Vec<ScanId>,
    },
    #[error("Job panicked: {0}")]
    Panicked(String),
    #[error("aborted")]
    Aborted,
}

/// Failure of the persisted run manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Illegal state transition for {file}: {from} -> {to}")]
    IllegalTransition {
        file: PathBuf,
        from: String,
        to: String,
    },
    #[error("{0} is not tracked by the run manifest")]
    UnknownFile(PathBuf),
    #[error("Failed to access run manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse run manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    LibraryBuild(#[from] LibraryBuildError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("Failed to write {path}: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkflowError {
    /// Whether this error ends the batch (or, for a library build, every file
    /// of the polarity group) rather than a single file.
    pub fn is_batch_fatal(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::LibraryBuild(_) | Self::Manifest(_) => true,
            Self::Validation(_) | Self::Processing(_) | Self::Export { .. } => false,
        }
    }

    pub fn export<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        Self::Export {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fatality() {
        let err: WorkflowError = ConfigurationError::InvalidWorkerCount(0).into();
        assert!(err.is_batch_fatal());
        let err: WorkflowError = LibraryBuildError::TierInvariant {
            tier: ResolutionTier::High,
            merge_distance: 0.03,
            window_tolerance: 0.01,
        }
        .into();
        assert!(err.is_batch_fatal());

        let err: WorkflowError = ValidationError::NoScansMatched {
            key: "ms2".into(),
            filter: "FTMS".into(),
        }
        .into();
        assert!(!err.is_batch_fatal());
        assert!(err.to_string().contains("ms2"));

        let err = WorkflowError::export(
            "out.csv",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_batch_fatal());
        let err: WorkflowError = ProcessingError::Aborted.into();
        assert!(!err.is_batch_fatal());
    }
}
