//! Batch annotation of LC-MS/MS runs against a reference spectral library.
//!
//! Each input file goes through feature extraction, the precursors observed
//! across all files of a polarity select the reference spectra worth indexing,
//! and every file's routed tandem scans are then matched against that
//! polarity's resolution-tiered indices.
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod io;
pub mod library;
pub mod manifest;
pub mod params;
pub mod routing;
pub mod spectrum;
pub mod stages;
pub mod workflow;

pub use mzpeaks::Tolerance;

pub use crate::dispatch::{AbortHandle, Dispatcher, DispatchStrategy};
pub use crate::engine::{EngineConfig, ObservedFeature, ProcessingEngine, SimilarityScorer};
pub use crate::error::{
    ConfigurationError, LibraryBuildError, ManifestError, ProcessingError, ValidationError,
    WorkflowError,
};
pub use crate::io::{
    FormatRegistry, IntermediateArtifact, MGFReader, MSPReader, MzMLScanReader, ScanReader,
};
pub use crate::library::{build_reference_library, ReferenceIndex, ReferenceLibrary};
pub use crate::manifest::{FileState, RunManifest};
pub use crate::params::{WorkflowParameters, WorkflowRequest};
pub use crate::routing::{ResolutionTier, ScanRoute, ScanRouteTable};
pub use crate::spectrum::{Polarity, ScanCatalogue, ScanRecord};
pub use crate::stages::{MatchResult, Stage};
pub use crate::workflow::{BatchSummary, Workflow};
