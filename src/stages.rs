//! The two per-file stages of a batch: feature extraction and spectral matching.
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineConfig, ProcessingEngine, SimilarityScorer};
use crate::error::{ProcessingError, WorkflowError};
use crate::io::artifact::IntermediateArtifact;
use crate::io::export::export_annotations;
use crate::io::FormatRegistry;
use crate::library::{QuerySpectrum, ReferenceLibrary, SpectrumHit};
use crate::params::MatchingParameters;
use crate::routing::{ResolutionTier, ScanRouteTable};
use crate::spectrum::{Polarity, ScanId};

/// Where in the pipeline a file was when something happened to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PolarityDetection,
    FeatureExtraction,
    LibraryBuild,
    SpectralMatching,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolarityDetection => "polarity detection",
            Self::FeatureExtraction => "feature extraction",
            Self::LibraryBuild => "library build",
            Self::SpectralMatching => "spectral matching",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What feature extraction hands to the rest of the batch
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutput {
    pub polarity: Polarity,
    pub artifact_path: PathBuf,
    pub feature_count: usize,
    pub precursor_masses: Vec<f64>,
}

/// Parse a file, check its scans against the routing table, extract features
/// and persist the result as an [`IntermediateArtifact`]
pub struct FeatureExtraction<'a> {
    pub registry: &'a FormatRegistry,
    pub engine: &'a dyn ProcessingEngine,
    pub config: &'a EngineConfig,
    pub routes: &'a ScanRouteTable,
    pub output_directory: &'a Path,
}

impl FeatureExtraction<'_> {
    pub fn run(&self, path: &Path) -> Result<ExtractionOutput, WorkflowError> {
        let reader = self.registry.reader_for(path)?;
        let catalogue = reader.parse(path)?;
        if let Some(scan) = catalogue.duplicate_scan() {
            return Err(ProcessingError::MalformedInput {
                path: path.to_path_buf(),
                reason: format!("scan number {scan} is used by more than one spectrum"),
            }
            .into());
        }
        let polarity = match catalogue.polarity() {
            Some(Polarity::Unknown) => {
                return Err(ProcessingError::UnknownPolarity(path.to_path_buf()).into())
            }
            Some(polarity) => polarity,
            None => return Err(ProcessingError::MixedPolarity(path.to_path_buf()).into()),
        };
        debug!(
            "{}: read {} scans, {} tandem",
            path.display(),
            catalogue.len(),
            catalogue.tandem_scans().count()
        );

        let routes = self.routes.resolve(&catalogue, &self.config.profiles)?;
        let extracted = self.engine.extract(&catalogue, self.config, polarity)?;
        drop(catalogue);

        let precursor_masses = extracted.precursor_masses();
        let feature_count = extracted.features.len();
        info!(
            "{}: extracted {feature_count} features, {} with tandem scans, {} scans routed",
            path.display(),
            precursor_masses.len(),
            routes.routed_scan_count()
        );

        let artifact = IntermediateArtifact::new(
            path.to_path_buf(),
            polarity,
            extracted.features,
            extracted.spectra,
            routes,
            precursor_masses.clone(),
        );
        let artifact_path = IntermediateArtifact::path_for(self.output_directory, path);
        artifact.write_to(&artifact_path)?;

        Ok(ExtractionOutput {
            polarity,
            artifact_path,
            feature_count,
            precursor_masses,
        })
    }
}

/// The qualifying reference hits of one feature, best first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub feature_id: usize,
    pub hits: Vec<SpectrumHit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutput {
    pub export_path: PathBuf,
    pub matches: Vec<MatchResult>,
}

impl MatchOutput {
    pub fn hit_count(&self) -> usize {
        self.matches.iter().map(|m| m.hits.len()).sum()
    }
}

/// Score an artifact's routed scans against a polarity's reference library.
///
/// Each tier's bucket of routed scans is searched against that tier's index in
/// one call. A non-empty bucket for a tier without an index is an error.
pub fn match_artifact(
    artifact: &IntermediateArtifact,
    library: &ReferenceLibrary,
    scorer: &dyn SimilarityScorer,
    parameters: &MatchingParameters,
) -> Result<Vec<MatchResult>, ProcessingError> {
    if artifact.polarity != library.polarity {
        return Err(ProcessingError::MalformedInput {
            path: artifact.source.clone(),
            reason: format!(
                "{} artifact cannot be matched against a {} library",
                artifact.polarity, library.polarity
            ),
        });
    }

    let mut hits_by_scan: HashMap<ScanId, Vec<SpectrumHit>> = HashMap::new();
    for tier in ResolutionTier::ALL {
        let bucket = artifact.routes.bucket(tier);
        if bucket.is_empty() {
            continue;
        }
        let index = library
            .index(tier)
            .ok_or_else(|| ProcessingError::MissingTierIndex {
                tier,
                scans: bucket.clone(),
            })?;
        let queries: Vec<QuerySpectrum> = bucket
            .iter()
            .filter_map(|scan| artifact.spectrum(*scan))
            .filter_map(|scan| QuerySpectrum::from_scan(scan, &index.parameters))
            .collect();
        if queries.is_empty() {
            continue;
        }
        let hits = index.search_bucket(&queries, parameters.precursor_tolerance(), scorer);
        debug!(
            "{}: {} {tier} tier queries produced {} candidate hits",
            artifact.source.display(),
            queries.len(),
            hits.len()
        );
        for hit in hits {
            hits_by_scan.entry(hit.scan).or_default().push(hit);
        }
    }

    let mut matches = Vec::new();
    for feature in artifact.features.iter().filter(|f| f.has_tandem()) {
        let mut hits: Vec<SpectrumHit> = feature
            .tandem_scans
            .iter()
            .filter_map(|scan| hits_by_scan.get(scan))
            .flatten()
            .filter(|hit| hit.similarity > 0.0 && hit.similarity >= parameters.min_similarity)
            .cloned()
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.reference_id.cmp(&b.reference_id))
                .then_with(|| a.scan.cmp(&b.scan))
        });
        let mut seen = HashSet::new();
        hits.retain(|hit| seen.insert(hit.reference_id.clone()));
        hits.truncate(parameters.top_n);
        if !hits.is_empty() {
            matches.push(MatchResult {
                feature_id: feature.id,
                hits,
            });
        }
    }
    Ok(matches)
}

/// Load an artifact, match it and write its annotation table
pub struct SpectralMatching<'a> {
    pub library: &'a ReferenceLibrary,
    pub scorer: &'a dyn SimilarityScorer,
    pub parameters: &'a MatchingParameters,
    pub output_directory: &'a Path,
}

impl SpectralMatching<'_> {
    pub fn run(&self, artifact_path: &Path) -> Result<MatchOutput, WorkflowError> {
        let artifact = IntermediateArtifact::read_from(artifact_path)?;
        let matches = match_artifact(&artifact, self.library, self.scorer, self.parameters)?;
        let export_path = export_annotations(
            self.output_directory,
            &artifact.source,
            &artifact.features,
            &matches,
            &self.library.molecules,
        )
        .map_err(|source| {
            WorkflowError::export(
                crate::io::export::annotation_path(self.output_directory, &artifact.source),
                source,
            )
        })?;
        let output = MatchOutput {
            export_path,
            matches,
        };
        info!(
            "{}: {} features annotated with {} hits",
            artifact.source.display(),
            output.matches.len(),
            output.hit_count()
        );
        Ok(output)
    }
}
