//! Run configuration: the user-facing parameter file and the validated,
//! immutable [`WorkflowRequest`] built from it.
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use mzpeaks::Tolerance;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ConfigurationError, LibraryBuildError};
use crate::io::artifact::output_stem;
use crate::io::FormatRegistry;
use crate::routing::ResolutionTier;
use crate::spectrum::PeakCleaning;

/// Parameters of one resolution tier's reference index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierParameters {
    /// Peaks closer than this are merged when indexing
    pub merge_distance_da: f64,
    /// Fragment matching tolerance used when scoring against the index. Must be
    /// exactly half of `merge_distance_da`.
    pub window_tolerance_da: f64,
    pub max_indexed_mz: f64,
    pub noise_threshold: f32,
    #[serde(default)]
    pub precursor_removal_da: Option<f64>,
    /// Peaks closer than this are merged in query spectra before searching
    pub query_peak_separation_da: f64,
}

impl TierParameters {
    pub const fn high_resolution() -> Self {
        Self {
            merge_distance_da: 0.02,
            window_tolerance_da: 0.01,
            max_indexed_mz: 3000.0,
            noise_threshold: 0.0,
            precursor_removal_da: None,
            query_peak_separation_da: 0.01,
        }
    }

    pub const fn low_resolution() -> Self {
        Self {
            merge_distance_da: 0.4,
            window_tolerance_da: 0.2,
            max_indexed_mz: 3000.0,
            noise_threshold: 0.0,
            precursor_removal_da: None,
            query_peak_separation_da: 0.3,
        }
    }

    pub fn validate(&self, tier: ResolutionTier) -> Result<(), LibraryBuildError> {
        if self.merge_distance_da != 2.0 * self.window_tolerance_da {
            Err(LibraryBuildError::TierInvariant {
                tier,
                merge_distance: self.merge_distance_da,
                window_tolerance: self.window_tolerance_da,
            })
        } else {
            Ok(())
        }
    }

    pub fn index_cleaning(&self, normalize: bool) -> PeakCleaning {
        PeakCleaning {
            merge_distance_da: self.merge_distance_da,
            max_mz: Some(self.max_indexed_mz),
            noise_threshold: self.noise_threshold,
            precursor_removal_da: self.precursor_removal_da,
            normalize,
        }
    }

    pub fn query_cleaning(&self) -> PeakCleaning {
        PeakCleaning {
            merge_distance_da: self.query_peak_separation_da,
            max_mz: Some(self.max_indexed_mz),
            noise_threshold: self.noise_threshold,
            precursor_removal_da: self.precursor_removal_da,
            normalize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryParameters {
    /// Precursor tolerance for selecting reference entries, in ppm
    pub ppm_tolerance: f64,
    /// Scale each reference spectrum so its intensities sum to 1
    pub normalize: bool,
    pub high_resolution: TierParameters,
    pub low_resolution: TierParameters,
}

impl Default for LibraryParameters {
    fn default() -> Self {
        Self {
            ppm_tolerance: 10.0,
            normalize: true,
            high_resolution: TierParameters::high_resolution(),
            low_resolution: TierParameters::low_resolution(),
        }
    }
}

impl LibraryParameters {
    pub fn tier(&self, tier: ResolutionTier) -> &TierParameters {
        match tier {
            ResolutionTier::High => &self.high_resolution,
            ResolutionTier::Low => &self.low_resolution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingParameters {
    /// Precursor tolerance between a query scan and an indexed reference, in ppm
    pub precursor_tolerance_ppm: f64,
    pub min_similarity: f64,
    /// Most hits reported per feature
    pub top_n: usize,
}

impl MatchingParameters {
    pub fn precursor_tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.precursor_tolerance_ppm)
    }
}

impl Default for MatchingParameters {
    fn default() -> Self {
        Self {
            precursor_tolerance_ppm: 10.0,
            min_similarity: 0.0,
            top_n: 5,
        }
    }
}

/// Split a comma-delimited list of paths, dropping empty items
pub fn split_file_paths(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn deserialize_file_paths<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<PathBuf>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FilePaths {
        List(Vec<PathBuf>),
        Joined(String),
    }

    Ok(match FilePaths::deserialize(deserializer)? {
        FilePaths::List(paths) => paths,
        FilePaths::Joined(text) => split_file_paths(&text),
    })
}

/// The workflow parameter file, as written by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowParameters {
    /// A list of paths, or a single comma-delimited string
    #[serde(deserialize_with = "deserialize_file_paths")]
    pub file_paths: Vec<PathBuf>,
    pub output_directory: PathBuf,
    pub engine_config_path: PathBuf,
    pub reference_library_path: PathBuf,
    pub scan_routes_path: Option<PathBuf>,
    pub cores: usize,
    pub library: LibraryParameters,
    pub matching: MatchingParameters,
    pub resume: bool,
    pub cache_index: bool,
}

impl Default for WorkflowParameters {
    fn default() -> Self {
        Self {
            file_paths: Vec::new(),
            output_directory: PathBuf::from("."),
            engine_config_path: PathBuf::from("engine.json"),
            reference_library_path: PathBuf::from("library.msp"),
            scan_routes_path: None,
            cores: 1,
            library: LibraryParameters::default(),
            matching: MatchingParameters::default(),
            resume: false,
            cache_index: false,
        }
    }
}

impl WorkflowParameters {
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, serde_json::Error> {
        serde_json::from_reader(reader)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
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

    /// Run the pre-flight checks and freeze the parameters into a request.
    ///
    /// Any failure here is fatal to the whole batch.
    pub fn into_request(
        self,
        registry: &FormatRegistry,
    ) -> Result<WorkflowRequest, ConfigurationError> {
        if self.cores < 1 {
            return Err(ConfigurationError::InvalidWorkerCount(self.cores));
        }
        if !self.engine_config_path.is_file() {
            return Err(ConfigurationError::MissingEngineConfig(
                self.engine_config_path,
            ));
        }
        if !self.reference_library_path.exists() {
            return Err(ConfigurationError::MissingReferenceLibrary(
                self.reference_library_path,
            ));
        }
        if !self.output_directory.is_dir() {
            return Err(ConfigurationError::MissingOutputDirectory(
                self.output_directory,
            ));
        }
        if let Some(routes) = self.scan_routes_path.as_ref() {
            if !routes.is_file() {
                return Err(ConfigurationError::MissingRouteTable(routes.clone()));
            }
        }
        if self.file_paths.is_empty() {
            return Err(ConfigurationError::NoInputFiles);
        }
        if !(self.library.ppm_tolerance.is_finite() && self.library.ppm_tolerance >= 0.0) {
            return Err(ConfigurationError::Invalid(format!(
                "ppm_tolerance must be a non-negative number, got {}",
                self.library.ppm_tolerance
            )));
        }

        let mut seen = HashSet::new();
        let mut file_paths = Vec::with_capacity(self.file_paths.len());
        for path in self.file_paths {
            if !path.exists() {
                return Err(ConfigurationError::MissingInputFile(path));
            }
            if !registry.recognizes(&path) {
                return Err(ConfigurationError::UnrecognizedExtension(path));
            }
            if seen.insert(path.clone()) {
                file_paths.push(path);
            } else {
                warn!("{} was listed more than once, processing it once", path.display());
            }
        }

        check_output_stems(&file_paths)?;

        Ok(WorkflowRequest {
            file_paths,
            output_directory: self.output_directory,
            engine_config_path: self.engine_config_path,
            reference_library_path: self.reference_library_path,
            scan_routes_path: self.scan_routes_path,
            workers: self.cores,
            library: self.library,
            matching: self.matching,
            resume: self.resume,
            cache_index: self.cache_index,
        })
    }
}

/// Every file's outputs live under `<output>/<stem>/`, so two inputs that share
/// a stem cannot be run in the same batch
pub fn check_output_stems(file_paths: &[PathBuf]) -> Result<(), ConfigurationError> {
    let mut stems: HashMap<String, &PathBuf> = HashMap::with_capacity(file_paths.len());
    for path in file_paths {
        let stem = output_stem(path);
        if let Some(first) = stems.get(&stem) {
            return Err(ConfigurationError::DuplicateOutputStem {
                stem,
                first: (*first).clone(),
                second: path.clone(),
            });
        }
        stems.insert(stem, path);
    }
    Ok(())
}

/// The immutable configuration of one batch run, after pre-flight validation
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    pub file_paths: Vec<PathBuf>,
    pub output_directory: PathBuf,
    pub engine_config_path: PathBuf,
    pub reference_library_path: PathBuf,
    pub scan_routes_path: Option<PathBuf>,
    pub workers: usize,
    pub library: LibraryParameters,
    pub matching: MatchingParameters,
    pub resume: bool,
    pub cache_index: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tier_invariant() {
        assert!(TierParameters::high_resolution()
            .validate(ResolutionTier::High)
            .is_ok());
        assert!(TierParameters::low_resolution()
            .validate(ResolutionTier::Low)
            .is_ok());
        let mut bad = TierParameters::high_resolution();
        bad.merge_distance_da = 0.03;
        assert!(matches!(
            bad.validate(ResolutionTier::High),
            Err(LibraryBuildError::TierInvariant { .. })
        ));
    }

    #[test]
    fn test_file_path_forms() {
        let params: WorkflowParameters =
            serde_json::from_str(r#"{"file_paths": "a.mgf, b.mgf,,c.mgf "}"#).unwrap();
        assert_eq!(
            params.file_paths,
            vec![
                PathBuf::from("a.mgf"),
                PathBuf::from("b.mgf"),
                PathBuf::from("c.mgf")
            ]
        );
        let params: WorkflowParameters =
            serde_json::from_str(r#"{"file_paths": ["a.mgf", "b.mgf"], "cores": 4}"#).unwrap();
        assert_eq!(params.file_paths.len(), 2);
        assert_eq!(params.cores, 4);
        assert_eq!(params.library.ppm_tolerance, 10.0);
    }

    fn valid_parameters(dir: &Path) -> WorkflowParameters {
        WorkflowParameters {
            file_paths: vec![PathBuf::from("test/data/positive.mgf")],
            output_directory: dir.to_path_buf(),
            engine_config_path: PathBuf::from("test/data/engine.json"),
            reference_library_path: PathBuf::from("test/data/library.msp"),
            scan_routes_path: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_preflight() {
        let registry = FormatRegistry::default();
        let dir = tempfile::tempdir().unwrap();

        let request = valid_parameters(dir.path()).into_request(&registry).unwrap();
        assert_eq!(request.workers, 1);

        let mut params = valid_parameters(dir.path());
        params.cores = 0;
        assert!(matches!(
            params.into_request(&registry),
            Err(ConfigurationError::InvalidWorkerCount(0))
        ));

        let mut params = valid_parameters(dir.path());
        params.engine_config_path = PathBuf::from("test/data/nope.json");
        assert!(matches!(
            params.into_request(&registry),
            Err(ConfigurationError::MissingEngineConfig(_))
        ));

        let mut params = valid_parameters(dir.path());
        params.reference_library_path = PathBuf::from("test/data/nope.msp");
        assert!(matches!(
            params.into_request(&registry),
            Err(ConfigurationError::MissingReferenceLibrary(_))
        ));

        let mut params = valid_parameters(dir.path());
        params.output_directory = dir.path().join("missing");
        assert!(matches!(
            params.into_request(&registry),
            Err(ConfigurationError::MissingOutputDirectory(_))
        ));

        let mut params = valid_parameters(dir.path());
        params.scan_routes_path = Some(PathBuf::from("test/data/no-routes.json"));
        assert!(matches!(
            params.into_request(&registry),
            Err(ConfigurationError::MissingRouteTable(_))
        ));

        let mut params = valid_parameters(dir.path());
        params.file_paths.push(PathBuf::from("test/data/missing.mgf"));
        assert!(matches!(
            params.into_request(&registry),
            Err(ConfigurationError::MissingInputFile(_))
        ));

        let mut params = valid_parameters(dir.path());
        params.file_paths.push(PathBuf::from("test/data/engine.json"));
        assert!(matches!(
            params.into_request(&registry),
            Err(ConfigurationError::UnrecognizedExtension(_))
        ));
    }

    #[test]
    fn test_duplicate_inputs_collapse() {
        let registry = FormatRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let mut params = valid_parameters(dir.path());
        params.file_paths.push(PathBuf::from("test/data/positive.mgf"));
        let request = params.into_request(&registry).unwrap();
        assert_eq!(request.file_paths.len(), 1);
    }

    #[test_log::test]
    fn test_shared_output_stem_rejected() {
        let registry = FormatRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let mut params = valid_parameters(dir.path());
        params.file_paths.clear();
        for sub in ["a", "b"] {
            let target = dir.path().join(sub);
            fs::create_dir(&target).unwrap();
            fs::copy("test/data/positive.mgf", target.join("run.mgf")).unwrap();
            params.file_paths.push(target.join("run.mgf"));
        }
        match params.into_request(&registry) {
            Err(ConfigurationError::DuplicateOutputStem { stem, first, second }) => {
                assert_eq!(stem, "run");
                assert_eq!(first, dir.path().join("a").join("run.mgf"));
                assert_eq!(second, dir.path().join("b").join("run.mgf"));
            }
            other => panic!("Expected a duplicate stem error, got {other:?}"),
        }
    }
}
