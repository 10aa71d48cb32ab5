//! Coordinates a batch: polarity grouping, the extraction phase, one library
//! build per polarity, and the matching phase.
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::dispatch::{AbortHandle, Dispatcher, FileFailure};
use crate::engine::{
    EngineConfig, EntropySimilarity, PrecursorClusterEngine, ProcessingEngine, SimilarityScorer,
};
use crate::error::{ConfigurationError, LibraryBuildError, ManifestError, ProcessingError, WorkflowError};
use crate::io::artifact::IntermediateArtifact;
use crate::io::FormatRegistry;
use crate::library::{
    build_reference_library, prepare_query_masses, IndexCache, LibraryKey, ReferenceLibrary,
    TierRequest,
};
use crate::manifest::{FileState, RunManifest};
use crate::params::{check_output_stems, WorkflowParameters, WorkflowRequest};
use crate::routing::{ResolutionTier, ScanRouteTable};
use crate::spectrum::Polarity;
use crate::stages::{FeatureExtraction, SpectralMatching, Stage};

/// A file that did not make it to export, and why
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFile {
    pub file: PathBuf,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub skipped: Vec<SkippedFile>,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn skip<S: Display>(&mut self, file: &Path, stage: Stage, reason: S) {
        self.skipped.push(SkippedFile {
            file: file.to_path_buf(),
            stage,
            reason: reason.to_string(),
        })
    }

    /// Every file was exported
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.completed == self.total
    }

    pub fn skipped_in(&self, file: &Path) -> Option<&SkippedFile> {
        self.skipped.iter().find(|s| s.file == file)
    }

    pub fn log(&self) {
        info!(
            "{} of {} files completed in {:.2?}",
            self.completed, self.total, self.elapsed
        );
        for skipped in self.skipped.iter() {
            warn!(
                "Skipped {} during {}: {}",
                skipped.file.display(),
                skipped.stage,
                skipped.reason
            );
        }
    }
}

impl Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} of {} files completed, {} skipped ({:.2?})",
            self.completed,
            self.total,
            self.skipped.len(),
            self.elapsed
        )?;
        for skipped in self.skipped.iter() {
            writeln!(
                f,
                "  {}\t{}\t{}",
                skipped.file.display(),
                skipped.stage,
                skipped.reason
            )?;
        }
        Ok(())
    }
}

fn record_failure(
    manifest: &mut RunManifest,
    summary: &mut BatchSummary,
    file: &Path,
    stage: Stage,
    error: &WorkflowError,
) -> Result<(), ManifestError> {
    manifest.fail(file, stage, error)?;
    summary.skip(file, stage, error);
    Ok(())
}

fn record_failures(
    manifest: &mut RunManifest,
    summary: &mut BatchSummary,
    failures: Vec<FileFailure>,
) -> Result<(), ManifestError> {
    for failure in failures {
        record_failure(manifest, summary, &failure.file, failure.stage, &failure.error)?;
    }
    Ok(())
}

/// A configured batch run
pub struct Workflow {
    request: WorkflowRequest,
    registry: FormatRegistry,
    engine: Box<dyn ProcessingEngine>,
    scorer: Box<dyn SimilarityScorer>,
    abort: AbortHandle,
}

impl Workflow {
    pub fn new(request: WorkflowRequest) -> Self {
        Self {
            request,
            registry: FormatRegistry::default(),
            engine: Box::new(PrecursorClusterEngine),
            scorer: Box::new(EntropySimilarity),
            abort: AbortHandle::new(),
        }
    }

    /// Validate `parameters` against the built-in format registry
    pub fn from_parameters(parameters: WorkflowParameters) -> Result<Self, ConfigurationError> {
        let registry = FormatRegistry::default();
        let request = parameters.into_request(&registry)?;
        Ok(Self::new(request).with_registry(registry))
    }

    pub fn with_engine<E: ProcessingEngine + 'static>(mut self, engine: E) -> Self {
        self.engine = Box::new(engine);
        self
    }

    pub fn with_scorer<S: SimilarityScorer + 'static>(mut self, scorer: S) -> Self {
        self.scorer = Box::new(scorer);
        self
    }

    pub fn with_registry(mut self, registry: FormatRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn request(&self) -> &WorkflowRequest {
        &self.request
    }

    /// A handle that stops the batch before the next job starts
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn detect_polarity(&self, path: &Path) -> Result<Polarity, WorkflowError> {
        let reader = self.registry.reader_for(path)?;
        match reader.polarity(path)? {
            Polarity::Unknown => Err(ProcessingError::UnknownPolarity(path.to_path_buf()).into()),
            polarity => Ok(polarity),
        }
    }

    /// The precursor masses of an artifact left by an earlier run, if the file
    /// got far enough for it to be reused
    fn reusable_artifact(&self, manifest: &RunManifest, file: &Path) -> Option<(PathBuf, Vec<f64>)> {
        let entry = manifest.entry(file)?;
        if !matches!(
            entry.state,
            FileState::FeaturesExtracted
                | FileState::IndexReady
                | FileState::Matched
                | FileState::Exported
        ) {
            return None;
        }
        let path = entry.existing_artifact()?.to_path_buf();
        match IntermediateArtifact::read_from(&path) {
            Ok(artifact) => Some((path, artifact.precursor_masses)),
            Err(e) => {
                warn!("{}: cannot reuse artifact, extracting again: {e}", file.display());
                None
            }
        }
    }

    fn tier_request(&self, routes: &ScanRouteTable) -> TierRequest {
        let parameters = &self.request.library;
        TierRequest {
            high: parameters.high_resolution,
            low: routes
                .has_tier(ResolutionTier::Low)
                .then_some(parameters.low_resolution),
        }
    }

    fn build_library(
        &self,
        polarity: Polarity,
        query_masses: &[f64],
        routes: &ScanRouteTable,
    ) -> Result<ReferenceLibrary, LibraryBuildError> {
        let request = &self.request;
        let parameters = &request.library;
        let tiers = self.tier_request(routes);
        tiers.validate()?;
        let queries = prepare_query_masses(query_masses.iter().copied());
        info!(
            "Building the {polarity} reference library for {} unique precursors{}",
            queries.len(),
            if tiers.low.is_some() { " with a low resolution tier" } else { "" }
        );

        let build = || {
            build_reference_library(
                &request.reference_library_path,
                polarity,
                &queries,
                parameters.ppm_tolerance,
                parameters.normalize,
                &tiers,
            )
        };

        let library = if request.cache_index {
            let key = LibraryKey {
                reference_location: &request.reference_library_path,
                polarity,
                query_masses: &queries,
                ppm_tolerance: parameters.ppm_tolerance,
                normalize: parameters.normalize,
                tiers: &tiers,
            };
            let fingerprint = key.fingerprint()?;
            let cache = IndexCache::new(&request.output_directory);
            match cache.load(&fingerprint) {
                Some(library) => {
                    info!("Reusing cached {polarity} reference library {fingerprint}");
                    library
                }
                None => {
                    let library = build()?;
                    if let Err(e) = cache.store(&fingerprint, &library) {
                        warn!("Failed to cache the {polarity} reference library: {e}");
                    }
                    library
                }
            }
        } else {
            build()?
        };

        library.write_contents(&request.output_directory)?;
        Ok(library)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_group(
        &self,
        polarity: Polarity,
        files: Vec<PathBuf>,
        config: &EngineConfig,
        routes: &ScanRouteTable,
        dispatcher: &Dispatcher,
        manifest: &mut RunManifest,
        summary: &mut BatchSummary,
    ) -> Result<(), WorkflowError> {
        let request = &self.request;
        let output_directory = request.output_directory.as_path();
        let exclusive = self.registry.any_exclusive(files.iter());
        info!("Processing {} {polarity} files", files.len());

        let mut extracted: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(files.len());
        let mut query_masses = Vec::new();
        let mut jobs = Vec::with_capacity(files.len());
        for file in files {
            let reusable = if request.resume {
                self.reusable_artifact(manifest, &file)
            } else {
                None
            };
            manifest.restart(&file)?;
            if let Some((artifact, masses)) = reusable {
                info!(
                    "{}: reusing features from {}",
                    file.display(),
                    artifact.display()
                );
                manifest.transition(&file, FileState::FeaturesExtracted)?;
                query_masses.extend(masses);
                extracted.push((file, artifact));
                continue;
            }
            jobs.push((file, ()));
        }

        // Phase 1
        let extraction = FeatureExtraction {
            registry: &self.registry,
            engine: self.engine.as_ref(),
            config,
            routes,
            output_directory,
        };
        let outcome = dispatcher.run(Stage::FeatureExtraction, jobs, exclusive, |path, ()| {
            extraction.run(path)
        });
        let (successes, failures) = outcome.partition();
        record_failures(manifest, summary, failures)?;
        for (file, output) in successes {
            if output.polarity != polarity {
                let err: WorkflowError = ProcessingError::MalformedInput {
                    path: file.clone(),
                    reason: format!("detected as {polarity} but parsed as {}", output.polarity),
                }
                .into();
                record_failure(manifest, summary, &file, Stage::FeatureExtraction, &err)?;
                continue;
            }
            manifest.entry_mut(&file)?.artifact = Some(output.artifact_path.clone());
            manifest.transition(&file, FileState::FeaturesExtracted)?;
            query_masses.extend(output.precursor_masses);
            extracted.push((file, output.artifact_path));
        }
        manifest.save()?;

        if extracted.is_empty() {
            warn!("No {polarity} files completed feature extraction");
            return Ok(());
        }
        if self.abort.is_aborted() {
            let err = WorkflowError::from(ProcessingError::Aborted);
            for (file, _) in extracted.iter() {
                record_failure(manifest, summary, file, Stage::LibraryBuild, &err)?;
            }
            return Ok(());
        }

        // Every extraction job of the group has finished, so the query set is complete
        let library = match self.build_library(polarity, &query_masses, routes) {
            Ok(library) => library,
            Err(e) => {
                error!("The {polarity} reference library could not be built: {e}");
                let err = WorkflowError::from(e);
                for (file, _) in extracted.iter() {
                    record_failure(manifest, summary, file, Stage::LibraryBuild, &err)?;
                }
                return Ok(());
            }
        };
        for (file, _) in extracted.iter() {
            manifest.transition(file, FileState::IndexReady)?;
        }
        manifest.save()?;

        // Phase 2
        let matching = SpectralMatching {
            library: &library,
            scorer: self.scorer.as_ref(),
            parameters: &request.matching,
            output_directory,
        };
        let outcome = dispatcher.run(
            Stage::SpectralMatching,
            extracted,
            false,
            |_, artifact: PathBuf| matching.run(&artifact),
        );
        let (successes, failures) = outcome.partition();
        record_failures(manifest, summary, failures)?;
        for (file, output) in successes {
            manifest.transition(&file, FileState::Matched)?;
            manifest.entry_mut(&file)?.export = Some(output.export_path);
            manifest.transition(&file, FileState::Exported)?;
            summary.completed += 1;
        }
        Ok(())
    }

    /// Run the batch to completion.
    ///
    /// Only configuration and manifest failures end the run early. Everything
    /// that goes wrong with an individual file, or with one polarity's library,
    /// is reported in the returned summary.
    pub fn run(&self) -> Result<BatchSummary, WorkflowError> {
        let started = Instant::now();
        let request = &self.request;
        let output_directory = request.output_directory.as_path();
        check_output_stems(&request.file_paths)?;
        let config = EngineConfig::from_path(&request.engine_config_path)?;
        let routes = match request.scan_routes_path.as_ref() {
            Some(path) => ScanRouteTable::from_path(path)?,
            None => ScanRouteTable::default(),
        };
        info!(
            "Annotating {} files with {} workers, routing keys: {}",
            request.file_paths.len(),
            request.workers,
            routes.keys().collect::<Vec<_>>().join(", ")
        );

        let mut manifest = if request.resume {
            RunManifest::load_or_new(output_directory)?
        } else {
            RunManifest::new(output_directory)
        };
        let mut summary = BatchSummary::new(request.file_paths.len());
        let dispatcher = Dispatcher::new(request.workers, self.abort.clone());

        let mut groups: BTreeMap<Polarity, Vec<PathBuf>> = BTreeMap::new();
        for path in request.file_paths.iter() {
            manifest.register(path);
            if request.resume {
                let exported = manifest.entry(path).is_some_and(|entry| {
                    entry.state == FileState::Exported && entry.existing_export().is_some()
                });
                if exported {
                    info!("{}: already exported, skipping", path.display());
                    summary.completed += 1;
                    continue;
                }
            }
            match self.detect_polarity(path) {
                Ok(polarity) => {
                    manifest.entry_mut(path)?.polarity = Some(polarity);
                    groups.entry(polarity).or_default().push(path.clone());
                }
                Err(e) => {
                    error!("{}: {} failed: {e}", path.display(), Stage::PolarityDetection);
                    record_failure(&mut manifest, &mut summary, path, Stage::PolarityDetection, &e)?;
                }
            }
        }
        manifest.save()?;

        for (polarity, files) in groups {
            self.run_group(
                polarity,
                files,
                &config,
                &routes,
                &dispatcher,
                &mut manifest,
                &mut summary,
            )?;
            manifest.save()?;
        }

        summary.elapsed = started.elapsed();
        summary.log();
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;
    use crate::params::TierParameters;

    fn parameters(output_directory: &Path) -> WorkflowParameters {
        WorkflowParameters {
            file_paths: vec![
                PathBuf::from("test/data/positive.mgf"),
                PathBuf::from("test/data/negative.mgf"),
            ],
            output_directory: output_directory.to_path_buf(),
            engine_config_path: PathBuf::from("test/data/engine.json"),
            reference_library_path: PathBuf::from("test/data/library.msp"),
            scan_routes_path: Some(PathBuf::from("test/data/routes.json")),
            cores: 2,
            ..Default::default()
        }
    }

    #[test_log::test]
    fn test_both_polarities() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = Workflow::from_parameters(parameters(dir.path())).unwrap();
        let summary = workflow.run().unwrap();
        assert!(summary.is_complete(), "{summary}");
        assert_eq!(summary.completed, 2);

        for name in [
            "reference_index_positive_high.json.gz",
            "reference_index_positive_low.json.gz",
            "reference_index_negative_high.json.gz",
            "reference_index_negative_low.json.gz",
            "molecular_metadata_positive.tsv",
            "molecular_metadata_negative.tsv",
            "manifest.json",
        ] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }

        let table = fs::read_to_string(dir.path().join("positive").join("positive.csv")).unwrap();
        assert!(table.contains("Caffeine"));
        assert!(table.contains("Adenine"));
        let table = fs::read_to_string(dir.path().join("negative").join("negative.csv")).unwrap();
        assert!(table.contains("Citric acid"));

        let manifest = RunManifest::load_or_new(dir.path()).unwrap();
        assert!(manifest
            .files
            .values()
            .all(|entry| entry.state == FileState::Exported));
    }

    #[test_log::test]
    fn test_route_failure_is_file_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let routes = dir.path().join("routes.json");
        fs::write(
            &routes,
            r#"{"hcd": {"scan_filter": "FTMS \\+", "resolution": "high"}}"#,
        )
        .unwrap();
        let mut params = parameters(dir.path());
        params.scan_routes_path = Some(routes);
        let summary = Workflow::from_parameters(params).unwrap().run().unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.skipped.len(), 1);
        let skipped = summary
            .skipped_in(Path::new("test/data/negative.mgf"))
            .unwrap();
        assert_eq!(skipped.stage, Stage::FeatureExtraction);
        assert!(skipped.reason.contains("hcd"));
        // No negative file reached the library build
        assert!(!dir
            .path()
            .join("reference_index_negative_high.json.gz")
            .exists());
        assert!(!dir.path().join("reference_index_positive_low.json.gz").exists());
    }

    #[test_log::test]
    fn test_library_failure_covers_the_polarity() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = parameters(dir.path());
        params.library.low_resolution = TierParameters {
            window_tolerance_da: 0.25,
            ..TierParameters::low_resolution()
        };
        let summary = Workflow::from_parameters(params).unwrap().run().unwrap();
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.skipped.len(), 2);
        assert!(summary
            .skipped
            .iter()
            .all(|s| s.stage == Stage::LibraryBuild && s.reason.contains("twice")));
    }

    #[test_log::test]
    fn test_unknown_polarity_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let unknown = dir.path().join("unknown.mgf");
        fs::write(
            &unknown,
            "BEGIN IONS\nSCANS=1\nPEPMASS=195.0876\nFILTER=FTMS @hcd\n138.0661 100\nEND IONS\n",
        )
        .unwrap();
        let mut params = parameters(dir.path());
        params.file_paths.push(unknown.clone());
        params.scan_routes_path = None;
        params.engine_config_path = dir.path().join("engine.json");
        fs::write(&params.engine_config_path, r#"{"profiles": ["ms2"]}"#).unwrap();

        let summary = Workflow::from_parameters(params).unwrap().run().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 2);
        let skipped = summary.skipped_in(&unknown).unwrap();
        assert_eq!(skipped.stage, Stage::PolarityDetection);
        // The default table routes everything to the high tier only
        assert!(!dir.path().join("reference_index_positive_low.json.gz").exists());
    }

    #[test_log::test]
    fn test_resume() {
        let dir = tempfile::tempdir().unwrap();
        let summary = Workflow::from_parameters(parameters(dir.path()))
            .unwrap()
            .run()
            .unwrap();
        assert!(summary.is_complete());

        let artifact_path = |name: &str| {
            IntermediateArtifact::path_for(dir.path(), Path::new(&format!("{name}.mgf")))
        };
        let created_before: Vec<_> = ["positive", "negative"]
            .iter()
            .map(|name| IntermediateArtifact::read_from(&artifact_path(name)).unwrap().created)
            .collect();
        let negative_export = dir.path().join("negative").join("negative.csv");
        fs::remove_file(&negative_export).unwrap();

        let mut params = parameters(dir.path());
        params.resume = true;
        let summary = Workflow::from_parameters(params).unwrap().run().unwrap();
        assert!(summary.is_complete(), "{summary}");
        assert!(negative_export.exists());
        let created_after: Vec<_> = ["positive", "negative"]
            .iter()
            .map(|name| IntermediateArtifact::read_from(&artifact_path(name)).unwrap().created)
            .collect();
        assert_eq!(created_before, created_after);
    }

    #[test_log::test]
    fn test_cached_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = parameters(dir.path());
        params.cache_index = true;
        params.file_paths.truncate(1);
        Workflow::from_parameters(params.clone()).unwrap().run().unwrap();
        let cached: Vec<_> = fs::read_dir(dir.path().join("index_cache"))
            .unwrap()
            .collect();
        assert_eq!(cached.len(), 1);
        let summary = Workflow::from_parameters(params).unwrap().run().unwrap();
        assert!(summary.is_complete());
    }

    #[test_log::test]
    fn test_unwritable_cache_does_not_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = parameters(dir.path());
        params.cache_index = true;
        params.file_paths.truncate(1);
        // A plain file where the cache directory would go
        fs::write(dir.path().join("index_cache"), b"").unwrap();
        let summary = Workflow::from_parameters(params).unwrap().run().unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.completed, 1);
        assert!(dir.path().join("index_cache").is_file());
    }

    #[test_log::test]
    fn test_mzml_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = parameters(dir.path());
        params.file_paths = vec![PathBuf::from("test/data/positive.mzML")];
        let summary = Workflow::from_parameters(params).unwrap().run().unwrap();
        assert!(summary.is_complete(), "{summary}");
        let table = fs::read_to_string(dir.path().join("positive").join("positive.csv")).unwrap();
        assert!(table.contains("Caffeine"));
        assert!(table.contains("Adenine"));
    }

    #[test_log::test]
    fn test_abort_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = Workflow::from_parameters(parameters(dir.path())).unwrap();
        workflow.abort_handle().abort();
        let summary = workflow.run().unwrap();
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.skipped.len(), 2);
        assert!(summary.skipped.iter().all(|s| s.reason == "aborted"));
    }

    #[test_log::test]
    fn test_shared_output_stem_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        let output = dir.path().join("output");
        fs::create_dir(&output).unwrap();
        for sub in ["a", "b"] {
            fs::create_dir_all(inputs.join(sub)).unwrap();
            fs::copy("test/data/positive.mgf", inputs.join(sub).join("run.mgf")).unwrap();
        }

        let mut params = parameters(&output);
        params.file_paths = vec![inputs.join("a").join("run.mgf"), inputs.join("b").join("run.mgf")];
        assert!(matches!(
            Workflow::from_parameters(params),
            Err(ConfigurationError::DuplicateOutputStem { .. })
        ));

        // A request assembled by hand is checked again before anything is written
        let mut single = parameters(&output);
        single.file_paths = vec![inputs.join("a").join("run.mgf")];
        let mut request = single.into_request(&FormatRegistry::default()).unwrap();
        request.file_paths.push(inputs.join("b").join("run.mgf"));
        let result = Workflow::new(request).run();
        assert!(matches!(
            result,
            Err(WorkflowError::Configuration(ConfigurationError::DuplicateOutputStem { .. }))
        ));
        assert!(!output.join("run").exists());
    }
}
