//! The per-file state handed from feature extraction to spectral matching.
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ObservedFeature;
use crate::error::ProcessingError;
use crate::io::compression::{is_gzipped_extension, read_compressed_json, write_compressed_json};
use crate::routing::ResolvedRoutes;
use crate::spectrum::{Polarity, ScanId, ScanRecord};

/// The name a source file's outputs are filed under, its file name without
/// the format extension (and any trailing `.gz`)
pub fn output_stem(source: &Path) -> String {
    let (_, path) = is_gzipped_extension(source);
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// `<output>/<stem>/`
pub fn output_directory_for(output_directory: &Path, source: &Path) -> PathBuf {
    output_directory.join(output_stem(source))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntermediateArtifact {
    pub source: PathBuf,
    pub polarity: Polarity,
    pub features: Vec<ObservedFeature>,
    /// The tandem scans attached to features, ordered by scan number
    pub spectra: Vec<ScanRecord>,
    pub routes: ResolvedRoutes,
    /// Precursor masses of the features carrying tandem data
    pub precursor_masses: Vec<f64>,
    pub created: DateTime<Utc>,
}

impl IntermediateArtifact {
    pub fn new(
        source: PathBuf,
        polarity: Polarity,
        features: Vec<ObservedFeature>,
        mut spectra: Vec<ScanRecord>,
        routes: ResolvedRoutes,
        precursor_masses: Vec<f64>,
    ) -> Self {
        spectra.sort_by_key(|s| s.scan);
        spectra.dedup_by_key(|s| s.scan);
        Self {
            source,
            polarity,
            features,
            spectra,
            routes,
            precursor_masses,
            created: Utc::now(),
        }
    }

    pub fn path_for(output_directory: &Path, source: &Path) -> PathBuf {
        output_directory_for(output_directory, source)
            .join(format!("{}.artifact.json.gz", output_stem(source)))
    }

    pub fn spectrum(&self, scan: ScanId) -> Option<&ScanRecord> {
        self.spectra
            .binary_search_by_key(&scan, |s| s.scan)
            .ok()
            .map(|i| &self.spectra[i])
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ProcessingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ProcessingError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_compressed_json(path, self).map_err(|source| ProcessingError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read_from(path: &Path) -> Result<Self, ProcessingError> {
        read_compressed_json(path).map_err(|e| ProcessingError::Artifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routing::{ResolutionTier, RoutedScans};
    use mzpeaks::CentroidPeak;

    fn scan(scan: ScanId, precursor_mz: f64) -> ScanRecord {
        ScanRecord {
            scan,
            ms_level: 2,
            start_time: 2.0,
            polarity: Polarity::Positive,
            filter: "FTMS + p ESI d Full ms2 @hcd30.00".to_string(),
            precursor_mz: Some(precursor_mz),
            precursor_intensity: 1e4,
            peaks: vec![CentroidPeak::new(precursor_mz / 2.0, 100.0, 0)],
        }
    }

    #[test]
    fn test_output_paths() {
        let out = Path::new("/tmp/out");
        assert_eq!(output_stem(Path::new("runs/sample_01.mgf.gz")), "sample_01");
        assert_eq!(
            IntermediateArtifact::path_for(out, Path::new("runs/sample_01.mgf")),
            PathBuf::from("/tmp/out/sample_01/sample_01.artifact.json.gz")
        );
    }

    #[test_log::test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut routes = ResolvedRoutes::default();
        routes.routes.insert(
            "ms2".to_string(),
            RoutedScans {
                scans: vec![4, 9],
                tier: ResolutionTier::High,
            },
        );
        let feature = ObservedFeature {
            id: 0,
            mz: 300.1,
            retention_time: 2.0,
            polarity: Polarity::Positive,
            apex_intensity: 1e4,
            isotopologue: false,
            tandem_scans: vec![4, 9],
        };
        let artifact = IntermediateArtifact::new(
            PathBuf::from("sample.mgf"),
            Polarity::Positive,
            vec![feature],
            vec![scan(9, 300.1), scan(4, 300.1)],
            routes,
            vec![300.1],
        );
        assert_eq!(artifact.spectrum(4).unwrap().scan, 4);
        assert!(artifact.spectrum(5).is_none());

        let path = IntermediateArtifact::path_for(dir.path(), &artifact.source);
        artifact.write_to(&path).unwrap();
        let back = IntermediateArtifact::read_from(&path).unwrap();
        assert_eq!(back.features, artifact.features);
        assert_eq!(back.routes, artifact.routes);
        assert_eq!(back.spectra.len(), 2);
        assert_eq!(back.created, artifact.created);

        assert!(matches!(
            IntermediateArtifact::read_from(&dir.path().join("missing.json.gz")),
            Err(ProcessingError::Artifact { .. })
        ));
    }
}
