use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use sha1::{Digest, Sha1};

use crate::error::LibraryBuildError;
use crate::io::compression::{read_compressed_json, write_compressed_json};
use crate::library::builder::{ReferenceLibrary, TierRequest};
use crate::spectrum::Polarity;

/// Everything that determines the contents of a built [`ReferenceLibrary`].
///
/// The reference catalog is identified by its location and its contents.
#[derive(Debug, Clone, Copy)]
pub struct LibraryKey<'a> {
    pub reference_location: &'a Path,
    pub polarity: Polarity,
    /// Sorted and deduplicated
    pub query_masses: &'a [f64],
    pub ppm_tolerance: f64,
    pub normalize: bool,
    pub tiers: &'a TierRequest,
}

impl LibraryKey<'_> {
    /// A hex SHA-1 digest of the key
    pub fn fingerprint(&self) -> Result<String, LibraryBuildError> {
        let mut hasher = Sha1::new();
        hasher.update(self.reference_location.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        fs::File::open(self.reference_location)
            .and_then(|mut handle| io::copy(&mut handle, &mut hasher))
            .map_err(|source| LibraryBuildError::Io {
                path: self.reference_location.to_path_buf(),
                source,
            })?;
        hasher.update(self.polarity.as_str().as_bytes());
        hasher.update(self.ppm_tolerance.to_le_bytes());
        hasher.update([self.normalize as u8]);
        for mass in self.query_masses {
            hasher.update(mass.to_le_bytes());
        }
        for tier in [Some(self.tiers.high), self.tiers.low] {
            match tier {
                Some(t) => {
                    hasher.update([1u8]);
                    hasher.update(t.merge_distance_da.to_le_bytes());
                    hasher.update(t.window_tolerance_da.to_le_bytes());
                    hasher.update(t.max_indexed_mz.to_le_bytes());
                    hasher.update(t.noise_threshold.to_le_bytes());
                    hasher.update(t.precursor_removal_da.unwrap_or(-1.0).to_le_bytes());
                    hasher.update(t.query_peak_separation_da.to_le_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        Ok(base16ct::lower::encode_string(&hasher.finalize()))
    }
}

/// Built libraries persisted under `<output>/index_cache/`, keyed by fingerprint
#[derive(Debug, Clone)]
pub struct IndexCache {
    directory: PathBuf,
}

impl IndexCache {
    pub fn new(output_directory: &Path) -> Self {
        Self {
            directory: output_directory.join("index_cache"),
        }
    }

    pub fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.directory.join(format!("{fingerprint}.json.gz"))
    }

    /// A previously stored library, if there is a readable one
    pub fn load(&self, fingerprint: &str) -> Option<ReferenceLibrary> {
        let path = self.path_for(fingerprint);
        if !path.exists() {
            return None;
        }
        match read_compressed_json(&path) {
            Ok(library) => {
                debug!("Loaded cached reference library {}", path.display());
                Some(library)
            }
            Err(e) => {
                warn!(
                    "Ignoring unreadable cached reference library {}: {e}",
                    path.display()
                );
                None
            }
        }
    }

    pub fn store(&self, fingerprint: &str, library: &ReferenceLibrary) -> Result<PathBuf, LibraryBuildError> {
        let path = self.path_for(fingerprint);
        fs::create_dir_all(&self.directory)
            .and_then(|_| write_compressed_json(&path, library))
            .map_err(|source| LibraryBuildError::Persist {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::library::builder::build_reference_library;
    use crate::params::TierParameters;

    fn tiers() -> TierRequest {
        TierRequest {
            high: TierParameters::high_resolution(),
            low: None,
        }
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let tiers = tiers();
        let masses = [100.0, 200.0];
        let key = LibraryKey {
            reference_location: Path::new("test/data/library.msp"),
            polarity: Polarity::Positive,
            query_masses: &masses,
            ppm_tolerance: 10.0,
            normalize: true,
            tiers: &tiers,
        };
        let base = key.fingerprint().unwrap();
        assert_eq!(base.len(), 40);
        assert_eq!(base, key.fingerprint().unwrap());

        let other = LibraryKey {
            polarity: Polarity::Negative,
            ..key
        };
        assert_ne!(base, other.fingerprint().unwrap());
        let fewer = [100.0];
        let other = LibraryKey {
            query_masses: &fewer,
            ..key
        };
        assert_ne!(base, other.fingerprint().unwrap());
        let with_low = TierRequest {
            low: Some(TierParameters::low_resolution()),
            ..tiers
        };
        let other = LibraryKey {
            tiers: &with_low,
            ..key
        };
        assert_ne!(base, other.fingerprint().unwrap());
    }

    #[test_log::test]
    fn test_fingerprint_follows_catalog_contents() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("library.msp");
        fs::copy("test/data/library.msp", &location).unwrap();
        let tiers = tiers();
        let masses = [195.0877];
        let key = LibraryKey {
            reference_location: &location,
            polarity: Polarity::Positive,
            query_masses: &masses,
            ppm_tolerance: 10.0,
            normalize: true,
            tiers: &tiers,
        };
        let before = key.fingerprint().unwrap();

        let mut text = fs::read_to_string(&location).unwrap();
        text.push_str(
            "\nName: Caffeine isomer\nPrecursorMZ: 195.0877\nPrecursor_type: [M+H]+\nIon_mode: P\n\
             InChIKey: RYYVLZVUVIJVGH-UHFFFAOYSA-X\nFormula: C8H10N4O2\nDB#: REF0099\n\
             Num Peaks: 1\n138.0662 100\n",
        );
        fs::write(&location, text).unwrap();
        let after = key.fingerprint().unwrap();
        assert_ne!(before, after);

        let cache = IndexCache::new(dir.path());
        let library = build_reference_library(&location, Polarity::Positive, &masses, 10.0, true, &tiers).unwrap();
        cache.store(&before, &library).unwrap();
        assert!(cache.load(&after).is_none());

        fs::remove_file(&location).unwrap();
        assert!(matches!(key.fingerprint(), Err(LibraryBuildError::Io { .. })));
    }

    #[test_log::test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path());
        assert!(cache.load("abc").is_none());

        let library = build_reference_library(
            Path::new("test/data/library.msp"),
            Polarity::Negative,
            &[191.0196],
            10.0,
            true,
            &tiers(),
        )
        .unwrap();
        let path = cache.store("abc", &library).unwrap();
        assert!(path.starts_with(dir.path().join("index_cache")));
        let cached = cache.load("abc").unwrap();
        assert_eq!(cached.polarity, Polarity::Negative);
        assert_eq!(cached.high_resolution.len(), library.high_resolution.len());
        assert_eq!(cached.molecules.keys().collect::<Vec<_>>(), library.molecules.keys().collect::<Vec<_>>());

        fs::write(cache.path_for("broken"), b"not gzip or json").unwrap();
        assert!(cache.load("broken").is_none());
    }
}
