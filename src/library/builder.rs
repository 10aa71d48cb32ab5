use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::{debug, info};
use mzpeaks::Tolerance;
use serde::{Deserialize, Serialize};

use crate::error::LibraryBuildError;
use crate::io::export::write_molecular_metadata;
use crate::library::catalog::{open_catalog, MoleculeMetadata, ReferenceCatalog};
use crate::library::index::ReferenceIndex;
use crate::library::neighbors::{filter_by_nearest_query, prepare_query_masses};
use crate::params::TierParameters;
use crate::routing::ResolutionTier;
use crate::spectrum::Polarity;

/// Which tiers to build, and with what parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierRequest {
    pub high: TierParameters,
    pub low: Option<TierParameters>,
}

impl TierRequest {
    /// Check every requested tier's invariant
    pub fn validate(&self) -> Result<(), LibraryBuildError> {
        self.high.validate(ResolutionTier::High)?;
        if let Some(low) = self.low.as_ref() {
            low.validate(ResolutionTier::Low)?;
        }
        Ok(())
    }
}

/// The reference indices and molecular metadata for one polarity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLibrary {
    pub polarity: Polarity,
    pub high_resolution: ReferenceIndex,
    pub low_resolution: Option<ReferenceIndex>,
    pub molecules: IndexMap<String, MoleculeMetadata>,
}

impl ReferenceLibrary {
    pub fn index(&self, tier: ResolutionTier) -> Option<&ReferenceIndex> {
        match tier {
            ResolutionTier::High => Some(&self.high_resolution),
            ResolutionTier::Low => self.low_resolution.as_ref(),
        }
    }

    pub fn molecule(&self, molecule_id: &str) -> Option<&MoleculeMetadata> {
        self.molecules.get(molecule_id)
    }

    pub fn index_path(output_directory: &Path, polarity: Polarity, tier: ResolutionTier) -> PathBuf {
        output_directory.join(format!("reference_index_{polarity}_{tier}.json.gz"))
    }

    pub fn metadata_path(output_directory: &Path, polarity: Polarity) -> PathBuf {
        output_directory.join(format!("molecular_metadata_{polarity}.tsv"))
    }

    /// Write each index and the molecular metadata table into `output_directory`
    pub fn write_contents(&self, output_directory: &Path) -> Result<Vec<PathBuf>, LibraryBuildError> {
        let mut written = Vec::new();
        for tier in ResolutionTier::ALL {
            if let Some(index) = self.index(tier) {
                let path = Self::index_path(output_directory, self.polarity, tier);
                index.write_to(&path)?;
                written.push(path);
            }
        }
        let path = Self::metadata_path(output_directory, self.polarity);
        let handle = fs::File::create(&path).map_err(|source| LibraryBuildError::Persist {
            path: path.clone(),
            source,
        })?;
        write_molecular_metadata(handle, self.molecules.values()).map_err(|source| {
            LibraryBuildError::Persist {
                path: path.clone(),
                source,
            }
        })?;
        written.push(path);
        Ok(written)
    }
}

/// Builds polarity-specific reference indices restricted to the precursors
/// actually observed in a batch
pub struct LibraryBuilder<'a> {
    catalog: &'a dyn ReferenceCatalog,
    precursor_tolerance: Tolerance,
    normalize: bool,
}

impl<'a> LibraryBuilder<'a> {
    pub fn new(
        catalog: &'a dyn ReferenceCatalog,
        precursor_tolerance: Tolerance,
        normalize: bool,
    ) -> Self {
        Self {
            catalog,
            precursor_tolerance,
            normalize,
        }
    }

    pub fn build(
        &self,
        polarity: Polarity,
        query_masses: &[f64],
        tiers: &TierRequest,
    ) -> Result<ReferenceLibrary, LibraryBuildError> {
        tiers.validate()?;
        if !polarity.is_known() {
            return Err(LibraryBuildError::UnknownPolarity);
        }
        let queries = prepare_query_masses(query_masses.iter().copied());

        let (spectra, molecules) = if queries.is_empty() {
            debug!("No {polarity} query masses, building an empty index");
            (Vec::new(), IndexMap::new())
        } else {
            let entries = self.catalog.precursors(polarity)?;
            let retained = filter_by_nearest_query(&entries, &queries, self.precursor_tolerance);
            info!(
                "Retained {} of {} {polarity} reference entries within {} of {} observed precursors",
                retained.len(),
                entries.len(),
                self.precursor_tolerance,
                queries.len()
            );
            let keys: Vec<_> = retained.iter().map(|m| m.key).collect();
            let mut molecules = IndexMap::new();
            let mut spectra = Vec::with_capacity(keys.len());
            for record in self.catalog.fetch(&keys)? {
                molecules
                    .entry(record.molecule.id.clone())
                    .or_insert(record.molecule);
                spectra.push(record.spectrum);
            }
            (spectra, molecules)
        };

        let low_resolution = match tiers.low.as_ref() {
            Some(low) => Some(ReferenceIndex::build(
                polarity,
                ResolutionTier::Low,
                low,
                self.normalize,
                spectra.clone(),
            )?),
            None => None,
        };
        let high_resolution = ReferenceIndex::build(
            polarity,
            ResolutionTier::High,
            &tiers.high,
            self.normalize,
            spectra,
        )?;

        Ok(ReferenceLibrary {
            polarity,
            high_resolution,
            low_resolution,
            molecules,
        })
    }
}

/// Open the catalog at `reference_location` and build the polarity's library.
///
/// Tier invariants are checked before the catalog is opened.
pub fn build_reference_library(
    reference_location: &Path,
    polarity: Polarity,
    query_masses: &[f64],
    ppm_tolerance: f64,
    normalize: bool,
    tiers: &TierRequest,
) -> Result<ReferenceLibrary, LibraryBuildError> {
    tiers.validate()?;
    let catalog = open_catalog(reference_location)?;
    LibraryBuilder::new(catalog.as_ref(), Tolerance::PPM(ppm_tolerance), normalize).build(
        polarity,
        query_masses,
        tiers,
    )
}
