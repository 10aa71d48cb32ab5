use std::path::Path;

use mzpeaks::{PeakSet, Tolerance};
use serde::{Deserialize, Serialize};

use crate::engine::SimilarityScorer;
use crate::error::LibraryBuildError;
use crate::io::compression::{read_compressed_json, write_compressed_json};
use crate::library::catalog::ReferenceSpectrum;
use crate::library::neighbors::ppm_error;
use crate::params::TierParameters;
use crate::routing::ResolutionTier;
use crate::spectrum::{Polarity, ScanId, ScanRecord};

/// A query spectrum prepared for searching one tier's index
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpectrum {
    pub scan: ScanId,
    pub precursor_mz: f64,
    pub peaks: PeakSet,
}

impl QuerySpectrum {
    /// Clean `scan`'s peaks with the tier's query parameters. Scans without a
    /// precursor can't be searched.
    pub fn from_scan(scan: &ScanRecord, parameters: &TierParameters) -> Option<Self> {
        let precursor_mz = scan.precursor_mz?;
        Some(Self {
            scan: scan.scan,
            precursor_mz,
            peaks: parameters
                .query_cleaning()
                .apply(&scan.peaks, Some(precursor_mz)),
        })
    }
}

/// One scored pairing of a query scan with a reference spectrum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumHit {
    pub scan: ScanId,
    pub tier: ResolutionTier,
    pub reference_id: String,
    pub molecule_id: String,
    pub similarity: f64,
    /// `(reference - query) / reference * 1e6` of the precursor masses
    pub precursor_ppm_error: f64,
}

/// A searchable collection of cleaned reference spectra for one polarity and tier,
/// ordered by precursor m/z
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceIndex {
    pub polarity: Polarity,
    pub tier: ResolutionTier,
    pub parameters: TierParameters,
    spectra: Vec<ReferenceSpectrum>,
}

impl ReferenceIndex {
    /// Clean and order `spectra`. Fails before touching any spectrum if the tier's
    /// merge distance is not exactly twice its window tolerance.
    pub fn build(
        polarity: Polarity,
        tier: ResolutionTier,
        parameters: &TierParameters,
        normalize: bool,
        spectra: Vec<ReferenceSpectrum>,
    ) -> Result<Self, LibraryBuildError> {
        parameters.validate(tier)?;
        let cleaning = parameters.index_cleaning(normalize);
        let mut spectra: Vec<ReferenceSpectrum> = spectra
            .into_iter()
            .map(|mut spectrum| {
                spectrum.peaks =
                    cleaning.apply(spectrum.peaks.as_slice(), Some(spectrum.precursor_mz));
                spectrum
            })
            .collect();
        spectra.sort_by(|a, b| {
            a.precursor_mz
                .total_cmp(&b.precursor_mz)
                .then_with(|| a.reference_id.cmp(&b.reference_id))
        });
        Ok(Self {
            polarity,
            tier,
            parameters: *parameters,
            spectra,
        })
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }

    pub fn spectra(&self) -> &[ReferenceSpectrum] {
        &self.spectra
    }

    /// Reference spectra whose precursor lies within `tolerance` of
    /// `precursor_mz`, relative to the reference
    pub fn candidates(
        &self,
        precursor_mz: f64,
        tolerance: Tolerance,
    ) -> impl Iterator<Item = &ReferenceSpectrum> {
        // Wide enough for any reference whose own window reaches the query
        let (lo, hi) = (tolerance * 2.0).bounds(precursor_mz);
        let start = self.spectra.partition_point(|s| s.precursor_mz < lo);
        self.spectra[start..]
            .iter()
            .take_while(move |s| s.precursor_mz <= hi)
            .filter(move |s| tolerance.test(precursor_mz, s.precursor_mz))
    }

    pub fn fragment_tolerance(&self) -> Tolerance {
        Tolerance::Da(self.parameters.window_tolerance_da)
    }

    pub fn search(
        &self,
        query: &QuerySpectrum,
        precursor_tolerance: Tolerance,
        scorer: &dyn SimilarityScorer,
    ) -> Vec<SpectrumHit> {
        let fragment_tolerance = self.fragment_tolerance();
        self.candidates(query.precursor_mz, precursor_tolerance)
            .map(|reference| SpectrumHit {
                scan: query.scan,
                tier: self.tier,
                reference_id: reference.reference_id.clone(),
                molecule_id: reference.molecule_id.clone(),
                similarity: scorer.score(&query.peaks, &reference.peaks, fragment_tolerance),
                precursor_ppm_error: ppm_error(query.precursor_mz, reference.precursor_mz),
            })
            .collect()
    }

    /// Search every query of a routed scan bucket
    pub fn search_bucket(
        &self,
        queries: &[QuerySpectrum],
        precursor_tolerance: Tolerance,
        scorer: &dyn SimilarityScorer,
    ) -> Vec<SpectrumHit> {
        queries
            .iter()
            .flat_map(|q| self.search(q, precursor_tolerance, scorer))
            .collect()
    }

    pub fn write_to(&self, path: &Path) -> Result<(), LibraryBuildError> {
        write_compressed_json(path, self).map_err(|source| LibraryBuildError::Persist {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read_from(path: &Path) -> Result<Self, LibraryBuildError> {
        read_compressed_json(path).map_err(|source| LibraryBuildError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
