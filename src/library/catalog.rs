use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::debug;
use mzpeaks::{CentroidPeak, PeakSet};
use serde::{Deserialize, Serialize};

use crate::error::LibraryBuildError;
use crate::io::compression::is_gzipped_extension;
use crate::io::msp::{MSPError, MSPReader, MSPRecord};
use crate::spectrum::Polarity;

/// Identifies an entry within one catalog
pub type EntryKey = usize;

/// The precursor of a catalog entry, listed without loading its spectrum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecursorEntry {
    pub key: EntryKey,
    pub precursor_mz: f64,
}

/// The identity of the molecule a reference spectrum was acquired from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoleculeMetadata {
    pub id: String,
    pub name: String,
    pub formula: Option<String>,
    pub inchikey: Option<String>,
    pub inchi: Option<String>,
    pub smiles: Option<String>,
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSpectrum {
    pub reference_id: String,
    pub molecule_id: String,
    pub precursor_mz: f64,
    pub polarity: Polarity,
    pub peaks: PeakSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRecord {
    pub spectrum: ReferenceSpectrum,
    pub molecule: MoleculeMetadata,
}

/// A source of reference spectra and molecular metadata
pub trait ReferenceCatalog: Send + Sync {
    fn location(&self) -> &Path;

    /// The entries of `polarity`, sorted ascending by precursor m/z
    fn precursors(&self, polarity: Polarity) -> Result<Vec<PrecursorEntry>, LibraryBuildError>;

    /// Load the full records for `keys`, in the same order
    fn fetch(&self, keys: &[EntryKey]) -> Result<Vec<ReferenceRecord>, LibraryBuildError>;
}

/// A reference catalog read from an MSP file, held in memory
#[derive(Debug, Clone)]
pub struct MSPCatalog {
    path: PathBuf,
    records: Vec<MSPRecord>,
}

impl MSPCatalog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LibraryBuildError> {
        let path = path.as_ref();
        let reader = MSPReader::open_path(path).map_err(|source| LibraryBuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let records = reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| match e {
                MSPError::IOError(source) => LibraryBuildError::Io {
                    path: path.to_path_buf(),
                    source,
                },
                MSPError::MalformedPeakLine(line, text)
                | MSPError::MalformedHeaderLine(line, text) => {
                    LibraryBuildError::MalformedCatalog {
                        path: path.to_path_buf(),
                        line,
                        reason: format!("could not parse {text:?}"),
                    }
                }
            })?;
        debug!("Read {} reference entries from {}", records.len(), path.display());
        Self::from_records(path, records)
    }

    /// Every record must declare a precursor m/z and a known polarity
    pub fn from_records<P: Into<PathBuf>>(
        path: P,
        records: Vec<MSPRecord>,
    ) -> Result<Self, LibraryBuildError> {
        let path = path.into();
        for record in records.iter() {
            let reason = if record.precursor_mz.is_none() {
                Some("entry has no precursor m/z")
            } else if !record.effective_polarity().is_known() {
                Some("entry has no recognizable ion mode")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(LibraryBuildError::MalformedCatalog {
                    path,
                    line: record.line,
                    reason: format!("{reason} ({:?})", record.name),
                });
            }
        }
        Ok(Self { path, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn reference_id(&self, key: EntryKey, record: &MSPRecord) -> String {
        match record.identifier.as_ref() {
            Some(id) => id.clone(),
            None => {
                let stem = self
                    .path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("reference");
                format!("{stem}:{}", key + 1)
            }
        }
    }
}

impl ReferenceCatalog for MSPCatalog {
    fn location(&self) -> &Path {
        &self.path
    }

    fn precursors(&self, polarity: Polarity) -> Result<Vec<PrecursorEntry>, LibraryBuildError> {
        let mut entries: Vec<PrecursorEntry> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.effective_polarity() == polarity)
            .filter_map(|(key, r)| {
                r.precursor_mz.map(|precursor_mz| PrecursorEntry { key, precursor_mz })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.precursor_mz
                .total_cmp(&b.precursor_mz)
                .then(a.key.cmp(&b.key))
        });
        Ok(entries)
    }

    fn fetch(&self, keys: &[EntryKey]) -> Result<Vec<ReferenceRecord>, LibraryBuildError> {
        keys.iter()
            .map(|key| {
                let record = self
                    .records
                    .get(*key)
                    .ok_or(LibraryBuildError::MissingEntry(*key))?;
                let molecule_id = record
                    .inchikey
                    .clone()
                    .unwrap_or_else(|| record.name.clone());
                let spectrum = ReferenceSpectrum {
                    reference_id: self.reference_id(*key, record),
                    molecule_id: molecule_id.clone(),
                    precursor_mz: record.precursor_mz.unwrap_or_default(),
                    polarity: record.effective_polarity(),
                    peaks: PeakSet::new(
                        record
                            .peaks
                            .iter()
                            .filter(|(mz, _)| mz.is_finite())
                            .map(|(mz, intensity)| CentroidPeak::new(*mz, *intensity, 0))
                            .collect(),
                    ),
                };
                let mut attributes = record.attributes.clone();
                if let Some(precursor_type) = record.precursor_type.as_ref() {
                    attributes.insert("precursor_type".into(), precursor_type.clone());
                }
                let molecule = MoleculeMetadata {
                    id: molecule_id,
                    name: record.name.clone(),
                    formula: record.formula.clone(),
                    inchikey: record.inchikey.clone(),
                    inchi: record.inchi.clone(),
                    smiles: record.smiles.clone(),
                    attributes,
                };
                Ok(ReferenceRecord { spectrum, molecule })
            })
            .collect()
    }
}

/// Open the reference catalog at `path`, choosing a reader by extension
pub fn open_catalog(path: &Path) -> Result<Box<dyn ReferenceCatalog>, LibraryBuildError> {
    let (_, stem) = is_gzipped_extension(path);
    match stem
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("msp") => Ok(Box::new(MSPCatalog::open(path)?)),
        _ => Err(LibraryBuildError::UnsupportedCatalog(path.to_path_buf())),
    }
}
