//! Read [mzML](https://www.psidev.info/mzML) files with `mzdata`.
use std::fmt::Display;
use std::io::BufRead;
use std::path::Path;

use log::{debug, warn};
use mzdata::io::MzMLReader;
use mzdata::prelude::*;
use mzdata::spectrum::{MultiLayerSpectrum, RefPeakDataLevel, ScanPolarity, SignalContinuity};
use mzpeaks::CentroidPeak;

use crate::error::ProcessingError;
use crate::io::compression::open_maybe_gzipped;
use crate::io::format::{MassSpectrometryFormat, ScanReader};
use crate::spectrum::{Polarity, ScanCatalogue, ScanId, ScanRecord};

const FILTER_STRING: &str = "MS:1000512";

/// The `scan=` component of a native spectrum id, e.g.
/// `controllerType=0 controllerNumber=1 scan=19`
pub fn scan_number(native_id: &str) -> Option<ScanId> {
    native_id
        .split_whitespace()
        .find_map(|token| token.strip_prefix("scan="))
        .and_then(|value| value.parse().ok())
}

fn convert_polarity(polarity: ScanPolarity) -> Polarity {
    match polarity {
        ScanPolarity::Positive => Polarity::Positive,
        ScanPolarity::Negative => Polarity::Negative,
        _ => Polarity::Unknown,
    }
}

/// The built-in [`ScanReader`] for mzML files, plain or gzipped.
///
/// Scans are numbered from the `scan=` part of their native id, or by their
/// position in the file when the id has none. Profile spectra keep their
/// metadata but no peaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct MzMLScanReader;

impl MzMLScanReader {
    fn open(path: &Path) -> Result<MzMLReader<Box<dyn BufRead + Send>>, ProcessingError> {
        let handle = open_maybe_gzipped(path).map_err(|source| ProcessingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(MzMLReader::new(handle))
    }

    fn malformed<E: Display>(path: &Path, spectrum: &MultiLayerSpectrum, err: E) -> ProcessingError {
        ProcessingError::MalformedInput {
            path: path.to_path_buf(),
            reason: format!("{}: {err}", spectrum.id()),
        }
    }

    fn peaks(path: &Path, spectrum: &MultiLayerSpectrum) -> Result<Vec<(f64, f32)>, ProcessingError> {
        let peaks = match spectrum.peaks() {
            RefPeakDataLevel::Centroid(centroids) => {
                centroids.iter().map(|p| (p.mz, p.intensity)).collect()
            }
            RefPeakDataLevel::RawData(_) if spectrum.signal_continuity() == SignalContinuity::Profile => {
                debug!("{}: {} is a profile spectrum", path.display(), spectrum.id());
                Vec::new()
            }
            RefPeakDataLevel::RawData(arrays) => {
                let mzs = arrays.mzs().map_err(|e| Self::malformed(path, spectrum, e))?;
                let intensities = arrays
                    .intensities()
                    .map_err(|e| Self::malformed(path, spectrum, e))?;
                mzs.iter().copied().zip(intensities.iter().copied()).collect()
            }
            _ => Vec::new(),
        };
        Ok(peaks)
    }

    fn convert(path: &Path, spectrum: &MultiLayerSpectrum) -> Result<ScanRecord, ProcessingError> {
        let mut peaks = Self::peaks(path, spectrum)?;
        peaks.retain(|(mz, _)| mz.is_finite());
        peaks.sort_by(|a, b| a.0.total_cmp(&b.0));

        let filter = spectrum
            .acquisition()
            .first_scan()
            .and_then(|event| event.get_param_by_accession(FILTER_STRING))
            .map(|param| param.value.to_string())
            .unwrap_or_default();
        let ion = spectrum.precursor().and_then(|p| p.ion());
        let scan = scan_number(spectrum.id()).unwrap_or(spectrum.index() as ScanId + 1);

        Ok(ScanRecord {
            scan,
            ms_level: spectrum.ms_level(),
            start_time: spectrum.start_time(),
            polarity: convert_polarity(spectrum.polarity()),
            filter,
            precursor_mz: ion.map(|i| i.mz),
            precursor_intensity: ion.map(|i| i.intensity).unwrap_or_default(),
            peaks: peaks
                .into_iter()
                .enumerate()
                .map(|(i, (mz, intensity))| CentroidPeak::new(mz, intensity, i as u32))
                .collect(),
        })
    }
}

impl ScanReader for MzMLScanReader {
    fn format(&self) -> MassSpectrometryFormat {
        MassSpectrometryFormat::MzML
    }

    fn parse(&self, path: &Path) -> Result<ScanCatalogue, ProcessingError> {
        let reader = Self::open(path)?;
        let mut scans = Vec::new();
        for spectrum in reader {
            scans.push(Self::convert(path, &spectrum)?);
        }
        if scans.is_empty() {
            warn!("No spectra were read from {}", path.display());
        }
        debug!("Read {} spectra from {}", scans.len(), path.display());
        Ok(ScanCatalogue::new(scans))
    }

    fn polarity(&self, path: &Path) -> Result<Polarity, ProcessingError> {
        let reader = Self::open(path)?;
        for spectrum in reader {
            let polarity = convert_polarity(spectrum.polarity());
            if polarity.is_known() {
                return Ok(polarity);
            }
        }
        Err(ProcessingError::UnknownPolarity(path.to_path_buf()))
    }
}
