use std::io::{self, prelude::*};
use std::path::Path;

use log::{debug, warn};
use mzpeaks::CentroidPeak;
use thiserror::Error;

use crate::error::ProcessingError;
use crate::io::compression::open_maybe_gzipped;
use crate::io::format::{MassSpectrometryFormat, ScanReader};
use crate::spectrum::{Polarity, ScanCatalogue, ScanId, ScanRecord};

#[derive(PartialEq, Debug)]
pub enum MGFParserState {
    Start,
    FileHeader,
    ScanHeaders,
    Peaks,
    Between,
    Done,
    Error,
}

#[derive(Debug, Error)]
pub enum MGFError {
    #[error("No error occurred")]
    NoError,
    #[error("Encountered a malformed peak line: {0}")]
    MalformedPeakLine(String),
    #[error("Encountered a malformed header line: {0}")]
    MalformedHeaderLine(String),
    #[error("Not enough columns for peak line encountered")]
    NotEnoughColumnsForPeakLine,
    #[error("Reached the end of the file before END IONS")]
    UnterminatedSpectrum,
    #[error("Encountered an IO error: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
}

#[derive(Debug, Default)]
struct ScanBuilder {
    title: Option<String>,
    filter: Option<String>,
    scan: Option<ScanId>,
    ms_level: Option<u8>,
    start_time: f64,
    precursor_mz: Option<f64>,
    precursor_intensity: f32,
    declared_polarity: Polarity,
    charge_polarity: Polarity,
    peaks: Vec<(f64, f32)>,
}

/// A line-oriented MGF parser that yields one [`ScanRecord`] per `BEGIN IONS` block.
///
/// Polarity is taken from a `POLARITY` or `IONMODE` header, then from an explicitly
/// signed `CHARGE`, then from the file header.
pub struct MGFReaderType<R: BufRead> {
    pub handle: R,
    pub state: MGFParserState,
    pub error: Option<MGFError>,
    line_number: usize,
    last_scan: ScanId,
    file_polarity: Polarity,
}

impl<R: BufRead> MGFReaderType<R> {
    pub fn new(handle: R) -> Self {
        Self {
            handle,
            state: MGFParserState::Start,
            error: None,
            line_number: 0,
            last_scan: 0,
            file_polarity: Polarity::Unknown,
        }
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }

    fn set_error(&mut self, error: MGFError) {
        self.state = MGFParserState::Error;
        self.error = Some(error);
    }

    fn parse_peak_from_line(&mut self, line: &str, builder: &mut ScanBuilder) -> bool {
        let first = match line.chars().next() {
            Some(c) => c,
            None => return false,
        };
        if !first.is_ascii_digit() {
            return false;
        }
        let mut it = line.split_ascii_whitespace();
        let (mz_token, intensity_token) = match (it.next(), it.next()) {
            (Some(mz), Some(intensity)) => (mz, intensity),
            _ => {
                self.set_error(MGFError::NotEnoughColumnsForPeakLine);
                return true;
            }
        };
        match (mz_token.parse::<f64>(), intensity_token.parse::<f32>()) {
            (Ok(mz), Ok(intensity)) => builder.peaks.push((mz, intensity)),
            _ => self.set_error(MGFError::MalformedPeakLine(line.to_string())),
        }
        true
    }

    /// Parse a charge token like `2+`, `1-`, `-1` or `3`, reporting whether the sign
    /// was written explicitly
    fn parse_charge(&mut self, value: &str) -> Option<(i32, bool)> {
        let value = value
            .split(|c: char| c == ',' || c.is_ascii_whitespace())
            .next()
            .unwrap_or(value);
        let (sign, digits, explicit) = if let Some(stripped) = value.strip_suffix('+') {
            (1, stripped, true)
        } else if let Some(stripped) = value.strip_suffix('-') {
            (-1, stripped, true)
        } else if let Some(stripped) = value.strip_prefix('-') {
            (-1, stripped, true)
        } else if let Some(stripped) = value.strip_prefix('+') {
            (1, stripped, true)
        } else {
            (1, value, false)
        };

        match digits.parse::<i32>() {
            Ok(z) if z >= 0 => Some((sign * z, explicit)),
            _ => {
                self.set_error(MGFError::MalformedHeaderLine(format!(
                    "Could not parse charge value {value}"
                )));
                None
            }
        }
    }

    fn charge_polarity(charge: Option<(i32, bool)>) -> Polarity {
        match charge {
            Some((z, true)) if z < 0 => Polarity::Negative,
            Some((z, true)) if z > 0 => Polarity::Positive,
            _ => Polarity::Unknown,
        }
    }

    fn handle_scan_header(&mut self, line: &str, builder: &mut ScanBuilder) -> bool {
        if self.parse_peak_from_line(line, builder) {
            if self.state == MGFParserState::Error {
                return false;
            }
            self.state = MGFParserState::Peaks;
            return true;
        }
        if line == "END IONS" {
            self.state = MGFParserState::Between;
            return false;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim().to_ascii_uppercase(), value.trim()),
            None => {
                self.set_error(MGFError::MalformedHeaderLine(format!(
                    "No '=' in header line {line:?}"
                )));
                return false;
            }
        };
        match key.as_str() {
            "TITLE" => builder.title = Some(value.to_string()),
            "FILTER" | "SCANFILTER" | "FILTER_STRING" => builder.filter = Some(value.to_string()),
            "RTINSECONDS" => match value.parse::<f64>() {
                Ok(rt) => builder.start_time = rt / 60.0,
                Err(e) => warn!("Failed to parse RTINSECONDS {value}: {e}"),
            },
            "SCANS" => {
                let first = value.split(['-', ',']).next().unwrap_or(value).trim();
                match first.parse::<ScanId>() {
                    Ok(scan) => builder.scan = Some(scan),
                    Err(e) => warn!("Failed to parse SCANS {value}: {e}"),
                }
            }
            "MSLEVEL" => match value.parse::<u8>() {
                Ok(level) => builder.ms_level = Some(level),
                Err(e) => warn!("Failed to parse MSLEVEL {value}: {e}"),
            },
            "PEPMASS" => {
                let mut parts = value.split_ascii_whitespace();
                let mz: f64 = match parts.next().map(|s| s.parse()) {
                    Some(Ok(mz)) => mz,
                    Some(Err(e)) => {
                        self.set_error(MGFError::MalformedHeaderLine(format!(
                            "Malformed m/z value in PEPMASS header {value}: {e}"
                        )));
                        return false;
                    }
                    None => {
                        self.set_error(MGFError::MalformedHeaderLine(
                            "No m/z value in PEPMASS header".into(),
                        ));
                        return false;
                    }
                };
                builder.precursor_mz = Some(mz);
                builder.precursor_intensity = parts
                    .next()
                    .map(|v| v.parse())
                    .unwrap_or(Ok(0.0))
                    .map_err(|e| warn!("Failed to parse PEPMASS intensity {value}: {e}"))
                    .unwrap_or_default();
                if let Some(c) = parts.next() {
                    let charge = self.parse_charge(c);
                    if builder.charge_polarity == Polarity::Unknown {
                        builder.charge_polarity = Self::charge_polarity(charge);
                    }
                }
            }
            "CHARGE" => {
                let charge = self.parse_charge(value);
                builder.charge_polarity = Self::charge_polarity(charge);
            }
            "POLARITY" | "IONMODE" | "ION_MODE" => {
                builder.declared_polarity = Polarity::parse_loose(value);
            }
            _ => {
                debug!("Ignoring MGF header {key}");
            }
        }
        self.state != MGFParserState::Error
    }

    fn handle_peak(&mut self, line: &str, builder: &mut ScanBuilder) -> bool {
        if self.parse_peak_from_line(line, builder) {
            self.state != MGFParserState::Error
        } else if line == "END IONS" {
            self.state = MGFParserState::Between;
            false
        } else {
            self.set_error(MGFError::MalformedPeakLine(line.to_string()));
            false
        }
    }

    fn handle_start(&mut self, line: &str) -> bool {
        if line == "BEGIN IONS" {
            self.state = MGFParserState::ScanHeaders;
        } else if let Some((key, value)) = line.split_once('=') {
            self.state = MGFParserState::FileHeader;
            let key = key.trim().to_ascii_uppercase();
            if matches!(key.as_str(), "POLARITY" | "IONMODE" | "ION_MODE") {
                self.file_polarity = Polarity::parse_loose(value);
            }
        } else if !line.starts_with('#') {
            self.set_error(MGFError::MalformedHeaderLine(format!(
                "Unexpected line before the first spectrum {line:?}"
            )));
            return false;
        }
        true
    }

    fn handle_between(&mut self, line: &str) -> bool {
        if line == "BEGIN IONS" {
            self.state = MGFParserState::ScanHeaders;
        }
        true
    }

    /// Read the lines of the next spectrum into `builder`, returning whether a
    /// spectrum was started
    fn parse_into(&mut self, builder: &mut ScanBuilder) -> Result<bool, MGFError> {
        let mut buffer = String::new();
        let mut started = false;
        loop {
            buffer.clear();
            let b = match self.handle.read_line(&mut buffer) {
                Ok(b) => b,
                Err(err) => {
                    self.state = MGFParserState::Error;
                    return Err(MGFError::IOError(err));
                }
            };
            if b == 0 {
                let in_spectrum = matches!(
                    self.state,
                    MGFParserState::ScanHeaders | MGFParserState::Peaks
                );
                self.state = MGFParserState::Done;
                if in_spectrum {
                    return Err(MGFError::UnterminatedSpectrum);
                }
                return Ok(false);
            }
            self.line_number += 1;

            let line = buffer.trim();
            // Skip empty lines
            if line.is_empty() {
                continue;
            }

            let work = match self.state {
                MGFParserState::Start | MGFParserState::FileHeader => self.handle_start(line),
                MGFParserState::Between => self.handle_between(line),
                MGFParserState::ScanHeaders => {
                    started = true;
                    self.handle_scan_header(line, builder)
                }
                MGFParserState::Peaks => self.handle_peak(line, builder),
                MGFParserState::Done => false,
                MGFParserState::Error => {
                    return Err(self.error.take().unwrap_or(MGFError::NoError));
                }
            };

            if self.state == MGFParserState::Error {
                return Err(self.error.take().unwrap_or(MGFError::NoError));
            }
            if !work {
                return Ok(started);
            }
        }
    }

    fn finish(&mut self, builder: ScanBuilder) -> ScanRecord {
        let polarity = [
            builder.declared_polarity,
            builder.charge_polarity,
            self.file_polarity,
        ]
        .into_iter()
        .find(|p| p.is_known())
        .unwrap_or_default();

        let mut peaks = builder.peaks;
        peaks.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Unnumbered blocks continue after the highest number seen so far
        let scan = builder.scan.unwrap_or(self.last_scan.saturating_add(1));
        self.last_scan = self.last_scan.max(scan);

        ScanRecord {
            scan,
            ms_level: builder.ms_level.unwrap_or(2),
            start_time: builder.start_time,
            polarity,
            filter: builder.filter.or(builder.title).unwrap_or_default(),
            precursor_mz: builder.precursor_mz,
            precursor_intensity: builder.precursor_intensity,
            peaks: peaks
                .into_iter()
                .enumerate()
                .map(|(i, (mz, intensity))| CentroidPeak::new(mz, intensity, i as u32))
                .collect(),
        }
    }

    /// Read the next spectrum from the file, if there is one.
    pub fn read_next(&mut self) -> Option<Result<ScanRecord, MGFError>> {
        if matches!(self.state, MGFParserState::Done | MGFParserState::Error) {
            return None;
        }
        let mut builder = ScanBuilder::default();
        match self.parse_into(&mut builder) {
            Ok(true) => Some(Ok(self.finish(builder))),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// Read only as far as needed to learn the polarity of the file
    pub fn sniff_polarity(&mut self) -> Result<Polarity, MGFError> {
        while let Some(scan) = self.read_next() {
            let scan = scan?;
            if scan.polarity.is_known() {
                return Ok(scan.polarity);
            }
        }
        Ok(self.file_polarity)
    }
}

impl<R: BufRead> Iterator for MGFReaderType<R> {
    type Item = Result<ScanRecord, MGFError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next()
    }
}

pub type MGFReader = MGFReaderType<Box<dyn BufRead + Send>>;

impl MGFReader {
    pub fn open_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(open_maybe_gzipped(path.as_ref())?))
    }
}

/// The built-in [`ScanReader`] for MGF files, plain or gzipped
#[derive(Debug, Default, Clone, Copy)]
pub struct MGFScanReader;

impl MGFScanReader {
    fn convert_error<R: BufRead>(
        path: &Path,
        reader: &MGFReaderType<R>,
        err: MGFError,
    ) -> ProcessingError {
        match err {
            MGFError::IOError(source) => ProcessingError::Io {
                path: path.to_path_buf(),
                source,
            },
            err => ProcessingError::MalformedInput {
                path: path.to_path_buf(),
                reason: format!("line {}: {}", reader.line_number(), err),
            },
        }
    }

    fn open(path: &Path) -> Result<MGFReader, ProcessingError> {
        MGFReader::open_path(path).map_err(|source| ProcessingError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ScanReader for MGFScanReader {
    fn format(&self) -> MassSpectrometryFormat {
        MassSpectrometryFormat::MGF
    }

    fn parse(&self, path: &Path) -> Result<ScanCatalogue, ProcessingError> {
        let mut reader = Self::open(path)?;
        let mut scans = Vec::new();
        while let Some(scan) = reader.read_next() {
            match scan {
                Ok(scan) => scans.push(scan),
                Err(err) => return Err(Self::convert_error(path, &reader, err)),
            }
        }
        debug!("Read {} spectra from {}", scans.len(), path.display());
        Ok(ScanCatalogue::new(scans))
    }

    fn polarity(&self, path: &Path) -> Result<Polarity, ProcessingError> {
        let mut reader = Self::open(path)?;
        match reader.sniff_polarity() {
            Ok(Polarity::Unknown) => Err(ProcessingError::UnknownPolarity(path.to_path_buf())),
            Ok(polarity) => Ok(polarity),
            Err(err) => Err(Self::convert_error(path, &reader, err)),
        }
    }
}
