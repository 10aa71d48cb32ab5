use std::io::{self, prelude::*};
use std::path::Path;

use indexmap::IndexMap;
use thiserror::Error;

use crate::io::compression::open_maybe_gzipped;
use crate::spectrum::Polarity;

#[derive(Debug, Error)]
pub enum MSPError {
    #[error("Encountered a malformed peak line at line {0}: {1}")]
    MalformedPeakLine(usize, String),
    #[error("Encountered a malformed header line at line {0}: {1}")]
    MalformedHeaderLine(usize, String),
    #[error("Encountered an IO error: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
}

/// One library spectrum as written in an MSP file.
///
/// Recognized fields are lifted out, everything else is kept in `attributes`
/// under its original key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MSPRecord {
    pub name: String,
    pub precursor_mz: Option<f64>,
    pub polarity: Polarity,
    pub precursor_type: Option<String>,
    pub identifier: Option<String>,
    pub inchikey: Option<String>,
    pub inchi: Option<String>,
    pub smiles: Option<String>,
    pub formula: Option<String>,
    pub declared_peak_count: Option<usize>,
    pub attributes: IndexMap<String, String>,
    /// Peaks sorted by m/z with zero intensities removed
    pub peaks: Vec<(f64, f32)>,
    /// The line the record starts on
    pub line: usize,
}

impl MSPRecord {
    fn is_empty(&self) -> bool {
        self.name.is_empty() && self.attributes.is_empty() && self.peaks.is_empty()
            && self.precursor_mz.is_none()
    }

    /// The record's polarity, falling back to the charge sign of its precursor
    /// type, e.g. `[M+H]+`
    pub fn effective_polarity(&self) -> Polarity {
        if self.polarity.is_known() {
            return self.polarity;
        }
        match self.precursor_type.as_deref().map(str::trim) {
            Some(t) if t.ends_with('+') => Polarity::Positive,
            Some(t) if t.ends_with('-') => Polarity::Negative,
            _ => Polarity::Unknown,
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// A reader over the records of an MSP file
pub struct MSPReaderType<R: BufRead> {
    handle: R,
    line_number: usize,
    pending: Option<MSPRecord>,
    done: bool,
}

impl<R: BufRead> MSPReaderType<R> {
    pub fn new(handle: R) -> Self {
        Self {
            handle,
            line_number: 0,
            pending: None,
            done: false,
        }
    }

    fn parse_peaks(&self, line: &str, record: &mut MSPRecord) -> Result<(), MSPError> {
        for pair in line.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let mut tokens = pair.split_ascii_whitespace();
            let (mz, intensity) = match (tokens.next(), tokens.next()) {
                (Some(mz), Some(intensity)) => (mz, intensity),
                _ => return Err(MSPError::MalformedPeakLine(self.line_number, line.into())),
            };
            match (mz.parse::<f64>(), intensity.parse::<f32>()) {
                (Ok(mz), Ok(intensity)) => {
                    if intensity > 0.0 {
                        record.peaks.push((mz, intensity))
                    }
                }
                _ => return Err(MSPError::MalformedPeakLine(self.line_number, line.into())),
            }
        }
        Ok(())
    }

    fn parse_header(&self, line: &str, record: &mut MSPRecord) -> Result<(), MSPError> {
        let (key, value) = match line.split_once(':') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => {
                return Err(MSPError::MalformedHeaderLine(
                    self.line_number,
                    line.into(),
                ))
            }
        };
        match normalize_key(key).as_str() {
            "name" => record.name = value.to_string(),
            "precursormz" => match value.parse::<f64>() {
                Ok(mz) => record.precursor_mz = Some(mz),
                Err(e) => {
                    return Err(MSPError::MalformedHeaderLine(
                        self.line_number,
                        format!("{line}: {e}"),
                    ))
                }
            },
            "ionmode" | "polarity" => record.polarity = Polarity::parse_loose(value),
            "precursortype" => record.precursor_type = Some(value.to_string()),
            "db#" | "id" | "spectrumid" => record.identifier = Some(value.to_string()),
            "inchikey" => record.inchikey = Some(value.to_string()),
            "inchi" => record.inchi = Some(value.to_string()),
            "smiles" => record.smiles = Some(value.to_string()),
            "formula" => record.formula = Some(value.to_string()),
            "numpeaks" => record.declared_peak_count = value.parse().ok(),
            _ => {
                record.attributes.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn finish(mut record: MSPRecord) -> MSPRecord {
        record.peaks.sort_by(|a, b| a.0.total_cmp(&b.0));
        record
    }

    pub fn read_next(&mut self) -> Option<Result<MSPRecord, MSPError>> {
        if self.done {
            return None;
        }
        let mut record = self.pending.take().unwrap_or_default();
        let mut buffer = String::new();
        loop {
            buffer.clear();
            let b = match self.handle.read_line(&mut buffer) {
                Ok(b) => b,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if b == 0 {
                self.done = true;
                return (!record.is_empty()).then(|| Ok(Self::finish(record)));
            }
            self.line_number += 1;
            let line = buffer.trim();
            if line.is_empty() {
                if record.is_empty() {
                    continue;
                }
                return Some(Ok(Self::finish(record)));
            }
            if line.starts_with('#') {
                continue;
            }
            let outcome = if line.starts_with(|c: char| c.is_ascii_digit()) {
                self.parse_peaks(line, &mut record)
            } else {
                let starts_record = normalize_key(line.split(':').next().unwrap_or_default())
                    == "name"
                    && !record.is_empty();
                if starts_record {
                    // A record that was not terminated by a blank line
                    let mut next = MSPRecord {
                        line: self.line_number,
                        ..Default::default()
                    };
                    if let Err(e) = self.parse_header(line, &mut next) {
                        self.done = true;
                        return Some(Err(e));
                    }
                    self.pending = Some(next);
                    return Some(Ok(Self::finish(record)));
                }
                if record.is_empty() {
                    record.line = self.line_number;
                }
                self.parse_header(line, &mut record)
            };
            if let Err(e) = outcome {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

impl<R: BufRead> Iterator for MSPReaderType<R> {
    type Item = Result<MSPRecord, MSPError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next()
    }
}

pub type MSPReader = MSPReaderType<Box<dyn BufRead + Send>>;

impl MSPReader {
    pub fn open_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(open_maybe_gzipped(path.as_ref())?))
    }
}
