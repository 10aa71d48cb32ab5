//! Scans as read from an instrument file, and the peak list cleaning shared by
//! reference indexing and query preparation.
use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use mzpeaks::{CentroidPeak, PeakSet};
use serde::{Deserialize, Serialize};

/// The scan number of a spectrum within its source file
pub type ScanId = u32;

/// The ionization polarity a scan was acquired in
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    #[default]
    Unknown,
    Positive,
    Negative,
}

impl Polarity {
    /// Interpret the many spellings used by instrument and library files,
    /// e.g. `positive`, `POS`, `P`, `+`, `negative`, `N`, `-`.
    pub fn parse_loose(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "p" | "+" | "1" => Self::Positive,
            "n" | "-" | "-1" => Self::Negative,
            _ if value.starts_with("pos") => Self::Positive,
            _ if value.starts_with("neg") => Self::Negative,
            _ => Self::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }

    /// Collapse a set of observed polarities into one, if they agree.
    pub fn unify<I: IntoIterator<Item = Polarity>>(polarities: I) -> Option<Polarity> {
        let observed: BTreeSet<Polarity> =
            polarities.into_iter().filter(|p| p.is_known()).collect();
        match observed.len() {
            0 => Some(Polarity::Unknown),
            1 => observed.into_iter().next(),
            _ => None,
        }
    }
}

impl Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Polarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse_loose(s) {
            Self::Unknown => Err(format!("Unrecognized polarity {s:?}")),
            p => Ok(p),
        }
    }
}

/// A single centroided scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scan: ScanId,
    pub ms_level: u8,
    /// Scan start time in minutes
    pub start_time: f64,
    pub polarity: Polarity,
    /// The instrument's scan filter line, or whatever text the source format offers
    /// in its place
    pub filter: String,
    pub precursor_mz: Option<f64>,
    pub precursor_intensity: f32,
    pub peaks: Vec<CentroidPeak>,
}

impl ScanRecord {
    pub fn is_tandem(&self) -> bool {
        self.ms_level > 1
    }
}

/// All scans of one instrument file, ordered by scan number
#[derive(Debug, Clone, Default)]
pub struct ScanCatalogue {
    scans: Vec<ScanRecord>,
}

impl ScanCatalogue {
    pub fn new(mut scans: Vec<ScanRecord>) -> Self {
        scans.sort_by_key(|s| s.scan);
        Self { scans }
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScanRecord> {
        self.scans.iter()
    }

    pub fn tandem_scans(&self) -> impl Iterator<Item = &ScanRecord> {
        self.scans.iter().filter(|s| s.is_tandem())
    }

    /// The first scan id carried by more than one scan, if any
    pub fn duplicate_scan(&self) -> Option<ScanId> {
        self.scans
            .windows(2)
            .find(|w| w[0].scan == w[1].scan)
            .map(|w| w[0].scan)
    }

    pub fn get(&self, scan: ScanId) -> Option<&ScanRecord> {
        self.scans
            .binary_search_by_key(&scan, |s| s.scan)
            .ok()
            .map(|i| &self.scans[i])
    }

    /// The single polarity of the run, `Some(Unknown)` if no scan declares one
    /// and `None` if scans disagree.
    pub fn polarity(&self) -> Option<Polarity> {
        Polarity::unify(self.scans.iter().map(|s| s.polarity))
    }
}

impl FromIterator<ScanRecord> for ScanCatalogue {
    fn from_iter<T: IntoIterator<Item = ScanRecord>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// How a peak list is cleaned before it is indexed or searched
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakCleaning {
    /// Peaks closer than this are merged into one
    pub merge_distance_da: f64,
    /// Peaks at or above this m/z are dropped
    pub max_mz: Option<f64>,
    /// Peaks below this fraction of the base peak are dropped
    pub noise_threshold: f32,
    /// Peaks within this distance of the precursor or above it are dropped
    pub precursor_removal_da: Option<f64>,
    pub normalize: bool,
}

impl Default for PeakCleaning {
    fn default() -> Self {
        Self {
            merge_distance_da: 0.0,
            max_mz: None,
            noise_threshold: 0.0,
            precursor_removal_da: None,
            normalize: true,
        }
    }
}

impl PeakCleaning {
    pub fn apply(&self, peaks: &[CentroidPeak], precursor_mz: Option<f64>) -> PeakSet {
        let mut kept: Vec<(f64, f32)> = peaks
            .iter()
            .filter(|p| p.intensity > 0.0 && p.mz.is_finite())
            .filter(|p| self.max_mz.map(|m| p.mz < m).unwrap_or(true))
            .filter(|p| match (self.precursor_removal_da, precursor_mz) {
                (Some(width), Some(prec)) => p.mz < prec - width,
                _ => true,
            })
            .map(|p| (p.mz, p.intensity))
            .collect();
        kept.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut merged = merge_close_peaks(kept, self.merge_distance_da);

        if self.noise_threshold > 0.0 {
            let base = merged.iter().map(|p| p.1).fold(0.0, f32::max);
            let cutoff = base * self.noise_threshold;
            merged.retain(|p| p.1 >= cutoff);
        }

        if self.normalize {
            normalize_intensities(&mut merged);
        }

        PeakSet::new(
            merged
                .into_iter()
                .map(|(mz, intensity)| CentroidPeak::new(mz, intensity, 0))
                .collect(),
        )
    }
}

/// Merge runs of peaks separated by less than `distance`, using intensity-weighted
/// m/z and summed intensity. Expects `peaks` sorted by m/z.
fn merge_close_peaks(peaks: Vec<(f64, f32)>, distance: f64) -> Vec<(f64, f32)> {
    if distance <= 0.0 {
        return peaks;
    }
    let mut merged: Vec<(f64, f32)> = Vec::with_capacity(peaks.len());
    for (mz, intensity) in peaks {
        match merged.last_mut() {
            Some(last) if mz - last.0 < distance => {
                let total = last.1 + intensity;
                last.0 = (last.0 * last.1 as f64 + mz * intensity as f64) / total as f64;
                last.1 = total;
            }
            _ => merged.push((mz, intensity)),
        }
    }
    merged
}

fn normalize_intensities(peaks: &mut [(f64, f32)]) {
    let total: f64 = peaks.iter().map(|p| p.1 as f64).sum();
    if total > 0.0 {
        for p in peaks.iter_mut() {
            p.1 = (p.1 as f64 / total) as f32;
        }
    }
}
