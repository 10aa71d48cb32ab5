use mzpeaks::Tolerance;

use crate::library::catalog::{EntryKey, PrecursorEntry};

/// `(reference - query) / reference * 1e6`, positive when the query mass is
/// below the reference
pub fn ppm_error(query: f64, reference: f64) -> f64 {
    -Tolerance::PPM(0.0).call(query, reference)
}

/// Sort, deduplicate and drop non-finite values from a set of query masses
pub fn prepare_query_masses<I: IntoIterator<Item = f64>>(masses: I) -> Vec<f64> {
    let mut masses: Vec<f64> = masses.into_iter().filter(|m| m.is_finite()).collect();
    masses.sort_by(|a, b| a.total_cmp(b));
    masses.dedup();
    masses
}

/// The index of the value in `sorted` closest to `target`.
///
/// Only the floor and ceiling insertion candidates are compared. When both are
/// equally close the lower index wins.
pub fn nearest_index(sorted: &[f64], target: f64) -> Option<usize> {
    if sorted.is_empty() {
        return None;
    }
    let ceiling = sorted.partition_point(|v| *v < target);
    if ceiling == 0 {
        return Some(0);
    }
    if ceiling == sorted.len() {
        return Some(ceiling - 1);
    }
    let floor = ceiling - 1;
    if target - sorted[floor] <= sorted[ceiling] - target {
        Some(floor)
    } else {
        Some(ceiling)
    }
}

/// A reference entry whose nearest observed precursor is within tolerance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborMatch {
    pub key: EntryKey,
    pub reference_mz: f64,
    pub query_mz: f64,
    /// `(reference - query) / reference * 1e6`
    pub ppm_error: f64,
}

/// Keep the reference entries whose nearest query mass lies within `tolerance`
/// of the entry's precursor.
///
/// `query_masses` must be sorted ascending.
pub fn filter_by_nearest_query(
    entries: &[PrecursorEntry],
    query_masses: &[f64],
    tolerance: Tolerance,
) -> Vec<NeighborMatch> {
    entries
        .iter()
        .filter_map(|entry| {
            let nearest = nearest_index(query_masses, entry.precursor_mz)?;
            let query_mz = query_masses[nearest];
            tolerance
                .test(query_mz, entry.precursor_mz)
                .then(|| NeighborMatch {
                    key: entry.key,
                    reference_mz: entry.precursor_mz,
                    query_mz,
                    ppm_error: ppm_error(query_mz, entry.precursor_mz),
                })
        })
        .collect()
}
