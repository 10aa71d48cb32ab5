use mzpeaks::prelude::*;
use mzpeaks::{PeakSet, Tolerance};

/// Scores the similarity of a query spectrum against a reference spectrum
pub trait SimilarityScorer: Send + Sync {
    /// Fragments are paired within `tolerance`. The result lies in `[0, 1]`.
    fn score(&self, query: &PeakSet, reference: &PeakSet, tolerance: Tolerance) -> f64;
}

/// Unweighted spectral entropy similarity.
///
/// Each spectrum is scaled to unit total intensity and peaks are paired one to
/// one within the tolerance, closest pairs first. With `S` the Shannon entropy and
/// `M = (P + Q) / 2`, the similarity is `1 - (2 S(M) - S(P) - S(Q)) / ln 4`, which
/// only depends on the paired peaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntropySimilarity;

fn x_ln_x(x: f64) -> f64 {
    if x > 0.0 {
        x * x.ln()
    } else {
        0.0
    }
}

/// Pair the peaks of `query` and `reference` within `tolerance`, greedily by
/// increasing m/z difference. Pairs are positions in each peak set.
pub(crate) fn pair_peaks(
    query: &PeakSet,
    reference: &PeakSet,
    tolerance: Tolerance,
) -> Vec<(usize, usize)> {
    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (i, q) in query.iter().enumerate() {
        for r in reference.all_peaks_for(q.mz, tolerance) {
            candidates.push(((r.mz - q.mz).abs(), i, r.index as usize));
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut query_used = vec![false; query.len()];
    let mut reference_used = vec![false; reference.len()];
    let mut pairs = Vec::new();
    for (_, i, j) in candidates {
        if !query_used[i] && !reference_used[j] {
            query_used[i] = true;
            reference_used[j] = true;
            pairs.push((i, j));
        }
    }
    pairs
}

impl SimilarityScorer for EntropySimilarity {
    fn score(&self, query: &PeakSet, reference: &PeakSet, tolerance: Tolerance) -> f64 {
        let query_total: f64 = query.iter().map(|p| p.intensity as f64).sum();
        let reference_total: f64 = reference.iter().map(|p| p.intensity as f64).sum();
        if query_total <= 0.0 || reference_total <= 0.0 {
            return 0.0;
        }
        let shared: f64 = pair_peaks(query, reference, tolerance)
            .into_iter()
            .map(|(i, j)| {
                let p = query[i].intensity as f64 / query_total;
                let q = reference[j].intensity as f64 / reference_total;
                x_ln_x(p + q) - x_ln_x(p) - x_ln_x(q)
            })
            .sum();
        (shared / 4f64.ln()).clamp(0.0, 1.0)
    }
}
