use log::debug;

use super::{EngineConfig, ExtractedFeatures, ObservedFeature, ProcessingEngine};
use crate::error::ProcessingError;
use crate::spectrum::{Polarity, ScanCatalogue, ScanRecord};

/// The mass difference between the monoisotopic and M+1 peaks, 13C - 12C
pub const ISOTOPE_SPACING: f64 = 1.003355;

#[derive(Debug)]
struct Cluster<'a> {
    anchor_mz: f64,
    rt_min: f64,
    rt_max: f64,
    members: Vec<&'a ScanRecord>,
}

impl<'a> Cluster<'a> {
    fn new(scan: &'a ScanRecord, mz: f64) -> Self {
        Self {
            anchor_mz: mz,
            rt_min: scan.start_time,
            rt_max: scan.start_time,
            members: vec![scan],
        }
    }

    fn accepts(&self, mz: f64, rt: f64, config: &EngineConfig) -> bool {
        config.feature_tolerance().test(mz, self.anchor_mz)
            && rt >= self.rt_min - config.feature_rt_window
            && rt <= self.rt_max + config.feature_rt_window
    }

    fn push(&mut self, scan: &'a ScanRecord) {
        self.rt_min = self.rt_min.min(scan.start_time);
        self.rt_max = self.rt_max.max(scan.start_time);
        self.members.push(scan);
    }

    fn weighted_mz(&self) -> f64 {
        let weights: Vec<f64> = self
            .members
            .iter()
            .map(|s| s.precursor_intensity.max(0.0) as f64)
            .collect();
        let total: f64 = weights.iter().sum();
        let mzs = self.members.iter().map(|s| s.precursor_mz.unwrap_or_default());
        if total > 0.0 {
            mzs.zip(weights.iter())
                .map(|(mz, w)| mz * w)
                .sum::<f64>()
                / total
        } else {
            mzs.sum::<f64>() / self.members.len() as f64
        }
    }

    fn apex(&self) -> &'a ScanRecord {
        let mut apex = self.members[0];
        for scan in self.members.iter().skip(1) {
            if scan.precursor_intensity > apex.precursor_intensity {
                apex = *scan;
            }
        }
        apex
    }
}

/// Groups tandem scans into features by precursor m/z and retention time.
///
/// A feature's m/z is the precursor intensity-weighted mean of its scans and its
/// retention time is that of its most intense scan. Scans with fewer than
/// `min_tandem_peaks` peaks still shape the feature but are not attached to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrecursorClusterEngine;

impl PrecursorClusterEngine {
    fn cluster<'a>(&self, catalogue: &'a ScanCatalogue, config: &EngineConfig) -> Vec<Cluster<'a>> {
        let mut candidates: Vec<(f64, &ScanRecord)> = catalogue
            .tandem_scans()
            .filter_map(|s| s.precursor_mz.map(|mz| (mz, s)))
            .collect();
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.start_time.total_cmp(&b.1.start_time))
        });

        let mut clusters: Vec<Cluster<'a>> = Vec::new();
        for (mz, scan) in candidates {
            let (floor, _) = config.feature_tolerance().bounds(mz);
            let mut assigned = None;
            // Anchors never decrease, so stop at the first one out of reach
            for (i, cluster) in clusters.iter().enumerate().rev() {
                if cluster.anchor_mz < floor {
                    break;
                }
                if cluster.accepts(mz, scan.start_time, config) {
                    assigned = Some(i);
                    break;
                }
            }
            match assigned {
                Some(i) => clusters[i].push(scan),
                None => clusters.push(Cluster::new(scan, mz)),
            }
        }
        clusters
    }

    fn flag_isotopologues(features: &mut [ObservedFeature], config: &EngineConfig) {
        let mzs: Vec<f64> = features.iter().map(|f| f.mz).collect();
        let rts: Vec<f64> = features.iter().map(|f| f.retention_time).collect();
        let tolerance = config.feature_tolerance();
        for feature in features.iter_mut() {
            let (lo, hi) = tolerance.bounds(feature.mz - ISOTOPE_SPACING);
            let start = mzs.partition_point(|mz| *mz < lo);
            feature.isotopologue = mzs[start..]
                .iter()
                .zip(rts[start..].iter())
                .take_while(|(mz, _)| **mz <= hi)
                .any(|(_, rt)| (rt - feature.retention_time).abs() <= config.feature_rt_window);
        }
    }
}

impl ProcessingEngine for PrecursorClusterEngine {
    fn extract(
        &self,
        catalogue: &ScanCatalogue,
        config: &EngineConfig,
        polarity: Polarity,
    ) -> Result<ExtractedFeatures, ProcessingError> {
        if !(config.feature_mz_tolerance_ppm >= 0.0 && config.feature_rt_window >= 0.0) {
            return Err(ProcessingError::Engine(format!(
                "Feature tolerances must be non-negative, got {} ppm and {} min",
                config.feature_mz_tolerance_ppm, config.feature_rt_window
            )));
        }

        let clusters = self.cluster(catalogue, config);
        let mut spectra = Vec::new();
        let mut features: Vec<ObservedFeature> = clusters
            .iter()
            .map(|cluster| {
                let apex = cluster.apex();
                let mut attached: Vec<&ScanRecord> = cluster
                    .members
                    .iter()
                    .copied()
                    .filter(|s| s.peaks.len() >= config.min_tandem_peaks.max(1))
                    .collect();
                attached.sort_by_key(|s| s.scan);
                spectra.extend(attached.iter().map(|s| (*s).clone()));
                ObservedFeature {
                    id: 0,
                    mz: cluster.weighted_mz(),
                    retention_time: apex.start_time,
                    polarity,
                    apex_intensity: apex.precursor_intensity,
                    isotopologue: false,
                    tandem_scans: attached.iter().map(|s| s.scan).collect(),
                }
            })
            .collect();

        features.sort_by(|a, b| {
            a.mz.total_cmp(&b.mz)
                .then(a.retention_time.total_cmp(&b.retention_time))
        });
        for (i, feature) in features.iter_mut().enumerate() {
            feature.id = i;
        }
        Self::flag_isotopologues(&mut features, config);
        spectra.sort_by_key(|s| s.scan);

        debug!(
            "Extracted {} features ({} with tandem scans) from {} scans",
            features.len(),
            features.iter().filter(|f| f.has_tandem()).count(),
            catalogue.len()
        );
        Ok(ExtractedFeatures { features, spectra })
    }
}
