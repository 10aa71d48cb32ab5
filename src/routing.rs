//! Assigning tandem scans to acquisition parameter profiles and resolution tiers.
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use indexmap::IndexMap;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, ValidationError};
use crate::spectrum::{ScanCatalogue, ScanId};

/// The resolution a tandem scan was acquired at, which selects the reference
/// index it is searched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTier {
    High,
    Low,
}

impl ResolutionTier {
    pub const ALL: [ResolutionTier; 2] = [ResolutionTier::High, ResolutionTier::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

impl Display for ResolutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One routing table entry as written in a routing table file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRoute {
    /// A regular expression searched for in each scan's filter text. Empty matches
    /// every scan.
    #[serde(default)]
    pub scan_filter: String,
    pub resolution: ResolutionTier,
}

impl ScanRoute {
    pub fn new<S: Into<String>>(scan_filter: S, resolution: ResolutionTier) -> Self {
        Self {
            scan_filter: scan_filter.into(),
            resolution,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    route: ScanRoute,
    pattern: Option<Regex>,
}

impl CompiledRoute {
    fn matches(&self, filter_text: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(filter_text),
            None => true,
        }
    }
}

/// A validated mapping from routing key to scan filter and resolution tier
#[derive(Debug, Clone)]
pub struct ScanRouteTable {
    routes: IndexMap<String, CompiledRoute>,
}

impl Default for ScanRouteTable {
    /// A single `ms2` key that sends every tandem scan to the high resolution tier
    fn default() -> Self {
        let mut routes = IndexMap::new();
        routes.insert(
            "ms2".to_string(),
            CompiledRoute {
                route: ScanRoute::new("", ResolutionTier::High),
                pattern: None,
            },
        );
        Self { routes }
    }
}

impl ScanRouteTable {
    pub fn new(routes: IndexMap<String, ScanRoute>) -> Result<Self, ConfigurationError> {
        if routes.is_empty() {
            return Err(ConfigurationError::Invalid(
                "The scan routing table has no entries".into(),
            ));
        }
        let routes = routes
            .into_iter()
            .map(|(key, route)| {
                let pattern = if route.scan_filter.is_empty() {
                    None
                } else {
                    Some(Regex::new(&route.scan_filter).map_err(|source| {
                        ConfigurationError::InvalidScanFilter {
                            key: key.clone(),
                            filter: route.scan_filter.clone(),
                            source,
                        }
                    })?)
                };
                Ok((key, CompiledRoute { route, pattern }))
            })
            .collect::<Result<IndexMap<_, _>, ConfigurationError>>()?;
        Ok(Self { routes })
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, serde_json::Error> {
        let routes: IndexMap<String, ScanRoute> = serde_json::from_reader(reader)?;
        Self::new(routes).map_err(serde::de::Error::custom)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let handle = fs::File::open(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let routes: IndexMap<String, ScanRoute> = serde_json::from_reader(io::BufReader::new(
            handle,
        ))
        .map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(routes)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(|k| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&ScanRoute> {
        self.routes.get(key).map(|c| &c.route)
    }

    pub fn has_tier(&self, tier: ResolutionTier) -> bool {
        self.routes.values().any(|c| c.route.resolution == tier)
    }

    pub fn to_routes(&self) -> IndexMap<String, ScanRoute> {
        self.routes
            .iter()
            .map(|(k, c)| (k.clone(), c.route.clone()))
            .collect()
    }

    /// Select each key's tandem scans from `catalogue`.
    ///
    /// Every key must name one of `profiles`, match at least one tandem scan, and
    /// no scan may be selected by two keys.
    pub fn resolve<S: AsRef<str>>(
        &self,
        catalogue: &ScanCatalogue,
        profiles: &[S],
    ) -> Result<ResolvedRoutes, ValidationError> {
        if let Some(key) = self
            .routes
            .keys()
            .find(|k| !profiles.iter().any(|p| p.as_ref() == k.as_str()))
        {
            return Err(ValidationError::UnknownProfile(key.clone()));
        }

        let mut resolved = IndexMap::with_capacity(self.routes.len());
        let mut owners: BTreeMap<ScanId, Vec<&str>> = BTreeMap::new();

        for (key, compiled) in self.routes.iter() {
            let mut scans: Vec<ScanId> = catalogue
                .tandem_scans()
                .filter(|s| compiled.matches(&s.filter))
                .map(|s| s.scan)
                .collect();
            scans.dedup();
            if scans.is_empty() {
                return Err(ValidationError::NoScansMatched {
                    key: key.clone(),
                    filter: compiled.route.scan_filter.clone(),
                });
            }
            debug!("Routing key {key} selected {} scans", scans.len());
            for scan in scans.iter() {
                let claimants = owners.entry(*scan).or_default();
                if claimants.last() != Some(&key.as_str()) {
                    claimants.push(key.as_str());
                }
            }
            resolved.insert(
                key.clone(),
                RoutedScans {
                    scans,
                    tier: compiled.route.resolution,
                },
            );
        }

        let mut overlapping = Vec::new();
        let mut keys: Vec<String> = Vec::new();
        for (scan, claimants) in owners.iter().filter(|(_, v)| v.len() > 1) {
            overlapping.push(*scan);
            for k in claimants {
                if !keys.iter().any(|seen| seen == k) {
                    keys.push(k.to_string());
                }
            }
        }
        if !overlapping.is_empty() {
            return Err(ValidationError::OverlappingScans {
                scans: overlapping,
                keys,
            });
        }

        Ok(ResolvedRoutes { routes: resolved })
    }
}

/// The scans one routing key selected in one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedScans {
    pub scans: Vec<ScanId>,
    pub tier: ResolutionTier,
}

/// The result of resolving a [`ScanRouteTable`] against one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRoutes {
    pub routes: IndexMap<String, RoutedScans>,
}

impl ResolvedRoutes {
    pub fn get(&self, key: &str) -> Option<&RoutedScans> {
        self.routes.get(key)
    }

    /// All scans routed to `tier`, ascending
    pub fn bucket(&self, tier: ResolutionTier) -> Vec<ScanId> {
        let mut scans: Vec<ScanId> = self
            .routes
            .values()
            .filter(|r| r.tier == tier)
            .flat_map(|r| r.scans.iter().copied())
            .collect();
        scans.sort_unstable();
        scans.dedup();
        scans
    }

    pub fn routed_scan_count(&self) -> usize {
        self.routes.values().map(|r| r.scans.len()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spectrum::ScanRecord;

    fn catalogue() -> ScanCatalogue {
        let filters = [
            (1, 1, "FTMS + p ESI Full ms"),
            (2, 2, "FTMS + p ESI d Full ms2 195.09@hcd30.00"),
            (3, 2, "ITMS + c ESI d Full ms2 136.06@cid35.00"),
            (4, 2, "FTMS + p ESI d Full ms2 250.10@hcd30.00"),
            (5, 1, "FTMS + p ESI Full ms"),
        ];
        filters
            .into_iter()
            .map(|(scan, ms_level, filter)| ScanRecord {
                scan,
                ms_level,
                filter: filter.to_string(),
                ..Default::default()
            })
            .collect()
    }

    fn table(entries: &[(&str, &str, ResolutionTier)]) -> ScanRouteTable {
        let routes = entries
            .iter()
            .map(|(k, f, t)| (k.to_string(), ScanRoute::new(*f, *t)))
            .collect();
        ScanRouteTable::new(routes).unwrap()
    }

    #[test]
    fn test_default_routes_all_tandem_high() {
        let table = ScanRouteTable::default();
        let resolved = table.resolve(&catalogue(), &["ms1", "ms2"]).unwrap();
        assert_eq!(resolved.bucket(ResolutionTier::High), vec![2, 3, 4]);
        assert!(resolved.bucket(ResolutionTier::Low).is_empty());
        assert!(!table.has_tier(ResolutionTier::Low));
    }

    #[test]
    fn test_split_by_filter() {
        let table = table(&[
            ("hcd", "FTMS", ResolutionTier::High),
            ("cid", r"ITMS .*@cid", ResolutionTier::Low),
        ]);
        let resolved = table.resolve(&catalogue(), &["hcd", "cid"]).unwrap();
        assert_eq!(resolved.get("hcd").unwrap().scans, vec![2, 4]);
        assert_eq!(resolved.bucket(ResolutionTier::Low), vec![3]);
        assert_eq!(resolved.routed_scan_count(), 3);
        assert!(table.has_tier(ResolutionTier::Low));
    }

    #[test]
    fn test_overlap_rejected() {
        let table = table(&[
            ("all", "", ResolutionTier::High),
            ("cid", "ITMS", ResolutionTier::Low),
        ]);
        match table.resolve(&catalogue(), &["all", "cid"]) {
            Err(ValidationError::OverlappingScans { scans, keys }) => {
                assert_eq!(scans, vec![3]);
                assert_eq!(keys, vec!["all".to_string(), "cid".to_string()]);
            }
            other => panic!("Expected an overlap error, got {other:?}"),
        }
    }

    #[test_log::test]
    fn test_repeated_scan_is_not_an_overlap() {
        let mut scans: Vec<ScanRecord> = catalogue().iter().cloned().collect();
        scans.push(scans[1].clone());
        let catalogue = ScanCatalogue::new(scans);
        assert_eq!(catalogue.duplicate_scan(), Some(2));

        let resolved = ScanRouteTable::default()
            .resolve(&catalogue, &["ms1", "ms2"])
            .unwrap();
        assert_eq!(resolved.bucket(ResolutionTier::High), vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_match_rejected() {
        let table = table(&[
            ("hcd", "FTMS", ResolutionTier::High),
            ("etd", "@etd", ResolutionTier::Low),
        ]);
        match table.resolve(&catalogue(), &["hcd", "etd"]) {
            Err(ValidationError::NoScansMatched { key, .. }) => assert_eq!(key, "etd"),
            other => panic!("Expected a zero-match error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let table = table(&[("hcd", "FTMS", ResolutionTier::High)]);
        assert!(matches!(
            table.resolve(&catalogue(), &["ms2"]),
            Err(ValidationError::UnknownProfile(k)) if k == "hcd"
        ));
    }

    #[test]
    fn test_from_reader() {
        let text = r#"{"hcd": {"scan_filter": "FTMS", "resolution": "high"}, "any": {"resolution": "low"}}"#;
        let table = ScanRouteTable::from_reader(text.as_bytes()).unwrap();
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["hcd", "any"]);
        assert_eq!(table.get("any").unwrap().scan_filter, "");

        let bad = r#"{"hcd": {"scan_filter": "FTMS(", "resolution": "high"}}"#;
        assert!(ScanRouteTable::from_reader(bad.as_bytes()).is_err());
        assert!(ScanRouteTable::from_reader("{}".as_bytes()).is_err());
    }
}
