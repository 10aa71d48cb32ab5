//! Tab-separated tables: the per-file annotation table and the per-polarity
//! molecular metadata table.
use std::collections::HashMap;
use std::fs;
use std::io::{self, prelude::*, BufWriter};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::engine::ObservedFeature;
use crate::io::artifact::{output_directory_for, output_stem};
use crate::library::{MoleculeMetadata, SpectrumHit};
use crate::stages::MatchResult;

pub const METADATA_COLUMNS: [&str; 6] =
    ["molecule_id", "name", "formula", "inchikey", "inchi", "smiles"];

pub const ANNOTATION_COLUMNS: [&str; 15] = [
    "file",
    "feature_id",
    "mz",
    "rt",
    "polarity",
    "has_tandem",
    "isotopologue",
    "scan",
    "tier",
    "reference_id",
    "molecule_name",
    "formula",
    "inchikey",
    "similarity",
    "precursor_ppm_error",
];

fn tsv_writer<W: Write>(handle: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(handle)
}

pub fn write_molecular_metadata<'a, W: Write, I: IntoIterator<Item = &'a MoleculeMetadata>>(
    handle: W,
    molecules: I,
) -> io::Result<()> {
    let mut writer = tsv_writer(handle);
    writer.write_record(METADATA_COLUMNS)?;
    for molecule in molecules {
        writer.write_record([
            molecule.id.as_str(),
            molecule.name.as_str(),
            molecule.formula.as_deref().unwrap_or_default(),
            molecule.inchikey.as_deref().unwrap_or_default(),
            molecule.inchi.as_deref().unwrap_or_default(),
            molecule.smiles.as_deref().unwrap_or_default(),
        ])?;
    }
    writer.flush()
}

/// `<output>/<stem>/<stem>.csv`
pub fn annotation_path(output_directory: &Path, source: &Path) -> PathBuf {
    output_directory_for(output_directory, source).join(format!("{}.csv", output_stem(source)))
}

fn feature_fields(source: &str, feature: &ObservedFeature) -> Vec<String> {
    vec![
        source.to_string(),
        feature.id.to_string(),
        format!("{:.6}", feature.mz),
        format!("{:.4}", feature.retention_time),
        feature.polarity.to_string(),
        feature.has_tandem().to_string(),
        feature.isotopologue.to_string(),
    ]
}

fn hit_fields(hit: &SpectrumHit, molecule: Option<&MoleculeMetadata>) -> [String; 8] {
    [
        hit.scan.to_string(),
        hit.tier.to_string(),
        hit.reference_id.clone(),
        molecule.map(|m| m.name.clone()).unwrap_or_default(),
        molecule.and_then(|m| m.formula.clone()).unwrap_or_default(),
        molecule.and_then(|m| m.inchikey.clone()).unwrap_or_default(),
        format!("{:.4}", hit.similarity),
        format!("{:.3}", hit.precursor_ppm_error),
    ]
}

/// Write one row per feature and hit. Features without hits get one row with
/// the hit columns left empty.
pub fn write_annotation_table<W: Write>(
    handle: W,
    source: &Path,
    features: &[ObservedFeature],
    matches: &[MatchResult],
    molecules: &IndexMap<String, MoleculeMetadata>,
) -> io::Result<()> {
    let source = source.display().to_string();
    let hits_by_feature: HashMap<usize, &[SpectrumHit]> = matches
        .iter()
        .map(|m| (m.feature_id, m.hits.as_slice()))
        .collect();

    let mut writer = tsv_writer(handle);
    writer.write_record(ANNOTATION_COLUMNS)?;
    for feature in features {
        let hits = hits_by_feature
            .get(&feature.id)
            .copied()
            .unwrap_or_default();
        if hits.is_empty() {
            let mut record = feature_fields(&source, feature);
            record.resize(ANNOTATION_COLUMNS.len(), String::new());
            writer.write_record(&record)?;
            continue;
        }
        for hit in hits {
            let mut record = feature_fields(&source, feature);
            record.extend(hit_fields(hit, molecules.get(&hit.molecule_id)));
            writer.write_record(&record)?;
        }
    }
    writer.flush()
}

/// Write the annotation table for `source` under `output_directory`, returning
/// its path
pub fn export_annotations(
    output_directory: &Path,
    source: &Path,
    features: &[ObservedFeature],
    matches: &[MatchResult],
    molecules: &IndexMap<String, MoleculeMetadata>,
) -> io::Result<PathBuf> {
    let path = annotation_path(output_directory, source);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let handle = BufWriter::new(fs::File::create(&path)?);
    write_annotation_table(handle, source, features, matches, molecules)?;
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routing::ResolutionTier;
    use crate::spectrum::Polarity;

    fn feature(id: usize, mz: f64, tandem: bool) -> ObservedFeature {
        ObservedFeature {
            id,
            mz,
            retention_time: 2.05,
            polarity: Polarity::Positive,
            apex_intensity: 1e5,
            isotopologue: false,
            tandem_scans: if tandem { vec![10] } else { vec![] },
        }
    }

    fn molecules() -> IndexMap<String, MoleculeMetadata> {
        let mut molecules = IndexMap::new();
        molecules.insert(
            "RYYVLZVUVIJVGH-UHFFFAOYSA-N".to_string(),
            MoleculeMetadata {
                id: "RYYVLZVUVIJVGH-UHFFFAOYSA-N".to_string(),
                name: "Caffeine".to_string(),
                formula: Some("C8H10N4O2".to_string()),
                inchikey: Some("RYYVLZVUVIJVGH-UHFFFAOYSA-N".to_string()),
                ..Default::default()
            },
        );
        molecules
    }

    #[test]
    fn test_annotation_rows() {
        let features = vec![feature(0, 195.087675, true), feature(1, 250.1, false)];
        let matches = vec![MatchResult {
            feature_id: 0,
            hits: vec![SpectrumHit {
                scan: 10,
                tier: ResolutionTier::High,
                reference_id: "REF0001".to_string(),
                molecule_id: "RYYVLZVUVIJVGH-UHFFFAOYSA-N".to_string(),
                similarity: 0.91234,
                precursor_ppm_error: 0.1282,
            }],
        }];
        let mut buffer = Vec::new();
        write_annotation_table(
            &mut buffer,
            Path::new("positive.mgf"),
            &features,
            &matches,
            &molecules(),
        )
        .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].split('\t').count(), ANNOTATION_COLUMNS.len());

        let hit: Vec<_> = lines[1].split('\t').collect();
        assert_eq!(hit[0], "positive.mgf");
        assert_eq!(hit[2], "195.087675");
        assert_eq!(hit[5], "true");
        assert_eq!(hit[8], "high");
        assert_eq!(hit[10], "Caffeine");
        assert_eq!(hit[13], "0.9123");

        let empty: Vec<_> = lines[2].split('\t').collect();
        assert_eq!(empty.len(), ANNOTATION_COLUMNS.len());
        assert_eq!(empty[1], "1");
        assert_eq!(empty[5], "false");
        assert!(empty[7..].iter().all(|f| f.is_empty()));
    }

    #[test]
    fn test_metadata_table() {
        let mut buffer = Vec::new();
        write_molecular_metadata(&mut buffer, molecules().values()).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], METADATA_COLUMNS.join("\t"));
        assert_eq!(
            lines[1],
            "RYYVLZVUVIJVGH-UHFFFAOYSA-N\tCaffeine\tC8H10N4O2\tRYYVLZVUVIJVGH-UHFFFAOYSA-N\t\t"
        );
    }

    #[test]
    fn test_export_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = export_annotations(
            dir.path(),
            Path::new("data/run_a.mgf"),
            &[feature(0, 100.0, false)],
            &[],
            &IndexMap::new(),
        )
        .unwrap();
        assert_eq!(path, dir.path().join("run_a").join("run_a.csv"));
        assert_eq!(fs::read_to_string(path).unwrap().lines().count(), 2);
    }
}
