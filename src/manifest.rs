//! The persisted record of how far each file of a batch has progressed.
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ManifestError;
use crate::spectrum::Polarity;
use crate::stages::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileState {
    Pending,
    FeaturesExtracted,
    IndexReady,
    Matched,
    Exported,
    Failed { stage: Stage, reason: String },
}

impl FileState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::FeaturesExtracted => "features_extracted",
            Self::IndexReady => "index_ready",
            Self::Matched => "matched",
            Self::Exported => "exported",
            Self::Failed { .. } => "failed",
        }
    }

    /// Files move forward one state at a time. Any state may fail, and any
    /// state may start over.
    pub fn can_transition_to(&self, next: &FileState) -> bool {
        matches!(
            (self, next),
            (_, Self::Failed { .. })
                | (_, Self::Pending)
                | (Self::Pending, Self::FeaturesExtracted)
                | (Self::FeaturesExtracted, Self::IndexReady)
                | (Self::IndexReady, Self::Matched)
                | (Self::Matched, Self::Exported)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { stage, reason } => write!(f, "failed during {stage}: {reason}"),
            _ => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub state: FileState,
    pub polarity: Option<Polarity>,
    pub artifact: Option<PathBuf>,
    pub export: Option<PathBuf>,
    pub updated: DateTime<Utc>,
}

impl Default for ManifestEntry {
    fn default() -> Self {
        Self {
            state: FileState::Pending,
            polarity: None,
            artifact: None,
            export: None,
            updated: Utc::now(),
        }
    }
}

impl ManifestEntry {
    /// The artifact, if one was recorded and it is still on disk
    pub fn existing_artifact(&self) -> Option<&Path> {
        self.artifact.as_deref().filter(|p| p.is_file())
    }

    pub fn existing_export(&self) -> Option<&Path> {
        self.export.as_deref().filter(|p| p.is_file())
    }
}

/// Per-file state of a batch, stored as `<output>/manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(skip)]
    path: PathBuf,
    pub created: DateTime<Utc>,
    pub files: IndexMap<PathBuf, ManifestEntry>,
}

impl RunManifest {
    pub fn path_in(output_directory: &Path) -> PathBuf {
        output_directory.join("manifest.json")
    }

    pub fn new(output_directory: &Path) -> Self {
        Self {
            path: Self::path_in(output_directory),
            created: Utc::now(),
            files: IndexMap::new(),
        }
    }

    /// Read the manifest a previous run left in `output_directory`, or start a
    /// new one
    pub fn load_or_new(output_directory: &Path) -> Result<Self, ManifestError> {
        let path = Self::path_in(output_directory);
        if !path.exists() {
            return Ok(Self::new(output_directory));
        }
        let handle = fs::File::open(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        let mut manifest: Self = serde_json::from_reader(io::BufReader::new(handle))
            .map_err(|source| ManifestError::Parse {
                path: path.clone(),
                source,
            })?;
        debug!(
            "Loaded run manifest {} tracking {} files",
            path.display(),
            manifest.files.len()
        );
        manifest.path = path;
        Ok(manifest)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start tracking `file`, keeping any state it already has
    pub fn register(&mut self, file: &Path) {
        self.files.entry(file.to_path_buf()).or_default();
    }

    pub fn entry(&self, file: &Path) -> Option<&ManifestEntry> {
        self.files.get(file)
    }

    pub fn entry_mut(&mut self, file: &Path) -> Result<&mut ManifestEntry, ManifestError> {
        self.files
            .get_mut(file)
            .ok_or_else(|| ManifestError::UnknownFile(file.to_path_buf()))
    }

    pub fn state(&self, file: &Path) -> Option<&FileState> {
        self.entry(file).map(|e| &e.state)
    }

    pub fn transition(&mut self, file: &Path, next: FileState) -> Result<(), ManifestError> {
        let entry = self.entry_mut(file)?;
        if !entry.state.can_transition_to(&next) {
            return Err(ManifestError::IllegalTransition {
                file: file.to_path_buf(),
                from: entry.state.name().to_string(),
                to: next.name().to_string(),
            });
        }
        entry.state = next;
        entry.updated = Utc::now();
        Ok(())
    }

    /// Return `file` to [`FileState::Pending`] unless it already is
    pub fn restart(&mut self, file: &Path) -> Result<(), ManifestError> {
        match self.state(file) {
            Some(FileState::Pending) => Ok(()),
            Some(_) => self.transition(file, FileState::Pending),
            None => Err(ManifestError::UnknownFile(file.to_path_buf())),
        }
    }

    pub fn fail<S: Display>(&mut self, file: &Path, stage: Stage, reason: S) -> Result<(), ManifestError> {
        self.transition(
            file,
            FileState::Failed {
                stage,
                reason: reason.to_string(),
            },
        )
    }

    /// Write the manifest, replacing the previous copy only once the write has
    /// completed
    pub fn save(&self) -> Result<(), ManifestError> {
        let staging = self.path.with_extension("json.partial");
        let as_io = |source| ManifestError::Io {
            path: self.path.clone(),
            source,
        };
        {
            let mut handle = BufWriter::new(fs::File::create(&staging).map_err(as_io)?);
            serde_json::to_writer_pretty(&mut handle, self).map_err(|source| {
                ManifestError::Parse {
                    path: self.path.clone(),
                    source,
                }
            })?;
            handle.flush().map_err(as_io)?;
        }
        fs::rename(&staging, &self.path).map_err(as_io)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transitions() {
        let file = Path::new("a.mgf");
        let mut manifest = RunManifest::new(Path::new("."));
        manifest.register(file);
        assert_eq!(manifest.state(file), Some(&FileState::Pending));

        assert!(matches!(
            manifest.transition(file, FileState::Matched),
            Err(ManifestError::IllegalTransition { .. })
        ));
        for state in [
            FileState::FeaturesExtracted,
            FileState::IndexReady,
            FileState::Matched,
            FileState::Exported,
        ] {
            manifest.transition(file, state).unwrap();
        }
        assert!(manifest.transition(file, FileState::Matched).is_err());

        manifest.restart(file).unwrap();
        manifest
            .fail(file, Stage::FeatureExtraction, "unreadable")
            .unwrap();
        assert!(manifest.state(file).unwrap().is_failed());
        assert!(manifest.transition(file, FileState::IndexReady).is_err());
        manifest.restart(file).unwrap();
        assert_eq!(manifest.state(file), Some(&FileState::Pending));

        assert!(matches!(
            manifest.transition(Path::new("b.mgf"), FileState::Pending),
            Err(ManifestError::UnknownFile(_))
        ));
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let file = Path::new("runs/a.mgf");
        let mut manifest = RunManifest::load_or_new(dir.path()).unwrap();
        assert!(manifest.files.is_empty());
        manifest.register(file);
        manifest
            .fail(file, Stage::SpectralMatching, "disk full")
            .unwrap();
        manifest.entry_mut(file).unwrap().polarity = Some(Polarity::Negative);
        manifest.save().unwrap();
        assert!(RunManifest::path_in(dir.path()).exists());

        let mut loaded = RunManifest::load_or_new(dir.path()).unwrap();
        assert_eq!(loaded.path(), RunManifest::path_in(dir.path()));
        assert_eq!(loaded.entry(file), manifest.entry(file));
        loaded.register(file);
        assert!(loaded.state(file).unwrap().is_failed());
        assert_eq!(
            loaded.state(file).unwrap().to_string(),
            "failed during spectral matching: disk full"
        );
    }
}
