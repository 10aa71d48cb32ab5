use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ProcessingError;
use crate::io::compression::is_gzipped_extension;
use crate::io::mgf::MGFScanReader;
use crate::io::mzml::MzMLScanReader;
use crate::spectrum::{Polarity, ScanCatalogue};

/// Instrument file formats a batch may contain
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MassSpectrometryFormat {
    MGF,
    MzML,
    ThermoRaw,
}

impl MassSpectrometryFormat {
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::MGF => &["mgf"],
            Self::MzML => &["mzml"],
            Self::ThermoRaw => &["raw"],
        }
    }

    /// Whether the format's reader cannot be used from several threads at once
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::ThermoRaw)
    }
}

impl Display for MassSpectrometryFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Given a path, infer the file format from its extension, looking through a
/// trailing `.gz`
pub fn infer_from_path(path: &Path) -> Option<MassSpectrometryFormat> {
    let (_, path) = is_gzipped_extension(path);
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    [
        MassSpectrometryFormat::MGF,
        MassSpectrometryFormat::MzML,
        MassSpectrometryFormat::ThermoRaw,
    ]
    .into_iter()
    .find(|fmt| fmt.extensions().contains(&ext.as_str()))
}

/// The capability of reading one instrument file format
pub trait ScanReader: Send + Sync {
    fn format(&self) -> MassSpectrometryFormat;

    /// Read every scan in the file
    fn parse(&self, path: &Path) -> Result<ScanCatalogue, ProcessingError>;

    /// Determine the file's polarity as cheaply as the format allows.
    ///
    /// The default implementation parses the whole file.
    fn polarity(&self, path: &Path) -> Result<Polarity, ProcessingError> {
        match self.parse(path)?.polarity() {
            Some(Polarity::Unknown) => Err(ProcessingError::UnknownPolarity(path.to_path_buf())),
            Some(polarity) => Ok(polarity),
            None => Err(ProcessingError::MixedPolarity(path.to_path_buf())),
        }
    }

    fn is_exclusive(&self) -> bool {
        self.format().is_exclusive()
    }
}

/// Known formats and the readers available for them
#[derive(Clone)]
pub struct FormatRegistry {
    readers: HashMap<MassSpectrometryFormat, Arc<dyn ScanReader>>,
}

impl Default for FormatRegistry {
    /// Recognizes MGF, mzML and Thermo RAW files, and ships readers for MGF and mzML
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Arc::new(MGFScanReader))
            .register(Arc::new(MzMLScanReader));
        registry
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self {
            readers: HashMap::new(),
        }
    }

    /// Install `reader` for its format, replacing any previous reader
    pub fn register(&mut self, reader: Arc<dyn ScanReader>) -> &mut Self {
        self.readers.insert(reader.format(), reader);
        self
    }

    pub fn infer_format(&self, path: &Path) -> Option<MassSpectrometryFormat> {
        infer_from_path(path)
    }

    pub fn recognizes(&self, path: &Path) -> bool {
        self.infer_format(path).is_some()
    }

    pub fn reader_for(&self, path: &Path) -> Result<Arc<dyn ScanReader>, ProcessingError> {
        let format = self
            .infer_format(path)
            .ok_or_else(|| ProcessingError::NoReader {
                format: "unknown".into(),
                path: path.to_path_buf(),
            })?;
        self.readers
            .get(&format)
            .cloned()
            .ok_or_else(|| ProcessingError::NoReader {
                format: format.to_string(),
                path: path.to_path_buf(),
            })
    }

    /// Whether any of `paths` must be read by only one worker at a time
    pub fn any_exclusive<'a, I: IntoIterator<Item = &'a PathBuf>>(&self, paths: I) -> bool {
        paths.into_iter().any(|p| match self.infer_format(p) {
            Some(format) => self
                .readers
                .get(&format)
                .map(|r| r.is_exclusive())
                .unwrap_or_else(|| format.is_exclusive()),
            None => false,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_infer_from_path() {
        assert_eq!(
            infer_from_path(Path::new("run.MGF")),
            Some(MassSpectrometryFormat::MGF)
        );
        assert_eq!(
            infer_from_path(Path::new("run.mzML.gz")),
            Some(MassSpectrometryFormat::MzML)
        );
        assert_eq!(
            infer_from_path(Path::new("run.raw")),
            Some(MassSpectrometryFormat::ThermoRaw)
        );
        assert_eq!(infer_from_path(Path::new("run.d")), None);
        assert_eq!(infer_from_path(Path::new("run")), None);
    }

    #[test]
    fn test_registry() {
        let registry = FormatRegistry::default();
        assert!(registry.reader_for(Path::new("a.mgf")).is_ok());
        let mzml = registry.reader_for(Path::new("a.mzML.gz")).unwrap();
        assert_eq!(mzml.format(), MassSpectrometryFormat::MzML);
        assert!(!mzml.is_exclusive());
        assert!(matches!(
            registry.reader_for(Path::new("a.raw")),
            Err(ProcessingError::NoReader { .. })
        ));
        assert!(registry.recognizes(Path::new("a.raw")));
        assert!(!registry.recognizes(Path::new("a.txt")));

        let paths = vec![PathBuf::from("a.mgf"), PathBuf::from("b.mzml")];
        assert!(!registry.any_exclusive(paths.iter()));
        let paths = vec![PathBuf::from("a.mgf"), PathBuf::from("b.RAW")];
        assert!(registry.any_exclusive(paths.iter()));
    }
}
