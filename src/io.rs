//! Reading instrument and reference files, and writing the files a run produces.
pub mod artifact;
pub mod compression;
pub mod export;
pub mod format;
pub mod mgf;
pub mod msp;
pub mod mzml;

pub use crate::io::artifact::{output_stem, IntermediateArtifact};
pub use crate::io::format::{infer_from_path, FormatRegistry, MassSpectrometryFormat, ScanReader};
pub use crate::io::mgf::{MGFError, MGFReader, MGFScanReader};
pub use crate::io::msp::{MSPError, MSPReader, MSPRecord};
pub use crate::io::mzml::MzMLScanReader;
