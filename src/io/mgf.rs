//! Read [MGF](https://www.matrixscience.com/help/data_file_help.html#GEN) files.
mod reader;

pub use reader::{MGFError, MGFParserState, MGFReader, MGFReaderType, MGFScanReader};
