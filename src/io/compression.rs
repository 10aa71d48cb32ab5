use std::fs;
use std::io::{self, prelude::*, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::{bufread::MultiGzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};

pub fn is_gzipped(header: &[u8]) -> bool {
    header.starts_with(b"\x1f\x8b")
}

/// Whether `path` ends in `.gz`, and the path with that suffix removed
pub fn is_gzipped_extension(path: &Path) -> (bool, PathBuf) {
    match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("gz") => (true, path.with_extension("")),
        _ => (false, path.to_path_buf()),
    }
}

/// Open a file for line-oriented reading, decompressing it if it starts with a
/// gzip header
pub fn open_maybe_gzipped(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut handle = BufReader::new(fs::File::open(path)?);
    let header = handle.fill_buf()?;
    if is_gzipped(header) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(handle))))
    } else {
        Ok(Box::new(handle))
    }
}

fn as_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Write `value` as gzip-compressed JSON, replacing `path` only once the write
/// has completed
pub fn write_compressed_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let staging = path.with_extension("partial");
    {
        let handle = BufWriter::new(fs::File::create(&staging)?);
        let mut encoder = GzEncoder::new(handle, Compression::default());
        serde_json::to_writer(&mut encoder, value).map_err(as_io_error)?;
        encoder.finish()?.flush()?;
    }
    fs::rename(&staging, path)
}

pub fn read_compressed_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let handle = open_maybe_gzipped(path)?;
    serde_json::from_reader(handle).map_err(as_io_error)
}
