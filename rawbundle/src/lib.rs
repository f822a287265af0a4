//! Self-contained capture bundle: a ZIP file with one `metadata` JSON
//! entry and one stored (uncompressed) entry per raw frame.
//!
//! The manifest references frames by filename; entry order inside the
//! ZIP is not significant. Pixel blobs are written exactly as received
//! from the sensor, `row_stride * height` bytes each.

use std::io::Cursor;
use std::path::Path;

use tracing::debug;

pub type Result<M> = std::result::Result<M, Error>;

mod manifest;
mod reader;
mod writer;

pub use manifest::{FrameRecord, Manifest};
pub use reader::Bundle;
pub use writer::BundleWriter;

pub const METADATA_ENTRY: &str = "metadata";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Zip {
        #[from]
        source: zip::result::ZipError,
    },
    #[error("cannot parse metadata: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("{source}")]
    Types {
        #[from]
        source: rawcam_types::Error,
    },
    #[error("bundle has no metadata entry")]
    MissingMetadata,
    #[error("no frame named \"{0}\" in bundle")]
    FrameNotFound(String),
    #[error("frame \"{name}\" has {got} bytes, expected {expected}")]
    FrameLengthMismatch {
        name: String,
        got: usize,
        expected: usize,
    },
}

/// Open a bundle file on disk.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Bundle<std::io::BufReader<std::fs::File>>> {
    debug!("opening bundle {}", path.as_ref().display());
    let file = std::fs::File::open(path)?;
    Bundle::from_reader(std::io::BufReader::new(file))
}

/// Open a bundle held in memory.
pub fn open_in_memory(bytes: Vec<u8>) -> Result<Bundle<Cursor<Vec<u8>>>> {
    Bundle::from_reader(Cursor::new(bytes))
}

/// Create a bundle writer targeting a file on disk.
pub fn create<P: AsRef<Path>>(path: P) -> Result<BundleWriter<std::fs::File>> {
    let file = std::fs::File::create(path)?;
    Ok(BundleWriter::new(file))
}

/// Create a bundle writer targeting an in-memory buffer. Call
/// [`BundleWriter::into_inner`] after `finish`.
pub fn create_in_memory() -> BundleWriter<Cursor<Vec<u8>>> {
    BundleWriter::new(Cursor::new(Vec::new()))
}

#[cfg(test)]
mod tests;
