use std::io::{Seek, Write};

use tracing::debug;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::{Error, Manifest, Result, METADATA_ENTRY};

/// Writes a bundle: frame blobs first, the manifest last.
///
/// Frame entries are stored uncompressed; raw sensor data barely
/// deflates and capture-path latency matters more than size.
pub struct BundleWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
}

impl<W: Write + Seek> BundleWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
        }
    }

    fn options() -> FileOptions {
        FileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(true)
    }

    /// Write one frame blob. `record.byte_len()` must match the data
    /// length.
    pub fn add_frame(&mut self, record: &crate::FrameRecord, data: &[u8]) -> Result<()> {
        if data.len() != record.byte_len() {
            return Err(Error::FrameLengthMismatch {
                name: record.filename.clone(),
                got: data.len(),
                expected: record.byte_len(),
            });
        }
        self.zip.start_file(&record.filename, Self::options())?;
        self.zip.write_all(data)?;
        debug!("wrote frame {} ({} bytes)", record.filename, data.len());
        Ok(())
    }

    /// Write the manifest entry and close the archive, returning the
    /// underlying writer.
    pub fn finish(mut self, manifest: &Manifest) -> Result<W> {
        let json = serde_json::to_string(manifest)?;
        self.zip.start_file(METADATA_ENTRY, Self::options())?;
        self.zip.write_all(json.as_bytes())?;
        Ok(self.zip.finish()?)
    }
}
