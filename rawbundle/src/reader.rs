use std::io::{Read, Seek};

use tracing::debug;
use zip::ZipArchive;

use crate::{Error, FrameRecord, Manifest, Result, METADATA_ENTRY};

/// Read access to a bundle. Frames are indexed by the filenames in the
/// manifest; ZIP entry order is not significant.
pub struct Bundle<R: Read + Seek> {
    zip: ZipArchive<R>,
    manifest: Manifest,
}

impl<R: Read + Seek> Bundle<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut zip = ZipArchive::new(reader)?;
        let manifest = {
            let mut entry = match zip.by_name(METADATA_ENTRY) {
                Ok(entry) => entry,
                Err(zip::result::ZipError::FileNotFound) => return Err(Error::MissingMetadata),
                Err(e) => return Err(e.into()),
            };
            let mut json = String::new();
            entry.read_to_string(&mut json)?;
            serde_json::from_str(&json)?
        };
        debug!("bundle manifest loaded");
        Ok(Self { zip, manifest })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn frame_names(&self) -> Vec<String> {
        self.manifest
            .frames
            .iter()
            .map(|f| f.filename.clone())
            .collect()
    }

    /// Load one frame's pixel bytes, validating the declared length.
    pub fn load_frame(&mut self, filename: &str) -> Result<Vec<u8>> {
        let expected = self.manifest.frame(filename)?.byte_len();
        let mut entry = match self.zip.by_name(filename) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(Error::FrameNotFound(filename.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::with_capacity(expected);
        entry.read_to_end(&mut data)?;
        if data.len() != expected {
            return Err(Error::FrameLengthMismatch {
                name: filename.to_string(),
                got: data.len(),
                expected,
            });
        }
        Ok(data)
    }

    /// Load the frame record and bytes for the manifest's reference
    /// frame.
    pub fn load_reference(&mut self) -> Result<(FrameRecord, Vec<u8>)> {
        let record = self
            .manifest
            .reference_frame()
            .cloned()
            .ok_or_else(|| Error::FrameNotFound("<reference>".to_string()))?;
        let data = self.load_frame(&record.filename)?;
        Ok((record, data))
    }
}
