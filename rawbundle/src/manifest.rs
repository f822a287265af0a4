use serde::{Deserialize, Serialize};

use rawcam_types::{
    CameraDescription, FrameMetadata, Illuminant, PixelFormat, RawType, ScreenOrientation,
    SensorArrangement, ShadingMap,
};

use crate::{Error, Result};

/// Serialize an `i64` as a decimal string, the way the manifest stores
/// timestamps.
mod i64_string {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Per-frame entry in the manifest `frames` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRecord {
    #[serde(with = "i64_string")]
    pub timestamp: i64,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub row_stride: u32,
    pub pixel_format: PixelFormat,
    pub as_shot_neutral: [f32; 3],
    pub iso: i32,
    pub exposure_compensation: i32,
    pub exposure_time: i64,
    pub orientation: i32,
    pub lens_shading_map_width: usize,
    pub lens_shading_map_height: usize,
    /// Four per-channel grids, each row-major `width * height` floats.
    pub lens_shading_map: Vec<Vec<f32>>,
}

impl FrameRecord {
    pub fn new(
        filename: String,
        metadata: &FrameMetadata,
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        row_stride: u32,
    ) -> Self {
        let map = &metadata.lens_shading_map;
        Self {
            timestamp: metadata.timestamp_ns,
            filename,
            width,
            height,
            row_stride,
            pixel_format,
            as_shot_neutral: metadata.as_shot_neutral,
            iso: metadata.iso,
            exposure_compensation: metadata.exposure_compensation,
            exposure_time: metadata.exposure_time_ns,
            orientation: metadata.orientation.code(),
            lens_shading_map_width: map[0].width,
            lens_shading_map_height: map[0].height,
            lens_shading_map: map.iter().map(|m| m.gains.clone()).collect(),
        }
    }

    pub fn metadata(&self, raw_type: RawType) -> Result<FrameMetadata> {
        let w = self.lens_shading_map_width;
        let h = self.lens_shading_map_height;
        let mut maps = Vec::with_capacity(4);
        for channel in 0..4 {
            let gains = self
                .lens_shading_map
                .get(channel)
                .filter(|g| g.len() == w * h)
                .cloned()
                .unwrap_or_else(|| vec![1.0; w.max(1) * h.max(1)]);
            maps.push(ShadingMap::new(w.max(1), h.max(1), gains));
        }
        // Vec has exactly 4 entries.
        let maps: [ShadingMap; 4] = maps.try_into().unwrap();
        Ok(FrameMetadata {
            timestamp_ns: self.timestamp,
            exposure_time_ns: self.exposure_time,
            iso: self.iso,
            exposure_compensation: self.exposure_compensation,
            as_shot_neutral: self.as_shot_neutral,
            lens_shading_map: maps,
            orientation: ScreenOrientation::from_code(self.orientation)?,
            raw_type,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.row_stride as usize * self.height as usize
    }
}

/// The `metadata` JSON entry of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(with = "i64_string")]
    pub reference_timestamp: i64,
    #[serde(rename = "writeDNG")]
    pub write_dng: bool,
    pub is_hdr: bool,

    pub color_illuminant1: String,
    pub color_illuminant2: String,
    pub forward_matrix1: [f32; 9],
    pub forward_matrix2: [f32; 9],
    pub color_matrix1: [f32; 9],
    pub color_matrix2: [f32; 9],
    pub calibration_matrix1: [f32; 9],
    pub calibration_matrix2: [f32; 9],
    pub black_level: [i32; 4],
    pub white_level: i32,
    // Key spelling kept for compatibility with existing bundles.
    #[serde(rename = "sensorArrangment")]
    pub sensor_arrangement: SensorArrangement,
    pub apertures: Vec<f32>,
    pub focal_lengths: Vec<f32>,

    pub post_processing_settings: rawcam_types::PostProcessSettings,

    pub frames: Vec<FrameRecord>,
}

impl Manifest {
    pub fn new(
        camera: &CameraDescription,
        settings: rawcam_types::PostProcessSettings,
        reference_timestamp: i64,
        is_hdr: bool,
        write_dng: bool,
    ) -> Self {
        Self {
            reference_timestamp,
            write_dng,
            is_hdr,
            color_illuminant1: camera.color_illuminant1.to_string(),
            color_illuminant2: camera.color_illuminant2.to_string(),
            forward_matrix1: camera.forward_matrix1,
            forward_matrix2: camera.forward_matrix2,
            color_matrix1: camera.color_matrix1,
            color_matrix2: camera.color_matrix2,
            calibration_matrix1: camera.calibration_matrix1,
            calibration_matrix2: camera.calibration_matrix2,
            black_level: camera.black_level,
            white_level: camera.white_level,
            sensor_arrangement: camera.sensor_arrangement,
            apertures: camera.apertures.clone(),
            focal_lengths: camera.focal_lengths.clone(),
            post_processing_settings: settings,
            frames: Vec::new(),
        }
    }

    /// Reconstruct a camera description from the stored calibration.
    /// Fields the manifest does not carry take their defaults.
    pub fn camera_description(&self) -> Result<CameraDescription> {
        let color_illuminant1: Illuminant = self.color_illuminant1.parse()?;
        let color_illuminant2: Illuminant = self.color_illuminant2.parse()?;
        Ok(CameraDescription {
            sensor_arrangement: self.sensor_arrangement,
            black_level: self.black_level,
            white_level: self.white_level,
            color_illuminant1,
            color_illuminant2,
            color_matrix1: self.color_matrix1,
            color_matrix2: self.color_matrix2,
            forward_matrix1: self.forward_matrix1,
            forward_matrix2: self.forward_matrix2,
            calibration_matrix1: self.calibration_matrix1,
            calibration_matrix2: self.calibration_matrix2,
            apertures: self.apertures.clone(),
            focal_lengths: self.focal_lengths.clone(),
            ..Default::default()
        })
    }

    pub fn frame(&self, filename: &str) -> Result<&FrameRecord> {
        self.frames
            .iter()
            .find(|f| f.filename == filename)
            .ok_or_else(|| Error::FrameNotFound(filename.to_string()))
    }

    /// The frame whose timestamp equals `reference_timestamp`, falling
    /// back to the first frame.
    pub fn reference_frame(&self) -> Option<&FrameRecord> {
        self.frames
            .iter()
            .find(|f| f.timestamp == self.reference_timestamp)
            .or_else(|| self.frames.first())
    }
}
