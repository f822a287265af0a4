use serde::{Deserialize, Serialize};

use crate::{Illuminant, SensorArrangement};

/// Pixel rectangle, used for the sensor active array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

/// Static description of one camera, loaded once at startup from the
/// driver's characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDescription {
    pub sensor_arrangement: SensorArrangement,

    /// Per-channel black level, ordered R, G0, G1, B.
    pub black_level: [i32; 4],
    pub white_level: i32,

    pub color_illuminant1: Illuminant,
    pub color_illuminant2: Illuminant,

    /// Row-major 3x3 matrices keyed to the two reference illuminants.
    pub color_matrix1: [f32; 9],
    pub color_matrix2: [f32; 9],
    pub forward_matrix1: [f32; 9],
    pub forward_matrix2: [f32; 9],
    pub calibration_matrix1: [f32; 9],
    pub calibration_matrix2: [f32; 9],

    pub iso_range: [i32; 2],
    pub exposure_range_ns: [i64; 2],
    pub exposure_compensation_range: [i32; 2],

    pub max_af_regions: i32,
    pub max_ae_regions: i32,
    pub max_awb_regions: i32,

    pub sensor_size: Rect,
    /// Clockwise rotation of the sensor relative to the device, degrees.
    pub sensor_orientation: i32,

    pub ois_supported: bool,
    pub supported_tonemap_modes: Vec<i32>,

    pub apertures: Vec<f32>,
    pub focal_lengths: Vec<f32>,
}

impl Default for CameraDescription {
    fn default() -> Self {
        Self {
            sensor_arrangement: SensorArrangement::Rggb,
            black_level: [64, 64, 64, 64],
            white_level: 1023,
            color_illuminant1: Illuminant::StandardA,
            color_illuminant2: Illuminant::D65,
            color_matrix1: identity3(),
            color_matrix2: identity3(),
            forward_matrix1: [0.0; 9],
            forward_matrix2: [0.0; 9],
            calibration_matrix1: identity3(),
            calibration_matrix2: identity3(),
            iso_range: [100, 3200],
            exposure_range_ns: [100_000, 1_000_000_000],
            exposure_compensation_range: [-24, 24],
            max_af_regions: 1,
            max_ae_regions: 1,
            max_awb_regions: 1,
            sensor_size: Rect {
                left: 0,
                top: 0,
                width: 4000,
                height: 3000,
            },
            sensor_orientation: 90,
            ois_supported: false,
            supported_tonemap_modes: vec![],
            apertures: vec![1.8],
            focal_lengths: vec![4.3],
        }
    }
}

fn identity3() -> [f32; 9] {
    [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
}
