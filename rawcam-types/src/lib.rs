//! Shared types for the raw capture and processing pipeline.

use serde::{Deserialize, Serialize};

pub type Result<M> = std::result::Result<M, Error>;

mod camera;
mod metadata;
mod packing;
mod settings;

pub use camera::{CameraDescription, Rect};
pub use metadata::{FrameMetadata, ShadingMap};
pub use packing::{pack_raw10, raw10_sample, raw16_sample, unpack_raw10, unpack_raw16};
pub use settings::PostProcessSettings;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown pixel format \"{0}\"")]
    UnknownPixelFormat(String),
    #[error("unknown sensor arrangement \"{0}\"")]
    UnknownSensorArrangement(String),
    #[error("unknown illuminant \"{0}\"")]
    UnknownIlluminant(String),
    #[error("unknown orientation code {0}")]
    UnknownOrientation(i32),
    #[error("buffer length {got} too short, need {need}")]
    ShortBuffer { got: usize, need: usize },
    #[error("{source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Layout of pixel data as delivered by the sensor.
///
/// This needs to match the kernel inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Raw10,
    Raw16,
    Raw12,
    Yuv420,
}

impl PixelFormat {
    /// The name used in bundle manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Raw10 => "raw10",
            PixelFormat::Raw16 => "raw16",
            PixelFormat::Raw12 => "raw12",
            PixelFormat::Yuv420 => "yuv_420_888",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw10" => Ok(PixelFormat::Raw10),
            "raw16" => Ok(PixelFormat::Raw16),
            "raw12" => Ok(PixelFormat::Raw12),
            "yuv_420_888" => Ok(PixelFormat::Yuv420),
            other => Err(Error::UnknownPixelFormat(other.to_string())),
        }
    }
}

/// Color filter array layout of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorArrangement {
    Rggb,
    Grbg,
    Gbrg,
    Bggr,
}

impl SensorArrangement {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorArrangement::Rggb => "rggb",
            SensorArrangement::Grbg => "grbg",
            SensorArrangement::Gbrg => "gbrg",
            SensorArrangement::Bggr => "bggr",
        }
    }

    /// Offsets of the R, G0, G1, B samples within one 2x2 CFA tile,
    /// as (column, row) pairs.
    pub fn channel_offsets(&self) -> [(usize, usize); 4] {
        match self {
            SensorArrangement::Rggb => [(0, 0), (1, 0), (0, 1), (1, 1)],
            SensorArrangement::Grbg => [(1, 0), (0, 0), (1, 1), (0, 1)],
            SensorArrangement::Gbrg => [(0, 1), (0, 0), (1, 1), (1, 0)],
            SensorArrangement::Bggr => [(1, 1), (1, 0), (0, 1), (0, 0)],
        }
    }
}

impl std::fmt::Display for SensorArrangement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SensorArrangement {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rggb" => Ok(SensorArrangement::Rggb),
            "grbg" => Ok(SensorArrangement::Grbg),
            "gbrg" => Ok(SensorArrangement::Gbrg),
            "bggr" => Ok(SensorArrangement::Bggr),
            other => Err(Error::UnknownSensorArrangement(other.to_string())),
        }
    }
}

/// Orientation of the device screen when the frame was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenOrientation {
    Portrait,
    ReversePortrait,
    Landscape,
    ReverseLandscape,
}

impl ScreenOrientation {
    pub fn code(&self) -> i32 {
        match self {
            ScreenOrientation::Portrait => 0,
            ScreenOrientation::ReversePortrait => 1,
            ScreenOrientation::Landscape => 2,
            ScreenOrientation::ReverseLandscape => 3,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(ScreenOrientation::Portrait),
            1 => Ok(ScreenOrientation::ReversePortrait),
            2 => Ok(ScreenOrientation::Landscape),
            3 => Ok(ScreenOrientation::ReverseLandscape),
            other => Err(Error::UnknownOrientation(other)),
        }
    }
}

/// Whether a frame belongs to the zero-shutter-lag ring or to an HDR
/// burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawType {
    Zsl,
    Hdr,
}

/// Reference illuminants the camera color matrices are calibrated
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Illuminant {
    StandardA,
    StandardB,
    StandardC,
    D50,
    D55,
    D65,
    D75,
}

impl Illuminant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Illuminant::StandardA => "standarda",
            Illuminant::StandardB => "standardb",
            Illuminant::StandardC => "standardc",
            Illuminant::D50 => "d50",
            Illuminant::D55 => "d55",
            Illuminant::D65 => "d65",
            Illuminant::D75 => "d75",
        }
    }

    /// Correlated color temperature in kelvin.
    pub fn temperature(&self) -> f64 {
        match self {
            Illuminant::StandardA => 2850.0,
            Illuminant::StandardB => 4874.0,
            Illuminant::StandardC => 6774.0,
            Illuminant::D50 => 5003.0,
            Illuminant::D55 => 5503.0,
            Illuminant::D65 => 6504.0,
            Illuminant::D75 => 7504.0,
        }
    }
}

impl std::fmt::Display for Illuminant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Illuminant {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standarda" => Ok(Illuminant::StandardA),
            "standardb" => Ok(Illuminant::StandardB),
            "standardc" => Ok(Illuminant::StandardC),
            "d50" => Ok(Illuminant::D50),
            "d55" => Ok(Illuminant::D55),
            "d65" => Ok(Illuminant::D65),
            "d75" => Ok(Illuminant::D75),
            other => Err(Error::UnknownIlluminant(other.to_string())),
        }
    }
}

/// Exposure value of a captured frame.
///
/// Uses a fixed reference aperture since phone lenses do not report
/// per-frame aperture.
pub fn ev(metadata: &FrameMetadata) -> f64 {
    const APERTURE: f64 = 1.8;
    let exposure_s = metadata.exposure_time_ns as f64 / 1.0e9;
    let s = APERTURE * APERTURE;
    s.log2() - (exposure_s * metadata.iso as f64 / 100.0).log2()
}

fn _test_types_are_send() {
    fn implements<T: Send>() {}
    implements::<FrameMetadata>();
    implements::<CameraDescription>();
    implements::<PostProcessSettings>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_name_round_trip() {
        for fmt in [
            PixelFormat::Raw10,
            PixelFormat::Raw16,
            PixelFormat::Raw12,
            PixelFormat::Yuv420,
        ] {
            let parsed: PixelFormat = fmt.as_str().parse().unwrap();
            assert_eq!(parsed, fmt);
        }
        assert!("raw99".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn arrangement_channel_offsets_cover_tile() {
        for arr in [
            SensorArrangement::Rggb,
            SensorArrangement::Grbg,
            SensorArrangement::Gbrg,
            SensorArrangement::Bggr,
        ] {
            let mut seen = [[false; 2]; 2];
            for (x, y) in arr.channel_offsets() {
                assert!(!seen[y][x]);
                seen[y][x] = true;
            }
        }
    }

    #[test]
    fn ev_doubles_with_iso() {
        let mut m = FrameMetadata::default();
        m.exposure_time_ns = 10_000_000;
        m.iso = 100;
        let ev0 = ev(&m);
        m.iso = 200;
        let ev1 = ev(&m);
        approx::assert_abs_diff_eq!(ev0 - ev1, 1.0, epsilon = 1e-9);
    }
}
