use serde::{Deserialize, Serialize};

use crate::{RawType, ScreenOrientation};

/// One per-channel lens shading grid. Multiplicative gains, typically
/// 16x12.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadingMap {
    pub width: usize,
    pub height: usize,
    pub gains: Vec<f32>,
}

impl ShadingMap {
    pub fn new(width: usize, height: usize, gains: Vec<f32>) -> Self {
        assert_eq!(gains.len(), width * height);
        Self {
            width,
            height,
            gains,
        }
    }

    /// A map that applies no correction.
    pub fn identity(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            gains: vec![1.0; width * height],
        }
    }

    /// Bilinear sample at normalized image coordinates in [0, 1].
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        let x = (u.clamp(0.0, 1.0) * (self.width - 1) as f32).min(self.width as f32 - 1.0);
        let y = (v.clamp(0.0, 1.0) * (self.height - 1) as f32).min(self.height as f32 - 1.0);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let g = |xi: usize, yi: usize| self.gains[yi * self.width + xi];
        let top = g(x0, y0) * (1.0 - fx) + g(x1, y0) * fx;
        let bot = g(x0, y1) * (1.0 - fx) + g(x1, y1) * fx;
        top * (1.0 - fy) + bot * fy
    }
}

/// Per-frame metadata extracted from the driver's capture-completed
/// callback.
///
/// `timestamp_ns` is the sensor start-of-exposure timestamp. It is
/// unique per frame and monotone, and is the join key between pixel
/// data and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub timestamp_ns: i64,
    pub exposure_time_ns: i64,
    pub iso: i32,
    pub exposure_compensation: i32,
    pub as_shot_neutral: [f32; 3],
    pub lens_shading_map: [ShadingMap; 4],
    pub orientation: ScreenOrientation,
    pub raw_type: RawType,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            timestamp_ns: 0,
            exposure_time_ns: 0,
            iso: 0,
            exposure_compensation: 0,
            as_shot_neutral: [1.0, 1.0, 1.0],
            lens_shading_map: [
                ShadingMap::identity(16, 12),
                ShadingMap::identity(16, 12),
                ShadingMap::identity(16, 12),
                ShadingMap::identity(16, 12),
            ],
            orientation: ScreenOrientation::Portrait,
            raw_type: RawType::Zsl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shading_map_sample_interpolates() {
        let map = ShadingMap::new(2, 2, vec![1.0, 3.0, 1.0, 3.0]);
        approx::assert_abs_diff_eq!(map.sample(0.0, 0.0), 1.0);
        approx::assert_abs_diff_eq!(map.sample(1.0, 1.0), 3.0);
        approx::assert_abs_diff_eq!(map.sample(0.5, 0.5), 2.0);
    }
}
