//! Color science shared by the preview and post-process paths.
//!
//! The temperature conversion follows the DNG specification's
//! camera-neutral to chromaticity mapping over the Wyszecki & Stiles
//! blackbody table.

use nalgebra::{Matrix3, Vector3};

use rawcam_types::CameraDescription;

use crate::{Error, Result};

/// D50, the DNG profile connection space white.
pub const D50_XY: [f64; 2] = [0.3457, 0.3585];

// Scale factor between distances in uv space and the user-facing tint
// parameter.
const TINT_SCALE: f64 = -3000.0;

// Wyszecki & Stiles, "Color Science", second edition, page 228.
// (reciprocal megakelvin, u, v, slope)
const TEMP_TABLE: [[f64; 4]; 31] = [
    [0.0, 0.18006, 0.26352, -0.24341],
    [10.0, 0.18066, 0.26589, -0.25479],
    [20.0, 0.18133, 0.26846, -0.26876],
    [30.0, 0.18208, 0.27119, -0.28539],
    [40.0, 0.18293, 0.27407, -0.30470],
    [50.0, 0.18388, 0.27709, -0.32675],
    [60.0, 0.18494, 0.28021, -0.35156],
    [70.0, 0.18611, 0.28342, -0.37915],
    [80.0, 0.18740, 0.28668, -0.40955],
    [90.0, 0.18880, 0.28997, -0.44278],
    [100.0, 0.19032, 0.29326, -0.47888],
    [125.0, 0.19462, 0.30141, -0.58204],
    [150.0, 0.19962, 0.30921, -0.70471],
    [175.0, 0.20525, 0.31647, -0.84901],
    [200.0, 0.21142, 0.32312, -1.0182],
    [225.0, 0.21807, 0.32909, -1.2168],
    [250.0, 0.22511, 0.33439, -1.4512],
    [275.0, 0.23247, 0.33904, -1.7298],
    [300.0, 0.24010, 0.34308, -2.0637],
    [325.0, 0.24702, 0.34655, -2.4681],
    [350.0, 0.25591, 0.34951, -2.9641],
    [375.0, 0.26400, 0.35200, -3.5814],
    [400.0, 0.27218, 0.35407, -4.3633],
    [425.0, 0.28039, 0.35577, -5.3762],
    [450.0, 0.28863, 0.35714, -6.7262],
    [475.0, 0.29685, 0.35823, -8.5955],
    [500.0, 0.30505, 0.35907, -11.324],
    [525.0, 0.31320, 0.35968, -15.628],
    [550.0, 0.32129, 0.36011, -23.325],
    [575.0, 0.32931, 0.36038, -40.770],
    [600.0, 0.33724, 0.36051, -116.45],
];

/// Correlated color temperature and tint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature {
    pub temperature: f64,
    pub tint: f64,
}

impl Temperature {
    pub fn new(temperature: f64, tint: f64) -> Self {
        Self { temperature, tint }
    }

    /// Locate an xy chromaticity on the blackbody locus.
    pub fn from_xy(xy: [f64; 2]) -> Self {
        let u = 2.0 * xy[0] / (1.5 - xy[0] + 6.0 * xy[1]);
        let v = 3.0 * xy[1] / (1.5 - xy[0] + 6.0 * xy[1]);

        let mut temperature = 0.0;
        let mut tint = 0.0;

        let mut last_dt = 0.0;
        let mut last_du = 0.0;
        let mut last_dv = 0.0;

        for index in 1..=30usize {
            // Convert slope to delta-u and delta-v, with length 1.
            let mut du = 1.0;
            let mut dv = TEMP_TABLE[index][3];
            let len = (1.0 + dv * dv).sqrt();
            du /= len;
            dv /= len;

            let mut uu = u - TEMP_TABLE[index][1];
            let mut vv = v - TEMP_TABLE[index][2];

            // Distance above or below the line.
            let mut dt = -uu * dv + vv * du;

            if dt <= 0.0 || index == 30 {
                dt = (-dt).max(0.0);

                let f = if index == 1 { 0.0 } else { dt / (last_dt + dt) };

                temperature =
                    1.0e6 / (TEMP_TABLE[index - 1][0] * f + TEMP_TABLE[index][0] * (1.0 - f));

                uu = u - (TEMP_TABLE[index - 1][1] * f + TEMP_TABLE[index][1] * (1.0 - f));
                vv = v - (TEMP_TABLE[index - 1][2] * f + TEMP_TABLE[index][2] * (1.0 - f));

                du = du * (1.0 - f) + last_du * f;
                dv = dv * (1.0 - f) + last_dv * f;

                let len = (du * du + dv * dv).sqrt();
                du /= len;
                dv /= len;

                tint = (uu * du + vv * dv) * TINT_SCALE;
                break;
            }

            last_dt = dt;
            last_du = du;
            last_dv = dv;
        }

        Self { temperature, tint }
    }

    /// Inverse of [`Temperature::from_xy`].
    pub fn to_xy(&self) -> [f64; 2] {
        let r = 1.0e6 / self.temperature;
        let offset = self.tint * (1.0 / TINT_SCALE);

        for index in 0..=29usize {
            if r < TEMP_TABLE[index + 1][0] || index == 29 {
                let f = (TEMP_TABLE[index + 1][0] - r)
                    / (TEMP_TABLE[index + 1][0] - TEMP_TABLE[index][0]);

                let mut u = TEMP_TABLE[index][1] * f + TEMP_TABLE[index + 1][1] * (1.0 - f);
                let mut v = TEMP_TABLE[index][2] * f + TEMP_TABLE[index + 1][2] * (1.0 - f);

                let mut uu1 = 1.0;
                let mut vv1 = TEMP_TABLE[index][3];
                let mut uu2 = 1.0;
                let mut vv2 = TEMP_TABLE[index + 1][3];

                let len1 = (1.0 + vv1 * vv1).sqrt();
                let len2 = (1.0 + vv2 * vv2).sqrt();
                uu1 /= len1;
                vv1 /= len1;
                uu2 /= len2;
                vv2 /= len2;

                let mut uu3 = uu1 * f + uu2 * (1.0 - f);
                let mut vv3 = vv1 * f + vv2 * (1.0 - f);
                let len3 = (uu3 * uu3 + vv3 * vv3).sqrt();
                uu3 /= len3;
                vv3 /= len3;

                u += uu3 * offset;
                v += vv3 * offset;

                return [
                    1.5 * u / (u - 4.0 * v + 2.0),
                    v / (u - 4.0 * v + 2.0),
                ];
            }
        }
        D50_XY
    }
}

pub fn xy_to_xyz(xy: [f64; 2]) -> Vector3<f64> {
    let mut x = xy[0].clamp(1e-6, 0.999999);
    let mut y = xy[1].clamp(1e-6, 0.999999);
    if x + y > 0.999999 {
        let scale = 0.999999 / (x + y);
        x *= scale;
        y *= scale;
    }
    Vector3::new(x / y, 1.0, (1.0 - x - y) / y)
}

pub fn xyz_to_xy(xyz: Vector3<f64>) -> [f64; 2] {
    let total = xyz.x + xyz.y + xyz.z;
    if total > 0.0 {
        [xyz.x / total, xyz.y / total]
    } else {
        D50_XY
    }
}

pub fn pcs_to_xyz() -> Vector3<f64> {
    xy_to_xyz(D50_XY)
}

fn mat3(values: &[f32; 9]) -> Matrix3<f64> {
    Matrix3::from_row_slice(&values.map(|v| v as f64))
}

fn is_zero(values: &[f32; 9]) -> bool {
    values.iter().all(|v| *v == 0.0)
}

/// The calibrated color pipeline of one camera, with the two reference
/// matrices ordered by increasing temperature.
pub struct CameraProfile {
    color_matrix1: Matrix3<f64>,
    color_matrix2: Matrix3<f64>,
    forward_matrix1: Option<Matrix3<f64>>,
    forward_matrix2: Option<Matrix3<f64>>,
    calibration1: Matrix3<f64>,
    calibration2: Matrix3<f64>,
    temperature1: f64,
    temperature2: f64,
}

impl CameraProfile {
    pub fn new(camera: &CameraDescription) -> Self {
        let calibration1 = mat3(&camera.calibration_matrix1);
        let calibration2 = mat3(&camera.calibration_matrix2);

        let color_matrix1 = calibration1 * normalize_color_matrix(mat3(&camera.color_matrix1));
        let color_matrix2 = calibration2 * normalize_color_matrix(mat3(&camera.color_matrix2));

        let forward_matrix1 = (!is_zero(&camera.forward_matrix1))
            .then(|| normalize_forward_matrix(mat3(&camera.forward_matrix1)));
        let forward_matrix2 = (!is_zero(&camera.forward_matrix2))
            .then(|| normalize_forward_matrix(mat3(&camera.forward_matrix2)));

        let temperature1 = camera.color_illuminant1.temperature();
        let temperature2 = camera.color_illuminant2.temperature();

        if temperature1 > temperature2 {
            Self {
                color_matrix1: color_matrix2,
                color_matrix2: color_matrix1,
                forward_matrix1: forward_matrix2,
                forward_matrix2: forward_matrix1,
                calibration1: calibration2,
                calibration2: calibration1,
                temperature1: temperature2,
                temperature2: temperature1,
            }
        } else {
            Self {
                color_matrix1,
                color_matrix2,
                forward_matrix1,
                forward_matrix2,
                calibration1,
                calibration2,
                temperature1,
                temperature2,
            }
        }
    }

    /// Weight of the first calibration for a white point, interpolated
    /// in reciprocal temperature.
    fn calibration_weight(&self, temperature: f64) -> f64 {
        if temperature <= self.temperature1 {
            1.0
        } else if temperature >= self.temperature2 {
            0.0
        } else {
            let inv_t = 1.0 / temperature;
            (inv_t - 1.0 / self.temperature2) / (1.0 / self.temperature1 - 1.0 / self.temperature2)
        }
    }

    fn xyz_to_camera(&self, white_xy: [f64; 2]) -> (Matrix3<f64>, Option<Matrix3<f64>>, Matrix3<f64>) {
        let t = Temperature::from_xy(white_xy);
        let g = self.calibration_weight(t.temperature);

        let color_matrix = if g >= 1.0 {
            self.color_matrix1
        } else if g <= 0.0 {
            self.color_matrix2
        } else {
            self.color_matrix1 * g + self.color_matrix2 * (1.0 - g)
        };

        let forward = match (self.forward_matrix1, self.forward_matrix2) {
            (Some(f1), Some(f2)) => {
                if g >= 1.0 {
                    Some(f1)
                } else if g <= 0.0 {
                    Some(f2)
                } else {
                    Some(f1 * g + f2 * (1.0 - g))
                }
            }
            (Some(f1), None) => Some(f1),
            (None, Some(f2)) => Some(f2),
            (None, None) => None,
        };

        let calibration = if g >= 1.0 {
            self.calibration1
        } else if g <= 0.0 {
            self.calibration2
        } else {
            self.calibration1 * g + self.calibration2 * (1.0 - g)
        };

        (color_matrix, forward, calibration)
    }

    /// Solve the camera-neutral to chromaticity mapping iteratively.
    /// Up to 30 iterations; a final non-converged pair of estimates is
    /// averaged since the iteration tends to end in a two-value
    /// oscillation.
    pub fn neutral_to_xy(&self, neutral: [f32; 3]) -> Result<[f64; 2]> {
        const MAX_ITERS: usize = 30;

        let max = neutral.iter().cloned().fold(f32::MIN, f32::max);
        if max <= 0.0 {
            return Err(Error::ZeroNeutral);
        }
        let neutral = Vector3::new(
            (neutral[0] / max) as f64,
            (neutral[1] / max) as f64,
            (neutral[2] / max) as f64,
        );

        let mut last = D50_XY;
        for i in 0..MAX_ITERS {
            let (xyz_to_camera, _, _) = self.xyz_to_camera(last);
            let inv = xyz_to_camera
                .try_inverse()
                .unwrap_or_else(Matrix3::identity);
            let mut next = xyz_to_xy(inv * neutral);

            if (next[0] - last[0]).abs() + (next[1] - last[1]).abs() < 1e-7 {
                return Ok(next);
            }

            if i == MAX_ITERS - 1 {
                next[0] = (last[0] + next[0]) * 0.5;
                next[1] = (last[1] + next[1]) * 0.5;
            }
            last = next;
        }
        Ok(last)
    }

    pub fn temperature_from_neutral(&self, neutral: [f32; 3]) -> Result<Temperature> {
        Ok(Temperature::from_xy(self.neutral_to_xy(neutral)?))
    }

    /// Build the camera-to-PCS transform, the PCS-to-sRGB transform and
    /// the camera white for a white point.
    pub fn camera_to_pcs(&self, temperature: &Temperature) -> CameraTransform {
        let neutral_xy = temperature.to_xy();
        let (color_matrix, forward, calibration) = self.xyz_to_camera(neutral_xy);

        let camera_white_raw = color_matrix * xy_to_xyz(neutral_xy);
        let white_scale = 1.0 / camera_white_raw.max();
        let camera_white = Vector3::new(
            (camera_white_raw.x * white_scale).clamp(0.001, 1.0),
            (camera_white_raw.y * white_scale).clamp(0.001, 1.0),
            (camera_white_raw.z * white_scale).clamp(0.001, 1.0),
        );

        // Scale so PCS white is just reached when the first camera
        // channel saturates.
        let pcs_to_camera_raw = color_matrix * map_white_matrix(D50_XY, neutral_xy);
        let scale = (pcs_to_camera_raw * pcs_to_xyz()).max();
        let pcs_to_camera = pcs_to_camera_raw * (1.0 / scale);

        let camera_to_pcs = match forward {
            Some(forward) => {
                let individual_to_reference = calibration
                    .try_inverse()
                    .unwrap_or_else(Matrix3::identity);
                let ref_white = individual_to_reference * camera_white;
                let ref_white_inv = Matrix3::from_diagonal(&ref_white)
                    .try_inverse()
                    .unwrap_or_else(Matrix3::identity);
                forward * ref_white_inv * individual_to_reference
            }
            None => pcs_to_camera
                .try_inverse()
                .unwrap_or_else(Matrix3::identity),
        };

        CameraTransform {
            camera_to_pcs,
            pcs_to_srgb: pcs_to_srgb(),
            camera_white: [
                camera_white.x as f32,
                camera_white.y as f32,
                camera_white.z as f32,
            ],
        }
    }
}

/// Matrices handed to the pixel kernels.
#[derive(Debug, Clone)]
pub struct CameraTransform {
    pub camera_to_pcs: Matrix3<f64>,
    pub pcs_to_srgb: Matrix3<f64>,
    pub camera_white: [f32; 3],
}

fn normalize_color_matrix(m: Matrix3<f64>) -> Matrix3<f64> {
    let coord = m * pcs_to_xyz();
    let max = coord.max();
    if max > 0.0 && !(0.99..=1.01).contains(&max) {
        m * (1.0 / max)
    } else {
        m
    }
}

fn normalize_forward_matrix(m: Matrix3<f64>) -> Matrix3<f64> {
    let ones = Vector3::new(1.0, 1.0, 1.0);
    let xyz = m * ones;
    let inv = Matrix3::from_diagonal(&xyz)
        .try_inverse()
        .unwrap_or_else(Matrix3::identity);
    Matrix3::from_diagonal(&pcs_to_xyz()) * inv * m
}

/// Linearized Bradford chromatic adaptation between two white points.
fn map_white_matrix(white1: [f64; 2], white2: [f64; 2]) -> Matrix3<f64> {
    let bradford = Matrix3::new(
        0.8951, 0.2664, -0.1614, -0.7502, 1.7135, 0.0367, 0.0389, -0.0685, 1.0296,
    );

    let w1 = (bradford * xy_to_xyz(white1)).map(|v| v.max(0.0));
    let w2 = (bradford * xy_to_xyz(white2)).map(|v| v.max(0.0));

    let ratio = |a: f64, b: f64| {
        if a > 0.0 {
            (b / a).clamp(0.1, 10.0)
        } else {
            10.0
        }
    };

    let a = Matrix3::from_diagonal(&Vector3::new(
        ratio(w1.x, w2.x),
        ratio(w1.y, w2.y),
        ratio(w1.z, w2.z),
    ));

    bradford.try_inverse().unwrap_or_else(Matrix3::identity) * a * bradford
}

/// The PCS (D50 XYZ) to linear sRGB matrix, white-point corrected the
/// way the DNG reference does it.
pub fn pcs_to_srgb() -> Matrix3<f64> {
    let srgb_to_pcs = Matrix3::new(
        0.4361, 0.3851, 0.1431, 0.2225, 0.7169, 0.0606, 0.0139, 0.0971, 0.7141,
    );
    let w1 = srgb_to_pcs * Vector3::new(1.0, 1.0, 1.0);
    let w2 = pcs_to_xyz();
    let s = Matrix3::from_diagonal(&Vector3::new(w2.x / w1.x, w2.y / w1.y, w2.z / w1.z));
    (s * srgb_to_pcs)
        .try_inverse()
        .unwrap_or_else(Matrix3::identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_xy_round_trip() {
        for (temp, tint) in [(2850.0, 0.0), (5000.0, 10.0), (6500.0, -8.0)] {
            let t = Temperature::new(temp, tint);
            let back = Temperature::from_xy(t.to_xy());
            assert!(
                (back.temperature - temp).abs() / temp < 0.01,
                "temperature {temp} came back as {}",
                back.temperature
            );
            assert!((back.tint - tint).abs() < 1.0);
        }
    }

    #[test]
    fn d50_is_near_5000k() {
        let t = Temperature::from_xy(D50_XY);
        assert!((t.temperature - 5000.0).abs() < 120.0, "{}", t.temperature);
    }

    #[test]
    fn neutral_to_xy_converges_for_identity_profile() {
        let camera = CameraDescription::default();
        let profile = CameraProfile::new(&camera);
        let xy = profile.neutral_to_xy([1.0, 1.0, 1.0]).unwrap();
        // An identity camera matrix maps equal-energy white near x=y=1/3.
        assert!((xy[0] - 1.0 / 3.0).abs() < 0.02);
        assert!((xy[1] - 1.0 / 3.0).abs() < 0.02);
    }

    #[test]
    fn zero_neutral_rejected() {
        let camera = CameraDescription::default();
        let profile = CameraProfile::new(&camera);
        assert!(profile.neutral_to_xy([0.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn camera_transform_white_is_normalized() {
        let camera = CameraDescription::default();
        let profile = CameraProfile::new(&camera);
        let t = profile.temperature_from_neutral([0.7, 1.0, 0.6]).unwrap();
        let transform = profile.camera_to_pcs(&t);
        let max = transform
            .camera_white
            .iter()
            .cloned()
            .fold(f32::MIN, f32::max);
        approx::assert_abs_diff_eq!(max, 1.0, epsilon = 1e-5);
    }
}
