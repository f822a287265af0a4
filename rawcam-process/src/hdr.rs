//! Registration and ghost analysis of the underexposed frame.
//!
//! The underexposed capture is offset in time from the burst, so a
//! dense flow field is not reliable; instead the frames are aligned
//! with a global homography fit on sparse feature matches (corner
//! detection, binary descriptors, Lowe ratio filtering, RANSAC), the
//! way panorama stitchers do it.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::kernels::{self, RawChannels};
use crate::plane::Plane;

const MAX_FEATURES: usize = 2000;
const LOWE_RATIO: f32 = 0.75;
const RANSAC_ITERATIONS: usize = 512;
const RANSAC_INLIER_PX: f32 = 3.0;
const DESCRIPTOR_BITS: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Keypoint {
    x: f32,
    y: f32,
}

/// Harris-style corner score on a grayscale plane, returning the
/// strongest spaced keypoints.
fn detect_corners(image: &Plane<f32>) -> Vec<Keypoint> {
    let w = image.width;
    let h = image.height;
    if w < 16 || h < 16 {
        return vec![];
    }

    let mut scored: Vec<(f32, usize, usize)> = Vec::new();
    for y in (2..h - 2).step_by(2) {
        for x in (2..w - 2).step_by(2) {
            let gx = image.get(x + 1, y) - image.get(x - 1, y);
            let gy = image.get(x, y + 1) - image.get(x, y - 1);
            let gxy = image.get(x + 1, y + 1) - image.get(x - 1, y - 1);
            let score = gx * gx + gy * gy + 0.5 * gxy * gxy;
            if score > 25.0 {
                scored.push((score, x, y));
            }
        }
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    // Greedy spacing suppression.
    let mut taken: Vec<Keypoint> = Vec::new();
    let min_dist_sq = 36.0f32;
    for (_, x, y) in scored {
        if taken.len() >= MAX_FEATURES {
            break;
        }
        let candidate = Keypoint {
            x: x as f32,
            y: y as f32,
        };
        let clear = taken.iter().all(|k| {
            let dx = k.x - candidate.x;
            let dy = k.y - candidate.y;
            dx * dx + dy * dy >= min_dist_sq
        });
        if clear {
            taken.push(candidate);
        }
    }
    taken
}

/// Binary intensity-comparison descriptor sampled on a fixed pattern
/// around the keypoint.
fn describe(image: &Plane<f32>, keypoint: &Keypoint) -> [u64; DESCRIPTOR_BITS / 64] {
    // The pattern must be identical for every keypoint and image.
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    let mut descriptor = [0u64; DESCRIPTOR_BITS / 64];
    for bit in 0..DESCRIPTOR_BITS {
        let ax = rng.random_range(-12i32..=12);
        let ay = rng.random_range(-12i32..=12);
        let bx = rng.random_range(-12i32..=12);
        let by = rng.random_range(-12i32..=12);
        let a = image.get_clamped(keypoint.x as isize + ax as isize, keypoint.y as isize + ay as isize);
        let b = image.get_clamped(keypoint.x as isize + bx as isize, keypoint.y as isize + by as isize);
        if a > b {
            descriptor[bit / 64] |= 1u64 << (bit % 64);
        }
    }
    descriptor
}

fn hamming(a: &[u64; DESCRIPTOR_BITS / 64], b: &[u64; DESCRIPTOR_BITS / 64]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Matched point pair, reference then target.
#[derive(Debug, Clone, Copy)]
struct PointMatch {
    rx: f32,
    ry: f32,
    tx: f32,
    ty: f32,
}

fn match_features(reference: &Plane<f32>, target: &Plane<f32>) -> Vec<PointMatch> {
    let ref_smooth = kernels::gaussian_blur(reference, 2);
    let target_smooth = kernels::gaussian_blur(target, 2);

    let ref_keypoints = detect_corners(&ref_smooth);
    let target_keypoints = detect_corners(&target_smooth);
    if ref_keypoints.is_empty() || target_keypoints.is_empty() {
        return vec![];
    }

    let ref_descriptors: Vec<_> = ref_keypoints
        .iter()
        .map(|k| describe(&ref_smooth, k))
        .collect();
    let target_descriptors: Vec<_> = target_keypoints
        .iter()
        .map(|k| describe(&target_smooth, k))
        .collect();

    let mut matches = Vec::new();
    for (ri, rd) in ref_descriptors.iter().enumerate() {
        let mut best = u32::MAX;
        let mut second = u32::MAX;
        let mut best_idx = 0usize;
        for (ti, td) in target_descriptors.iter().enumerate() {
            let dist = hamming(rd, td);
            if dist < best {
                second = best;
                best = dist;
                best_idx = ti;
            } else if dist < second {
                second = dist;
            }
        }
        // Lowe's ratio test on the two nearest neighbors.
        if (best as f32) < LOWE_RATIO * second as f32 {
            matches.push(PointMatch {
                rx: ref_keypoints[ri].x,
                ry: ref_keypoints[ri].y,
                tx: target_keypoints[best_idx].x,
                ty: target_keypoints[best_idx].y,
            });
        }
    }
    matches
}

/// Direct linear transform for a homography mapping target points onto
/// reference points.
fn dlt_homography(matches: &[PointMatch]) -> Option<Matrix3<f64>> {
    if matches.len() < 4 {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(2 * matches.len(), 9);
    for (i, m) in matches.iter().enumerate() {
        let (x, y) = (m.tx as f64, m.ty as f64);
        let (u, v) = (m.rx as f64, m.ry as f64);
        a[(2 * i, 0)] = -x;
        a[(2 * i, 1)] = -y;
        a[(2 * i, 2)] = -1.0;
        a[(2 * i, 6)] = u * x;
        a[(2 * i, 7)] = u * y;
        a[(2 * i, 8)] = u;
        a[(2 * i + 1, 3)] = -x;
        a[(2 * i + 1, 4)] = -y;
        a[(2 * i + 1, 5)] = -1.0;
        a[(2 * i + 1, 6)] = v * x;
        a[(2 * i + 1, 7)] = v * y;
        a[(2 * i + 1, 8)] = v;
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(v_t.nrows() - 1);
    let mut matrix = Matrix3::from_row_slice(&[
        h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8],
    ]);
    if matrix[(2, 2)].abs() < 1e-12 {
        return None;
    }
    matrix /= matrix[(2, 2)];
    Some(matrix)
}

fn project(h: &Matrix3<f64>, x: f32, y: f32) -> (f32, f32) {
    let p = h * Vector3::new(x as f64, y as f64, 1.0);
    if p.z.abs() < 1e-12 {
        return (f32::MAX, f32::MAX);
    }
    ((p.x / p.z) as f32, (p.y / p.z) as f32)
}

/// RANSAC homography over the matches; refined on the inlier set.
fn ransac_homography(matches: &[PointMatch]) -> Option<Matrix3<f64>> {
    if matches.len() < 4 {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(0x0a11_ce5e);
    let mut best_inliers: Vec<PointMatch> = Vec::new();

    for _ in 0..RANSAC_ITERATIONS {
        let mut sample = [0usize; 4];
        for s in &mut sample {
            *s = rng.random_range(0..matches.len());
        }
        if sample.iter().collect::<std::collections::BTreeSet<_>>().len() < 4 {
            continue;
        }
        let subset: Vec<PointMatch> = sample.iter().map(|i| matches[*i]).collect();
        let Some(h) = dlt_homography(&subset) else {
            continue;
        };
        let inliers: Vec<PointMatch> = matches
            .iter()
            .filter(|m| {
                let (px, py) = project(&h, m.tx, m.ty);
                let dx = px - m.rx;
                let dy = py - m.ry;
                dx * dx + dy * dy < RANSAC_INLIER_PX * RANSAC_INLIER_PX
            })
            .copied()
            .collect();
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
        }
    }

    if best_inliers.len() < 8 {
        return None;
    }
    dlt_homography(&best_inliers)
}

/// Register `target` onto `reference` (both grayscale previews) and
/// return the homography that pulls target pixels into the reference
/// frame.
pub fn register(reference: &Plane<f32>, target: &Plane<f32>) -> Option<Matrix3<f64>> {
    let matches = match_features(reference, target);
    debug!("registration found {} ratio-filtered matches", matches.len());
    ransac_homography(&matches)
}

/// Resample a plane through a homography (inverse warp, replicated
/// edges).
pub fn warp_perspective(image: &Plane<f32>, homography: &Matrix3<f64>) -> Plane<f32> {
    let inverse = match homography.try_inverse() {
        Some(inv) => inv,
        None => return image.clone(),
    };
    let mut out = Plane::new(image.width, image.height);
    for y in 0..image.height {
        for x in 0..image.width {
            let (sx, sy) = project(&inverse, x as f32, y as f32);
            out.set(x, y, image.sample(sx, sy));
        }
    }
    out
}

/// Warp all four Bayer channels through the homography computed on the
/// same-resolution previews.
pub fn warp_channels(channels: &RawChannels, homography: &Matrix3<f64>) -> RawChannels {
    let planes = [
        warp_perspective(&channels.planes[0], homography),
        warp_perspective(&channels.planes[1], homography),
        warp_perspective(&channels.planes[2], homography),
        warp_perspective(&channels.planes[3], homography),
    ];
    RawChannels { planes }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(width: usize, height: usize, dx: f32, dy: f32) -> Plane<f32> {
        let mut p = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let sx = x as f32 - dx;
                let sy = y as f32 - dy;
                let v = 128.0
                    + 60.0 * ((sx * 0.35).sin() * (sy * 0.27).cos())
                    + 40.0 * (((sx as i64 * 37 + sy as i64 * 73).rem_euclid(101)) as f32 / 101.0);
                p.set(x, y, v);
            }
        }
        p
    }

    #[test]
    fn dlt_recovers_exact_translation() {
        let matches: Vec<PointMatch> = [(10.0, 10.0), (90.0, 12.0), (15.0, 80.0), (88.0, 85.0)]
            .iter()
            .map(|(x, y)| PointMatch {
                rx: *x,
                ry: *y,
                tx: *x + 5.0,
                ty: *y - 3.0,
            })
            .collect();
        let h = dlt_homography(&matches).unwrap();
        let (px, py) = project(&h, 55.0, 47.0);
        approx::assert_abs_diff_eq!(px, 50.0, epsilon = 1e-3);
        approx::assert_abs_diff_eq!(py, 50.0, epsilon = 1e-3);
    }

    #[test]
    fn register_recovers_translation() {
        let reference = textured(160, 120, 0.0, 0.0);
        let target = textured(160, 120, 4.0, -3.0);
        let h = register(&reference, &target).expect("registration failed");
        // The homography maps target points onto reference points.
        let (px, py) = project(&h, 80.0, 60.0);
        assert!((px - 76.0).abs() < 1.5, "px {px}");
        assert!((py - 63.0).abs() < 1.5, "py {py}");
    }

    #[test]
    fn warp_aligns_target_to_reference() {
        let reference = textured(160, 120, 0.0, 0.0);
        let target = textured(160, 120, 4.0, -3.0);
        let h = register(&reference, &target).expect("registration failed");
        let aligned = warp_perspective(&target, &h);

        let mut err = 0.0f32;
        let mut n = 0usize;
        for y in 20..100 {
            for x in 20..140 {
                err += (aligned.get(x, y) - reference.get(x, y)).abs();
                n += 1;
            }
        }
        let mean = err / n as f32;
        assert!(mean < 8.0, "mean abs err {mean}");
    }
}
