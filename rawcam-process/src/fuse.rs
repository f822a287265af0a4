//! Weighted temporal fusion of a registered burst in the complex
//! wavelet domain.
//!
//! For each reference/candidate coefficient pair the blend
//! `fused = y + m * (x - y)` with `m = |d| / (|d| + w * T)` keeps the
//! candidate where the difference is inside the noise floor (so the
//! temporal average denoises) and falls back to the reference where it
//! is not (so motion does not ghost). `T` is a local noise estimate
//! from the reference subband; `w` grows where the low-pass difference
//! and the flow magnitude say the frames agree.

use crate::flow::FlowField;
use crate::plane::Plane;
use crate::wavelet::{Pyramid, Subband};

/// Squared-magnitude scale of the motion-vector weight.
pub const MOTION_VECTORS_WEIGHT: f32 = 20.0 * 20.0;

/// Difference weight, linear in exposure value.
pub fn difference_weight(ev: f64) -> f32 {
    (-ev + 16.0).clamp(1.0, 16.0) as f32
}

/// Local noise threshold: median of the four nearest reference
/// magnitudes.
fn local_threshold(reference: &Subband, x: usize, y: usize) -> f32 {
    let w = reference.width();
    let h = reference.height();
    let x1 = (x + 1).min(w - 1);
    let y1 = (y + 1).min(h - 1);
    let mut m = [
        reference.magnitude(y * w + x),
        reference.magnitude(y * w + x1),
        reference.magnitude(y1 * w + x),
        reference.magnitude(y1 * w + x1),
    ];
    m.sort_by(f32::total_cmp);
    0.5 * (m[1] + m[2])
}

/// Accumulator for the per-subband running sums.
pub struct FusionAccumulator {
    sum: Pyramid,
    frames: usize,
}

impl FusionAccumulator {
    pub fn new(reference: &Pyramid) -> Self {
        let mut sum = reference.clone();
        sum.for_each_subband_mut(true, |band| {
            band.a.data.fill(0.0);
            band.b.data.fill(0.0);
        });
        Self { sum, frames: 0 }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Fuse one registered candidate against the reference and add the
    /// result to the running sums.
    ///
    /// `lowpass_diff` is the absolute low-pass difference of the two
    /// frames normalized by the white level, at full channel
    /// resolution; it and the flow field are resampled per level.
    pub fn fuse(
        &mut self,
        reference: &Pyramid,
        candidate: &Pyramid,
        flow: &FlowField,
        lowpass_diff: &Plane<f32>,
        difference_weight: f32,
        noise_floor: f32,
    ) {
        for (level, (sum_level, (ref_level, cand_level))) in self
            .sum
            .levels
            .iter_mut()
            .zip(reference.levels.iter().zip(candidate.levels.iter()))
            .enumerate()
        {
            let bands = [
                (&mut sum_level.lh, &ref_level.lh, &cand_level.lh),
                (&mut sum_level.hl, &ref_level.hl, &cand_level.hl),
                (&mut sum_level.hh, &ref_level.hh, &cand_level.hh),
            ];
            for (sum, reference, candidate) in bands {
                fuse_subband(
                    sum,
                    reference,
                    candidate,
                    flow,
                    lowpass_diff,
                    level,
                    difference_weight,
                    noise_floor,
                );
            }
        }
        fuse_subband(
            &mut self.sum.ll,
            &reference.ll,
            &candidate.ll,
            flow,
            lowpass_diff,
            crate::wavelet::LEVELS,
            difference_weight,
            noise_floor,
        );
        self.frames += 1;
    }

    /// The temporal average `sum / frames`, or a copy of `reference`
    /// when nothing was fused.
    pub fn average(mut self, reference: &Pyramid) -> Pyramid {
        if self.frames == 0 {
            return reference.clone();
        }
        let scale = 1.0 / self.frames as f32;
        self.sum.for_each_subband_mut(true, |band| {
            for v in band.a.data.iter_mut() {
                *v *= scale;
            }
            for v in band.b.data.iter_mut() {
                *v *= scale;
            }
        });
        self.sum
    }
}

#[allow(clippy::too_many_arguments)]
fn fuse_subband(
    sum: &mut Subband,
    reference: &Subband,
    candidate: &Subband,
    flow: &FlowField,
    lowpass_diff: &Plane<f32>,
    level: usize,
    difference_weight: f32,
    noise_floor: f32,
) {
    let w = reference.width();
    let h = reference.height();
    // Coefficient position in full-resolution pixels.
    let scale = (1 << (level + 1)) as f32;

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let px = x as f32 * scale;
            let py = y as f32 * scale;

            let (fx, fy) = flow.at(px, py);
            let motion_sq = fx * fx + fy * fy;

            let d = lowpass_diff.sample(px, py);
            let weight = 1.0
                + (-motion_sq / MOTION_VECTORS_WEIGHT).exp()
                    * difference_weight
                    * (-256.0 * d).exp();

            let t = local_threshold(reference, x, y).max(noise_floor);

            let dre = reference.a.data[idx] - candidate.a.data[idx];
            let dim = reference.b.data[idx] - candidate.b.data[idx];
            let mag = (dre * dre + dim * dim).sqrt();
            let m = mag / (1e-15 + mag + weight * t);

            sum.a.data[idx] += candidate.a.data[idx] + m * dre;
            sum.b.data[idx] += candidate.b.data[idx] + m * dim;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wavelet;

    fn flat_flow(width: usize, height: usize) -> FlowField {
        FlowField {
            cell: 8,
            dx: Plane::new(width / 8 + 1, height / 8 + 1),
            dy: Plane::new(width / 8 + 1, height / 8 + 1),
        }
    }

    fn pattern(width: usize, height: usize, noise: f32, seed: usize) -> Plane<f32> {
        let mut p = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let base = 100.0 + 50.0 * ((x as f32 * 0.2).sin() + (y as f32 * 0.15).cos());
                let n = (((x * 31 + y * 17 + seed * 101) % 113) as f32 / 113.0 - 0.5) * noise;
                p.set(x, y, base + n);
            }
        }
        p
    }

    #[test]
    fn difference_weight_is_clamped_linear() {
        assert_eq!(difference_weight(20.0), 1.0);
        assert_eq!(difference_weight(0.0), 16.0);
        approx::assert_abs_diff_eq!(difference_weight(10.0), 6.0);
    }

    #[test]
    fn fusing_identical_frames_averages_to_reference() {
        let image = pattern(64, 64, 0.0, 0);
        let reference = wavelet::forward(&image);
        let candidate = wavelet::forward(&image);
        let flow = flat_flow(64, 64);
        let diff = Plane::new(64, 64);

        let mut acc = FusionAccumulator::new(&reference);
        acc.fuse(&reference, &candidate, &flow, &diff, 8.0, 0.0);
        acc.fuse(&reference, &candidate, &flow, &diff, 8.0, 0.0);
        let fused = acc.average(&reference);

        let out = wavelet::inverse(&fused);
        for y in 0..64 {
            for x in 0..64 {
                approx::assert_abs_diff_eq!(out.get(x, y), image.get(x, y), epsilon = 0.05);
            }
        }
    }

    #[test]
    fn fusion_reduces_noise() {
        let clean = pattern(64, 64, 0.0, 0);
        let reference = wavelet::forward(&pattern(64, 64, 8.0, 1));
        let flow = flat_flow(64, 64);
        let diff = Plane::new(64, 64);

        let mut acc = FusionAccumulator::new(&reference);
        for seed in 2..6 {
            let candidate = wavelet::forward(&pattern(64, 64, 8.0, seed));
            acc.fuse(&reference, &candidate, &flow, &diff, 16.0, 2.0);
        }
        let fused = wavelet::inverse(&acc.average(&reference));

        let noisy = wavelet::inverse(&reference);
        let err = |img: &Plane<f32>| -> f32 {
            img.data
                .iter()
                .zip(clean.data.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                / img.data.len() as f32
        };
        assert!(
            err(&fused) < 0.6 * err(&noisy),
            "fused mse {} vs noisy mse {}",
            err(&fused),
            err(&noisy)
        );
    }

    #[test]
    fn strong_differences_follow_reference() {
        // Candidate has a large moving object; the fused result must
        // stay close to the reference there.
        let ref_img = pattern(64, 64, 0.0, 0);
        let mut cand_img = ref_img.clone();
        for y in 20..40 {
            for x in 20..40 {
                cand_img.set(x, y, cand_img.get(x, y) + 400.0);
            }
        }
        let reference = wavelet::forward(&ref_img);
        let candidate = wavelet::forward(&cand_img);
        let flow = flat_flow(64, 64);
        let diff = Plane::new(64, 64);

        let mut acc = FusionAccumulator::new(&reference);
        acc.fuse(&reference, &candidate, &flow, &diff, 1.0, 0.5);
        let fused = wavelet::inverse(&acc.average(&reference));

        let center_err = (fused.get(30, 30) - ref_img.get(30, 30)).abs();
        assert!(center_err < 100.0, "ghosting of {center_err}");
    }
}
