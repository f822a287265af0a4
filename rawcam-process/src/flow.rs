//! Dense patch-based optical flow used to register burst frames.
//!
//! Coarse-to-fine block matching: SAD over 16x16 patches on an image
//! pyramid, one flow vector per 8-pixel grid cell, refined at each
//! scale. Tuned for speed over accuracy; the wavelet fusion weights
//! tolerate small residual misalignment.

use tracing::debug;

use crate::plane::Plane;

pub const PATCH: usize = 16;
pub const STRIDE: usize = 8;

const SEARCH_COARSE: isize = 4;
const SEARCH_FINE: isize = 2;

/// Per-grid-cell displacement from reference to candidate.
#[derive(Debug, Clone)]
pub struct FlowField {
    /// Grid cell size in image pixels.
    pub cell: usize,
    pub dx: Plane<f32>,
    pub dy: Plane<f32>,
}

impl FlowField {
    /// Flow vector at an image position, bilinearly interpolated from
    /// the grid.
    pub fn at(&self, x: f32, y: f32) -> (f32, f32) {
        let gx = x / self.cell as f32;
        let gy = y / self.cell as f32;
        (self.dx.sample(gx, gy), self.dy.sample(gx, gy))
    }

    /// Mean squared flow magnitude, the motion measure fed to the
    /// fusion weights.
    pub fn mean_magnitude_sq(&self) -> f32 {
        let n = self.dx.data.len().max(1);
        let sum: f32 = self
            .dx
            .data
            .iter()
            .zip(self.dy.data.iter())
            .map(|(dx, dy)| dx * dx + dy * dy)
            .sum();
        sum / n as f32
    }

}

fn sad(
    reference: &Plane<f32>,
    candidate: &Plane<f32>,
    cx: isize,
    cy: isize,
    dx: isize,
    dy: isize,
) -> f32 {
    let half = PATCH as isize / 2;
    let mut acc = 0.0f32;
    for py in -half..half {
        for px in -half..half {
            let r = reference.get_clamped(cx + px, cy + py);
            let c = candidate.get_clamped(cx + px + dx, cy + py + dy);
            acc += (r - c).abs();
        }
    }
    acc
}

fn match_level(
    reference: &Plane<f32>,
    candidate: &Plane<f32>,
    prior: Option<&FlowField>,
    search: isize,
) -> FlowField {
    let grid_w = (reference.width + STRIDE - 1) / STRIDE;
    let grid_h = (reference.height + STRIDE - 1) / STRIDE;
    let mut dx_plane = Plane::new(grid_w, grid_h);
    let mut dy_plane = Plane::new(grid_w, grid_h);

    for gy in 0..grid_h {
        for gx in 0..grid_w {
            let cx = (gx * STRIDE + STRIDE / 2) as isize;
            let cy = (gy * STRIDE + STRIDE / 2) as isize;

            // Seed from the coarser level, doubled.
            let (seed_x, seed_y) = match prior {
                Some(prior) => {
                    let (px, py) = prior.at(cx as f32 * 0.5, cy as f32 * 0.5);
                    ((px * 2.0).round() as isize, (py * 2.0).round() as isize)
                }
                None => (0, 0),
            };

            let mut best = f32::MAX;
            let mut best_dx = seed_x;
            let mut best_dy = seed_y;
            for dy in -search..=search {
                for dx in -search..=search {
                    let cost = sad(reference, candidate, cx, cy, seed_x + dx, seed_y + dy);
                    if cost < best {
                        best = cost;
                        best_dx = seed_x + dx;
                        best_dy = seed_y + dy;
                    }
                }
            }
            dx_plane.set(gx, gy, best_dx as f32);
            dy_plane.set(gx, gy, best_dy as f32);
        }
    }

    FlowField {
        cell: STRIDE,
        dx: dx_plane,
        dy: dy_plane,
    }
}

/// Number of pyramid levels for an image size; the coarsest level
/// keeps at least one full patch.
fn pyramid_depth(width: usize, height: usize) -> usize {
    let mut depth = 1;
    let mut size = width.min(height);
    while size / 2 >= PATCH * 2 && depth < 4 {
        size /= 2;
        depth += 1;
    }
    depth
}

/// Dense flow from `reference` to `candidate`.
pub fn compute(reference: &Plane<f32>, candidate: &Plane<f32>) -> FlowField {
    let depth = pyramid_depth(reference.width, reference.height);

    let mut ref_pyramid = vec![reference.clone()];
    let mut cand_pyramid = vec![candidate.clone()];
    for _ in 1..depth {
        ref_pyramid.push(ref_pyramid.last().unwrap().downscale(2));
        cand_pyramid.push(cand_pyramid.last().unwrap().downscale(2));
    }

    let mut flow: Option<FlowField> = None;
    for level in (0..depth).rev() {
        let search = if flow.is_none() {
            SEARCH_COARSE
        } else {
            SEARCH_FINE
        };
        flow = Some(match_level(
            &ref_pyramid[level],
            &cand_pyramid[level],
            flow.as_ref(),
            search,
        ));
    }
    // depth >= 1, so the loop always produced a field.
    let flow = flow.unwrap();
    debug!(
        "flow field {}x{} cells, mean |v|^2 {:.3}",
        flow.dx.width,
        flow.dx.height,
        flow.mean_magnitude_sq()
    );
    flow
}

/// Resample `image` through `flow`, pulling each output pixel from the
/// matched position in `image`.
pub fn warp(image: &Plane<f32>, flow: &FlowField) -> Plane<f32> {
    let mut out = Plane::new(image.width, image.height);
    for y in 0..image.height {
        for x in 0..image.width {
            let (dx, dy) = flow.at(x as f32, y as f32);
            out.set(x, y, image.sample(x as f32 + dx, y as f32 + dy));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(width: usize, height: usize, shift_x: isize, shift_y: isize) -> Plane<f32> {
        let mut p = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let sx = x as isize - shift_x;
                let sy = y as isize - shift_y;
                let v = ((sx * 31 + sy * 17).rem_euclid(97)) as f32 / 97.0
                    + ((sx as f32 * 0.3).sin() + (sy as f32 * 0.2).cos()) * 0.25;
                p.set(x, y, v);
            }
        }
        p
    }

    #[test]
    fn recovers_global_translation() {
        let reference = textured(96, 96, 0, 0);
        let candidate = textured(96, 96, 3, -2);
        let flow = compute(&reference, &candidate);

        // Check interior cells; borders are unreliable.
        let (dx, dy) = flow.at(48.0, 48.0);
        assert!((dx - 3.0).abs() <= 1.0, "dx {dx}");
        assert!((dy + 2.0).abs() <= 1.0, "dy {dy}");
    }

    #[test]
    fn warp_undoes_translation() {
        let reference = textured(96, 96, 0, 0);
        let candidate = textured(96, 96, 3, -2);
        let flow = compute(&reference, &candidate);
        let warped = warp(&candidate, &flow);

        let mut err = 0.0f32;
        let mut n = 0usize;
        for y in 24..72 {
            for x in 24..72 {
                err += (warped.get(x, y) - reference.get(x, y)).abs();
                n += 1;
            }
        }
        assert!(err / (n as f32) < 0.05, "mean abs err {}", err / n as f32);
    }

    #[test]
    fn zero_motion_yields_zero_flow() {
        let reference = textured(64, 64, 0, 0);
        let flow = compute(&reference, &reference.clone());
        assert!(flow.mean_magnitude_sq() < 0.25);
    }
}
