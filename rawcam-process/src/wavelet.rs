//! Six-level dual-tree oriented complex wavelet transform.
//!
//! Two parallel real filter trees (called `a` and `b` here) run over
//! the image with separable row/column convolutions; the pair of tree
//! outputs at each subband forms one complex coefficient, which gives
//! the near shift-invariance the temporal fusion relies on. The
//! first-level filter pair differs from the later levels (a
//! near-symmetric bank at level one, a quarter-shift bank below).
//! Synthesis uses the time-reversed analysis filters; the two tree
//! reconstructions are averaged.

use crate::plane::Plane;

pub const LEVELS: usize = 6;

// First stage, trees a and b: near-symmetric quadrature-mirror pair.
const FIRST_LOW_A: [f32; 10] = [
    0.0,
    -0.08838834764832,
    0.08838834764832,
    0.695879989034,
    0.695879989034,
    0.08838834764832,
    -0.08838834764832,
    0.01122679215254,
    0.01122679215254,
    0.0,
];
const FIRST_LOW_B: [f32; 10] = [
    0.01122679215254,
    0.01122679215254,
    -0.08838834764832,
    0.08838834764832,
    0.695879989034,
    0.695879989034,
    0.08838834764832,
    -0.08838834764832,
    0.0,
    0.0,
];

// Later stages: quarter-shift pair.
const LOW_A: [f32; 10] = [
    0.03516384,
    0.0,
    -0.08832942,
    0.23389032,
    0.76027237,
    0.58751830,
    0.0,
    -0.11430184,
    0.0,
    0.0,
];
const LOW_B: [f32; 10] = [
    0.0,
    0.0,
    -0.11430184,
    0.0,
    0.58751830,
    0.76027237,
    0.23389032,
    -0.08832942,
    0.0,
    0.03516384,
];

/// Quadrature mirror of a lowpass filter.
fn qmf(h: &[f32; 10]) -> [f32; 10] {
    let mut g = [0.0f32; 10];
    for (n, out) in g.iter_mut().enumerate() {
        let rev = h[h.len() - 1 - n];
        *out = if n % 2 == 0 { rev } else { -rev };
    }
    g
}

struct FilterBank {
    low: [f32; 10],
    high: [f32; 10],
}

impl FilterBank {
    /// The published coefficients are not all exactly unit-energy;
    /// rescale so the transposed synthesis reconstructs without gain.
    fn normalized(mut low: [f32; 10]) -> Self {
        let energy: f32 = low.iter().map(|v| v * v).sum();
        let scale = 1.0 / energy.sqrt();
        for v in &mut low {
            *v *= scale;
        }
        Self {
            low,
            high: qmf(&low),
        }
    }

    fn first(tree_b: bool) -> Self {
        Self::normalized(if tree_b { FIRST_LOW_B } else { FIRST_LOW_A })
    }

    fn later(tree_b: bool) -> Self {
        Self::normalized(if tree_b { LOW_B } else { LOW_A })
    }
}

/// One oriented subband: the two tree outputs forming a complex pair.
#[derive(Debug, Clone)]
pub struct Subband {
    pub a: Plane<f32>,
    pub b: Plane<f32>,
}

impl Subband {
    fn new(width: usize, height: usize) -> Self {
        Self {
            a: Plane::new(width, height),
            b: Plane::new(width, height),
        }
    }

    pub fn width(&self) -> usize {
        self.a.width
    }

    pub fn height(&self) -> usize {
        self.a.height
    }

    /// Complex magnitude at one coefficient.
    #[inline]
    pub fn magnitude(&self, idx: usize) -> f32 {
        let re = self.a.data[idx];
        let im = self.b.data[idx];
        (re * re + im * im).sqrt()
    }
}

/// Detail subbands of one decomposition level.
#[derive(Debug, Clone)]
pub struct Level {
    pub lh: Subband,
    pub hl: Subband,
    pub hh: Subband,
}

/// The full decomposition: `levels[0]` is the finest.
#[derive(Debug, Clone)]
pub struct Pyramid {
    pub levels: Vec<Level>,
    pub ll: Subband,
    width: usize,
    height: usize,
}

impl Pyramid {
    /// Apply `f` to every detail coefficient pair, coarse low-pass
    /// included when `include_ll`.
    pub fn for_each_subband_mut(&mut self, include_ll: bool, mut f: impl FnMut(&mut Subband)) {
        for level in &mut self.levels {
            f(&mut level.lh);
            f(&mut level.hl);
            f(&mut level.hh);
        }
        if include_ll {
            f(&mut self.ll);
        }
    }
}

fn pad_to(mut n: usize, multiple: usize) -> usize {
    if n % multiple != 0 {
        n += multiple - n % multiple;
    }
    n
}

fn pad_image(image: &Plane<f32>, multiple: usize) -> Plane<f32> {
    let w = pad_to(image.width.max(multiple), multiple);
    let h = pad_to(image.height.max(multiple), multiple);
    if w == image.width && h == image.height {
        return image.clone();
    }
    let mut out = Plane::new(w, h);
    for y in 0..h {
        for x in 0..w {
            out.set(x, y, image.get_clamped(x as isize, y as isize));
        }
    }
    out
}

/// Periodic polyphase analysis of one row: `low[k], high[k]` from
/// `x[2k + n mod N]`.
fn analyze_row(x: &[f32], bank: &FilterBank, low: &mut [f32], high: &mut [f32]) {
    let n = x.len();
    for k in 0..n / 2 {
        let mut lo = 0.0f32;
        let mut hi = 0.0f32;
        for (t, (l, h)) in bank.low.iter().zip(bank.high.iter()).enumerate() {
            let xi = x[(2 * k + t) % n];
            lo += l * xi;
            hi += h * xi;
        }
        low[k] = lo;
        high[k] = hi;
    }
}

/// Transpose of [`analyze_row`]; exact reconstruction for the
/// orthonormal banks used here.
fn synthesize_row(low: &[f32], high: &[f32], bank: &FilterBank, x: &mut [f32]) {
    let n = x.len();
    x.fill(0.0);
    for k in 0..n / 2 {
        for (t, (l, h)) in bank.low.iter().zip(bank.high.iter()).enumerate() {
            x[(2 * k + t) % n] += l * low[k] + h * high[k];
        }
    }
}

struct TreeLevel {
    ll: Plane<f32>,
    lh: Plane<f32>,
    hl: Plane<f32>,
    hh: Plane<f32>,
}

fn analyze_2d(image: &Plane<f32>, bank: &FilterBank) -> TreeLevel {
    let w = image.width;
    let h = image.height;
    let hw = w / 2;
    let hh_ = h / 2;

    // Rows.
    let mut row_low = Plane::new(hw, h);
    let mut row_high = Plane::new(hw, h);
    let mut lo = vec![0.0f32; hw];
    let mut hi = vec![0.0f32; hw];
    for y in 0..h {
        analyze_row(image.row(y), bank, &mut lo, &mut hi);
        row_low.data[y * hw..(y + 1) * hw].copy_from_slice(&lo);
        row_high.data[y * hw..(y + 1) * hw].copy_from_slice(&hi);
    }

    // Columns.
    let mut ll = Plane::new(hw, hh_);
    let mut lh = Plane::new(hw, hh_);
    let mut hl = Plane::new(hw, hh_);
    let mut hh = Plane::new(hw, hh_);
    let mut col = vec![0.0f32; h];
    let mut clo = vec![0.0f32; hh_];
    let mut chi = vec![0.0f32; hh_];
    for x in 0..hw {
        for y in 0..h {
            col[y] = row_low.get(x, y);
        }
        analyze_row(&col, bank, &mut clo, &mut chi);
        for y in 0..hh_ {
            ll.set(x, y, clo[y]);
            lh.set(x, y, chi[y]);
        }
        for y in 0..h {
            col[y] = row_high.get(x, y);
        }
        analyze_row(&col, bank, &mut clo, &mut chi);
        for y in 0..hh_ {
            hl.set(x, y, clo[y]);
            hh.set(x, y, chi[y]);
        }
    }

    TreeLevel { ll, lh, hl, hh }
}

fn synthesize_2d(level: &TreeLevel, bank: &FilterBank) -> Plane<f32> {
    let hw = level.ll.width;
    let hh_ = level.ll.height;
    let w = hw * 2;
    let h = hh_ * 2;

    // Columns first (transpose of the analysis order).
    let mut row_low = Plane::new(hw, h);
    let mut row_high = Plane::new(hw, h);
    let mut clo = vec![0.0f32; hh_];
    let mut chi = vec![0.0f32; hh_];
    let mut col = vec![0.0f32; h];
    for x in 0..hw {
        for y in 0..hh_ {
            clo[y] = level.ll.get(x, y);
            chi[y] = level.lh.get(x, y);
        }
        synthesize_row(&clo, &chi, bank, &mut col);
        for y in 0..h {
            row_low.set(x, y, col[y]);
        }
        for y in 0..hh_ {
            clo[y] = level.hl.get(x, y);
            chi[y] = level.hh.get(x, y);
        }
        synthesize_row(&clo, &chi, bank, &mut col);
        for y in 0..h {
            row_high.set(x, y, col[y]);
        }
    }

    // Rows.
    let mut out = Plane::new(w, h);
    let mut lo = vec![0.0f32; hw];
    let mut hi = vec![0.0f32; hw];
    let mut row = vec![0.0f32; w];
    for y in 0..h {
        lo.copy_from_slice(row_low.row(y));
        hi.copy_from_slice(row_high.row(y));
        synthesize_row(&lo, &hi, bank, &mut row);
        out.data[y * w..(y + 1) * w].copy_from_slice(&row);
    }
    out
}

fn forward_tree(image: &Plane<f32>, tree_b: bool) -> (Vec<TreeLevel>, Plane<f32>) {
    let mut levels = Vec::with_capacity(LEVELS);
    let mut current = image.clone();
    for level in 0..LEVELS {
        let bank = if level == 0 {
            FilterBank::first(tree_b)
        } else {
            FilterBank::later(tree_b)
        };
        let decomposed = analyze_2d(&current, &bank);
        current = decomposed.ll.clone();
        levels.push(decomposed);
    }
    (levels, current)
}

/// Forward transform. The image is edge-padded to a multiple of
/// `2^LEVELS`; the original size is kept for the inverse.
pub fn forward(image: &Plane<f32>) -> Pyramid {
    let padded = pad_image(image, 1 << LEVELS);
    let (tree_a, ll_a) = forward_tree(&padded, false);
    let (tree_b, ll_b) = forward_tree(&padded, true);

    let mut levels = Vec::with_capacity(LEVELS);
    for (la, lb) in tree_a.into_iter().zip(tree_b.into_iter()) {
        levels.push(Level {
            lh: Subband { a: la.lh, b: lb.lh },
            hl: Subband { a: la.hl, b: lb.hl },
            hh: Subband { a: la.hh, b: lb.hh },
        });
    }
    Pyramid {
        levels,
        ll: Subband { a: ll_a, b: ll_b },
        width: image.width,
        height: image.height,
    }
}

fn inverse_tree(pyramid: &Pyramid, tree_b: bool) -> Plane<f32> {
    let pick = |s: &Subband| if tree_b { s.b.clone() } else { s.a.clone() };
    let mut current = pick(&pyramid.ll);
    for (index, level) in pyramid.levels.iter().enumerate().rev() {
        let bank = if index == 0 {
            FilterBank::first(tree_b)
        } else {
            FilterBank::later(tree_b)
        };
        let tree_level = TreeLevel {
            ll: current,
            lh: pick(&level.lh),
            hl: pick(&level.hl),
            hh: pick(&level.hh),
        };
        current = synthesize_2d(&tree_level, &bank);
    }
    current
}

/// Inverse transform, averaging the two tree reconstructions and
/// cropping back to the original size.
pub fn inverse(pyramid: &Pyramid) -> Plane<f32> {
    let rec_a = inverse_tree(pyramid, false);
    let rec_b = inverse_tree(pyramid, true);

    let mut out = Plane::new(pyramid.width, pyramid.height);
    for y in 0..pyramid.height {
        for x in 0..pyramid.width {
            out.set(x, y, 0.5 * (rec_a.get(x, y) + rec_b.get(x, y)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(width: usize, height: usize) -> Plane<f32> {
        let mut image = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let v = ((x * 13 + y * 7) % 251) as f32 / 251.0
                    + 0.2 * ((x as f32 * 0.1).sin() + (y as f32 * 0.07).cos());
                image.set(x, y, v);
            }
        }
        image
    }

    #[test]
    fn filter_banks_are_orthonormal() {
        for bank in [
            FilterBank::first(false),
            FilterBank::first(true),
            FilterBank::later(false),
            FilterBank::later(true),
        ] {
            let energy: f32 = bank.low.iter().map(|v| v * v).sum();
            assert!((energy - 1.0).abs() < 1e-5, "energy {energy}");
            let dot: f32 = bank
                .low
                .iter()
                .zip(bank.high.iter())
                .map(|(a, b)| a * b)
                .sum();
            assert!(dot.abs() < 1e-6, "low/high dot {dot}");
            // Even-shift self-orthogonality, the perfect-reconstruction
            // condition for the periodic polyphase scheme.
            for shift in [2usize, 4, 6, 8] {
                let dot: f32 = (0..10 - shift)
                    .map(|n| bank.low[n] * bank.low[n + shift])
                    .sum();
                assert!(dot.abs() < 1e-5, "shift {shift} dot {dot}");
            }
        }
    }

    #[test]
    fn six_levels_with_expected_sizes() {
        let pyramid = forward(&test_image(128, 64));
        assert_eq!(pyramid.levels.len(), LEVELS);
        assert_eq!(pyramid.levels[0].hh.width(), 64);
        assert_eq!(pyramid.levels[0].hh.height(), 32);
        assert_eq!(pyramid.ll.width(), 2);
        assert_eq!(pyramid.ll.height(), 1);
    }

    #[test]
    fn reconstruction_matches_input() {
        let image = test_image(96, 80);
        let pyramid = forward(&image);
        let back = inverse(&pyramid);
        assert_eq!(back.width, image.width);
        assert_eq!(back.height, image.height);
        let mut max_err = 0.0f32;
        for (a, b) in image.data.iter().zip(back.data.iter()) {
            max_err = max_err.max((a - b).abs());
        }
        assert!(max_err < 0.02, "max reconstruction error {max_err}");
    }

    #[test]
    fn zeroing_detail_keeps_mean() {
        let image = test_image(64, 64);
        let mean: f32 = image.data.iter().sum::<f32>() / image.data.len() as f32;
        let mut pyramid = forward(&image);
        pyramid.for_each_subband_mut(false, |band| {
            band.a.data.fill(0.0);
            band.b.data.fill(0.0);
        });
        let back = inverse(&pyramid);
        let back_mean: f32 = back.data.iter().sum::<f32>() / back.data.len() as f32;
        approx::assert_abs_diff_eq!(mean, back_mean, epsilon = 0.05);
    }
}
