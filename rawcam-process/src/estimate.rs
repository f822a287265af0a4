//! Automatic tuning estimates derived from the reference frame.

use crate::plane::Plane;

pub const HISTOGRAM_BINS: usize = 256;

/// Shadow lift from a luminance histogram: the ratio of the
/// photographic key value to the log-average luminance, clipped to
/// [1, 32].
pub fn shadows(histogram: &[f32], key_value: f32) -> f32 {
    let mut avg = 0.0f32;
    let mut total = 0.0f32;
    for (i, count) in histogram.iter().enumerate() {
        avg += count * (1e-5 + i as f32 / 255.0).ln();
        total += count;
    }
    let avg_luminance = (avg / (total + 1e-5)).exp();
    (key_value / avg_luminance).clamp(1.0, 32.0)
}

/// Exposure compensation in EV: the highest bin holding the top
/// `threshold` of mass, mapped through log2.
pub fn exposure_compensation(histogram: &[f32], threshold: f32) -> f32 {
    let mut bin = 0;
    let mut total = 0.0f32;
    for i in (0..histogram.len()).rev() {
        total += histogram[i];
        if total >= threshold {
            bin = i;
            break;
        }
    }
    (histogram.len() as f32 / (bin + 1) as f32).log2()
}

/// Black point from a cumulative normalized histogram: the first bin
/// (capped at 12) carrying more than 3% of mass, backed off by one.
pub fn blacks(cumulative: &[f32]) -> f32 {
    const MAX_DEHAZE: f32 = 0.03;
    const MAX_END_BIN: usize = 12;

    let mut end_bin = 0;
    while end_bin < MAX_END_BIN {
        if cumulative[end_bin] > MAX_DEHAZE {
            break;
        }
        end_bin += 1;
    }
    end_bin.saturating_sub(1) as f32 / (cumulative.len() - 1) as f32
}

/// White point from a cumulative normalized histogram: scanning down
/// from the top, the first bin whose mass drops below `threshold`.
/// Never goes below bin 192.
pub fn white_point(cumulative: &[f32], threshold: f32) -> f32 {
    let mut end_bin = cumulative.len() - 1;
    while end_bin >= 192 {
        if cumulative[end_bin] < threshold {
            break;
        }
        end_bin -= 1;
    }
    end_bin as f32 / (cumulative.len() - 1) as f32
}

/// Noise standard deviation of a raw plane via the 3x3 Laplacian
/// residual operator.
pub fn noise_sigma(plane: &Plane<f32>) -> f32 {
    let w = plane.width;
    let h = plane.height;
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut acc = 0.0f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let response = plane.get(x - 1, y - 1) - 2.0 * plane.get(x, y - 1)
                + plane.get(x + 1, y - 1)
                - 2.0 * plane.get(x - 1, y)
                + 4.0 * plane.get(x, y)
                - 2.0 * plane.get(x + 1, y)
                + plane.get(x - 1, y + 1)
                - 2.0 * plane.get(x, y + 1)
                + plane.get(x + 1, y + 1);
            acc += response.abs() as f64;
        }
    }
    let norm = (std::f64::consts::PI / 2.0).sqrt() / (6.0 * ((w - 2) * (h - 2)) as f64);
    (norm * acc) as f32
}

/// Running-sum normalization of a raw histogram.
pub fn to_cumulative(histogram: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(histogram.len());
    let mut acc = 0.0f32;
    for v in histogram {
        acc += v;
        out.push(acc);
    }
    if acc > 0.0 {
        for v in &mut out {
            *v /= acc;
        }
    }
    out
}
