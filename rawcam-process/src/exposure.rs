//! Exposure matching between the reference and an underexposed frame
//! by cumulative-histogram quantile matching.

/// Ratio that maps the underexposed frame onto the reference exposure.
///
/// For each bin `i` of the underexposed cumulative histogram, find the
/// smallest reference bin `j` holding at least as much mass; `j/(i+1)`
/// estimates the intensity ratio. The result is the mean over bins
/// [4, 32), a range dark enough to be unclipped in both frames.
/// Falls back to 1.0 when there are too few matches.
pub fn match_exposures(reference_cumulative: &[f32], under_cumulative: &[f32]) -> f32 {
    let mut matches = Vec::with_capacity(under_cumulative.len());

    for (i, a) in under_cumulative.iter().enumerate() {
        for (j, b) in reference_cumulative.iter().enumerate().skip(1) {
            if *a <= *b {
                matches.push(j as f32 / (i + 1) as f32);
                break;
            }
        }
    }

    let lo = matches.len().min(4);
    let hi = matches.len().min(32);
    if hi <= lo {
        return 1.0;
    }
    let sum: f32 = matches[lo..hi].iter().sum();
    sum / (hi - lo) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cumulative histograms of a uniform reference and the same scene
    /// underexposed by `scale`, so under bin `i` holds the mass the
    /// reference holds up to bin `(i+1)*scale`.
    fn cumulative_pair(scale: usize) -> (Vec<f32>, Vec<f32>) {
        let reference: Vec<f32> = (0..256).map(|j| (j + 1) as f32 / 256.0).collect();
        let under: Vec<f32> = (0..256)
            .map(|i| (((i + 1) * scale + 1) as f32 / 256.0).min(1.0))
            .collect();
        (reference, under)
    }

    #[test]
    fn recovers_known_scales_within_5_percent() {
        // A 256-bin histogram resolves the [4, 32) match window only up
        // to roughly 8x before the top bins clip.
        for scale in [1usize, 2, 4, 8] {
            let (reference, under) = cumulative_pair(scale);
            let got = match_exposures(&reference, &under);
            let err = (got - scale as f32).abs() / scale as f32;
            assert!(err < 0.05, "scale {scale} estimated as {got}");
        }
    }

    #[test]
    fn empty_histograms_fall_back_to_unity() {
        assert_eq!(match_exposures(&[], &[]), 1.0);
    }
}
