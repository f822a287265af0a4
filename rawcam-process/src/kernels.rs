//! Reference implementations of the pixel kernels.
//!
//! Production builds run these stages as generated GPU kernels; the
//! pipeline treats them as pure functions over plane buffers, and the
//! implementations here satisfy the same input/output contracts on the
//! host.

use nalgebra::{Matrix3, Vector3};

use rawcam_types::{
    raw10_sample, raw16_sample, FrameMetadata, PixelFormat, SensorArrangement, ShadingMap,
};

use crate::plane::Plane;
use crate::{Error, Result, EXPANDED_RANGE};

/// The four Bayer channels of one raw frame at half sensor resolution,
/// ordered R, G0, G1, B regardless of the CFA arrangement.
#[derive(Debug, Clone)]
pub struct RawChannels {
    pub planes: [Plane<f32>; 4],
}

impl RawChannels {
    pub fn width(&self) -> usize {
        self.planes[0].width
    }

    pub fn height(&self) -> usize {
        self.planes[0].height
    }
}

/// Split packed sensor bytes into the four Bayer channel planes.
pub fn deinterleave_raw(
    data: &[u8],
    pixel_format: PixelFormat,
    width: usize,
    height: usize,
    row_stride: usize,
    arrangement: SensorArrangement,
) -> Result<RawChannels> {
    let read: fn(&[u8], usize) -> u16 = match pixel_format {
        PixelFormat::Raw10 => raw10_sample,
        PixelFormat::Raw16 => raw16_sample,
        other => return Err(Error::UnsupportedPixelFormat(other)),
    };

    let half_w = width / 2;
    let half_h = height / 2;
    let offsets = arrangement.channel_offsets();
    let mut planes = [
        Plane::new(half_w, half_h),
        Plane::new(half_w, half_h),
        Plane::new(half_w, half_h),
        Plane::new(half_w, half_h),
    ];

    for y in 0..half_h {
        for (channel, (ox, oy)) in offsets.iter().enumerate() {
            let row = &data[(2 * y + oy) * row_stride..];
            let plane = &mut planes[channel];
            for x in 0..half_w {
                let v = read(row, 2 * x + ox);
                plane.set(x, y, v as f32);
            }
        }
    }

    Ok(RawChannels { planes })
}

/// Rebuild the interleaved Bayer mosaic from four (possibly denoised)
/// channel planes, for raw re-export.
pub fn interleave_bayer(channels: &RawChannels, arrangement: SensorArrangement) -> Plane<u16> {
    let half_w = channels.width();
    let half_h = channels.height();
    let mut out = Plane::new(half_w * 2, half_h * 2);
    let offsets = arrangement.channel_offsets();
    for y in 0..half_h {
        for x in 0..half_w {
            for (channel, (ox, oy)) in offsets.iter().enumerate() {
                let v = channels.planes[channel].get(x, y).clamp(0.0, 65535.0) as u16;
                out.set(2 * x + ox, 2 * y + oy, v);
            }
        }
    }
    out
}

/// Scale raw channel values to linear [0, 1], removing the black
/// pedestal and applying the per-channel lens shading gain.
pub fn linear_image(
    channels: &RawChannels,
    black_level: [i32; 4],
    white_level: i32,
    shading: &[ShadingMap; 4],
) -> RawChannels {
    let w = channels.width();
    let h = channels.height();
    let mut planes: Vec<Plane<f32>> = Vec::with_capacity(4);
    for c in 0..4 {
        let black = black_level[c] as f32;
        let range = (white_level as f32 - black).max(1.0);
        let mut out = Plane::new(w, h);
        for y in 0..h {
            let v = y as f32 / (h.max(2) - 1) as f32;
            for x in 0..w {
                let u = x as f32 / (w.max(2) - 1) as f32;
                let gain = shading[c].sample(u, v);
                let value = (channels.planes[c].get(x, y) - black) / range * gain;
                out.set(x, y, value.clamp(0.0, 1.0));
            }
        }
        planes.push(out);
    }
    // Vec has exactly 4 entries.
    RawChannels {
        planes: planes.try_into().unwrap(),
    }
}

/// Linear camera RGB to linear sRGB.
#[inline]
fn camera_rgb_to_srgb(
    rgb: [f32; 3],
    camera_white: [f32; 3],
    camera_to_srgb: &Matrix3<f64>,
) -> [f32; 3] {
    let balanced = Vector3::new(
        (rgb[0] / camera_white[0].max(1e-4)) as f64,
        (rgb[1] / camera_white[1].max(1e-4)) as f64,
        (rgb[2] / camera_white[2].max(1e-4)) as f64,
    );
    let srgb = camera_to_srgb * balanced;
    [
        srgb.x.max(0.0) as f32,
        srgb.y.max(0.0) as f32,
        srgb.z.max(0.0) as f32,
    ]
}

fn srgb_luma(rgb: [f32; 3]) -> f32 {
    0.2126 * rgb[0] + 0.7152 * rgb[1] + 0.0722 * rgb[2]
}

/// Half-resolution RGB from the Bayer channels: one output pixel per
/// 2x2 tile, greens averaged.
fn demosaic_half(linear: &RawChannels, x: usize, y: usize) -> [f32; 3] {
    [
        linear.planes[0].get(x, y),
        0.5 * (linear.planes[1].get(x, y) + linear.planes[2].get(x, y)),
        linear.planes[3].get(x, y),
    ]
}

/// Grayscale preview used by flow and registration, `u8` range but
/// stored as f32.
pub fn grayscale_preview(
    channels: &RawChannels,
    black_level: [i32; 4],
    white_level: i32,
    shading: &[ShadingMap; 4],
    exposure_scale: f32,
) -> Plane<f32> {
    let linear = linear_image(channels, black_level, white_level, shading);
    let mut out = Plane::new(linear.width(), linear.height());
    for y in 0..linear.height() {
        for x in 0..linear.width() {
            let rgb = demosaic_half(&linear, x, y);
            let luma = (srgb_luma(rgb) * exposure_scale).clamp(0.0, 1.0);
            // Gamma keeps shadow alignment errors visible to SAD.
            out.set(x, y, luma.powf(1.0 / 2.2) * 255.0);
        }
    }
    out
}

/// Tuning inputs shared by the preview and post-process kernels.
#[derive(Debug, Clone)]
pub struct ToneParams {
    pub gamma: f32,
    pub shadows: f32,
    pub tonemap_variance: f32,
    pub blacks: f32,
    pub exposure: f32,
    pub white_point: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub blue_saturation: f32,
    pub green_saturation: f32,
    pub sharpen0: f32,
    pub sharpen1: f32,
    pub chroma_eps: f32,
}

impl ToneParams {
    pub fn from_settings(settings: &rawcam_types::PostProcessSettings) -> Self {
        Self {
            gamma: settings.gamma,
            shadows: settings.shadows,
            tonemap_variance: settings.tonemap_variance,
            blacks: settings.blacks,
            exposure: settings.exposure,
            white_point: settings.white_point,
            contrast: settings.contrast,
            saturation: settings.saturation,
            blue_saturation: settings.blue_saturation,
            green_saturation: settings.green_saturation,
            sharpen0: settings.sharpen0,
            sharpen1: settings.sharpen1,
            chroma_eps: settings.chroma_eps,
        }
    }
}

/// Exposure, shadow lift, highlight rolloff, black subtraction and
/// contrast, applied to one linear value. Output is display-referred
/// [0, 1] before gamma.
fn tonemap(v: f32, params: &ToneParams) -> f32 {
    let v = v * params.exposure.exp2() * params.shadows;

    // Extended Reinhard toward the estimated white point; the variance
    // parameter widens the highlight shoulder.
    let wp = (params.white_point.max(0.1) * (1.0 + params.tonemap_variance)).max(0.2);
    let t = v * (1.0 + v / (wp * wp)) / (1.0 + v);

    let t = ((t - params.blacks) / (1.0 - params.blacks).max(1e-3)).clamp(0.0, 1.0);

    // Piecewise-quadratic contrast around the midpoint.
    let c = params.contrast.clamp(0.0, 1.0);
    if t < 0.5 {
        (1.0 - c) * t + c * 2.0 * t * t
    } else {
        let u = 1.0 - t;
        (1.0 - c) * t + c * (1.0 - 2.0 * u * u)
    }
}

fn gamma_encode(v: f32, gamma: f32) -> f32 {
    v.clamp(0.0, 1.0).powf(1.0 / gamma.max(0.1))
}

/// Saturation adjustment around luma with per-hue extra weights.
fn adjust_saturation(rgb: [f32; 3], params: &ToneParams) -> [f32; 3] {
    let luma = srgb_luma(rgb);
    let mut out = [0.0f32; 3];
    let channel_sat = [
        params.saturation,
        params.saturation * params.green_saturation,
        params.saturation * params.blue_saturation,
    ];
    for c in 0..3 {
        out[c] = (luma + channel_sat[c] * (rgb[c] - luma)).clamp(0.0, 1.0);
    }
    out
}

/// Separable Gaussian blur; `radius` taps on each side.
pub fn gaussian_blur(plane: &Plane<f32>, radius: usize) -> Plane<f32> {
    if radius == 0 {
        return plane.clone();
    }
    let sigma = radius as f32 / 2.0;
    let taps: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let d = i as f32 - radius as f32;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let norm: f32 = taps.iter().sum();

    let mut tmp = Plane::new(plane.width, plane.height);
    for y in 0..plane.height {
        for x in 0..plane.width {
            let mut acc = 0.0f32;
            for (i, t) in taps.iter().enumerate() {
                acc += t * plane.get_clamped(x as isize + i as isize - radius as isize, y as isize);
            }
            tmp.set(x, y, acc / norm);
        }
    }
    let mut out = Plane::new(plane.width, plane.height);
    for y in 0..plane.height {
        for x in 0..plane.width {
            let mut acc = 0.0f32;
            for (i, t) in taps.iter().enumerate() {
                acc += t * tmp.get_clamped(x as isize, y as isize + i as isize - radius as isize);
            }
            out.set(x, y, acc / norm);
        }
    }
    out
}

/// Downscaled RGBA preview of one raw frame, sized
/// `ceil(W / 2d) x ceil(H / 2d) x 4` for downscale `d` where W, H are
/// the sensor dimensions.
#[allow(clippy::too_many_arguments)]
pub fn preview(
    channels: &RawChannels,
    metadata: &FrameMetadata,
    black_level: [i32; 4],
    white_level: i32,
    camera_white: [f32; 3],
    camera_to_srgb: &Matrix3<f64>,
    params: &ToneParams,
    downscale: usize,
) -> (usize, usize, Vec<u8>) {
    let linear = linear_image(channels, black_level, white_level, &metadata.lens_shading_map);
    let d = downscale.max(1);
    let out_w = (channels.width() + d - 1) / d;
    let out_h = (channels.height() + d - 1) / d;

    let mut out = vec![0u8; out_w * out_h * 4];
    for oy in 0..out_h {
        for ox in 0..out_w {
            let x = (ox * d).min(channels.width() - 1);
            let y = (oy * d).min(channels.height() - 1);
            let rgb = demosaic_half(&linear, x, y);
            let srgb = camera_rgb_to_srgb(rgb, camera_white, camera_to_srgb);
            let toned = adjust_saturation(
                [
                    gamma_encode(tonemap(srgb[0], params), params.gamma),
                    gamma_encode(tonemap(srgb[1], params), params.gamma),
                    gamma_encode(tonemap(srgb[2], params), params.gamma),
                ],
                params,
            );
            let idx = (oy * out_w + ox) * 4;
            out[idx] = (toned[0] * 255.0) as u8;
            out[idx + 1] = (toned[1] * 255.0) as u8;
            out[idx + 2] = (toned[2] * 255.0) as u8;
            out[idx + 3] = 255;
        }
    }
    (out_w, out_h, out)
}

/// 256-bin luminance histogram of the linearized, color-corrected
/// frame, sampled on a downscaled grid.
#[allow(clippy::too_many_arguments)]
pub fn measure_image(
    channels: &RawChannels,
    metadata: &FrameMetadata,
    black_level: [i32; 4],
    white_level: i32,
    camera_white: [f32; 3],
    camera_to_srgb: &Matrix3<f64>,
    downscale: usize,
) -> Vec<f32> {
    let linear = linear_image(channels, black_level, white_level, &metadata.lens_shading_map);
    let d = downscale.max(1);
    let mut histogram = vec![0.0f32; crate::estimate::HISTOGRAM_BINS];
    let mut samples = 0usize;
    let mut y = 0;
    while y < channels.height() {
        let mut x = 0;
        while x < channels.width() {
            let rgb = demosaic_half(&linear, x, y);
            let srgb = camera_rgb_to_srgb(rgb, camera_white, camera_to_srgb);
            let luma = srgb_luma(srgb).clamp(0.0, 1.0);
            let bin = ((luma * 255.0) as usize).min(255);
            histogram[bin] += 1.0;
            samples += 1;
            x += d;
        }
        y += d;
    }
    if samples > 0 {
        for v in &mut histogram {
            *v /= samples as f32;
        }
    }
    histogram
}

/// Mean gradient magnitude, a cheap sharpness measure.
pub fn generate_edges(plane: &Plane<f32>) -> f32 {
    if plane.width < 2 || plane.height < 2 {
        return 0.0;
    }
    let mut acc = 0.0f64;
    for y in 0..plane.height - 1 {
        for x in 0..plane.width - 1 {
            let v = plane.get(x, y);
            let gx = plane.get(x + 1, y) - v;
            let gy = plane.get(x, y + 1) - v;
            acc += ((gx * gx + gy * gy).sqrt()) as f64;
        }
    }
    (acc / ((plane.width - 1) * (plane.height - 1)) as f64) as f32
}

/// Ghost detection between the reference preview and the aligned
/// underexposed preview, both on the `u8` scale. Returns the blurred
/// usability mask (1 where the frames agree) and the ghost fraction.
pub fn hdr_mask(
    reference: &Plane<f32>,
    aligned: &Plane<f32>,
    threshold: f32,
) -> (Plane<f32>, f32) {
    let w = reference.width;
    let h = reference.height;
    let mut ghost = Plane::new(w, h);
    let mut ghosted = 0usize;
    for y in 0..h {
        for x in 0..w {
            let is_ghost = (reference.get(x, y) - aligned.get(x, y)).abs() > threshold;
            if is_ghost {
                ghosted += 1;
            }
            ghost.set(x, y, if is_ghost { 1.0 } else { 0.0 });
        }
    }
    let error = ghosted as f32 / (w * h).max(1) as f32;

    let mut mask = ghost.map(|g| 1.0 - g);
    mask = gaussian_blur(&mask, 5);
    (mask, error)
}

/// Optional underexposed input to the post-process kernel.
pub struct HdrInput {
    /// Aligned underexposed channels on the expanded range.
    pub channels: RawChannels,
    /// Usability mask at channel resolution, [0, 1].
    pub mask: Plane<f32>,
    /// Ratio matching the underexposed frame to the reference.
    pub exposure_scale: f32,
}

/// Develop fused channels into the final interleaved 8-bit sRGB image.
///
/// The channels are at half sensor resolution on the expanded range; 8
/// pixels are cropped from every channel edge (hiding registration
/// artifacts) and the output is demosaiced back to sensor resolution,
/// so the result is `(W - 32) x (H - 32)` for a `W x H` sensor.
#[allow(clippy::too_many_arguments)]
pub fn postprocess(
    channels: &RawChannels,
    hdr: Option<&HdrInput>,
    camera_white: [f32; 3],
    camera_to_srgb: &Matrix3<f64>,
    params: &ToneParams,
    flipped: bool,
) -> Result<image::RgbImage> {
    const CROP: usize = 8;

    let half_w = channels.width();
    let half_h = channels.height();
    if half_w <= 2 * CROP || half_h <= 2 * CROP {
        return Err(Error::DimensionMismatch {
            got_w: half_w,
            got_h: half_h,
            want_w: 2 * CROP + 1,
            want_h: 2 * CROP + 1,
        });
    }
    let out_half_w = half_w - 2 * CROP;
    let out_half_h = half_h - 2 * CROP;
    let out_w = out_half_w * 2;
    let out_h = out_half_h * 2;

    // Shading was applied during fusion input normalization upstream;
    // here the channels are already on the expanded range.
    let scale = 1.0 / EXPANDED_RANGE;

    // Tone and color at half resolution.
    let mut rgb_planes = [
        Plane::<f32>::new(out_half_w, out_half_h),
        Plane::<f32>::new(out_half_w, out_half_h),
        Plane::<f32>::new(out_half_w, out_half_h),
    ];
    for y in 0..out_half_h {
        for x in 0..out_half_w {
            let sx = x + CROP;
            let sy = y + CROP;
            let mut rgb = [
                channels.planes[0].get(sx, sy) * scale,
                0.5 * (channels.planes[1].get(sx, sy) + channels.planes[2].get(sx, sy)) * scale,
                channels.planes[3].get(sx, sy) * scale,
            ];

            if let Some(hdr) = hdr {
                let m = hdr.mask.get_clamped(sx as isize, sy as isize).clamp(0.0, 1.0);
                let hdr_rgb = [
                    hdr.channels.planes[0].get(sx, sy) * scale * hdr.exposure_scale,
                    0.5 * (hdr.channels.planes[1].get(sx, sy)
                        + hdr.channels.planes[2].get(sx, sy))
                        * scale
                        * hdr.exposure_scale,
                    hdr.channels.planes[3].get(sx, sy) * scale * hdr.exposure_scale,
                ];
                // Take highlight detail from the underexposed frame
                // where it is trustworthy.
                let base_luma = srgb_luma(rgb);
                let highlight = ((base_luma - 0.7) / 0.25).clamp(0.0, 1.0);
                let w = m * highlight;
                for c in 0..3 {
                    rgb[c] = (1.0 - w) * rgb[c] + w * hdr_rgb[c];
                }
            }

            let srgb = camera_rgb_to_srgb(rgb, camera_white, camera_to_srgb);
            let toned = adjust_saturation(
                [
                    gamma_encode(tonemap(srgb[0], params), params.gamma),
                    gamma_encode(tonemap(srgb[1], params), params.gamma),
                    gamma_encode(tonemap(srgb[2], params), params.gamma),
                ],
                params,
            );
            for c in 0..3 {
                rgb_planes[c].set(x, y, toned[c]);
            }
        }
    }

    // Unsharp masking on luma at two radii.
    if params.sharpen0 > 0.0 || params.sharpen1 > 0.0 {
        let mut luma = Plane::new(out_half_w, out_half_h);
        for y in 0..out_half_h {
            for x in 0..out_half_w {
                luma.set(
                    x,
                    y,
                    srgb_luma([
                        rgb_planes[0].get(x, y),
                        rgb_planes[1].get(x, y),
                        rgb_planes[2].get(x, y),
                    ]),
                );
            }
        }
        let fine = gaussian_blur(&luma, 1);
        let coarse = gaussian_blur(&luma, 3);
        for y in 0..out_half_h {
            for x in 0..out_half_w {
                let l = luma.get(x, y);
                let boost = 0.25 * params.sharpen0 * (l - fine.get(x, y))
                    + 0.25 * params.sharpen1 * (l - coarse.get(x, y));
                if boost != 0.0 {
                    for plane in rgb_planes.iter_mut() {
                        let v = (plane.get(x, y) + boost).clamp(0.0, 1.0);
                        plane.set(x, y, v);
                    }
                }
            }
        }
    }

    // Chroma smoothing.
    if params.chroma_eps > 0.0 {
        let radius = (params.chroma_eps.clamp(0.0, 8.0)) as usize;
        if radius > 0 {
            let luma: Plane<f32> = {
                let mut l = Plane::new(out_half_w, out_half_h);
                for y in 0..out_half_h {
                    for x in 0..out_half_w {
                        l.set(
                            x,
                            y,
                            srgb_luma([
                                rgb_planes[0].get(x, y),
                                rgb_planes[1].get(x, y),
                                rgb_planes[2].get(x, y),
                            ]),
                        );
                    }
                }
                l
            };
            for plane in rgb_planes.iter_mut() {
                let mut chroma = Plane::new(out_half_w, out_half_h);
                for idx in 0..chroma.data.len() {
                    chroma.data[idx] = plane.data[idx] - luma.data[idx];
                }
                let blurred = gaussian_blur(&chroma, radius);
                for idx in 0..blurred.data.len() {
                    plane.data[idx] = (luma.data[idx] + blurred.data[idx]).clamp(0.0, 1.0);
                }
            }
        }
    }

    // Upscale to sensor resolution and interleave.
    let mut out = image::RgbImage::new(out_w as u32, out_h as u32);
    for y in 0..out_h {
        for x in 0..out_w {
            let sx = x as f32 * 0.5;
            let sy = y as f32 * 0.5;
            let px = [
                (rgb_planes[0].sample(sx, sy) * 255.0).clamp(0.0, 255.0) as u8,
                (rgb_planes[1].sample(sx, sy) * 255.0).clamp(0.0, 255.0) as u8,
                (rgb_planes[2].sample(sx, sy) * 255.0).clamp(0.0, 255.0) as u8,
            ];
            let ox = if flipped { out_w - 1 - x } else { x };
            out.put_pixel(ox as u32, y as u32, image::Rgb(px));
        }
    }
    Ok(out)
}
