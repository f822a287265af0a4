//! The offline processing pipeline: load, estimate, fuse, denoise,
//! merge, develop, save.

use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use rawcam_types::{ev, PostProcessSettings};

use crate::color::{CameraProfile, CameraTransform, Temperature};
use crate::container::{LoadedFrame, ProcessInput};
use crate::denoise::{self, Thresholding};
use crate::estimate;
use crate::exposure;
use crate::flow;
use crate::fuse::{self, FusionAccumulator};
use crate::hdr;
use crate::kernels::{self, HdrInput, RawChannels, ToneParams};
use crate::plane::Plane;
use crate::wavelet;
use crate::{Result, EXPANDED_RANGE, MAX_HDR_ERROR};

/// Observer of processing progress.
///
/// Progress is integer percent: 0-75 fusion (linear in the number of
/// frames), 75 after denoise, 95 after post-process, 100 once saved.
pub trait ProgressReporter: Send {
    fn on_progress(&mut self, percent: u8) {
        let _ = percent;
    }
    fn on_error(&mut self, message: &str) {
        let _ = message;
    }
    fn on_complete(&mut self, output: &Path) {
        let _ = output;
    }
}

/// Reporter that only logs.
#[derive(Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn on_progress(&mut self, percent: u8) {
        debug!("progress {percent}%");
    }
    fn on_error(&mut self, message: &str) {
        warn!("processing failed: {message}");
    }
    fn on_complete(&mut self, output: &Path) {
        info!("saved {}", output.display());
    }
}

/// Result of one processed bundle.
pub struct ProcessOutput {
    pub image: image::RgbImage,
    pub settings: PostProcessSettings,
    /// Set when the underexposed merge was accepted.
    pub hdr_applied: bool,
    /// Raw Bayer mosaic rebuilt from the denoised channels, present
    /// when the settings request raw output.
    pub raw_mosaic: Option<Plane<u16>>,
}

pub struct Processor {
    pub jpeg_quality: u8,
}

impl Default for Processor {
    fn default() -> Self {
        Self { jpeg_quality: 95 }
    }
}

/// Convenience entry: open `bundle_path`, process, write JPEG (and the
/// raw mosaic sidecar when requested) next to `output_path`.
pub fn process_bundle(
    bundle_path: &Path,
    output_path: &Path,
    settings_override: Option<PostProcessSettings>,
    progress: &mut dyn ProgressReporter,
) -> Result<PathBuf> {
    let result = (|| -> Result<PathBuf> {
        let mut bundle = rawbundle::open(bundle_path)?;
        let mut input = crate::container::load(&mut bundle)?;
        if let Some(settings) = settings_override {
            input.settings = settings;
        }
        let processor = Processor {
            jpeg_quality: input.settings.jpeg_quality.clamp(1, 100) as u8,
        };
        let output = processor.run(input, progress)?;

        let file = std::fs::File::create(output_path)?;
        let mut writer = std::io::BufWriter::new(file);
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, processor.jpeg_quality);
        encoder.encode_image(&output.image)?;
        writer.flush()?;

        if let Some(mosaic) = &output.raw_mosaic {
            let raw_path = output_path.with_extension("raw16");
            write_raw_mosaic(mosaic, &raw_path)?;
            info!("wrote raw mosaic {}", raw_path.display());
        }
        Ok(output_path.to_path_buf())
    })();

    match result {
        Ok(path) => {
            progress.on_progress(100);
            progress.on_complete(&path);
            Ok(path)
        }
        Err(e) => {
            progress.on_error(&e.to_string());
            Err(e)
        }
    }
}

/// Little-endian 16-bit dump of the mosaic with a small text header,
/// the hand-off format for the external raw (DNG) serializer.
fn write_raw_mosaic(mosaic: &Plane<u16>, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    writeln!(writer, "RAW16 {} {}", mosaic.width, mosaic.height)?;
    for v in &mosaic.data {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

impl Processor {
    /// Run the full fusion and development pipeline on loaded input.
    pub fn run(
        &self,
        mut input: ProcessInput,
        progress: &mut dyn ProgressReporter,
    ) -> Result<ProcessOutput> {
        let profile = CameraProfile::new(&input.camera);

        // White balance: explicit temperature override, else as-shot.
        let temperature = if input.settings.temperature > 0.0 || input.settings.tint > 0.0 {
            Temperature::new(
                input.settings.temperature as f64,
                input.settings.tint as f64,
            )
        } else {
            profile.temperature_from_neutral(input.reference.metadata.as_shot_neutral)?
        };
        let transform = profile.camera_to_pcs(&temperature);

        if input.settings.shadows <= 0.0 {
            self.estimate_settings(&mut input, &transform)?;
        }

        progress.on_progress(0);
        let (fused, n_frames) = self.fuse_burst(&input, progress)?;

        // Spatial denoise on the expanded-range channels.
        let denoised = self.denoise_channels(fused, input.settings.spatial_denoise_aggressiveness);
        progress.on_progress(75);
        debug!("denoise complete ({n_frames} fused frames)");

        // Optional highlight recovery from an underexposed frame.
        let mut settings = input.settings.clone();
        let hdr_input = self.prepare_hdr(&input, &transform, &mut settings);
        let hdr_applied = hdr_input.is_some();

        let params = ToneParams::from_settings(&settings);
        let image = kernels::postprocess(
            &denoised,
            hdr_input.as_ref(),
            transform.camera_white,
            &(transform.pcs_to_srgb * transform.camera_to_pcs),
            &params,
            settings.flipped,
        )?;
        progress.on_progress(95);

        let raw_mosaic = settings
            .dng
            .then(|| kernels::interleave_bayer(&denoised, input.camera.sensor_arrangement));

        Ok(ProcessOutput {
            image,
            settings,
            hdr_applied,
            raw_mosaic,
        })
    }

    /// Fill in the automatic estimates the capture path left at their
    /// sentinel values.
    fn estimate_settings(&self, input: &mut ProcessInput, transform: &CameraTransform) -> Result<()> {
        const SHADOWS_KEY_VALUE: f32 = 0.22;

        let camera_to_srgb = transform.pcs_to_srgb * transform.camera_to_pcs;
        let histogram = kernels::measure_image(
            &input.reference.channels,
            &input.reference.metadata,
            input.camera.black_level,
            input.camera.white_level,
            transform.camera_white,
            &camera_to_srgb,
            4,
        );

        input.settings.shadows = estimate::shadows(&histogram, SHADOWS_KEY_VALUE);
        input.settings.exposure = estimate::exposure_compensation(&histogram, 1e-2);

        let cumulative = estimate::to_cumulative(&histogram);
        input.settings.blacks = estimate::blacks(&cumulative);
        input.settings.white_point = estimate::white_point(&cumulative, 0.995);

        input.settings.noise_sigma = estimate::noise_sigma(&input.reference.channels.planes[0]);

        info!(
            "estimated settings: shadows {:.2}, exposure {:.2}, blacks {:.3}, white point {:.3}, noise sigma {:.1}",
            input.settings.shadows,
            input.settings.exposure,
            input.settings.blacks,
            input.settings.white_point,
            input.settings.noise_sigma,
        );
        Ok(())
    }

    /// Register and fuse the base burst. Returns the fused channels on
    /// the expanded range and the number of frames that contributed.
    fn fuse_burst(
        &self,
        input: &ProcessInput,
        progress: &mut dyn ProgressReporter,
    ) -> Result<(RawChannels, usize)> {
        let camera = &input.camera;
        let reference = &input.reference;

        let reference_preview = kernels::grayscale_preview(
            &reference.channels,
            camera.black_level,
            camera.white_level,
            &reference.metadata.lens_shading_map,
            1.0,
        );

        let difference_weight = fuse::difference_weight(ev(&reference.metadata));
        let noise_floor = input.settings.noise_sigma.max(0.0);

        let total = input.base.len().max(1);
        let mut fused_planes: Vec<Plane<f32>> = Vec::with_capacity(4);

        // Per-channel pyramids; candidates are registered once and
        // reused across channels.
        let mut registered: Vec<(RawChannels, flow::FlowField)> = Vec::new();
        for (index, frame) in input.base.iter().enumerate() {
            let candidate_preview = kernels::grayscale_preview(
                &frame.channels,
                camera.black_level,
                camera.white_level,
                &frame.metadata.lens_shading_map,
                1.0,
            );
            let field = flow::compute(&reference_preview, &candidate_preview);
            let warped = RawChannels {
                planes: [
                    flow::warp(&frame.channels.planes[0], &field),
                    flow::warp(&frame.channels.planes[1], &field),
                    flow::warp(&frame.channels.planes[2], &field),
                    flow::warp(&frame.channels.planes[3], &field),
                ],
            };
            registered.push((warped, field));
            progress.on_progress((25 * (index + 1) / total) as u8);
        }

        let white = camera.white_level as f32;
        for channel in 0..4 {
            let ref_plane = &reference.channels.planes[channel];
            let ref_pyramid = wavelet::forward(ref_plane);
            let mut accumulator = FusionAccumulator::new(&ref_pyramid);

            for (warped, field) in &registered {
                let plane = &warped.planes[channel];
                let mut diff = Plane::new(ref_plane.width, ref_plane.height);
                for idx in 0..diff.data.len() {
                    diff.data[idx] = (ref_plane.data[idx] - plane.data[idx]).abs() / white;
                }
                let candidate_pyramid = wavelet::forward(plane);
                accumulator.fuse(
                    &ref_pyramid,
                    &candidate_pyramid,
                    field,
                    &diff,
                    difference_weight,
                    noise_floor,
                );
            }

            let averaged = accumulator.average(&ref_pyramid);
            let fused = wavelet::inverse(&averaged);
            fused_planes.push(fused);

            progress.on_progress((25 + 50 * (channel + 1) / 4) as u8);
        }

        // Normalize to the expanded range.
        let mut planes: Vec<Plane<f32>> = Vec::with_capacity(4);
        for (channel, plane) in fused_planes.into_iter().enumerate() {
            let black = camera.black_level[channel] as f32;
            let scale = EXPANDED_RANGE / (camera.white_level as f32 - black).max(1.0);
            planes.push(plane.map(|v| ((v - black) * scale).clamp(0.0, EXPANDED_RANGE)));
        }

        Ok((
            RawChannels {
                planes: planes.try_into().unwrap(),
            },
            input.base.len() + 1,
        ))
    }

    fn denoise_channels(&self, channels: RawChannels, aggressiveness: f32) -> RawChannels {
        if aggressiveness <= 0.0 {
            return channels;
        }
        let mut planes: Vec<Plane<f32>> = Vec::with_capacity(4);
        for plane in channels.planes.into_iter() {
            let mut pyramid = wavelet::forward(&plane);
            let sigma = denoise::estimate_sigma(&pyramid);
            denoise::shrink(&mut pyramid, aggressiveness * sigma, Thresholding::Hard);
            planes.push(wavelet::inverse(&pyramid).map(|v| v.clamp(0.0, EXPANDED_RANGE)));
        }
        RawChannels {
            planes: planes.try_into().unwrap(),
        }
    }

    /// Try each underexposed candidate in order; the first whose ghost
    /// error is acceptable wins.
    fn prepare_hdr(
        &self,
        input: &ProcessInput,
        transform: &CameraTransform,
        settings: &mut PostProcessSettings,
    ) -> Option<HdrInput> {
        if input.underexposed.is_empty() {
            return None;
        }
        let camera = &input.camera;
        let camera_to_srgb = transform.pcs_to_srgb * transform.camera_to_pcs;

        let reference = &input.reference;
        let reference_preview = kernels::grayscale_preview(
            &reference.channels,
            camera.black_level,
            camera.white_level,
            &reference.metadata.lens_shading_map,
            1.0,
        );
        let reference_histogram = estimate::to_cumulative(&kernels::measure_image(
            &reference.channels,
            &reference.metadata,
            camera.black_level,
            camera.white_level,
            transform.camera_white,
            &camera_to_srgb,
            4,
        ));

        for candidate in &input.underexposed {
            match self.try_hdr_candidate(
                input,
                candidate,
                transform,
                &reference_preview,
                &reference_histogram,
            ) {
                Some((hdr_input, error)) => {
                    info!("hdr candidate accepted, error {:.4}", error);
                    settings.shadows = (0.75 * settings.shadows).max(4.0);

                    // Re-estimate the white point from the underexposed
                    // frame, which holds the real highlights.
                    let under_histogram = estimate::to_cumulative(&kernels::measure_image(
                        &hdr_input.channels,
                        &candidate.metadata,
                        camera.black_level,
                        camera.white_level,
                        transform.camera_white,
                        &camera_to_srgb,
                        4,
                    ));
                    settings.white_point = estimate::white_point(&under_histogram, 0.995);
                    return Some(hdr_input);
                }
                None => continue,
            }
        }
        debug!("no underexposed candidate usable, proceeding without hdr");
        None
    }

    fn try_hdr_candidate(
        &self,
        input: &ProcessInput,
        candidate: &LoadedFrame,
        transform: &CameraTransform,
        reference_preview: &Plane<f32>,
        reference_histogram: &[f32],
    ) -> Option<(HdrInput, f32)> {
        let camera = &input.camera;
        let camera_to_srgb = transform.pcs_to_srgb * transform.camera_to_pcs;

        let under_histogram = estimate::to_cumulative(&kernels::measure_image(
            &candidate.channels,
            &candidate.metadata,
            camera.black_level,
            camera.white_level,
            transform.camera_white,
            &camera_to_srgb,
            4,
        ));
        let exposure_scale = exposure::match_exposures(reference_histogram, &under_histogram);

        let under_preview = kernels::grayscale_preview(
            &candidate.channels,
            camera.black_level,
            camera.white_level,
            &candidate.metadata.lens_shading_map,
            exposure_scale,
        );

        let homography = hdr::register(reference_preview, &under_preview)?;
        let aligned_preview = hdr::warp_perspective(&under_preview, &homography);

        let (mask, error) = kernels::hdr_mask(reference_preview, &aligned_preview, 4.0);
        if error >= MAX_HDR_ERROR {
            debug!("hdr candidate rejected, error {:.4}", error);
            return None;
        }

        let aligned_channels = hdr::warp_channels(&candidate.channels, &homography);

        // Bring the aligned channels onto the same expanded range as
        // the fused base image.
        let mut planes: Vec<Plane<f32>> = Vec::with_capacity(4);
        for (channel, plane) in aligned_channels.planes.into_iter().enumerate() {
            let black = camera.black_level[channel] as f32;
            let scale = EXPANDED_RANGE / (camera.white_level as f32 - black).max(1.0);
            planes.push(plane.map(|v| ((v - black) * scale).clamp(0.0, EXPANDED_RANGE)));
        }

        Some((
            HdrInput {
                channels: RawChannels {
                    planes: planes.try_into().unwrap(),
                },
                mask,
                exposure_scale,
            },
            error,
        ))
    }
}

/// Process a bundle held in memory, returning the developed image
/// without touching the filesystem.
pub fn process_in_memory<R: Read + Seek>(
    bundle: &mut rawbundle::Bundle<R>,
    settings_override: Option<PostProcessSettings>,
    progress: &mut dyn ProgressReporter,
) -> Result<ProcessOutput> {
    let mut input = crate::container::load(bundle)?;
    if let Some(settings) = settings_override {
        input.settings = settings;
    }
    let processor = Processor::default();
    let output = processor.run(input, progress)?;
    progress.on_progress(100);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbundle::{FrameRecord, Manifest};
    use rawcam_types::{CameraDescription, FrameMetadata, PixelFormat};

    struct CountingProgress {
        updates: Vec<u8>,
    }

    impl ProgressReporter for CountingProgress {
        fn on_progress(&mut self, percent: u8) {
            self.updates.push(percent);
        }
    }

    fn synthetic_frame(ts: i64, width: u32, height: u32, seed: u16) -> (FrameRecord, Vec<u8>) {
        let mut metadata = FrameMetadata::default();
        metadata.timestamp_ns = ts;
        metadata.iso = 400;
        metadata.exposure_time_ns = 10_000_000;

        let mut data = Vec::with_capacity((width * height * 2) as usize);
        for y in 0..height {
            for x in 0..width {
                let signal = 200.0
                    + 300.0 * ((x as f32 * 0.05).sin() * (y as f32 * 0.04).cos()).abs()
                    + ((x * 7 + y * 13 + seed as u32 * 31) % 23) as f32;
                data.extend_from_slice(&(signal as u16).to_le_bytes());
            }
        }
        let record = FrameRecord::new(
            format!("frame{ts}.raw"),
            &metadata,
            PixelFormat::Raw16,
            width,
            height,
            width * 2,
        );
        (record, data)
    }

    fn synthetic_bundle(n: usize, width: u32, height: u32) -> Vec<u8> {
        let camera = CameraDescription::default();
        let mut writer = rawbundle::create_in_memory();
        let mut manifest = Manifest::new(
            &camera,
            PostProcessSettings::default(),
            (n as i64) / 2,
            false,
            false,
        );
        for i in 0..n {
            let (record, data) = synthetic_frame(i as i64, width, height, i as u16);
            writer.add_frame(&record, &data).unwrap();
            manifest.frames.push(record);
        }
        writer.finish(&manifest).unwrap().into_inner()
    }

    #[test]
    fn five_frame_burst_produces_cropped_srgb() {
        let width = 128u32;
        let height = 96u32;
        let bytes = synthetic_bundle(5, width, height);
        let mut bundle = rawbundle::open_in_memory(bytes).unwrap();
        let mut progress = CountingProgress { updates: vec![] };
        let output = process_in_memory(&mut bundle, None, &mut progress).unwrap();

        assert_eq!(output.image.width(), width - 32);
        assert_eq!(output.image.height(), height - 32);
        assert!(!output.hdr_applied);

        // Progress is monotone and finishes at 100.
        assert!(progress.updates.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*progress.updates.last().unwrap(), 100);
        assert!(progress.updates.iter().any(|p| *p == 75));
    }

    #[test]
    fn single_frame_bundle_still_develops() {
        let bytes = synthetic_bundle(1, 96, 64);
        let mut bundle = rawbundle::open_in_memory(bytes).unwrap();
        let mut progress = CountingProgress { updates: vec![] };
        let output = process_in_memory(&mut bundle, None, &mut progress).unwrap();
        assert_eq!(output.image.width(), 64);
        assert_eq!(output.image.height(), 32);
    }

    #[test]
    fn dng_request_rebuilds_mosaic() {
        let bytes = synthetic_bundle(2, 96, 64);
        let mut bundle = rawbundle::open_in_memory(bytes).unwrap();
        let mut settings = PostProcessSettings::default();
        settings.dng = true;
        let mut progress = CountingProgress { updates: vec![] };
        let output = process_in_memory(&mut bundle, Some(settings), &mut progress).unwrap();
        let mosaic = output.raw_mosaic.expect("mosaic requested");
        assert_eq!(mosaic.width, 96);
        assert_eq!(mosaic.height, 64);
    }
}
