//! Bundle loading and base/underexposed frame classification.

use std::io::{Read, Seek};

use tracing::{debug, info};

use rawbundle::{Bundle, FrameRecord};
use rawcam_types::{ev, CameraDescription, PostProcessSettings, RawType};

use crate::kernels::{self, RawChannels};
use crate::{Error, Result};

/// One frame ready for processing.
pub struct LoadedFrame {
    pub record: FrameRecord,
    pub metadata: rawcam_types::FrameMetadata,
    pub channels: RawChannels,
}

/// Everything the processor needs from a bundle, with frames
/// classified into the fusion burst and the underexposed candidates.
pub struct ProcessInput {
    pub camera: CameraDescription,
    pub settings: PostProcessSettings,
    pub write_dng: bool,
    pub is_hdr: bool,
    pub reference: LoadedFrame,
    /// Base burst frames, reference excluded.
    pub base: Vec<LoadedFrame>,
    /// Underexposed frames, brightest first.
    pub underexposed: Vec<LoadedFrame>,
}

fn load_frame<R: Read + Seek>(
    bundle: &mut Bundle<R>,
    record: &FrameRecord,
    camera: &CameraDescription,
) -> Result<LoadedFrame> {
    let data = bundle.load_frame(&record.filename)?;
    let channels = kernels::deinterleave_raw(
        &data,
        record.pixel_format,
        record.width as usize,
        record.height as usize,
        record.row_stride as usize,
        camera.sensor_arrangement,
    )?;
    Ok(LoadedFrame {
        metadata: record.metadata(RawType::Zsl)?,
        record: record.clone(),
        channels,
    })
}

/// Split the bundle's frames into base and underexposed sets and load
/// the pixel data.
///
/// When the EV spread exceeds 0.49 the frames are split at the median
/// EV: the brighter side is the fusion burst, the darker side holds
/// the highlight-recovery candidates. Otherwise every frame is a base
/// frame.
pub fn load<R: Read + Seek>(bundle: &mut Bundle<R>) -> Result<ProcessInput> {
    let manifest = bundle.manifest().clone();
    if manifest.frames.is_empty() {
        return Err(Error::EmptyBundle);
    }
    let camera = manifest.camera_description()?;

    let mut evs: Vec<(String, f64)> = Vec::with_capacity(manifest.frames.len());
    for record in &manifest.frames {
        let metadata = record.metadata(RawType::Zsl)?;
        evs.push((record.filename.clone(), ev(&metadata)));
    }

    let min_ev = evs.iter().map(|(_, e)| *e).fold(f64::MAX, f64::min);
    let max_ev = evs.iter().map(|(_, e)| *e).fold(f64::MIN, f64::max);

    let mut base_names: Vec<String> = Vec::new();
    let mut under_names: Vec<String> = Vec::new();

    if max_ev - min_ev > 0.49 {
        let mut sorted: Vec<f64> = evs.iter().map(|(_, e)| *e).collect();
        sorted.sort_by(f64::total_cmp);
        let median = sorted[sorted.len() / 2];
        for (name, e) in &evs {
            // Higher EV means less light reached the sensor.
            if *e > median {
                under_names.push(name.clone());
            } else {
                base_names.push(name.clone());
            }
        }
        if base_names.is_empty() {
            std::mem::swap(&mut base_names, &mut under_names);
        }
        // Brightest underexposed candidate first.
        under_names.sort_by(|a, b| {
            let ea = evs.iter().find(|(n, _)| n == a).map(|(_, e)| *e).unwrap_or(0.0);
            let eb = evs.iter().find(|(n, _)| n == b).map(|(_, e)| *e).unwrap_or(0.0);
            ea.total_cmp(&eb)
        });
    } else {
        base_names = evs.iter().map(|(n, _)| n.clone()).collect();
    }

    info!(
        "bundle: {} base frame(s), {} underexposed, ev spread {:.2}",
        base_names.len(),
        under_names.len(),
        max_ev - min_ev
    );

    // Reference: the manifest's reference timestamp if it is a base
    // frame, else the first base frame.
    let reference_name = manifest
        .reference_frame()
        .map(|r| r.filename.clone())
        .filter(|name| base_names.contains(name))
        .unwrap_or_else(|| base_names[0].clone());

    let reference_record = manifest.frame(&reference_name)?.clone();
    let reference = load_frame(bundle, &reference_record, &camera)?;

    let mut base = Vec::new();
    for name in &base_names {
        if *name == reference_name {
            continue;
        }
        let record = manifest.frame(name)?.clone();
        let frame = load_frame(bundle, &record, &camera)?;
        if frame.channels.width() != reference.channels.width()
            || frame.channels.height() != reference.channels.height()
        {
            return Err(Error::DimensionMismatch {
                got_w: frame.channels.width(),
                got_h: frame.channels.height(),
                want_w: reference.channels.width(),
                want_h: reference.channels.height(),
            });
        }
        base.push(frame);
    }

    let mut underexposed = Vec::new();
    for name in &under_names {
        let record = manifest.frame(name)?.clone();
        underexposed.push(load_frame(bundle, &record, &camera)?);
    }

    debug!("reference frame {}", reference_name);

    Ok(ProcessInput {
        camera,
        settings: manifest.post_processing_settings.clone(),
        write_dng: manifest.write_dng,
        is_hdr: manifest.is_hdr,
        reference,
        base,
        underexposed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbundle::Manifest;
    use rawcam_types::{FrameMetadata, PixelFormat};

    fn frame_record(name: &str, ts: i64, iso: i32, exposure_ns: i64) -> (FrameRecord, Vec<u8>) {
        let mut metadata = FrameMetadata::default();
        metadata.timestamp_ns = ts;
        metadata.iso = iso;
        metadata.exposure_time_ns = exposure_ns;
        let record = FrameRecord::new(name.to_string(), &metadata, PixelFormat::Raw16, 8, 8, 16);
        let data = vec![0u8; 128];
        (record, data)
    }

    fn build_bundle(frames: Vec<(FrameRecord, Vec<u8>)>, reference_ts: i64) -> Vec<u8> {
        let camera = CameraDescription::default();
        let mut writer = rawbundle::create_in_memory();
        let mut manifest = Manifest::new(&camera, Default::default(), reference_ts, false, false);
        for (record, data) in frames {
            writer.add_frame(&record, &data).unwrap();
            manifest.frames.push(record);
        }
        writer.finish(&manifest).unwrap().into_inner()
    }

    #[test]
    fn uniform_exposures_are_all_base() {
        let frames = (0..4)
            .map(|i| frame_record(&format!("frame{i}.raw"), i, 400, 10_000_000))
            .collect();
        let bytes = build_bundle(frames, 1);
        let mut bundle = rawbundle::open_in_memory(bytes).unwrap();
        let input = load(&mut bundle).unwrap();
        assert_eq!(input.base.len(), 3);
        assert!(input.underexposed.is_empty());
        assert_eq!(input.reference.record.timestamp, 1);
    }

    #[test]
    fn wide_ev_spread_splits_at_median() {
        // Three normal frames plus one two stops darker.
        let mut frames = vec![
            frame_record("frame0.raw", 0, 400, 10_000_000),
            frame_record("frame1.raw", 1, 400, 10_000_000),
            frame_record("frame2.raw", 2, 400, 10_000_000),
        ];
        frames.push(frame_record("frame3.raw", 3, 100, 10_000_000));
        let bytes = build_bundle(frames, 0);
        let mut bundle = rawbundle::open_in_memory(bytes).unwrap();
        let input = load(&mut bundle).unwrap();
        assert_eq!(input.base.len(), 2);
        assert_eq!(input.underexposed.len(), 1);
        assert_eq!(input.underexposed[0].record.filename, "frame3.raw");
    }

    #[test]
    fn empty_bundle_is_fatal() {
        let bytes = build_bundle(vec![], 0);
        let mut bundle = rawbundle::open_in_memory(bytes).unwrap();
        assert!(matches!(load(&mut bundle), Err(Error::EmptyBundle)));
    }
}
