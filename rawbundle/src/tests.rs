use rawcam_types::{
    CameraDescription, FrameMetadata, PixelFormat, PostProcessSettings, RawType, ShadingMap,
};

use super::*;

fn test_metadata(ts: i64) -> FrameMetadata {
    let mut m = FrameMetadata::default();
    m.timestamp_ns = ts;
    m.exposure_time_ns = 10_000_000;
    m.iso = 400;
    m.as_shot_neutral = [0.6, 1.0, 0.7];
    m.lens_shading_map = [
        ShadingMap::identity(4, 3),
        ShadingMap::identity(4, 3),
        ShadingMap::identity(4, 3),
        ShadingMap::identity(4, 3),
    ];
    m
}

fn frame_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
}

#[test]
fn round_trip_preserves_settings_metadata_and_bytes() {
    let camera = CameraDescription::default();
    let mut settings = PostProcessSettings::default();
    settings.shadows = 2.5;
    settings.contrast = 0.5;
    settings.dng = true;

    let mut writer = create_in_memory();
    let mut manifest = Manifest::new(&camera, settings.clone(), 200, false, true);
    for (i, ts) in [100i64, 200, 300].iter().enumerate() {
        let meta = test_metadata(*ts);
        let record = FrameRecord::new(
            format!("frame{i}.raw"),
            &meta,
            PixelFormat::Raw16,
            8,
            4,
            16,
        );
        writer.add_frame(&record, &frame_bytes(64, *ts as u8)).unwrap();
        manifest.frames.push(record);
    }
    let bytes = writer.finish(&manifest).unwrap().into_inner();

    let mut bundle = open_in_memory(bytes).unwrap();
    assert_eq!(bundle.manifest().post_processing_settings, settings);
    assert_eq!(bundle.manifest().reference_timestamp, 200);
    assert!(!bundle.manifest().is_hdr);
    assert!(bundle.manifest().write_dng);
    assert_eq!(bundle.frame_names().len(), 3);

    for (i, ts) in [100i64, 200, 300].iter().enumerate() {
        let name = format!("frame{i}.raw");
        let record = bundle.manifest().frame(&name).unwrap().clone();
        assert_eq!(record.timestamp, *ts);
        let meta = record.metadata(RawType::Zsl).unwrap();
        assert_eq!(meta, test_metadata(*ts));
        let data = bundle.load_frame(&name).unwrap();
        assert_eq!(data, frame_bytes(64, *ts as u8));
    }
}

#[test]
fn reference_frame_selected_by_timestamp() {
    let camera = CameraDescription::default();
    let mut writer = create_in_memory();
    let mut manifest = Manifest::new(&camera, Default::default(), 300, false, false);
    for (i, ts) in [100i64, 300].iter().enumerate() {
        let record = FrameRecord::new(
            format!("frame{i}.raw"),
            &test_metadata(*ts),
            PixelFormat::Raw16,
            4,
            2,
            8,
        );
        writer.add_frame(&record, &frame_bytes(16, 1)).unwrap();
        manifest.frames.push(record);
    }
    let bytes = writer.finish(&manifest).unwrap().into_inner();
    let mut bundle = open_in_memory(bytes).unwrap();
    let (record, _data) = bundle.load_reference().unwrap();
    assert_eq!(record.timestamp, 300);
}

#[test]
fn manifest_uses_wire_key_names() {
    let camera = CameraDescription::default();
    let manifest = Manifest::new(&camera, Default::default(), 7, true, false);
    let v = serde_json::to_value(&manifest).unwrap();
    let obj = v.as_object().unwrap();
    for key in [
        "referenceTimestamp",
        "writeDNG",
        "isHdr",
        "colorIlluminant1",
        "forwardMatrix1",
        "calibrationMatrix2",
        "blackLevel",
        "whiteLevel",
        "sensorArrangment",
        "postProcessingSettings",
        "frames",
    ] {
        assert!(obj.contains_key(key), "missing key {key}");
    }
    // Timestamps go over the wire as strings.
    assert_eq!(obj["referenceTimestamp"], serde_json::json!("7"));
}

#[test]
fn wrong_length_frame_rejected_at_write() {
    let record = FrameRecord::new(
        "frame0.raw".to_string(),
        &test_metadata(1),
        PixelFormat::Raw16,
        8,
        4,
        16,
    );
    let mut writer = create_in_memory();
    match writer.add_frame(&record, &[0u8; 10]) {
        Err(Error::FrameLengthMismatch { expected, got, .. }) => {
            assert_eq!(expected, 64);
            assert_eq!(got, 10);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn missing_metadata_entry_is_fatal() {
    // A ZIP with only a frame entry and no manifest.
    let cursor = std::io::Cursor::new(Vec::new());
    let mut zip = zip::ZipWriter::new(cursor);
    zip.start_file("frame0.raw", Default::default()).unwrap();
    use std::io::Write as _;
    zip.write_all(&[0u8; 4]).unwrap();
    let bytes = zip.finish().unwrap().into_inner();

    match open_in_memory(bytes) {
        Err(Error::MissingMetadata) => {}
        other => panic!("unexpected: {:?}", other.err()),
    }
}

#[test]
fn unknown_frame_lookup_fails() {
    let camera = CameraDescription::default();
    let writer = create_in_memory();
    let manifest = Manifest::new(&camera, Default::default(), 0, false, false);
    let bytes = writer.finish(&manifest).unwrap().into_inner();
    let mut bundle = open_in_memory(bytes).unwrap();
    assert!(matches!(
        bundle.load_frame("nope.raw"),
        Err(Error::FrameNotFound(_))
    ));
}

#[test]
fn file_backed_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.zip");

    let camera = CameraDescription::default();
    let mut writer = create(&path).unwrap();
    let mut manifest = Manifest::new(&camera, Default::default(), 42, false, false);
    let record = FrameRecord::new(
        "frame0.raw".to_string(),
        &test_metadata(42),
        PixelFormat::Raw10,
        16,
        4,
        20,
    );
    let data = frame_bytes(80, 3);
    writer.add_frame(&record, &data).unwrap();
    manifest.frames.push(record);
    writer.finish(&manifest).unwrap();

    let mut bundle = open(&path).unwrap();
    assert_eq!(bundle.load_frame("frame0.raw").unwrap(), data);
}
