//! Capture a burst through the session, then develop the saved bundle
//! with the offline processor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rawcam_session::fake::{FakeDriver, SubmissionKind};
use rawcam_session::{CameraSession, CaptureTag, NullListener, SessionConfig};
use rawcam_types::PostProcessSettings;

const W: u32 = 96;
const H: u32 = 64;
const FRAME_BYTES: usize = (W * H * 2) as usize;

fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn saved_bundle_develops_into_srgb_image() {
    let driver = FakeDriver::new();
    let handle = driver.handle();
    let config = SessionConfig {
        max_memory_bytes: 8 * FRAME_BYTES,
        ..Default::default()
    };
    let session = CameraSession::new(Box::new(driver), Arc::new(NullListener), config).unwrap();
    session.pool().add_buffers(8, FRAME_BYTES).unwrap();
    session.open_camera(false);
    wait_for(
        || {
            handle
                .submissions()
                .iter()
                .any(|s| s.kind == SubmissionKind::Repeating)
        },
        "steady state",
    );

    for ts in [100, 200, 300, 400, 500] {
        handle.deliver_frame(CaptureTag::Repeat, ts, W, H);
    }
    wait_for(|| session.pool().ring_len() >= 5, "burst in ring");

    let dir = tempfile::tempdir().unwrap();
    let bundle_path = dir.path().join("capture.zip");
    let mut settings = PostProcessSettings::default();
    settings.shadows = 1.0;
    settings.contrast = 0.5;
    session
        .save(300, 4, false, &settings, &bundle_path)
        .unwrap();

    session.close_camera();
    session.join();

    let output_path = dir.path().join("out.jpg");
    let saved = rawcam_process::process_bundle(
        &bundle_path,
        &output_path,
        None,
        &mut rawcam_process::LogProgress,
    )
    .unwrap();
    assert!(saved.exists());

    let decoded = image::open(&saved).unwrap();
    assert_eq!(decoded.width(), W - 32);
    assert_eq!(decoded.height(), H - 32);
}
