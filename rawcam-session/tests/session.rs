//! End-to-end session tests against the in-process fake driver.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rawcam_session::fake::{FakeDriver, SubmissionKind};
use rawcam_session::{
    AfMode, CameraSession, CaptureTag, HdrRequest, SessionConfig, SessionListener, SessionState,
};
use rawcam_types::PostProcessSettings;

const W: u32 = 64;
const H: u32 = 48;
const FRAME_BYTES: usize = (W * H * 2) as usize;

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<SessionState>>,
    previews: Mutex<Vec<(usize, usize)>>,
    hdr_saved: Mutex<Vec<PathBuf>>,
    hdr_failed: AtomicUsize,
    errors: AtomicUsize,
}

impl SessionListener for Recorder {
    fn on_session_state(&self, state: SessionState) {
        self.states.lock().unwrap().push(state);
    }
    fn on_camera_error(&self, _code: i32) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
    fn on_preview_frame(&self, width: usize, height: usize, _data: &[u8]) {
        self.previews.lock().unwrap().push((width, height));
    }
    fn on_hdr_saved(&self, path: &Path) {
        self.hdr_saved.lock().unwrap().push(path.to_path_buf());
    }
    fn on_hdr_failed(&self) {
        self.hdr_failed.fetch_add(1, Ordering::SeqCst);
    }
}

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

fn config(buffers: usize) -> SessionConfig {
    SessionConfig {
        max_memory_bytes: buffers * FRAME_BYTES,
        raw_preview_downscale: 2,
        hdr_timeout: Duration::from_millis(200),
    }
}

struct Fixture {
    session: CameraSession,
    handle: rawcam_session::fake::FakeHandle,
    listener: Arc<Recorder>,
}

fn open_session(buffers: usize, raw_preview: bool) -> Fixture {
    let driver = FakeDriver::new();
    let handle = driver.handle();
    let listener = Arc::new(Recorder::default());
    let session = CameraSession::new(Box::new(driver), listener.clone(), config(buffers)).unwrap();
    // Provision the pool up front so tests control the buffer count
    // exactly; the setup worker finds the budget already spent.
    session.pool().add_buffers(buffers, FRAME_BYTES).unwrap();
    session.open_camera(raw_preview);
    wait_for(|| handle.is_open(), "camera to open");
    // Steady state: the continuous repeating request is installed.
    wait_for(
        || {
            handle
                .submissions()
                .iter()
                .any(|s| s.kind == SubmissionKind::Repeating)
        },
        "repeating request",
    );
    Fixture {
        session,
        handle,
        listener,
    }
}

fn deliver_burst(fixture: &Fixture, timestamps: &[i64]) {
    for ts in timestamps {
        fixture.handle.deliver_frame(CaptureTag::Repeat, *ts, W, H);
    }
    let expected = timestamps.len();
    wait_for(
        || fixture.session.pool().ring_len() >= expected,
        "frames to reach the ring",
    );
}

#[test]
fn frames_become_visible_in_ring_after_matching() {
    let fixture = open_session(8, false);
    deliver_burst(&fixture, &[1000, 2000, 3000]);
    assert_eq!(fixture.session.pool().ring_timestamps(), vec![1000, 2000, 3000]);
    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn save_selects_reference_and_neighbors() {
    let fixture = open_session(8, false);
    deliver_burst(&fixture, &[100, 200, 300, 400, 500]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.zip");
    let settings = PostProcessSettings::default();
    fixture.session.save(300, 2, false, &settings, &path).unwrap();

    let mut bundle = rawbundle::open(&path).unwrap();
    let manifest = bundle.manifest().clone();
    assert_eq!(manifest.reference_timestamp, 300);
    assert!(!manifest.is_hdr);
    assert_eq!(manifest.frames.len(), 3);
    let mut timestamps: Vec<i64> = manifest.frames.iter().map(|f| f.timestamp).collect();
    timestamps.sort();
    assert_eq!(timestamps, vec![200, 300, 400]);

    // Pixel bytes round-trip exactly.
    let record = manifest
        .frames
        .iter()
        .find(|f| f.timestamp == 300)
        .unwrap()
        .clone();
    let data = bundle.load_frame(&record.filename).unwrap();
    assert_eq!(
        data,
        rawcam_session::fake::FakeHandle::frame_bytes(W, H, 300u16)
    );

    // Saved frames were consumed: the ring is empty but buffers are
    // reusable.
    assert_eq!(fixture.session.pool().ring_len(), 0);
    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn pool_exhaustion_drops_frames_without_losing_consistency() {
    let fixture = open_session(4, false);
    deliver_burst(&fixture, &[1, 2, 3, 4]);

    // Snapshot everything; allocation is now impossible.
    let handle = fixture.session.pool().lock_all();
    assert_eq!(handle.len(), 4);

    // A new frame arrives and must be dropped quietly.
    fixture.handle.deliver_frame(CaptureTag::Repeat, 5, W, H);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fixture.session.pool().ring_len(), 0);

    // Unlocking restores allocate capability.
    drop(handle);
    deliver_burst(&fixture, &[6]);
    assert_eq!(fixture.session.pool().ring_timestamps(), vec![6]);

    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn orphan_metadata_is_aged_out() {
    let fixture = open_session(4, false);
    let limit = 2 * fixture.session.pool().num_buffers();

    for ts in 0..100 {
        fixture.handle.deliver_metadata(CaptureTag::Repeat, ts);
    }
    // Let the copy worker churn through the queue.
    wait_for(
        || fixture.session.pool().pending_metadata_len() <= limit,
        "metadata aging",
    );
    std::thread::sleep(Duration::from_millis(200));
    assert!(fixture.session.pool().pending_metadata_len() <= limit);

    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn user_focus_point_reaches_repeat_request() {
    let fixture = open_session(8, false);

    // Metadata chatter around the focus request, as a real driver
    // produces.
    for ts in 0..50 {
        fixture.handle.deliver_metadata(CaptureTag::Repeat, ts);
    }
    fixture.session.set_focus_point(0.2, 0.2);
    for ts in 50..100 {
        fixture.handle.deliver_metadata(CaptureTag::Repeat, ts);
    }

    let camera = fixture.session.camera_description().clone();
    let px = (camera.sensor_size.width as f32 * 0.2) as i32;
    let py = (camera.sensor_size.height as f32 * 0.2) as i32;

    wait_for(
        || {
            fixture
                .handle
                .submissions()
                .iter()
                .rev()
                .find(|s| s.kind == SubmissionKind::Repeating)
                .map(|s| {
                    let request = &s.requests[0];
                    request.af_mode == AfMode::Auto
                        && request
                            .af_regions
                            .map(|r| r.contains(px, py))
                            .unwrap_or(false)
                })
                .unwrap_or(false)
        },
        "user focus repeat request",
    );

    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn preview_worker_delivers_downscaled_frames() {
    let fixture = open_session(8, true);
    fixture.handle.deliver_frame(CaptureTag::Repeat, 42, W, H);

    wait_for(
        || !fixture.listener.previews.lock().unwrap().is_empty(),
        "preview frame",
    );
    let (pw, ph) = fixture.listener.previews.lock().unwrap()[0];
    // Channels are W/2 x H/2, preview downscale halves again.
    assert_eq!(pw, (W as usize / 2).div_ceil(2));
    assert_eq!(ph, (H as usize / 2).div_ceil(2));

    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn hdr_capture_saves_bundle_when_frames_arrive() {
    let fixture = open_session(12, false);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hdr.zip");

    fixture.session.capture_hdr(HdrRequest {
        count: 2,
        base_iso: 100,
        base_exposure_ns: 10_000_000,
        hdr_iso: 100,
        hdr_exposure_ns: 2_500_000,
        settings: PostProcessSettings::default(),
        output_path: path.clone(),
    });

    wait_for(
        || {
            fixture
                .handle
                .submissions()
                .iter()
                .any(|s| s.kind == SubmissionKind::Burst)
        },
        "hdr burst submission",
    );
    let burst = fixture
        .handle
        .submissions()
        .into_iter()
        .find(|s| s.kind == SubmissionKind::Burst)
        .unwrap();
    // count + 1 requests, the middle one underexposed.
    assert_eq!(burst.requests.len(), 3);
    assert_eq!(burst.requests[1].exposure_time_ns, Some(2_500_000));
    assert_eq!(burst.requests[0].exposure_time_ns, Some(10_000_000));

    for ts in [10_000, 10_001, 10_002] {
        fixture.handle.deliver_frame(CaptureTag::Hdr, ts, W, H);
    }

    wait_for(
        || !fixture.listener.hdr_saved.lock().unwrap().is_empty(),
        "hdr bundle saved",
    );
    assert_eq!(fixture.listener.hdr_failed.load(Ordering::SeqCst), 0);

    let mut bundle = rawbundle::open(&path).unwrap();
    let manifest = bundle.manifest().clone();
    assert!(manifest.is_hdr);
    assert_eq!(manifest.frames.len(), 3);
    assert_eq!(manifest.reference_timestamp, 10_000);
    let data = bundle.load_frame(&manifest.frames[0].filename).unwrap();
    assert_eq!(data.len(), FRAME_BYTES);

    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn hdr_watchdog_fails_exactly_once_when_frames_are_missing() {
    let fixture = open_session(12, false);
    let dir = tempfile::tempdir().unwrap();

    fixture.session.capture_hdr(HdrRequest {
        count: 4,
        base_iso: 100,
        base_exposure_ns: 10_000_000,
        hdr_iso: 100,
        hdr_exposure_ns: 2_500_000,
        settings: PostProcessSettings::default(),
        output_path: dir.path().join("hdr.zip"),
    });

    // Only two of the five expected frames ever arrive.
    fixture.handle.deliver_frame(CaptureTag::Hdr, 1, W, H);
    fixture.handle.deliver_frame(CaptureTag::Hdr, 2, W, H);

    wait_for(
        || fixture.listener.hdr_failed.load(Ordering::SeqCst) >= 1,
        "hdr failure",
    );
    // Exactly once, and no save happened.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(fixture.listener.hdr_failed.load(Ordering::SeqCst), 1);
    assert!(fixture.listener.hdr_saved.lock().unwrap().is_empty());

    // The pool is consistent afterwards: ZSL capture still works.
    deliver_burst(&fixture, &[100]);
    assert_eq!(fixture.session.pool().ring_timestamps(), vec![100]);

    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn partial_hdr_queues_single_request_and_times_out() {
    let fixture = open_session(12, false);
    let dir = tempfile::tempdir().unwrap();

    fixture.session.capture_hdr(HdrRequest {
        count: 2,
        base_iso: 0,
        base_exposure_ns: 0,
        hdr_iso: 200,
        hdr_exposure_ns: 1_000_000,
        settings: PostProcessSettings::default(),
        output_path: dir.path().join("hdr.zip"),
    });

    wait_for(
        || {
            fixture
                .handle
                .submissions()
                .iter()
                .any(|s| s.kind == SubmissionKind::Burst)
        },
        "hdr burst submission",
    );
    let burst = fixture
        .handle
        .submissions()
        .into_iter()
        .find(|s| s.kind == SubmissionKind::Burst)
        .unwrap();
    assert_eq!(burst.requests.len(), 1);
    assert_eq!(burst.requests[0].iso, Some(200));

    // One frame arrives but count + 1 are expected; the watchdog
    // resolves it.
    fixture.handle.deliver_frame(CaptureTag::Hdr, 1, W, H);
    wait_for(
        || fixture.listener.hdr_failed.load(Ordering::SeqCst) >= 1,
        "partial hdr timeout",
    );

    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn camera_error_surfaces_and_closes() {
    let fixture = open_session(4, false);
    fixture.handle.report_error(3);
    wait_for(
        || fixture.listener.errors.load(Ordering::SeqCst) >= 1,
        "error callback",
    );
    wait_for(|| !fixture.handle.is_open(), "camera to close");
    fixture.session.close_camera();
    fixture.session.join();
}

#[test]
fn close_waits_for_driver_closed_state() {
    let fixture = open_session(4, false);
    fixture.session.close_camera();
    fixture.session.join();
    assert!(!fixture.handle.is_open());
    let states = fixture.listener.states.lock().unwrap().clone();
    assert_eq!(states.last(), Some(&SessionState::Closed));
}
