//! In-process camera driver for tests and demos.
//!
//! Behaves like a cooperative driver: submissions immediately complete
//! their sequences and move the session through Ready/Active, while
//! frame delivery stays under the caller's control so tests can
//! interleave pixels and metadata arbitrarily.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use rawcam_types::{CameraDescription, PixelFormat, ShadingMap};

use crate::driver::{CameraDriver, CaptureResult, DriverImage, DriverSink, SessionOutputs};
use crate::events::{CaptureTag, DriverExposureState, DriverFocusState};
use crate::request::CaptureRequest;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    Single,
    Repeating,
    Burst,
}

/// One recorded driver submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: SubmissionKind,
    pub requests: Vec<CaptureRequest>,
    pub sequence_id: i32,
}

struct FakeShared {
    description: CameraDescription,
    sink: Mutex<Option<DriverSink>>,
    submissions: Mutex<Vec<Submission>>,
    next_sequence: AtomicI32,
    last_repeat_sequence: AtomicI32,
    open: AtomicBool,
}

impl FakeShared {
    fn sink(&self) -> Result<DriverSink> {
        self.sink
            .lock()
            .clone()
            .ok_or_else(|| Error::Driver("camera not open".to_string()))
    }

    fn record(&self, kind: SubmissionKind, requests: Vec<CaptureRequest>) -> i32 {
        let sequence_id = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.submissions.lock().push(Submission {
            kind,
            requests,
            sequence_id,
        });
        sequence_id
    }
}

/// Test driver; create with [`FakeDriver::new`] and keep a
/// [`FakeHandle`] to drive callbacks after the session takes
/// ownership.
pub struct FakeDriver {
    shared: Arc<FakeShared>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::with_description(CameraDescription::default())
    }

    pub fn with_description(description: CameraDescription) -> Self {
        Self {
            shared: Arc::new(FakeShared {
                description,
                sink: Mutex::new(None),
                submissions: Mutex::new(Vec::new()),
                next_sequence: AtomicI32::new(1),
                last_repeat_sequence: AtomicI32::new(0),
                open: AtomicBool::new(false),
            }),
        }
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for FakeDriver {
    fn describe(&self) -> Result<CameraDescription> {
        Ok(self.shared.description.clone())
    }

    fn open(&mut self, _outputs: &SessionOutputs, sink: DriverSink) -> Result<()> {
        *self.shared.sink.lock() = Some(sink);
        self.shared.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.shared.open.store(false, Ordering::SeqCst);
        if let Ok(sink) = self.shared.sink() {
            sink.session_closed();
        }
        Ok(())
    }

    fn submit_capture(&mut self, request: &CaptureRequest) -> Result<i32> {
        let sink = self.shared.sink()?;
        let sequence_id = self
            .shared
            .record(SubmissionKind::Single, vec![request.clone()]);
        self.shared
            .last_repeat_sequence
            .store(sequence_id, Ordering::SeqCst);
        sink.capture_sequence_completed(CaptureTag::Repeat, sequence_id);
        sink.session_ready();
        Ok(sequence_id)
    }

    fn submit_burst(&mut self, requests: &[CaptureRequest]) -> Result<i32> {
        let sink = self.shared.sink()?;
        let sequence_id = self.shared.record(SubmissionKind::Burst, requests.to_vec());
        sink.capture_sequence_completed(CaptureTag::Hdr, sequence_id);
        Ok(sequence_id)
    }

    fn submit_repeating(&mut self, request: &CaptureRequest) -> Result<i32> {
        let sink = self.shared.sink()?;
        let sequence_id = self
            .shared
            .record(SubmissionKind::Repeating, vec![request.clone()]);
        self.shared
            .last_repeat_sequence
            .store(sequence_id, Ordering::SeqCst);
        sink.session_active();
        Ok(sequence_id)
    }

    fn stop_repeating(&mut self) -> Result<()> {
        let sink = self.shared.sink()?;
        let sequence_id = self.shared.last_repeat_sequence.load(Ordering::SeqCst);
        sink.capture_sequence_completed(CaptureTag::Repeat, sequence_id);
        sink.session_ready();
        Ok(())
    }
}

/// Test-side control of a [`FakeDriver`] owned by a session.
#[derive(Clone)]
pub struct FakeHandle {
    shared: Arc<FakeShared>,
}

impl FakeHandle {
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.shared.submissions.lock().clone()
    }

    pub fn last_submission(&self) -> Option<Submission> {
        self.shared.submissions.lock().last().cloned()
    }

    /// Deterministic raw16 payload for a frame of the given size.
    pub fn frame_bytes(width: u32, height: u32, seed: u16) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 2) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x * 7 + y * 13) as u16).wrapping_mul(seed | 1) % 1024;
                data.extend_from_slice(&v.to_le_bytes());
            }
        }
        data
    }

    fn capture_result(&self, timestamp_ns: i64) -> CaptureResult {
        CaptureResult {
            timestamp_ns,
            iso: 400,
            exposure_time_ns: 10_000_000,
            exposure_compensation: 0,
            as_shot_neutral: [0.7, 1.0, 0.8],
            lens_shading_map: [
                ShadingMap::identity(16, 12),
                ShadingMap::identity(16, 12),
                ShadingMap::identity(16, 12),
                ShadingMap::identity(16, 12),
            ],
            ae_state: DriverExposureState::Converged,
            af_state: DriverFocusState::PassiveFocused,
        }
    }

    /// Emit the capture-completed metadata callback only.
    pub fn deliver_metadata(&self, tag: CaptureTag, timestamp_ns: i64) {
        if let Ok(sink) = self.shared.sink() {
            sink.capture_started(tag, timestamp_ns);
            sink.capture_completed(tag, self.capture_result(timestamp_ns));
        }
    }

    /// Emit the raw image reader callback only.
    pub fn deliver_pixels(&self, timestamp_ns: i64, width: u32, height: u32) {
        if let Ok(sink) = self.shared.sink() {
            sink.image_available(DriverImage {
                pixel_format: PixelFormat::Raw16,
                width,
                height,
                row_stride: width * 2,
                timestamp_ns,
                data: Self::frame_bytes(width, height, timestamp_ns as u16),
            });
        }
    }

    /// Emit a full frame: metadata then pixels.
    pub fn deliver_frame(&self, tag: CaptureTag, timestamp_ns: i64, width: u32, height: u32) {
        self.deliver_metadata(tag, timestamp_ns);
        self.deliver_pixels(timestamp_ns, width, height);
    }

    pub fn report_error(&self, code: i32) {
        if let Ok(sink) = self.shared.sink() {
            sink.device_error(code);
        }
    }

    pub fn disconnect(&self) {
        if let Ok(sink) = self.shared.sink() {
            sink.device_disconnected();
        }
    }
}
