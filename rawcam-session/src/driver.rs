use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{trace, warn};

use rawcam_types::{
    CameraDescription, FrameMetadata, PixelFormat, RawType, ScreenOrientation, ShadingMap,
};

use crate::consumer::ConsumerItem;
use crate::events::{CaptureTag, DriverExposureState, DriverFocusState, Event, SessionState};
use crate::request::CaptureRequest;
use crate::Result;

/// Output targets the capture session asks the driver to create.
///
/// The auxiliary YUV reader exists only to keep continuous autofocus
/// working on legacy drivers; its buffers are never consumed.
#[derive(Debug, Clone, Copy)]
pub struct SessionOutputs {
    pub preview_surface: bool,
    pub raw_reader_buffers: usize,
    pub yuv_reader_buffers: usize,
}

impl Default for SessionOutputs {
    fn default() -> Self {
        Self {
            preview_surface: true,
            raw_reader_buffers: 4,
            yuv_reader_buffers: 2,
        }
    }
}

/// One raw image handed off by the driver's image reader.
#[derive(Debug, Clone)]
pub struct DriverImage {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub row_stride: u32,
    pub timestamp_ns: i64,
    pub data: Vec<u8>,
}

/// Result metadata of one completed capture, as read from the driver.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub timestamp_ns: i64,
    pub iso: i32,
    pub exposure_time_ns: i64,
    pub exposure_compensation: i32,
    pub as_shot_neutral: [f32; 3],
    pub lens_shading_map: [ShadingMap; 4],
    pub ae_state: DriverExposureState,
    pub af_state: DriverFocusState,
}

/// Platform camera abstraction.
///
/// Implementations submit requests to the hardware and report every
/// callback through the [`DriverSink`] given at `open`. Callback
/// threads must not block; the sink only enqueues.
pub trait CameraDriver: Send {
    fn describe(&self) -> Result<CameraDescription>;
    fn open(&mut self, outputs: &SessionOutputs, sink: DriverSink) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    /// Submit a single capture; returns the sequence id.
    fn submit_capture(&mut self, request: &CaptureRequest) -> Result<i32>;
    /// Submit an ad-hoc burst (used for HDR); returns the sequence id.
    fn submit_burst(&mut self, requests: &[CaptureRequest]) -> Result<i32>;
    /// Install the continuous repeating request; returns the sequence
    /// id.
    fn submit_repeating(&mut self, request: &CaptureRequest) -> Result<i32>;
    fn stop_repeating(&mut self) -> Result<()>;
}

struct SinkShared {
    events: Sender<Event>,
    items: Sender<ConsumerItem>,
    hdr_in_progress: Arc<AtomicBool>,
    orientation: Arc<AtomicI32>,
    last_iso: AtomicI32,
    last_exposure_ns: AtomicI64,
}

/// Context-free bridge from driver callback threads into the session.
///
/// Every method translates one driver callback into an [`Event`] or a
/// consumer queue item; nothing here touches session state or the
/// buffer pool.
#[derive(Clone)]
pub struct DriverSink {
    shared: Arc<SinkShared>,
}

impl DriverSink {
    pub(crate) fn new(
        events: Sender<Event>,
        items: Sender<ConsumerItem>,
        hdr_in_progress: Arc<AtomicBool>,
        orientation: Arc<AtomicI32>,
    ) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                events,
                items,
                hdr_in_progress,
                orientation,
                last_iso: AtomicI32::new(0),
                last_exposure_ns: AtomicI64::new(0),
            }),
        }
    }

    fn post(&self, event: Event) {
        if self.shared.events.send(event).is_err() {
            warn!("event loop is gone, dropping driver callback");
        }
    }

    pub fn capture_started(&self, tag: CaptureTag, timestamp_ns: i64) {
        trace!("capture started ({tag:?}, {timestamp_ns})");
    }

    pub fn capture_progressed(&self, tag: CaptureTag) {
        trace!("capture progressed ({tag:?})");
    }

    /// Completed capture: extract the frame metadata, queue it for the
    /// matcher, and surface exposure/AF/AE status changes.
    pub fn capture_completed(&self, tag: CaptureTag, result: CaptureResult) {
        let orientation = ScreenOrientation::from_code(self.shared.orientation.load(Ordering::Relaxed))
            .unwrap_or(ScreenOrientation::Portrait);
        let raw_type = match tag {
            CaptureTag::Repeat => RawType::Zsl,
            CaptureTag::Hdr => RawType::Hdr,
        };
        let metadata = FrameMetadata {
            timestamp_ns: result.timestamp_ns,
            exposure_time_ns: result.exposure_time_ns,
            iso: result.iso,
            exposure_compensation: result.exposure_compensation,
            as_shot_neutral: result.as_shot_neutral,
            lens_shading_map: result.lens_shading_map,
            orientation,
            raw_type,
        };
        if self.shared.items.send(ConsumerItem::Metadata(metadata)).is_err() {
            warn!("image consumer is gone, dropping metadata");
        }

        let iso_changed = self.shared.last_iso.swap(result.iso, Ordering::Relaxed) != result.iso;
        let exposure_changed = self
            .shared
            .last_exposure_ns
            .swap(result.exposure_time_ns, Ordering::Relaxed)
            != result.exposure_time_ns;
        if iso_changed || exposure_changed {
            self.post(Event::ExposureStatusChanged {
                iso: result.iso,
                exposure_ns: result.exposure_time_ns,
            });
        }

        self.post(Event::AeStateChanged(result.ae_state));
        self.post(Event::AfStateChanged(result.af_state));
    }

    pub fn capture_failed(&self, tag: CaptureTag) {
        self.post(Event::CaptureFailed { tag });
    }

    pub fn capture_sequence_completed(&self, tag: CaptureTag, sequence_id: i32) {
        self.post(Event::CaptureSequenceCompleted { tag, sequence_id });
    }

    pub fn capture_sequence_aborted(&self, tag: CaptureTag, sequence_id: i32) {
        self.post(Event::CaptureSequenceAborted { tag, sequence_id });
    }

    pub fn buffer_lost(&self) {
        self.post(Event::BufferLost);
    }

    /// Raw reader hand-off. While an HDR burst is collecting, every
    /// arrival also re-evaluates the HDR save state.
    pub fn image_available(&self, image: DriverImage) {
        if self.shared.items.send(ConsumerItem::Image(image)).is_err() {
            warn!("image consumer is gone, dropping image");
        }
        if self.shared.hdr_in_progress.load(Ordering::Acquire) {
            self.post(Event::SaveHdrData);
        }
    }

    pub fn device_error(&self, code: i32) {
        self.post(Event::CameraError { code });
    }

    pub fn device_disconnected(&self) {
        self.post(Event::CameraDisconnected);
    }

    pub fn session_ready(&self) {
        self.post(Event::SessionStateChanged(SessionState::Ready));
    }

    pub fn session_active(&self) {
        self.post(Event::SessionStateChanged(SessionState::Active));
    }

    pub fn session_closed(&self) {
        self.post(Event::SessionStateChanged(SessionState::Closed));
    }
}
