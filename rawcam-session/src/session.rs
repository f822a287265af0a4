use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use rawcam_pool::SharedPool;
use rawcam_types::{CameraDescription, PostProcessSettings, ScreenOrientation};

use crate::consumer::{ImageConsumer, PreviewSettings};
use crate::driver::{CameraDriver, DriverSink, SessionOutputs};
use crate::events::{CaptureTag, Event, HdrRequest, SessionState};
use crate::listener::SessionListener;
use crate::request::CaptureRequest;
use crate::state::CameraStateManager;
use crate::{Error, Result};

const EVENT_TIMEOUT: Duration = Duration::from_millis(100);
const HDR_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Budget for the raw frame pool.
    pub max_memory_bytes: usize,
    /// Downscale factor of the raw preview.
    pub raw_preview_downscale: usize,
    /// How long to wait for missing HDR frames after the burst
    /// sequence completes.
    pub hdr_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024,
            raw_preview_downscale: 2,
            hdr_timeout: HDR_TIMEOUT,
        }
    }
}

/// In-flight HDR capture bookkeeping, owned by the event loop.
struct HdrCapture {
    /// Frames that must arrive before the capture can be persisted.
    requested_count: usize,
    partial: bool,
    sequence_completed_at: Option<Instant>,
    settings: PostProcessSettings,
    output_path: PathBuf,
}

/// Handle to a running capture session.
///
/// Methods post events; the dedicated loop thread performs all state
/// mutation. Dropping the handle closes the camera and joins the
/// loop.
pub struct CameraSession {
    events: Sender<Event>,
    consumer: ImageConsumer,
    pool: SharedPool,
    camera: CameraDescription,
    orientation: Arc<AtomicI32>,
    thread: Option<JoinHandle<()>>,
}

impl CameraSession {
    pub fn new(
        driver: Box<dyn CameraDriver>,
        listener: Arc<dyn SessionListener>,
        config: SessionConfig,
    ) -> Result<Self> {
        let camera = driver.describe()?;
        let pool = SharedPool::new(config.max_memory_bytes);
        let (consumer, items_tx) = ImageConsumer::new(pool.clone(), camera.clone(), listener.clone());

        let (events_tx, events_rx) = unbounded();
        let hdr_in_progress = Arc::new(AtomicBool::new(false));
        let orientation = Arc::new(AtomicI32::new(ScreenOrientation::Portrait.code()));

        let sink = DriverSink::new(
            events_tx.clone(),
            items_tx,
            hdr_in_progress.clone(),
            orientation.clone(),
        );

        let loop_state = EventLoop {
            driver,
            sink,
            state: CameraStateManager::new(camera.clone()),
            consumer: consumer.clone(),
            listener,
            camera: camera.clone(),
            config: config.clone(),
            events_tx: events_tx.clone(),
            session_state: SessionState::Closed,
            stop_requested: false,
            hdr: None,
            hdr_in_progress,
        };

        let thread = std::thread::Builder::new()
            .name("camera-session".to_string())
            .spawn(move || loop_state.run(events_rx))
            .expect("spawn session event loop");

        Ok(Self {
            events: events_tx,
            consumer,
            pool,
            camera,
            orientation,
            thread: Some(thread),
        })
    }

    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            warn!("session loop has exited, dropping command");
        }
    }

    pub fn camera_description(&self) -> &CameraDescription {
        &self.camera
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    pub fn open_camera(&self, setup_raw_preview: bool) {
        self.post(Event::OpenCamera { setup_raw_preview });
    }

    /// Two-phase shutdown: close the camera, then stop the loop once
    /// the driver has reported `Closed`.
    pub fn close_camera(&self) {
        self.post(Event::CloseCamera);
        self.post(Event::Stop);
    }

    pub fn pause_capture(&self) {
        self.post(Event::PauseCapture);
    }

    pub fn resume_capture(&self) {
        self.post(Event::ResumeCapture);
    }

    pub fn set_auto_exposure(&self) {
        self.post(Event::SetAutoExposure);
    }

    pub fn set_manual_exposure(&self, iso: i32, exposure_ns: i64) {
        self.post(Event::SetManualExposure { iso, exposure_ns });
    }

    /// `value` is normalized to [0, 1] across the camera's exposure
    /// compensation range.
    pub fn set_exposure_compensation(&self, value: f32) {
        self.post(Event::SetExposureCompensation { value });
    }

    pub fn set_auto_focus(&self) {
        self.post(Event::SetAutoFocus);
    }

    pub fn set_focus_point(&self, x: f32, y: f32) {
        self.post(Event::SetFocusPoint { x, y });
    }

    pub fn capture_hdr(&self, request: HdrRequest) {
        self.post(Event::CaptureHdr(request));
    }

    pub fn update_orientation(&self, orientation: ScreenOrientation) {
        self.orientation.store(orientation.code(), Ordering::Relaxed);
    }

    pub fn update_preview_settings(&self, settings: PreviewSettings) {
        self.consumer.update_preview_settings(settings);
    }

    /// Persist the zero-shutter-lag ring around `reference_timestamp`
    /// to a bundle at `output_path`.
    pub fn save(
        &self,
        reference_timestamp: i64,
        extra_frames: usize,
        write_dng: bool,
        settings: &PostProcessSettings,
        output_path: &Path,
    ) -> Result<PathBuf> {
        if !self.consumer.is_running() {
            return Err(Error::NotOpen);
        }
        self.consumer.save(
            reference_timestamp,
            extra_frames,
            write_dng,
            settings,
            output_path,
        )
    }

    /// Wait for the loop thread to finish. Intended for tests and
    /// orderly teardown after `close_camera`.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.events.send(Event::CloseCamera);
            let _ = self.events.send(Event::Stop);
            let _ = thread.join();
        }
    }
}

struct EventLoop {
    driver: Box<dyn CameraDriver>,
    sink: DriverSink,
    state: CameraStateManager,
    consumer: ImageConsumer,
    listener: Arc<dyn SessionListener>,
    camera: CameraDescription,
    config: SessionConfig,
    events_tx: Sender<Event>,
    session_state: SessionState,
    stop_requested: bool,
    hdr: Option<HdrCapture>,
    hdr_in_progress: Arc<AtomicBool>,
}

impl EventLoop {
    fn run(mut self, events_rx: Receiver<Event>) {
        debug!("session event loop started");
        loop {
            match events_rx.recv_timeout(EVENT_TIMEOUT) {
                Ok(event) => self.dispatch(event),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    // The watchdog must fire even when no more frames
                    // arrive to trigger re-evaluation.
                    if self.hdr.is_some() {
                        self.attempt_save_hdr();
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }

            if self.stop_requested && self.session_state == SessionState::Closed {
                break;
            }
        }
        self.consumer.stop();
        debug!("session event loop exited");
    }

    fn dispatch(&mut self, event: Event) {
        // After Stop, only the driver's lifecycle reports matter; a
        // late callback must not restart anything.
        if self.stop_requested && !matches!(event, Event::SessionStateChanged(_)) {
            debug!("ignoring event after stop: {event:?}");
            return;
        }

        let result = match event {
            Event::OpenCamera { setup_raw_preview } => self.do_open(setup_raw_preview),
            Event::CloseCamera => self.do_close(),
            Event::PauseCapture => self.state.pause(self.driver.as_mut()),
            Event::ResumeCapture => self.state.resume(self.driver.as_mut()),
            Event::SetAutoExposure => self.state.request_auto_exposure(self.driver.as_mut()),
            Event::SetManualExposure { iso, exposure_ns } => self
                .state
                .request_manual_exposure(iso, exposure_ns, self.driver.as_mut()),
            Event::SetExposureCompensation { value } => {
                let range = &self.camera.exposure_compensation_range;
                let value = value.clamp(0.0, 1.0);
                let compensation =
                    (value * (range[1] - range[0]) as f32).round() as i32 + range[0];
                self.state
                    .request_exposure_compensation(compensation, self.driver.as_mut())
            }
            Event::SetAutoFocus => self.state.request_auto_focus(self.driver.as_mut()),
            Event::SetFocusPoint { x, y } => {
                self.state.request_user_focus(x, y, self.driver.as_mut())
            }
            Event::CaptureHdr(request) => self.do_capture_hdr(request),
            Event::SaveHdrData => {
                self.attempt_save_hdr();
                Ok(())
            }
            Event::CameraError { code } => {
                error!("camera error {code}");
                self.listener.on_camera_error(code);
                let _ = self.events_tx.send(Event::CloseCamera);
                Ok(())
            }
            Event::CameraDisconnected => {
                info!("camera disconnected");
                self.listener.on_camera_disconnected();
                let _ = self.events_tx.send(Event::CloseCamera);
                Ok(())
            }
            Event::SessionStateChanged(state) => {
                debug!("session state {state:?}");
                self.session_state = state;
                let result = self
                    .state
                    .on_session_state_changed(state, self.driver.as_mut());
                self.listener.on_session_state(state);
                result
            }
            Event::ExposureStatusChanged { iso, exposure_ns } => {
                self.listener.on_exposure_status(iso, exposure_ns);
                Ok(())
            }
            Event::AeStateChanged(state) => {
                self.listener.on_ae_state(state);
                Ok(())
            }
            Event::AfStateChanged(state) => {
                self.listener.on_af_state(state);
                Ok(())
            }
            Event::CaptureSequenceCompleted { tag, sequence_id } => {
                match tag {
                    CaptureTag::Repeat => self.state.on_capture_sequence_completed(sequence_id),
                    CaptureTag::Hdr => self.hdr_sequence_finished(),
                }
                Ok(())
            }
            Event::CaptureSequenceAborted { tag, sequence_id } => {
                warn!("capture sequence {sequence_id} aborted ({tag:?})");
                if tag == CaptureTag::Hdr {
                    self.hdr_sequence_finished();
                }
                Ok(())
            }
            Event::CaptureFailed { tag } => {
                warn!("capture failed ({tag:?})");
                // Failed HDR requests count as sequence completion so
                // the watchdog can start.
                if tag == CaptureTag::Hdr {
                    self.hdr_sequence_finished();
                }
                Ok(())
            }
            Event::BufferLost => {
                warn!("driver reported a lost buffer");
                Ok(())
            }
            Event::Stop => {
                debug!("stop requested");
                self.stop_requested = true;
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("event handling failed: {e}");
        }
    }

    fn do_open(&mut self, setup_raw_preview: bool) -> Result<()> {
        info!("opening camera");
        let outputs = SessionOutputs {
            preview_surface: true,
            raw_reader_buffers: 4,
            yuv_reader_buffers: 2,
        };
        self.driver.open(&outputs, self.sink.clone())?;
        self.consumer.start();
        if setup_raw_preview {
            self.consumer
                .enable_raw_preview(self.config.raw_preview_downscale);
        }
        self.state.start(self.driver.as_mut())
    }

    fn do_close(&mut self) -> Result<()> {
        info!("closing camera");
        self.consumer.disable_raw_preview();
        let _ = self.driver.stop_repeating();
        self.driver.close()
    }

    fn do_capture_hdr(&mut self, request: HdrRequest) -> Result<()> {
        if self.hdr.is_some() {
            warn!("hdr capture already in progress, ignoring request");
            return Ok(());
        }
        if request.count == 0 {
            warn!("invalid hdr capture request (count = 0)");
            return Ok(());
        }

        let partial =
            request.hdr_iso > 0 && request.hdr_exposure_ns > 0 && request.base_iso == 0;

        let requests: Vec<CaptureRequest> = if partial {
            // Only the underexposed frame is requested from the
            // driver; the base frames come from the ring.
            vec![CaptureRequest::manual(
                &self.camera,
                request.hdr_iso,
                request.hdr_exposure_ns,
            )]
        } else {
            let total = request.count + 1;
            let mut burst = vec![
                CaptureRequest::manual(
                    &self.camera,
                    request.base_iso,
                    request.base_exposure_ns,
                );
                total
            ];
            burst[total / 2] =
                CaptureRequest::manual(&self.camera, request.hdr_iso, request.hdr_exposure_ns);
            burst
        };

        // The partial path still waits for count+1 frames even though
        // it queues a single request; the watchdog resolves the
        // mismatch when the extra frames never arrive.
        let requested_count = request.count + 1;

        info!(
            "initiating hdr capture (count {}, partial {}, {} request(s))",
            request.count,
            partial,
            requests.len()
        );
        self.driver.submit_burst(&requests)?;

        self.hdr = Some(HdrCapture {
            requested_count,
            partial,
            sequence_completed_at: None,
            settings: request.settings,
            output_path: request.output_path,
        });
        self.hdr_in_progress.store(true, Ordering::Release);
        Ok(())
    }

    fn hdr_sequence_finished(&mut self) {
        if let Some(hdr) = &mut self.hdr {
            if hdr.sequence_completed_at.is_none() {
                debug!("hdr capture sequence finished");
                hdr.sequence_completed_at = Some(Instant::now());
            }
        }
    }

    fn finish_hdr(&mut self) {
        self.hdr = None;
        self.hdr_in_progress.store(false, Ordering::Release);
    }

    /// Re-evaluate the in-flight HDR capture: persist once enough
    /// frames arrived, fail once the watchdog expires.
    fn attempt_save_hdr(&mut self) {
        let Some(hdr) = &self.hdr else {
            return;
        };

        let collected = self.consumer.num_hdr_frames();
        if collected < hdr.requested_count {
            if let Some(completed_at) = hdr.sequence_completed_at {
                if completed_at.elapsed() > self.config.hdr_timeout {
                    warn!(
                        "hdr capture timed out with {collected}/{} frame(s) (partial: {})",
                        hdr.requested_count, hdr.partial
                    );
                    self.consumer.cancel_hdr();
                    self.listener.on_hdr_failed();
                    self.finish_hdr();
                    return;
                }
            }
            let percent = (collected * 100 / hdr.requested_count.max(1)) as u8;
            self.listener.on_hdr_progress(percent);
            return;
        }

        self.listener.on_hdr_progress(100);
        info!("hdr capture completed, saving");

        let settings = hdr.settings.clone();
        let output_path = hdr.output_path.clone();
        match self.consumer.save_hdr(&settings, &output_path) {
            Ok(path) => self.listener.on_hdr_saved(&path),
            Err(e) => {
                error!("failed to save hdr capture: {e}");
                self.listener.on_hdr_failed();
            }
        }
        self.finish_hdr();
    }
}
