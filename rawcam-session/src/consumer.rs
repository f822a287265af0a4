use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use rawbundle::{FrameRecord, Manifest};
use rawcam_pool::{RawFrame, SharedPool};
use rawcam_process::color::{CameraProfile, Temperature};
use rawcam_process::kernels;
use rawcam_types::{CameraDescription, FrameMetadata, PostProcessSettings, RawType};

use crate::listener::SessionListener;
use crate::{Error, Result};

const QUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Work delivered from driver callback threads to the copy worker.
pub enum ConsumerItem {
    Image(crate::driver::DriverImage),
    Metadata(FrameMetadata),
}

/// Live preview tuning, updatable while the preview worker runs.
#[derive(Debug, Clone)]
pub struct PreviewSettings {
    pub shadows: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub blacks: f32,
    pub white_point: f32,
    pub temperature_offset: f32,
    pub tint_offset: f32,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            shadows: 1.0,
            contrast: 0.5,
            saturation: 1.0,
            blacks: 0.0,
            white_point: 1.0,
            temperature_offset: 0.0,
            tint_offset: 0.0,
        }
    }
}

struct Shared {
    pool: SharedPool,
    camera: CameraDescription,
    listener: Arc<dyn SessionListener>,

    running: AtomicBool,
    items_rx: Mutex<Option<Receiver<ConsumerItem>>>,

    preview_enabled: AtomicBool,
    preview_downscale: AtomicUsize,
    preview_tx: Mutex<Option<Sender<RawFrame>>>,
    preview_settings: Mutex<PreviewSettings>,

    hdr_frames: Mutex<Vec<RawFrame>>,

    setup_started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The multi-threaded raw image pipeline: copy worker, lazily started
/// pool-growth worker, and optional preview worker.
#[derive(Clone)]
pub struct ImageConsumer {
    shared: Arc<Shared>,
}

impl ImageConsumer {
    /// Returns the consumer and the sender side of its work queue,
    /// which the driver sink feeds.
    pub fn new(
        pool: SharedPool,
        camera: CameraDescription,
        listener: Arc<dyn SessionListener>,
    ) -> (Self, Sender<ConsumerItem>) {
        let (tx, rx) = unbounded();
        let consumer = Self {
            shared: Arc::new(Shared {
                pool,
                camera,
                listener,
                running: AtomicBool::new(false),
                items_rx: Mutex::new(Some(rx)),
                preview_enabled: AtomicBool::new(false),
                preview_downscale: AtomicUsize::new(2),
                preview_tx: Mutex::new(None),
                preview_settings: Mutex::new(PreviewSettings::default()),
                hdr_frames: Mutex::new(Vec::new()),
                setup_started: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        };
        (consumer, tx)
    }

    /// Start the copy worker. Parallelism is kept at one: the matcher
    /// and the ring both rely on monotone timestamps, and multiple
    /// copy workers could reorder frames.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("image consumer already running");
            return;
        }
        let Some(rx) = self.shared.items_rx.lock().take() else {
            warn!("image consumer was restarted without a work queue");
            return;
        };
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("raw-copy".to_string())
            .spawn(move || copy_worker(shared, rx))
            .expect("spawn copy worker");
        self.shared.workers.lock().push(handle);
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.disable_raw_preview();
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        debug!("image consumer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Enable the raw preview path with the given downscale factor.
    pub fn enable_raw_preview(&self, downscale: usize) {
        if self.shared.preview_enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared
            .preview_downscale
            .store(downscale.max(1), Ordering::SeqCst);

        // Bounded at two frames: the preview drops under backpressure
        // rather than delaying the capture path.
        let (tx, rx) = bounded(2);
        *self.shared.preview_tx.lock() = Some(tx);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("raw-preview".to_string())
            .spawn(move || preview_worker(shared, rx))
            .expect("spawn preview worker");
        self.shared.workers.lock().push(handle);
        info!("raw preview enabled (downscale {downscale})");
    }

    pub fn disable_raw_preview(&self) {
        if self.shared.preview_enabled.swap(false, Ordering::SeqCst) {
            *self.shared.preview_tx.lock() = None;
            info!("raw preview disabled");
        }
    }

    pub fn update_preview_settings(&self, settings: PreviewSettings) {
        *self.shared.preview_settings.lock() = settings;
    }

    pub fn num_hdr_frames(&self) -> usize {
        self.shared.hdr_frames.lock().len()
    }

    /// Drop a partial HDR collection back into the pool.
    pub fn cancel_hdr(&self) {
        let frames = std::mem::take(&mut *self.shared.hdr_frames.lock());
        for frame in frames {
            self.shared.pool.discard(frame);
        }
    }

    /// Write the zero-shutter-lag ring to a bundle.
    ///
    /// The ring is snapshotted atomically; the reference is the frame
    /// closest to `reference_timestamp` and `extra_frames` more are
    /// added greedily by timestamp distance, alternating earlier and
    /// later. All selected frames return to `unused` afterwards.
    pub fn save(
        &self,
        reference_timestamp: i64,
        extra_frames: usize,
        write_dng: bool,
        settings: &PostProcessSettings,
        output_path: &Path,
    ) -> Result<PathBuf> {
        let handle = self.shared.pool.lock_all();
        if handle.is_empty() {
            return Err(Error::NothingToSave);
        }

        let frames = handle.frames();
        let reference_index = frames
            .iter()
            .enumerate()
            .min_by_key(|(_, f)| (f.metadata.timestamp_ns - reference_timestamp).abs())
            .map(|(i, _)| i)
            .unwrap_or(0);
        let reference_ts = frames[reference_index].metadata.timestamp_ns;

        let mut selected = vec![reference_index];
        let mut left = reference_index.checked_sub(1);
        let mut right = if reference_index + 1 < frames.len() {
            Some(reference_index + 1)
        } else {
            None
        };
        while selected.len() <= extra_frames && (left.is_some() || right.is_some()) {
            let left_dist = left
                .map(|i| (frames[i].metadata.timestamp_ns - reference_ts).abs())
                .unwrap_or(i64::MAX);
            let right_dist = right
                .map(|i| (frames[i].metadata.timestamp_ns - reference_ts).abs())
                .unwrap_or(i64::MAX);
            if left_dist < right_dist {
                let index = left.unwrap();
                selected.push(index);
                left = index.checked_sub(1);
            } else {
                let index = right.unwrap();
                selected.push(index);
                right = if index + 1 < frames.len() {
                    Some(index + 1)
                } else {
                    None
                };
            }
        }

        info!(
            "saving {} frame(s), reference timestamp {}",
            selected.len(),
            reference_ts
        );
        let picked: Vec<&RawFrame> = selected.iter().map(|i| &frames[*i]).collect();
        self.write_bundle(&picked, reference_ts, false, write_dng, settings, output_path)
    }

    /// Write the collected HDR burst, in arrival order, reference
    /// first.
    pub fn save_hdr(
        &self,
        settings: &PostProcessSettings,
        output_path: &Path,
    ) -> Result<PathBuf> {
        let frames = std::mem::take(&mut *self.shared.hdr_frames.lock());
        if frames.is_empty() {
            return Err(Error::NothingToSave);
        }
        let reference_ts = frames[0].metadata.timestamp_ns;
        info!(
            "saving hdr capture of {} frame(s), reference timestamp {}",
            frames.len(),
            reference_ts
        );
        let picked: Vec<&RawFrame> = frames.iter().collect();
        let result = self.write_bundle(&picked, reference_ts, true, false, settings, output_path);
        for frame in frames {
            self.shared.pool.discard(frame);
        }
        result
    }

    fn write_bundle(
        &self,
        frames: &[&RawFrame],
        reference_timestamp: i64,
        is_hdr: bool,
        write_dng: bool,
        settings: &PostProcessSettings,
        output_path: &Path,
    ) -> Result<PathBuf> {
        let mut writer = rawbundle::create(output_path)?;
        let mut manifest = Manifest::new(
            &self.shared.camera,
            settings.clone(),
            reference_timestamp,
            is_hdr,
            write_dng,
        );
        for (index, frame) in frames.iter().enumerate() {
            let record = FrameRecord::new(
                format!("frame{index}.raw"),
                &frame.metadata,
                frame.pixel_format,
                frame.width,
                frame.height,
                frame.row_stride,
            );
            writer.add_frame(&record, frame.pixel_bytes())?;
            manifest.frames.push(record);
        }
        writer.finish(&manifest)?;
        Ok(output_path.to_path_buf())
    }
}

/// Route matched frames: HDR bursts to the HDR collection, live
/// frames to the preview queue when it has room, everything else into
/// the ring.
fn route_matched(shared: &Shared, frames: Vec<RawFrame>) {
    for frame in frames {
        if frame.metadata.raw_type == RawType::Hdr {
            shared.hdr_frames.lock().push(frame);
            continue;
        }
        if shared.preview_enabled.load(Ordering::SeqCst) {
            let sender = shared.preview_tx.lock().clone();
            if let Some(sender) = sender {
                match sender.try_send(frame) {
                    Ok(()) => continue,
                    Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => {
                        shared.pool.return_frame(frame);
                        continue;
                    }
                }
            }
        }
        shared.pool.return_frame(frame);
    }
}

fn copy_worker(shared: Arc<Shared>, rx: Receiver<ConsumerItem>) {
    debug!("copy worker started");
    while shared.running.load(Ordering::SeqCst) {
        let item = match rx.recv_timeout(QUEUE_TIMEOUT) {
            Ok(item) => item,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                // Try to match buffers even if no image has arrived.
                route_matched(&shared, shared.pool.match_pending());
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };

        match item {
            ConsumerItem::Metadata(metadata) => {
                shared.pool.queue_metadata(metadata);
            }
            ConsumerItem::Image(image) => {
                if !shared.setup_started.swap(true, Ordering::SeqCst) {
                    let setup_shared = shared.clone();
                    let byte_len = image.data.len();
                    let handle = std::thread::Builder::new()
                        .name("setup-buffers".to_string())
                        .spawn(move || setup_buffers_worker(setup_shared, byte_len))
                        .expect("spawn setup-buffers worker");
                    shared.workers.lock().push(handle);
                    // Give the buffers thread a chance to create some
                    // buffers before the allocation below.
                    std::thread::sleep(Duration::from_millis(10));
                }

                let frame = shared.pool.allocate().or_else(|| {
                    // Matching has fallen behind; reclaim the oldest
                    // pending pixels as the copy target.
                    let stolen = shared.pool.steal_oldest_pending();
                    if stolen.is_some() {
                        warn!("pool exhausted, stealing oldest pending buffer");
                    }
                    stolen
                });
                let Some(mut frame) = frame else {
                    // Every buffer is locked; backpressure by dropping.
                    warn!("no buffer available, dropping frame {}", image.timestamp_ns);
                    continue;
                };

                if frame.data.len() < image.data.len() {
                    error!(
                        "unexpected driver image size {} for {}-byte buffers",
                        image.data.len(),
                        frame.data.len()
                    );
                    shared.pool.discard(frame);
                    continue;
                }

                frame.pixel_format = image.pixel_format;
                frame.width = image.width;
                frame.height = image.height;
                frame.row_stride = image.row_stride;
                frame.metadata = FrameMetadata {
                    timestamp_ns: image.timestamp_ns,
                    ..Default::default()
                };
                frame.data.bytes_mut()[..image.data.len()].copy_from_slice(&image.data);

                shared.pool.queue_pixels(frame);
            }
        }
        route_matched(&shared, shared.pool.match_pending());
    }
    debug!("copy worker exiting");
}

/// Grows the pool one buffer at a time until the memory budget is
/// reached. Runs once per session; stopping the consumer ends it
/// early.
fn setup_buffers_worker(shared: Arc<Shared>, byte_len: usize) {
    info!("setting up buffers ({byte_len} bytes each)");
    while shared.running.load(Ordering::SeqCst) && shared.pool.can_grow(byte_len) {
        if let Err(e) = shared.pool.add_buffers(1, byte_len) {
            debug!("stopping buffer setup: {e}");
            break;
        }
    }
    info!(
        "finished setting up buffers ({} total, {} bytes in use)",
        shared.pool.num_buffers(),
        shared.pool.memory_use_bytes()
    );
}

fn preview_worker(shared: Arc<Shared>, rx: Receiver<RawFrame>) {
    debug!("preview worker started");
    let profile = CameraProfile::new(&shared.camera);

    while shared.running.load(Ordering::SeqCst)
        && shared.preview_enabled.load(Ordering::SeqCst)
    {
        let frame = match rx.recv_timeout(QUEUE_TIMEOUT) {
            Ok(frame) => frame,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };

        match render_preview(&shared, &profile, &frame) {
            Ok((width, height, data)) => {
                shared.listener.on_preview_frame(width, height, &data);
            }
            Err(e) => debug!("preview skipped: {e}"),
        }
        shared.pool.return_frame(frame);
    }
    debug!("preview worker exiting");
}

fn render_preview(
    shared: &Shared,
    profile: &CameraProfile,
    frame: &RawFrame,
) -> Result<(usize, usize, Vec<u8>)> {
    let channels = kernels::deinterleave_raw(
        frame.pixel_bytes(),
        frame.pixel_format,
        frame.width as usize,
        frame.height as usize,
        frame.row_stride as usize,
        shared.camera.sensor_arrangement,
    )
    .map_err(|e| Error::Driver(e.to_string()))?;

    let settings = shared.preview_settings.lock().clone();
    let temperature = profile
        .temperature_from_neutral(frame.metadata.as_shot_neutral)
        .map(|t| {
            Temperature::new(
                t.temperature + settings.temperature_offset as f64,
                t.tint + settings.tint_offset as f64,
            )
        })
        .map_err(|e| Error::Driver(e.to_string()))?;
    let transform = profile.camera_to_pcs(&temperature);

    let mut tone = rawcam_types::PostProcessSettings::default();
    tone.shadows = settings.shadows;
    tone.contrast = settings.contrast;
    tone.saturation = settings.saturation;
    tone.blacks = settings.blacks;
    tone.white_point = settings.white_point;
    tone.sharpen0 = 0.0;
    tone.sharpen1 = 0.0;
    let params = kernels::ToneParams::from_settings(&tone);

    let downscale = shared.preview_downscale.load(Ordering::SeqCst);
    let (w, h, data) = kernels::preview(
        &channels,
        &frame.metadata,
        shared.camera.black_level,
        shared.camera.white_level,
        transform.camera_white,
        &(transform.pcs_to_srgb * transform.camera_to_pcs),
        &params,
        downscale,
    );
    Ok((w, h, data))
}
