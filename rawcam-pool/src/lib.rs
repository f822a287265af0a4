//! Bounded pool of raw frame buffers and the pixel/metadata matcher.
//!
//! All frame memory is created up front and lives for the whole capture
//! session. A frame moves between four disjoint states: `unused`
//! (available for allocation), `ring` (the timestamp-ordered
//! zero-shutter-lag window), `locked` (snapshotted by a [`LockHandle`])
//! and `pending` (pixels copied but metadata not yet matched). Pixel
//! data and metadata arrive on independent driver callbacks; a frame
//! becomes visible in the ring only after the matcher has joined the
//! two by sensor timestamp.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use rawcam_types::{FrameMetadata, PixelFormat};

pub type Result<M> = std::result::Result<M, Error>;

mod buffer;
pub use buffer::{HostBuffer, PixelBuffer};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("pool is closed to new buffers")]
    PoolClosed,
    #[error("adding {requested} bytes would exceed memory budget of {budget} bytes")]
    MemoryBudgetExceeded { requested: usize, budget: usize },
}

/// One pooled frame: a fixed-capacity pixel region plus its descriptive
/// header.
pub struct RawFrame {
    pub data: Box<dyn PixelBuffer>,
    pub metadata: FrameMetadata,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub row_stride: u32,
}

impl RawFrame {
    fn with_capacity(byte_len: usize) -> Self {
        Self {
            data: Box::new(HostBuffer::new(byte_len)),
            metadata: FrameMetadata::default(),
            pixel_format: PixelFormat::Raw10,
            width: 0,
            height: 0,
            row_stride: 0,
        }
    }

    /// Valid pixel bytes, `row_stride * height` of them.
    pub fn pixel_bytes(&self) -> &[u8] {
        let n = (self.row_stride as usize) * (self.height as usize);
        &self.data.bytes()[..n]
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("timestamp_ns", &self.metadata.timestamp_ns)
            .field("pixel_format", &self.pixel_format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_stride", &self.row_stride)
            .finish()
    }
}

struct PoolInner {
    max_memory_bytes: usize,
    memory_use_bytes: usize,
    num_buffers: usize,
    sealed: bool,

    unused: Vec<RawFrame>,
    ring: BTreeMap<i64, RawFrame>,
    locked_count: usize,

    pending_pixels: BTreeMap<i64, RawFrame>,
    pending_metadata: VecDeque<FrameMetadata>,
}

impl PoolInner {
    fn evict_oldest(&mut self) -> Option<RawFrame> {
        let oldest = *self.ring.keys().next()?;
        self.ring.remove(&oldest)
    }
}

/// Handle to the pool, cloneable across worker threads. All operations
/// take the single internal mutex.
#[derive(Clone)]
pub struct SharedPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl SharedPool {
    pub fn new(max_memory_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                max_memory_bytes,
                memory_use_bytes: 0,
                num_buffers: 0,
                sealed: false,
                unused: Vec::new(),
                ring: BTreeMap::new(),
                locked_count: 0,
                pending_pixels: BTreeMap::new(),
                pending_metadata: VecDeque::new(),
            })),
        }
    }

    /// Grow the pool by `n` buffers of `byte_len` bytes each.
    ///
    /// Fails once the pool has been sealed by session activity, or when
    /// the new total would exceed the memory budget.
    pub fn add_buffers(&self, n: usize, byte_len: usize) -> Result<()> {
        let mut pool = self.inner.lock();
        if pool.sealed {
            return Err(Error::PoolClosed);
        }
        let requested = n * byte_len;
        if pool.memory_use_bytes + requested > pool.max_memory_bytes {
            return Err(Error::MemoryBudgetExceeded {
                requested,
                budget: pool.max_memory_bytes,
            });
        }
        for _ in 0..n {
            pool.unused.push(RawFrame::with_capacity(byte_len));
        }
        pool.memory_use_bytes += requested;
        pool.num_buffers += n;
        debug!(
            "pool grown to {} buffers, {} bytes",
            pool.num_buffers, pool.memory_use_bytes
        );
        Ok(())
    }

    /// Forbid further growth.
    pub fn seal(&self) {
        self.inner.lock().sealed = true;
    }

    pub fn num_buffers(&self) -> usize {
        self.inner.lock().num_buffers
    }

    pub fn memory_use_bytes(&self) -> usize {
        self.inner.lock().memory_use_bytes
    }

    /// Whether the memory budget has room for another buffer of
    /// `byte_len` bytes.
    pub fn can_grow(&self, byte_len: usize) -> bool {
        let pool = self.inner.lock();
        !pool.sealed && pool.memory_use_bytes + byte_len <= pool.max_memory_bytes
    }

    /// Take a buffer for the next incoming image: an unused one if
    /// available, otherwise the oldest ring entry. `None` when every
    /// buffer is locked or pending.
    pub fn allocate(&self) -> Option<RawFrame> {
        let mut pool = self.inner.lock();
        if let Some(frame) = pool.unused.pop() {
            return Some(frame);
        }
        pool.evict_oldest()
    }

    /// Move `frame` into the ring, keyed by its metadata timestamp. A
    /// same-timestamp entry is replaced and the displaced frame goes to
    /// `unused`.
    pub fn return_frame(&self, frame: RawFrame) {
        let mut pool = self.inner.lock();
        let ts = frame.metadata.timestamp_ns;
        if let Some(displaced) = pool.ring.insert(ts, frame) {
            warn!("duplicate ring timestamp {ts}, discarding displaced frame");
            pool.unused.push(displaced);
        }
    }

    /// Move `frame` to `unused`.
    pub fn discard(&self, frame: RawFrame) {
        self.inner.lock().unused.push(frame);
    }

    /// Atomically snapshot the whole ring. Sealing the pool: the first
    /// lock marks the start of session activity observing the pool.
    pub fn lock_all(&self) -> LockHandle {
        let mut pool = self.inner.lock();
        pool.sealed = true;
        let ring = std::mem::take(&mut pool.ring);
        let frames: Vec<RawFrame> = ring.into_values().collect();
        pool.locked_count += frames.len();
        LockHandle {
            pool: self.clone(),
            frames,
        }
    }

    /// Snapshot only the newest ring entry.
    pub fn lock_latest(&self) -> LockHandle {
        let mut pool = self.inner.lock();
        pool.sealed = true;
        let newest = pool.ring.keys().next_back().copied();
        let frames = match newest {
            Some(ts) => {
                // Key was just observed under the same lock.
                let frame = pool.ring.remove(&ts).unwrap();
                vec![frame]
            }
            None => vec![],
        };
        pool.locked_count += frames.len();
        LockHandle {
            pool: self.clone(),
            frames,
        }
    }

    /// Number of frames currently visible in the ring.
    pub fn ring_len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn ring_timestamps(&self) -> Vec<i64> {
        self.inner.lock().ring.keys().copied().collect()
    }

    // ---------------------------
    // matcher

    /// Insert pixels that arrived from the driver, keyed by timestamp.
    /// A driver replay with the same timestamp discards the previous
    /// entry back to `unused`.
    pub fn queue_pixels(&self, frame: RawFrame) {
        let mut pool = self.inner.lock();
        let ts = frame.metadata.timestamp_ns;
        if let Some(old) = pool.pending_pixels.insert(ts, frame) {
            warn!("duplicate pending pixels for timestamp {ts}");
            pool.unused.push(old);
        }
    }

    /// Queue metadata from the driver's capture-completed callback.
    pub fn queue_metadata(&self, metadata: FrameMetadata) {
        self.inner.lock().pending_metadata.push_back(metadata);
    }

    /// Sweep pending metadata against pending pixels. Returns the
    /// joined frames, metadata attached, in metadata-arrival order. The
    /// caller routes each frame (ring, preview, HDR collection).
    ///
    /// Metadata whose pixels never arrive is aged out once more than
    /// `2 * num_buffers` entries are pending.
    pub fn match_pending(&self) -> Vec<RawFrame> {
        let mut pool = self.inner.lock();
        let mut matched = Vec::new();

        let mut remaining = VecDeque::with_capacity(pool.pending_metadata.len());
        while let Some(metadata) = pool.pending_metadata.pop_front() {
            match pool.pending_pixels.remove(&metadata.timestamp_ns) {
                Some(mut frame) => {
                    frame.metadata = metadata;
                    matched.push(frame);
                }
                None => remaining.push_back(metadata),
            }
        }
        pool.pending_metadata = remaining;

        let limit = 2 * pool.num_buffers;
        while pool.pending_metadata.len() > limit {
            let aged = pool.pending_metadata.pop_front();
            if let Some(aged) = aged {
                debug!(
                    "dropping orphan metadata for timestamp {}",
                    aged.timestamp_ns
                );
            }
        }

        matched
    }

    /// Oldest pending-pixels entry, reclaimed as an allocation target
    /// when the pool is exhausted.
    pub fn steal_oldest_pending(&self) -> Option<RawFrame> {
        let mut pool = self.inner.lock();
        let oldest = *pool.pending_pixels.keys().next()?;
        pool.pending_pixels.remove(&oldest)
    }

    pub fn pending_metadata_len(&self) -> usize {
        self.inner.lock().pending_metadata.len()
    }

    pub fn pending_pixels_len(&self) -> usize {
        self.inner.lock().pending_pixels.len()
    }

    fn unlock_frames(&self, frames: Vec<RawFrame>) {
        let mut pool = self.inner.lock();
        pool.locked_count -= frames.len();
        // Snapshotting made the ring obsolete; locked frames are
        // consumed, never returned to the ring.
        pool.unused.extend(frames);
    }
}

/// Snapshot of ring frames taken by [`SharedPool::lock_all`] or
/// [`SharedPool::lock_latest`]. Dropping the handle returns every frame
/// to `unused`.
pub struct LockHandle {
    pool: SharedPool,
    frames: Vec<RawFrame>,
}

impl LockHandle {
    /// Locked frames, ordered by timestamp.
    pub fn frames(&self) -> &[RawFrame] {
        &self.frames
    }

    pub fn get_by_timestamp(&self, timestamp_ns: i64) -> Option<&RawFrame> {
        self.frames
            .iter()
            .find(|f| f.metadata.timestamp_ns == timestamp_ns)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let frames = std::mem::take(&mut self.frames);
        self.pool.unlock_frames(frames);
    }
}

fn _test_shared_pool_is_send_sync() {
    fn implements<T: Send + Sync>() {}
    implements::<SharedPool>();
}
