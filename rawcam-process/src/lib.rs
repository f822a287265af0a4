//! Offline fusion and development of capture bundles.
//!
//! Consumes a bundle written by the capture path, registers the burst
//! with dense optical flow, fuses it in a complex-wavelet domain,
//! applies wavelet-shrinkage denoise, optionally merges an
//! underexposed frame for highlight recovery, then tonemaps and
//! color-corrects into an 8-bit sRGB image.

pub type Result<M> = std::result::Result<M, Error>;

pub mod color;
pub mod container;
pub mod denoise;
pub mod estimate;
pub mod exposure;
pub mod flow;
pub mod fuse;
pub mod hdr;
pub mod kernels;
pub mod plane;
pub mod processor;
pub mod wavelet;

pub use container::ProcessInput;
pub use processor::{
    process_bundle, process_in_memory, LogProgress, ProcessOutput, Processor, ProgressReporter,
};

/// Per-channel values are remapped to this range after fusion so the
/// denoise and post-process stages work on a fixed scale.
pub const EXPANDED_RANGE: f32 = 16384.0;

/// Largest acceptable ghost-mask error when merging an underexposed
/// frame.
pub const MAX_HDR_ERROR: f32 = 0.06;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Bundle {
        #[from]
        source: rawbundle::Error,
    },
    #[error("{source}")]
    Types {
        #[from]
        source: rawcam_types::Error,
    },
    #[error("bundle contains no frames")]
    EmptyBundle,
    #[error("unsupported pixel format {0} for processing")]
    UnsupportedPixelFormat(rawcam_types::PixelFormat),
    #[error("camera white balance vector is zero")]
    ZeroNeutral,
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("frame dimensions {got_w}x{got_h} do not match reference {want_w}x{want_h}")]
    DimensionMismatch {
        got_w: usize,
        got_h: usize,
        want_w: usize,
        want_h: usize,
    },
}

impl From<image::ImageError> for Error {
    fn from(orig: image::ImageError) -> Self {
        Error::Encode(orig.to_string())
    }
}
