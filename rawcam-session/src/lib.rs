//! Real-time capture session: camera lifecycle, focus/exposure state
//! machine, zero-shutter-lag buffering and HDR burst capture.
//!
//! The session is an actor. Driver callbacks and user commands are
//! marshalled into [`Event`]s on a single queue; one dedicated loop
//! thread owns the driver, the state machine and all session state, so
//! none of it is ever touched by two threads. Pixel copies run on the
//! image consumer's workers and synchronize only through the buffer
//! pool's mutex.

pub type Result<M> = std::result::Result<M, Error>;

mod consumer;
mod driver;
mod events;
pub mod fake;
mod listener;
mod request;
mod session;
mod state;

pub use consumer::{ConsumerItem, ImageConsumer, PreviewSettings};
pub use driver::{CameraDriver, CaptureResult, DriverImage, DriverSink, SessionOutputs};
pub use events::{
    CaptureTag, DriverExposureState, DriverFocusState, Event, HdrRequest, SessionState,
};
pub use listener::{NullListener, SessionListener};
pub use request::{AeMode, AfMode, CaptureRequest, ExposureMode, Region, Trigger};
pub use session::{CameraSession, SessionConfig};
pub use state::{CameraStateManager, FocusState, PendingAction};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("camera driver error: {0}")]
    Driver(String),
    #[error("session is not open")]
    NotOpen,
    #[error("no frames available to save")]
    NothingToSave,
    #[error("{source}")]
    Bundle {
        #[from]
        source: rawbundle::Error,
    },
}

fn _test_error_is_send() {
    fn implements<T: Send>() {}
    implements::<Error>();
}
