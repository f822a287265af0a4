use std::path::Path;

use crate::events::{DriverExposureState, DriverFocusState, SessionState};

/// Host-application callbacks from the capture session.
///
/// All methods are invoked from session worker threads and must not
/// block; the default implementations ignore the notification.
pub trait SessionListener: Send + Sync {
    fn on_session_state(&self, state: SessionState) {
        let _ = state;
    }
    fn on_camera_error(&self, code: i32) {
        let _ = code;
    }
    fn on_camera_disconnected(&self) {}
    fn on_exposure_status(&self, iso: i32, exposure_ns: i64) {
        let _ = (iso, exposure_ns);
    }
    fn on_ae_state(&self, state: DriverExposureState) {
        let _ = state;
    }
    fn on_af_state(&self, state: DriverFocusState) {
        let _ = state;
    }
    fn on_preview_frame(&self, width: usize, height: usize, data: &[u8]) {
        let _ = (width, height, data);
    }
    fn on_hdr_progress(&self, percent: u8) {
        let _ = percent;
    }
    fn on_hdr_saved(&self, path: &Path) {
        let _ = path;
    }
    fn on_hdr_failed(&self) {}
}

/// Listener that ignores everything.
pub struct NullListener;

impl SessionListener for NullListener {}
