use std::path::PathBuf;

use rawcam_types::PostProcessSettings;

/// Driver capture-session lifecycle, as reported by its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Ready,
    Active,
}

/// Which submitted request stream a capture callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTag {
    Repeat,
    Hdr,
}

/// Driver-reported autofocus state, relayed to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFocusState {
    Inactive,
    PassiveScan,
    PassiveFocused,
    PassiveUnfocused,
    ActiveScan,
    FocusLocked,
    NotFocusLocked,
}

/// Driver-reported auto-exposure state, relayed to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExposureState {
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

/// Payload of a `CaptureHdr` command.
#[derive(Debug, Clone)]
pub struct HdrRequest {
    pub count: usize,
    pub base_iso: i32,
    pub base_exposure_ns: i64,
    pub hdr_iso: i32,
    pub hdr_exposure_ns: i64,
    pub settings: PostProcessSettings,
    pub output_path: PathBuf,
}

/// Everything the event loop dispatches on: user commands, driver
/// callbacks, and the shutdown control message.
#[derive(Debug, Clone)]
pub enum Event {
    // Commands.
    OpenCamera { setup_raw_preview: bool },
    CloseCamera,
    PauseCapture,
    ResumeCapture,
    SetAutoExposure,
    SetManualExposure { iso: i32, exposure_ns: i64 },
    SetExposureCompensation { value: f32 },
    SetAutoFocus,
    SetFocusPoint { x: f32, y: f32 },
    CaptureHdr(HdrRequest),

    // Internal events.
    SaveHdrData,

    // Driver callbacks.
    CameraError { code: i32 },
    CameraDisconnected,
    SessionStateChanged(SessionState),
    ExposureStatusChanged { iso: i32, exposure_ns: i64 },
    AeStateChanged(DriverExposureState),
    AfStateChanged(DriverFocusState),
    CaptureSequenceCompleted { tag: CaptureTag, sequence_id: i32 },
    CaptureSequenceAborted { tag: CaptureTag, sequence_id: i32 },
    CaptureFailed { tag: CaptureTag },
    BufferLost,

    // Control.
    Stop,
}
