use tracing::debug;

use rawcam_types::CameraDescription;

use crate::driver::CameraDriver;
use crate::events::SessionState;
use crate::request::{AfMode, CaptureRequest, ExposureMode, Region, Trigger};
use crate::Result;

/// AF/AE trigger sequencing state.
///
/// The `Wait` states cover the gap between stopping the previous
/// repeating request and the session turning Ready; the `Trigger`
/// states cover the single AF-trigger capture; the `Locked` states
/// wait for the session to go Active with the repeating request
/// installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusState {
    AutoActive,
    AutoWait,
    TriggerAuto,
    AutoLocked,
    UserWait,
    TriggerUser,
    UserLocked,
    UserActive,
    Paused,
}

/// One-deep queue of user requests arriving while the machine is
/// mid-transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PendingAction {
    None,
    RequestAutoFocus,
    RequestUserFocus { x: f32, y: f32 },
}

const USER_FOCUS_EXTENT: f32 = 0.125;
const AUTO_FOCUS_EXTENT: f32 = 0.25;

/// Drives the camera's focus and exposure through the driver, one
/// trigger sequence at a time. Only ever touched from the event loop
/// thread.
pub struct CameraStateManager {
    camera: CameraDescription,
    state: FocusState,
    pending: PendingAction,
    mode: ExposureMode,
    exposure_compensation: i32,
    focus_x: f32,
    focus_y: f32,
    repeat_sequence: Option<i32>,
    last_request: Option<CaptureRequest>,
}

impl CameraStateManager {
    pub fn new(camera: CameraDescription) -> Self {
        Self {
            camera,
            state: FocusState::AutoActive,
            pending: PendingAction::None,
            mode: ExposureMode::Auto,
            exposure_compensation: 0,
            focus_x: 0.5,
            focus_y: 0.5,
            repeat_sequence: None,
            last_request: None,
        }
    }

    pub fn state(&self) -> FocusState {
        self.state
    }

    /// The most recent request handed to the driver.
    pub fn last_request(&self) -> Option<&CaptureRequest> {
        self.last_request.as_ref()
    }

    fn set_state(&mut self, state: FocusState) {
        debug!("focus state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn set_pending(&mut self, action: PendingAction) {
        debug!("pending action {:?} -> {:?}", self.pending, action);
        self.pending = action;
    }

    /// Begin the initial AF sequence after the camera opens.
    pub fn start(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        self.set_state(FocusState::AutoWait);
        self.trigger_auto_focus(driver)
    }

    /// Build the trigger request common to both focus paths.
    fn trigger_request(&self, x: f32, y: f32, extent: f32) -> CaptureRequest {
        let mut request = CaptureRequest::zero_shutter_lag(&self.camera);
        request.af_mode = AfMode::Auto;
        request.af_trigger = Trigger::Start;
        let region = Region::centered(&self.camera, x, y, extent);
        request.af_regions = Some(region);

        request.set_exposure(self.mode, self.exposure_compensation);
        if matches!(self.mode, ExposureMode::Auto) {
            request.ae_precapture_trigger = Trigger::Start;
            if self.camera.max_ae_regions > 0 {
                request.ae_regions = Some(region);
            }
        } else {
            request.ae_precapture_trigger = Trigger::Idle;
            request.ae_regions = None;
        }
        request
    }

    fn trigger_auto_focus(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        let request = self.trigger_request(0.5, 0.5, AUTO_FOCUS_EXTENT);
        debug!("trigger auto focus");
        self.repeat_sequence = Some(driver.submit_capture(&request)?);
        self.last_request = Some(request);
        Ok(())
    }

    fn trigger_user_focus(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        let request = self.trigger_request(self.focus_x, self.focus_y, USER_FOCUS_EXTENT);
        debug!("trigger user focus ({}, {})", self.focus_x, self.focus_y);
        self.repeat_sequence = Some(driver.submit_capture(&request)?);
        self.last_request = Some(request);
        Ok(())
    }

    /// Install the continuous-AF repeating request.
    fn set_auto_focus(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        let mut request = CaptureRequest::zero_shutter_lag(&self.camera);
        request.af_mode = AfMode::ContinuousPicture;
        request.af_trigger = Trigger::Idle;
        request.ae_precapture_trigger = Trigger::Idle;
        request.set_exposure(self.mode, self.exposure_compensation);

        debug!("set auto focus (repeating)");
        self.set_state(FocusState::AutoActive);
        self.repeat_sequence = Some(driver.submit_repeating(&request)?);
        self.last_request = Some(request);
        Ok(())
    }

    /// Install the locked-focus repeating request after a user
    /// trigger.
    fn set_user_focus(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        let mut request = CaptureRequest::zero_shutter_lag(&self.camera);
        request.af_mode = AfMode::Auto;
        request.af_trigger = Trigger::Idle;
        request.ae_precapture_trigger = Trigger::Idle;
        request.af_regions = Some(Region::centered(
            &self.camera,
            self.focus_x,
            self.focus_y,
            USER_FOCUS_EXTENT,
        ));
        request.set_exposure(self.mode, self.exposure_compensation);

        debug!("set user focus (repeating)");
        self.repeat_sequence = Some(driver.submit_repeating(&request)?);
        self.last_request = Some(request);
        Ok(())
    }

    pub fn request_user_focus(
        &mut self,
        x: f32,
        y: f32,
        driver: &mut dyn CameraDriver,
    ) -> Result<()> {
        self.focus_x = x;
        self.focus_y = y;

        if matches!(self.state, FocusState::AutoActive | FocusState::UserActive) {
            self.set_state(FocusState::UserWait);
            driver.stop_repeating()?;
        } else {
            self.set_pending(PendingAction::RequestUserFocus { x, y });
        }
        Ok(())
    }

    pub fn request_auto_focus(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        self.focus_x = 0.5;
        self.focus_y = 0.5;

        if self.state == FocusState::AutoActive {
            return Ok(());
        }
        if self.state == FocusState::UserActive {
            self.set_state(FocusState::AutoWait);
            driver.stop_repeating()?;
        } else {
            self.set_pending(PendingAction::RequestAutoFocus);
        }
        Ok(())
    }

    /// Update exposure compensation, re-issuing the repeating request
    /// when one is installed.
    pub fn request_exposure_compensation(
        &mut self,
        compensation: i32,
        driver: &mut dyn CameraDriver,
    ) -> Result<()> {
        if self.exposure_compensation == compensation {
            return Ok(());
        }
        debug!("exposure compensation {compensation}");
        self.exposure_compensation = compensation;
        self.reissue_repeat(driver)
    }

    pub fn request_auto_exposure(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        self.mode = ExposureMode::Auto;
        self.reissue_repeat(driver)
    }

    pub fn request_manual_exposure(
        &mut self,
        iso: i32,
        exposure_ns: i64,
        driver: &mut dyn CameraDriver,
    ) -> Result<()> {
        self.mode = ExposureMode::Manual { iso, exposure_ns };
        self.reissue_repeat(driver)
    }

    fn reissue_repeat(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        match self.state {
            FocusState::AutoActive => self.set_auto_focus(driver),
            FocusState::UserLocked | FocusState::UserActive => self.set_user_focus(driver),
            _ => Ok(()),
        }
    }

    pub fn pause(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        debug!("pause capture");
        self.set_state(FocusState::Paused);
        driver.stop_repeating()
    }

    pub fn resume(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        if self.state == FocusState::Paused {
            debug!("resume capture");
            self.set_state(FocusState::AutoWait);
            self.trigger_auto_focus(driver)?;
        }
        Ok(())
    }

    fn next_action(&mut self, driver: &mut dyn CameraDriver) -> Result<()> {
        let action = self.pending;
        self.set_pending(PendingAction::None);
        match action {
            PendingAction::None => Ok(()),
            PendingAction::RequestAutoFocus => self.request_auto_focus(driver),
            PendingAction::RequestUserFocus { x, y } => self.request_user_focus(x, y, driver),
        }
    }

    /// Session lifecycle transitions: Ready fires the next step of the
    /// trigger sequence, Active finishes it and drains the pending
    /// action.
    pub fn on_session_state_changed(
        &mut self,
        session_state: SessionState,
        driver: &mut dyn CameraDriver,
    ) -> Result<()> {
        match session_state {
            SessionState::Ready => match self.state {
                FocusState::TriggerUser => self.trigger_user_focus(driver),
                FocusState::TriggerAuto => self.trigger_auto_focus(driver),
                FocusState::AutoLocked => self.set_auto_focus(driver),
                FocusState::UserLocked => self.set_user_focus(driver),
                _ => Ok(()),
            },
            SessionState::Active => {
                match self.state {
                    FocusState::AutoLocked => self.set_state(FocusState::AutoActive),
                    FocusState::UserLocked => self.set_state(FocusState::UserActive),
                    _ => {}
                }
                if self.pending != PendingAction::None {
                    self.next_action(driver)?;
                }
                Ok(())
            }
            SessionState::Closed => Ok(()),
        }
    }

    /// Repeat-sequence completion walks the trigger ladder.
    pub fn on_capture_sequence_completed(&mut self, sequence_id: i32) {
        if self.repeat_sequence != Some(sequence_id) {
            return;
        }
        match self.state {
            FocusState::UserWait => self.set_state(FocusState::TriggerUser),
            FocusState::TriggerUser => self.set_state(FocusState::UserLocked),
            FocusState::AutoWait => self.set_state(FocusState::TriggerAuto),
            FocusState::TriggerAuto => self.set_state(FocusState::AutoLocked),
            FocusState::AutoActive => self.set_state(FocusState::AutoWait),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverSink, SessionOutputs};
    use crate::request::AeMode;

    /// Driver that records submissions and never calls back.
    #[derive(Default)]
    struct RecordingDriver {
        captures: Vec<CaptureRequest>,
        repeats: Vec<CaptureRequest>,
        stops: usize,
        next_sequence: i32,
    }

    impl CameraDriver for RecordingDriver {
        fn describe(&self) -> Result<CameraDescription> {
            Ok(CameraDescription::default())
        }
        fn open(&mut self, _outputs: &SessionOutputs, _sink: DriverSink) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn submit_capture(&mut self, request: &CaptureRequest) -> Result<i32> {
            self.captures.push(request.clone());
            self.next_sequence += 1;
            Ok(self.next_sequence)
        }
        fn submit_burst(&mut self, _requests: &[CaptureRequest]) -> Result<i32> {
            self.next_sequence += 1;
            Ok(self.next_sequence)
        }
        fn submit_repeating(&mut self, request: &CaptureRequest) -> Result<i32> {
            self.repeats.push(request.clone());
            self.next_sequence += 1;
            Ok(self.next_sequence)
        }
        fn stop_repeating(&mut self) -> Result<()> {
            self.stops += 1;
            Ok(())
        }
    }

    fn manager() -> (CameraStateManager, RecordingDriver) {
        (
            CameraStateManager::new(CameraDescription::default()),
            RecordingDriver::default(),
        )
    }

    /// Walk one full trigger ladder: sequence completion, Ready
    /// re-trigger, sequence completion, Ready repeat install, Active.
    fn complete_auto_sequence(state: &mut CameraStateManager, driver: &mut RecordingDriver) {
        state.on_capture_sequence_completed(driver.next_sequence);
        state
            .on_session_state_changed(SessionState::Ready, driver)
            .unwrap();
        state.on_capture_sequence_completed(driver.next_sequence);
        state
            .on_session_state_changed(SessionState::Ready, driver)
            .unwrap();
        state
            .on_session_state_changed(SessionState::Active, driver)
            .unwrap();
    }

    #[test]
    fn open_sequence_lands_in_auto_active() {
        let (mut state, mut driver) = manager();
        state.start(&mut driver).unwrap();
        assert_eq!(state.state(), FocusState::AutoWait);

        complete_auto_sequence(&mut state, &mut driver);
        assert_eq!(state.state(), FocusState::AutoActive);
        assert_eq!(driver.captures.len(), 2);
        assert_eq!(driver.repeats.len(), 1);

        // The initial trigger centers on the sensor with the wide
        // extent.
        let first = &driver.captures[0];
        assert_eq!(first.af_trigger, Trigger::Start);
        let region = first.af_regions.unwrap();
        let camera = CameraDescription::default();
        assert!(region.contains(
            camera.sensor_size.width / 2,
            camera.sensor_size.height / 2
        ));
    }

    #[test]
    fn user_focus_lands_in_user_active_with_region() {
        let (mut state, mut driver) = manager();
        state.start(&mut driver).unwrap();
        complete_auto_sequence(&mut state, &mut driver);

        state.request_user_focus(0.3, 0.7, &mut driver).unwrap();
        assert_eq!(state.state(), FocusState::UserWait);
        assert_eq!(driver.stops, 1);

        // Repeat stop completes, the session goes Ready, the user
        // trigger fires, completes, Ready installs the locked repeat,
        // Active finishes.
        state.on_capture_sequence_completed(driver.next_sequence);
        assert_eq!(state.state(), FocusState::TriggerUser);
        state
            .on_session_state_changed(SessionState::Ready, &mut driver)
            .unwrap();
        state.on_capture_sequence_completed(driver.next_sequence);
        assert_eq!(state.state(), FocusState::UserLocked);
        state
            .on_session_state_changed(SessionState::Ready, &mut driver)
            .unwrap();
        state
            .on_session_state_changed(SessionState::Active, &mut driver)
            .unwrap();
        assert_eq!(state.state(), FocusState::UserActive);

        let camera = CameraDescription::default();
        let px = (camera.sensor_size.width as f32 * 0.3) as i32;
        let py = (camera.sensor_size.height as f32 * 0.7) as i32;
        let repeat = driver.repeats.last().unwrap();
        assert_eq!(repeat.af_mode, AfMode::Auto);
        assert!(repeat.af_regions.unwrap().contains(px, py));
        assert_eq!(state.last_request(), Some(repeat));
    }

    #[test]
    fn focus_request_mid_transition_is_queued() {
        let (mut state, mut driver) = manager();
        state.start(&mut driver).unwrap();
        // Still in AutoWait: the request must queue, not execute.
        state.request_user_focus(0.2, 0.2, &mut driver).unwrap();
        assert_eq!(state.state(), FocusState::AutoWait);
        assert_eq!(driver.stops, 0);

        complete_auto_sequence(&mut state, &mut driver);
        // Draining the pending action moved the machine toward user
        // focus.
        assert_eq!(state.state(), FocusState::UserWait);
        assert_eq!(driver.stops, 1);
    }

    #[test]
    fn request_auto_focus_is_noop_when_already_auto() {
        let (mut state, mut driver) = manager();
        state.start(&mut driver).unwrap();
        complete_auto_sequence(&mut state, &mut driver);

        let repeats_before = driver.repeats.len();
        state.request_auto_focus(&mut driver).unwrap();
        assert_eq!(state.state(), FocusState::AutoActive);
        assert_eq!(driver.repeats.len(), repeats_before);
    }

    #[test]
    fn pause_and_resume_retrigger_autofocus() {
        let (mut state, mut driver) = manager();
        state.start(&mut driver).unwrap();
        complete_auto_sequence(&mut state, &mut driver);

        state.pause(&mut driver).unwrap();
        assert_eq!(state.state(), FocusState::Paused);
        assert_eq!(driver.stops, 1);

        // User focus while paused queues.
        state.request_user_focus(0.1, 0.1, &mut driver).unwrap();
        assert_eq!(state.state(), FocusState::Paused);

        state.resume(&mut driver).unwrap();
        assert_eq!(state.state(), FocusState::AutoWait);
        assert_eq!(driver.captures.len(), 3);
    }

    #[test]
    fn exposure_compensation_reissues_repeat_when_active() {
        let (mut state, mut driver) = manager();
        state.start(&mut driver).unwrap();
        complete_auto_sequence(&mut state, &mut driver);

        state.request_exposure_compensation(6, &mut driver).unwrap();
        let repeat = driver.repeats.last().unwrap();
        assert_eq!(repeat.exposure_compensation, 6);

        // Same value again is a no-op.
        let count = driver.repeats.len();
        state.request_exposure_compensation(6, &mut driver).unwrap();
        assert_eq!(driver.repeats.len(), count);
    }

    #[test]
    fn manual_exposure_disables_ae_on_repeat() {
        let (mut state, mut driver) = manager();
        state.start(&mut driver).unwrap();
        complete_auto_sequence(&mut state, &mut driver);

        state
            .request_manual_exposure(1600, 33_000_000, &mut driver)
            .unwrap();
        let repeat = driver.repeats.last().unwrap();
        assert_eq!(repeat.ae_mode, AeMode::Off);
        assert_eq!(repeat.iso, Some(1600));
        assert_eq!(repeat.exposure_time_ns, Some(33_000_000));

        // While manual, triggers keep the AE precapture idle.
        state.request_user_focus(0.5, 0.5, &mut driver).unwrap();
        state.on_capture_sequence_completed(driver.next_sequence);
        state
            .on_session_state_changed(SessionState::Ready, &mut driver)
            .unwrap();
        let trigger = driver.captures.last().unwrap();
        assert_eq!(trigger.ae_precapture_trigger, Trigger::Idle);
    }

    #[test]
    fn stale_sequence_ids_are_ignored() {
        let (mut state, mut driver) = manager();
        state.start(&mut driver).unwrap();
        assert_eq!(state.state(), FocusState::AutoWait);
        state.on_capture_sequence_completed(9999);
        assert_eq!(state.state(), FocusState::AutoWait);
    }
}
