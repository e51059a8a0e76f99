//! Capture lifecycle: configure the device, run acquisition, tear down.
//!
//! ```text
//! Idle --start--> Configuring --ok--> Active --stop--> Idle
//!                      |
//!                      +--failure--> Idle
//! ```
//!
//! One mutex covers `start`, `stop` and the whole of `next_frame`, including
//! its frame-ready wait, so the device is never torn down during a wait.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};

use crate::cursor::{AcquisitionCursor, FrameGeometry, FRAME_WAIT_TIMEOUT};
use crate::frame::RawFrame;
use crate::pool::FrameSlotPool;
use crate::settings::CaptureSettings;
use crate::traits::{AntiFlickerMode, CameraError, CameraHandle, CameraSdk, ColorFormat, Result, SlotId};

/// Layout the hardware writes into the slots.
pub const CAPTURE_FORMAT: ColorFormat = ColorFormat::Uyvy;

/// Anti-flicker compensation applied at start.
pub const ANTI_FLICKER: AntiFlickerMode = AntiFlickerMode::Fixed50Hz;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No device open, no buffers held.
    Idle,
    /// `start` is applying settings.
    Configuring,
    /// Frames are being captured.
    Active,
}

struct Session {
    state: CaptureState,
    handle: Option<CameraHandle>,
    pool: Option<FrameSlotPool>,
    geometry: Option<FrameGeometry>,
    cursor: AcquisitionCursor,
    actual_fps: Option<f64>,
}

/// Owns the driver and sequences device setup, acquisition and teardown.
pub struct CaptureLifecycle<S: CameraSdk> {
    sdk: S,
    session: Mutex<Session>,
}

impl<S: CameraSdk> CaptureLifecycle<S> {
    /// Idle lifecycle over a driver.
    pub fn new(sdk: S) -> Self {
        Self::with_frame_timeout(sdk, FRAME_WAIT_TIMEOUT)
    }

    /// Idle lifecycle with a custom frame-ready wait bound.
    pub fn with_frame_timeout(sdk: S, timeout: Duration) -> Self {
        Self {
            sdk,
            session: Mutex::new(Session {
                state: CaptureState::Idle,
                handle: None,
                pool: None,
                geometry: None,
                cursor: AcquisitionCursor::with_timeout(timeout),
                actual_fps: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Underlying driver.
    pub fn sdk(&self) -> &S {
        &self.sdk
    }

    /// Name of the capture backend.
    pub fn capture_method_name(&self) -> &'static str {
        self.sdk.name()
    }

    /// Current state.
    pub fn state(&self) -> CaptureState {
        self.lock().state
    }

    /// Whether frames are being captured.
    pub fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Active
    }

    /// Number of slots currently held.
    pub fn live_slots(&self) -> usize {
        self.lock().pool.as_ref().map_or(0, FrameSlotPool::len)
    }

    /// Slot ids currently held.
    pub fn slot_ids(&self) -> Vec<SlotId> {
        self.lock()
            .pool
            .as_ref()
            .map(|pool| pool.slot_ids().collect())
            .unwrap_or_default()
    }

    /// Frame rate the device reported at the last start.
    pub fn actual_frame_rate(&self) -> Option<f64> {
        self.lock().actual_fps
    }

    /// Open the camera, build the slot pool and begin continuous capture.
    ///
    /// On failure no device handle or buffer stays held and the state is `Idle`.
    pub fn start(&self, settings: &CaptureSettings) -> Result<()> {
        let mut session = self.lock();
        if session.state == CaptureState::Active {
            return Err(CameraError::AlreadyCapturing);
        }
        settings.validate()?;

        info!(
            "{}: starting capture on camera {}",
            self.sdk.name(),
            settings.camera_id
        );
        let handle = self.sdk.device_init(settings.camera_id)?;
        session.state = CaptureState::Configuring;

        match self.configure(handle, settings) {
            Ok((pool, actual_fps)) => {
                session.handle = Some(handle);
                session.pool = Some(pool);
                session.geometry = Some(FrameGeometry {
                    width: settings.width,
                    height: settings.height,
                    format: CAPTURE_FORMAT,
                });
                session.actual_fps = Some(actual_fps);
                session.cursor.reset();
                session.state = CaptureState::Active;
                info!(
                    "{}: capturing {}x{} {} at {actual_fps:.2} fps",
                    self.sdk.name(),
                    settings.width,
                    settings.height,
                    CAPTURE_FORMAT
                );
                Ok(())
            }
            Err(err) => {
                if let Err(exit_err) = self.sdk.device_exit(handle) {
                    warn!("Failed to close camera after aborted start: {exit_err}");
                }
                session.state = CaptureState::Idle;
                Err(err)
            }
        }
    }

    /// Halt capture, free the slots and close the camera.
    ///
    /// Safe to call while idle. Teardown continues past individual failures
    /// and reports the first one.
    pub fn stop(&self) -> Result<()> {
        let mut session = self.lock();
        session.cursor.reset();
        session.geometry = None;
        session.actual_fps = None;
        session.state = CaptureState::Idle;

        let Some(handle) = session.handle.take() else {
            debug!("stop: already idle");
            return Ok(());
        };

        let mut first_error = None;
        if let Err(err) = self.sdk.stop_capture(handle) {
            warn!("Failed to stop capture: {err}");
            first_error.get_or_insert(err);
        }
        if let Some(pool) = session.pool.take() {
            if let Err(err) = pool.release(&self.sdk, handle) {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.sdk.device_exit(handle) {
            warn!("Failed to close camera: {err}");
            first_error.get_or_insert(err);
        }

        info!("{}: capture stopped", self.sdk.name());
        first_error.map_or(Ok(()), Err)
    }

    /// Most recently completed frame.
    ///
    /// Blocks for at most the frame wait timeout. When no new frame arrived,
    /// the previous frame is returned again with `fresh == false`.
    pub fn next_frame(&self) -> Result<RawFrame<'_>> {
        let mut session = self.lock();
        let (CaptureState::Active, Some(handle), Some(geometry)) =
            (session.state, session.handle, session.geometry)
        else {
            return Err(CameraError::NotCapturing);
        };
        session.cursor.next_frame(&self.sdk, handle, geometry)
    }

    fn configure(
        &self,
        handle: CameraHandle,
        settings: &CaptureSettings,
    ) -> Result<(FrameSlotPool, f64)> {
        self.select_format(handle, settings);
        self.sdk
            .set_region_of_interest(handle, settings.region_of_interest())?;

        let pool = FrameSlotPool::allocate(
            &self.sdk,
            handle,
            settings.width,
            settings.height,
            CAPTURE_FORMAT.bit_depth(),
        )?;

        let actual_fps = match self.apply_controls(handle, settings) {
            Ok(actual_fps) => actual_fps,
            Err(err) => {
                if let Err(release_err) = pool.release(&self.sdk, handle) {
                    warn!("Failed to release slots after aborted start: {release_err}");
                }
                return Err(err);
            }
        };

        if let Err(err) = self
            .sdk
            .set_edge_enhancement(handle, settings.edge_enhancement)
        {
            warn!(
                "Edge enhancement {} not applied: {err}",
                settings.edge_enhancement
            );
        }

        Ok((pool, actual_fps))
    }

    fn select_format(&self, handle: CameraHandle, settings: &CaptureSettings) {
        let formats = match self.sdk.query_format_list(handle) {
            Ok(formats) => formats,
            Err(err) => {
                warn!("Could not query resolutions, using device default: {err}");
                return;
            }
        };

        let Some(format) = formats
            .iter()
            .find(|format| format.width == settings.width && format.height == settings.height)
        else {
            warn!(
                "Unsupported resolution: {}x{}; continuing with the device-selected format",
                settings.width, settings.height
            );
            return;
        };

        match self.sdk.set_image_format(handle, format.format_id) {
            Ok(()) => debug!(
                "Selected format {} ({}x{})",
                format.format_id, format.width, format.height
            ),
            Err(err) => warn!("Failed to select format {}: {err}", format.format_id),
        }
    }

    fn apply_controls(&self, handle: CameraHandle, settings: &CaptureSettings) -> Result<f64> {
        self.sdk.set_exposure(handle, settings.exposure_ms)?;
        self.sdk.set_gains(handle, settings.gains())?;
        self.sdk.set_anti_flicker(handle, ANTI_FLICKER)?;
        self.sdk.set_color_mode(handle, CAPTURE_FORMAT)?;
        let actual_fps = self.sdk.set_frame_rate(handle, settings.fps)?;
        if (actual_fps - settings.fps).abs() > 0.01 {
            info!(
                "Requested {:.2} fps, device runs at {actual_fps:.2} fps",
                settings.fps
            );
        }
        self.sdk.enable_frame_event(handle)?;
        self.sdk.start_continuous_capture(handle)?;
        Ok(actual_fps)
    }
}

impl<S: CameraSdk> Drop for CaptureLifecycle<S> {
    fn drop(&mut self) {
        if self.is_capturing() {
            if let Err(err) = self.stop() {
                warn!("Teardown on drop failed: {err}");
            }
        }
    }
}
