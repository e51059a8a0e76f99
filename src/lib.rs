//! Ring-Cam-Capture: ring-buffer frame acquisition for industrial cameras
//!
//! The camera writes continuously into eight driver buffers. Acquisition
//! hands out the most recently completed one without copying it, and the
//! conversion engine turns it into an 8-bit greyscale image. The driver is
//! reached through the [`CameraSdk`] trait, so the same lifecycle runs on
//! V4L2 hardware and on the test mock.

pub mod convert;
pub mod cursor;
pub mod device;
pub mod frame;
pub mod lifecycle;
pub mod pool;
pub mod sequence;
pub mod settings;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use convert::{to_greyscale, ConversionMethod, Fidelity, GreyscaleImage};
pub use device::V4l2Sdk;
pub use frame::RawFrame;
pub use lifecycle::{CaptureLifecycle, CaptureState};
pub use settings::{CaptureSettings, SettingKey, SettingValue, SettingsStore};
pub use traits::{CameraError, CameraSdk, ColorFormat, SlotId};
