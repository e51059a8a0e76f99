//! Capture settings: the named parameter store and the snapshot taken at start.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::traits::{CameraError, HardwareGains, RegionOfInterest, Result};

const DEFAULT_CAMERA_ID: u32 = 1;
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 1024;
const DEFAULT_EXPOSURE_MS: f64 = 16.35;
const DEFAULT_FPS: f64 = 60.01;
const DEFAULT_BLUE_GAIN: u32 = 64;
const DEFAULT_EDGE_ENHANCEMENT: u32 = 15;

/// Immutable capture parameters. Changing them requires a stop/start cycle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSettings {
    /// Driver camera id.
    pub camera_id: u32,
    /// Requested frame width in pixels.
    pub width: u32,
    /// Requested frame height in pixels.
    pub height: u32,
    /// Region-of-interest horizontal offset.
    pub x_offset: u32,
    /// Region-of-interest vertical offset.
    pub y_offset: u32,
    /// Exposure time in milliseconds.
    pub exposure_ms: f64,
    /// Target frame rate.
    pub fps: f64,
    /// Master gain.
    pub master_gain: u32,
    /// Red channel gain.
    pub red_gain: u32,
    /// Green channel gain.
    pub green_gain: u32,
    /// Blue channel gain.
    pub blue_gain: u32,
    /// Edge enhancement level.
    pub edge_enhancement: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            camera_id: DEFAULT_CAMERA_ID,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            x_offset: 0,
            y_offset: 0,
            exposure_ms: DEFAULT_EXPOSURE_MS,
            fps: DEFAULT_FPS,
            master_gain: 0,
            red_gain: 0,
            green_gain: 0,
            blue_gain: DEFAULT_BLUE_GAIN,
            edge_enhancement: DEFAULT_EDGE_ENHANCEMENT,
        }
    }
}

impl CaptureSettings {
    /// Parse settings from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(text).map_err(|err| CameraError::Config(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            CameraError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Snapshot the current values of a settings store.
    pub fn from_store(store: &SettingsStore) -> Result<Self> {
        let settings = Self {
            camera_id: store.get_u32(SettingKey::CameraId)?,
            width: store.get_u32(SettingKey::Width)?,
            height: store.get_u32(SettingKey::Height)?,
            x_offset: store.get_u32(SettingKey::XOffset)?,
            y_offset: store.get_u32(SettingKey::YOffset)?,
            exposure_ms: store.get_f64(SettingKey::ExposureMs)?,
            fps: store.get_f64(SettingKey::Fps)?,
            master_gain: store.get_u32(SettingKey::MasterGain)?,
            red_gain: store.get_u32(SettingKey::RedGain)?,
            green_gain: store.get_u32(SettingKey::GreenGain)?,
            blue_gain: store.get_u32(SettingKey::BlueGain)?,
            edge_enhancement: store.get_u32(SettingKey::EdgeEnhancement)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values no sensor can honour.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::Config(format!(
                "frame size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !(self.exposure_ms.is_finite() && self.exposure_ms > 0.0) {
            return Err(CameraError::Config(format!(
                "exposure must be positive, got {} ms",
                self.exposure_ms
            )));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(CameraError::Config(format!(
                "frame rate must be positive, got {}",
                self.fps
            )));
        }
        Ok(())
    }

    /// Region of interest covering the requested frame.
    #[must_use]
    pub const fn region_of_interest(&self) -> RegionOfInterest {
        RegionOfInterest {
            x: self.x_offset,
            y: self.y_offset,
            width: self.width,
            height: self.height,
        }
    }

    /// Hardware gains as one value.
    #[must_use]
    pub const fn gains(&self) -> HardwareGains {
        HardwareGains {
            master: self.master_gain,
            red: self.red_gain,
            green: self.green_gain,
            blue: self.blue_gain,
        }
    }
}

/// Names recognised by the settings store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingKey {
    /// "Cam ID"
    CameraId,
    /// "Width"
    Width,
    /// "Height"
    Height,
    /// "X offset"
    XOffset,
    /// "Y offset"
    YOffset,
    /// "Exposure (ms)"
    ExposureMs,
    /// "FPS"
    Fps,
    /// "Master gain"
    MasterGain,
    /// "Red gain"
    RedGain,
    /// "Green gain"
    GreenGain,
    /// "Blue gain"
    BlueGain,
    /// "Edge enhancement"
    EdgeEnhancement,
}

impl SettingKey {
    /// Every recognised key.
    pub const ALL: [Self; 12] = [
        Self::CameraId,
        Self::Width,
        Self::Height,
        Self::XOffset,
        Self::YOffset,
        Self::ExposureMs,
        Self::Fps,
        Self::MasterGain,
        Self::RedGain,
        Self::GreenGain,
        Self::BlueGain,
        Self::EdgeEnhancement,
    ];

    /// Display name used by front ends.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CameraId => "Cam ID",
            Self::Width => "Width",
            Self::Height => "Height",
            Self::XOffset => "X offset",
            Self::YOffset => "Y offset",
            Self::ExposureMs => "Exposure (ms)",
            Self::Fps => "FPS",
            Self::MasterGain => "Master gain",
            Self::RedGain => "Red gain",
            Self::GreenGain => "Green gain",
            Self::BlueGain => "Blue gain",
            Self::EdgeEnhancement => "Edge enhancement",
        }
    }

    /// Look a key up by display name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }

    const fn is_float(self) -> bool {
        matches!(self, Self::ExposureMs | Self::Fps)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed setting value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingValue {
    /// Integer parameter.
    Int(i64),
    /// Floating point parameter.
    Float(f64),
}

/// Named, typed capture parameters editable while the camera is idle or running.
///
/// Edits take effect at the next start, when [`CaptureSettings::from_store`]
/// snapshots them.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    values: BTreeMap<SettingKey, SettingValue>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::from_settings(&CaptureSettings::default())
    }
}

impl SettingsStore {
    /// Store seeded from a settings snapshot.
    #[must_use]
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        let int = |value: u32| SettingValue::Int(i64::from(value));
        let values = BTreeMap::from([
            (SettingKey::CameraId, int(settings.camera_id)),
            (SettingKey::Width, int(settings.width)),
            (SettingKey::Height, int(settings.height)),
            (SettingKey::XOffset, int(settings.x_offset)),
            (SettingKey::YOffset, int(settings.y_offset)),
            (SettingKey::ExposureMs, SettingValue::Float(settings.exposure_ms)),
            (SettingKey::Fps, SettingValue::Float(settings.fps)),
            (SettingKey::MasterGain, int(settings.master_gain)),
            (SettingKey::RedGain, int(settings.red_gain)),
            (SettingKey::GreenGain, int(settings.green_gain)),
            (SettingKey::BlueGain, int(settings.blue_gain)),
            (SettingKey::EdgeEnhancement, int(settings.edge_enhancement)),
        ]);
        Self { values }
    }

    /// Current value of a key.
    #[must_use]
    pub fn get(&self, key: SettingKey) -> Option<SettingValue> {
        self.values.get(&key).copied()
    }

    /// Replace a value. The value type must match the key.
    pub fn set(&mut self, key: SettingKey, value: SettingValue) -> Result<()> {
        match (key.is_float(), value) {
            (true, SettingValue::Float(_)) | (false, SettingValue::Int(_)) => {
                self.values.insert(key, value);
                Ok(())
            }
            _ => Err(CameraError::Config(format!(
                "{key} expects {} value, got {value:?}",
                if key.is_float() { "a float" } else { "an integer" }
            ))),
        }
    }

    /// Replace a value addressed by display name.
    pub fn set_by_name(&mut self, name: &str, value: SettingValue) -> Result<()> {
        let key = SettingKey::from_name(name)
            .ok_or_else(|| CameraError::Config(format!("unknown setting \"{name}\"")))?;
        self.set(key, value)
    }

    fn get_u32(&self, key: SettingKey) -> Result<u32> {
        match self.get(key) {
            Some(SettingValue::Int(value)) => u32::try_from(value)
                .map_err(|_| CameraError::Config(format!("{key} out of range: {value}"))),
            other => Err(CameraError::Config(format!(
                "{key} is not an integer: {other:?}"
            ))),
        }
    }

    fn get_f64(&self, key: SettingKey) -> Result<f64> {
        match self.get(key) {
            Some(SettingValue::Float(value)) => Ok(value),
            other => Err(CameraError::Config(format!(
                "{key} is not a float: {other:?}"
            ))),
        }
    }
}
