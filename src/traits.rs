//! Core traits and types for the camera SDK abstraction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Number of slots in the capture ring.
pub const SLOT_COUNT: u8 = 8;

/// Identifier of one slot in the capture ring, always within `1..=SLOT_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u8);

impl SlotId {
    /// The first slot of the ring.
    pub const FIRST: Self = Self(1);
    /// The last slot of the ring.
    pub const LAST: Self = Self(SLOT_COUNT);

    /// Create a slot id from a raw driver value. Returns `None` outside `1..=SLOT_COUNT`.
    #[must_use]
    pub fn new(raw: u32) -> Option<Self> {
        u8::try_from(raw)
            .ok()
            .filter(|id| (1..=SLOT_COUNT).contains(id))
            .map(Self)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// The slot written before this one. Slot 1 wraps to slot 8.
    #[must_use]
    pub const fn previous(self) -> Self {
        if self.0 <= 1 {
            Self::LAST
        } else {
            Self(self.0 - 1)
        }
    }

    /// The slot written after this one. Slot 8 wraps to slot 1.
    #[must_use]
    pub const fn next(self) -> Self {
        if self.0 >= SLOT_COUNT {
            Self::FIRST
        } else {
            Self(self.0 + 1)
        }
    }

    /// Every slot id in ring order.
    pub fn all() -> impl Iterator<Item = Self> {
        (1..=SLOT_COUNT).map(Self)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a driver-allocated image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryHandle(pub u32);

/// Opaque handle of an initialised camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraHandle(pub u32);

/// Pixel format representation (e.g., UYVY, YUYV, GREY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// YUYV pixel format (4:2:2 packed, luma first).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// 16-bit little-endian greyscale.
    pub const Y16: Self = Self::new(b"Y16 ");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// 8-bit Bayer RGGB mosaic.
    pub const RGGB: Self = Self::new(b"RGGB");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Source colour layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// Single channel, 8 bits per pixel.
    Grey8,
    /// Single channel, 16 bits per pixel, little-endian.
    Grey16,
    /// Packed 4:2:2 luma-chroma, byte order U Y0 V Y1.
    Uyvy,
    /// Packed 4:2:2 luma-chroma, byte order Y0 U Y1 V.
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb8,
    /// Packed 24-bit BGR.
    Bgr8,
    /// 8-bit Bayer mosaic starting with a red sample.
    BayerRggb8,
}

impl ColorFormat {
    /// Bytes occupied by one pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Grey8 | Self::BayerRggb8 => 1,
            Self::Grey16 | Self::Uyvy | Self::Yuyv => 2,
            Self::Rgb8 | Self::Bgr8 => 3,
        }
    }

    /// Bits per pixel as requested from the buffer allocator.
    #[must_use]
    pub const fn bit_depth(self) -> u32 {
        // bytes_per_pixel is at most 3
        #[allow(clippy::cast_possible_truncation)]
        let bytes = self.bytes_per_pixel() as u32;
        bytes * 8
    }

    /// Number of bytes a `width` x `height` frame occupies.
    #[must_use]
    pub const fn buffer_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    /// Matching V4L2 pixel format.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Grey8 => FourCC::GREY,
            Self::Grey16 => FourCC::Y16,
            Self::Uyvy => FourCC::UYVY,
            Self::Yuyv => FourCC::YUYV,
            Self::Rgb8 => FourCC::RGB3,
            Self::Bgr8 => FourCC::BGR3,
            Self::BayerRggb8 => FourCC::RGGB,
        }
    }

    /// Look up the colour format for a V4L2 pixel format.
    #[must_use]
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        [
            Self::Grey8,
            Self::Grey16,
            Self::Uyvy,
            Self::Yuyv,
            Self::Rgb8,
            Self::Bgr8,
            Self::BayerRggb8,
        ]
        .into_iter()
        .find(|format| format.fourcc() == fourcc)
    }
}

impl fmt::Display for ColorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Grey8 => "GREY (8-bit mono)",
            Self::Grey16 => "Y16 (16-bit mono)",
            Self::Uyvy => "UYVY (YUV 4:2:2 packed)",
            Self::Yuyv => "YUYV (YUV 4:2:2 packed)",
            Self::Rgb8 => "RGB24",
            Self::Bgr8 => "BGR24",
            Self::BayerRggb8 => "Bayer RGGB8",
        };
        f.write_str(name)
    }
}

/// One entry of the device's discrete resolution list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormatInfo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Driver identifier used to select this entry.
    pub format_id: u32,
}

/// Sensor region of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOfInterest {
    /// Horizontal offset in pixels.
    pub x: u32,
    /// Vertical offset in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Per-channel hardware gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareGains {
    /// Master gain.
    pub master: u32,
    /// Red channel gain.
    pub red: u32,
    /// Green channel gain.
    pub green: u32,
    /// Blue channel gain.
    pub blue: u32,
}

/// Mains anti-flicker compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntiFlickerMode {
    /// No compensation.
    Off,
    /// Fixed 50 Hz compensation.
    Fixed50Hz,
    /// Fixed 60 Hz compensation.
    Fixed60Hz,
}

/// Position of the hardware in its capture sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSlot {
    /// Slot the hardware is currently writing into.
    pub active: SlotId,
    /// Memory of the most recently completed buffer.
    pub last_completed: MemoryHandle,
}

/// Result of waiting on the frame-ready event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A frame completed while waiting.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
}

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Device initialisation failed.
    #[error("Failed to initialise camera {camera_id}: {reason}")]
    DeviceInit {
        /// Requested camera id.
        camera_id: u32,
        /// Driver message.
        reason: String,
    },
    /// Handle does not belong to an open camera.
    #[error("Camera handle {0:?} is not open")]
    InvalidHandle(CameraHandle),
    /// A ring buffer could not be allocated.
    #[error("Buffer allocation failed for slot {index}: {reason}")]
    BufferAllocation {
        /// Zero-based allocation attempt.
        index: usize,
        /// Driver message.
        reason: String,
    },
    /// Driver reported a slot id outside the ring.
    #[error("Slot id {0} is outside the capture ring")]
    InvalidSlot(u32),
    /// Memory handle is not a live buffer.
    #[error("Unknown memory handle {0:?}")]
    UnknownMemory(MemoryHandle),
    /// A camera control could not be applied.
    #[error("Failed to apply {control}: {reason}")]
    Control {
        /// Control name.
        control: &'static str,
        /// Driver message.
        reason: String,
    },
    /// Error during streaming operation.
    #[error("Stream error: {0}")]
    StreamError(String),
    /// Frame requested while not capturing.
    #[error("Camera is not capturing")]
    NotCapturing,
    /// Start requested while already capturing.
    #[error("Capture is already active")]
    AlreadyCapturing,
    /// Frame buffer shorter than its declared geometry.
    #[error("Frame buffer too small: expected {expected} bytes, got {actual}")]
    BufferTooSmall {
        /// Bytes required by width, height and format.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// No accelerated conversion exists for a source format.
    #[error("No accelerated greyscale conversion from {0}")]
    NoConversion(ColorFormat),
    /// Configuration could not be read or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over the vendor camera driver.
///
/// Buffers are identified by [`MemoryHandle`]; their bytes are shared out as
/// `Arc<[u8]>` so a reader never observes a buffer being freed under it.
pub trait CameraSdk: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Open and initialise a camera.
    fn device_init(&self, camera_id: u32) -> Result<CameraHandle>;

    /// Close a camera.
    fn device_exit(&self, handle: CameraHandle) -> Result<()>;

    /// Discrete resolutions supported by the sensor, in driver order.
    fn query_format_list(&self, handle: CameraHandle) -> Result<Vec<ImageFormatInfo>>;

    /// Select an entry from [`CameraSdk::query_format_list`].
    fn set_image_format(&self, handle: CameraHandle, format_id: u32) -> Result<()>;

    /// Set the sensor area of interest.
    fn set_region_of_interest(&self, handle: CameraHandle, roi: RegionOfInterest) -> Result<()>;

    /// Allocate one image buffer. Returns the memory handle and the driver's raw slot id.
    fn allocate_buffer(
        &self,
        handle: CameraHandle,
        width: u32,
        height: u32,
        bit_depth: u32,
    ) -> Result<(MemoryHandle, u32)>;

    /// Append a buffer to the capture sequence.
    fn register_buffer(&self, handle: CameraHandle, memory: MemoryHandle, slot: SlotId)
        -> Result<()>;

    /// Empty the capture sequence.
    fn clear_sequence(&self, handle: CameraHandle) -> Result<()>;

    /// Return a buffer to the allocator. `raw_slot` is the id reported by
    /// [`CameraSdk::allocate_buffer`].
    fn free_buffer(&self, handle: CameraHandle, memory: MemoryHandle, raw_slot: u32)
        -> Result<()>;

    /// Exposure time in milliseconds.
    fn set_exposure(&self, handle: CameraHandle, exposure_ms: f64) -> Result<()>;

    /// Per-channel hardware gain.
    fn set_gains(&self, handle: CameraHandle, gains: HardwareGains) -> Result<()>;

    /// Anti-flicker compensation.
    fn set_anti_flicker(&self, handle: CameraHandle, mode: AntiFlickerMode) -> Result<()>;

    /// Pixel layout written into the buffers.
    fn set_color_mode(&self, handle: CameraHandle, format: ColorFormat) -> Result<()>;

    /// Request a frame rate. Returns the rate the device actually applied.
    fn set_frame_rate(&self, handle: CameraHandle, fps: f64) -> Result<f64>;

    /// Enable the frame-ready event used by [`CameraSdk::wait_for_frame_event`].
    fn enable_frame_event(&self, handle: CameraHandle) -> Result<()>;

    /// Begin filling the capture sequence continuously.
    fn start_continuous_capture(&self, handle: CameraHandle) -> Result<()>;

    /// Halt capture.
    fn stop_capture(&self, handle: CameraHandle) -> Result<()>;

    /// Non-blocking query of the sequence position.
    fn active_slot(&self, handle: CameraHandle) -> Result<ActiveSlot>;

    /// Block until a frame completes or `timeout` elapses.
    fn wait_for_frame_event(&self, handle: CameraHandle, timeout: Duration)
        -> Result<WaitOutcome>;

    /// Current bytes of a buffer.
    fn slot_data(&self, handle: CameraHandle, memory: MemoryHandle) -> Result<Arc<[u8]>>;

    /// Edge enhancement (sharpening) level.
    fn set_edge_enhancement(&self, handle: CameraHandle, level: u32) -> Result<()>;
}
