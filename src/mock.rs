//! Mock driver for testing without hardware.
//!
//! Frames are produced only when a test calls [`MockSdk::advance`] (or, with
//! [`MockSdk::complete_on_wait`], during a frame-ready wait), so every test
//! controls exactly when the hardware "completes" a slot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::sequence::CaptureSequence;
use crate::traits::{
    ActiveSlot, AntiFlickerMode, CameraError, CameraHandle, CameraSdk, ColorFormat,
    HardwareGains, ImageFormatInfo, MemoryHandle, RegionOfInterest, Result, SlotId, WaitOutcome,
};

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light, neutral chroma.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

#[derive(Default)]
struct Failures {
    init: bool,
    allocation_at: Option<usize>,
    start_capture: bool,
    edge_enhancement: bool,
}

struct MockState {
    open: Option<CameraHandle>,
    next_handle: u32,
    formats: Vec<ImageFormatInfo>,
    selected_format: Option<u32>,
    roi: Option<RegionOfInterest>,
    exposure: Option<f64>,
    gains: Option<HardwareGains>,
    anti_flicker: Option<AntiFlickerMode>,
    color_mode: Option<ColorFormat>,
    edge_enhancement: Option<u32>,
    capturing: bool,
    frame_size: (u32, u32),
    pattern: TestPattern,
    complete_on_wait: bool,
    wait_calls: usize,
    exit_count: usize,
    freed_count: usize,
    failures: Failures,
}

struct MockInner {
    sequence: CaptureSequence,
    state: Mutex<MockState>,
}

/// In-memory camera driver. Clones share the same device.
#[derive(Clone)]
pub struct MockSdk {
    inner: Arc<MockInner>,
}

impl Default for MockSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSdk {
    /// Create a mock camera with three discrete resolutions.
    #[must_use]
    pub fn new() -> Self {
        let formats = [(640, 480), (1280, 1024), (1920, 1080)]
            .into_iter()
            .zip(1..)
            .map(|((width, height), format_id)| ImageFormatInfo {
                width,
                height,
                format_id,
            })
            .collect();

        Self {
            inner: Arc::new(MockInner {
                sequence: CaptureSequence::new(),
                state: Mutex::new(MockState {
                    open: None,
                    next_handle: 0,
                    formats,
                    selected_format: None,
                    roi: None,
                    exposure: None,
                    gains: None,
                    anti_flicker: None,
                    color_mode: None,
                    edge_enhancement: None,
                    capturing: false,
                    frame_size: (640, 480),
                    pattern: TestPattern::ColorBars,
                    complete_on_wait: false,
                    wait_calls: 0,
                    exit_count: 0,
                    freed_count: 0,
                    failures: Failures::default(),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, handle: CameraHandle) -> Result<()> {
        if self.state().open == Some(handle) {
            Ok(())
        } else {
            Err(CameraError::InvalidHandle(handle))
        }
    }

    /// Set the pattern written by [`MockSdk::advance`].
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        self.state().pattern = pattern;
        self
    }

    /// Replace the resolution list.
    #[must_use]
    pub fn with_formats(self, formats: Vec<ImageFormatInfo>) -> Self {
        self.state().formats = formats;
        self
    }

    /// Make `device_init` fail.
    #[must_use]
    pub fn fail_init(self) -> Self {
        self.state().failures.init = true;
        self
    }

    /// Make the allocation fail once `index` buffers are live.
    #[must_use]
    pub fn fail_allocation_at(self, index: usize) -> Self {
        self.state().failures.allocation_at = Some(index);
        self
    }

    /// Make `start_continuous_capture` fail.
    #[must_use]
    pub fn fail_start_capture(self) -> Self {
        self.state().failures.start_capture = true;
        self
    }

    /// Make `set_edge_enhancement` fail.
    #[must_use]
    pub fn fail_edge_enhancement(self) -> Self {
        self.state().failures.edge_enhancement = true;
        self
    }

    /// Complete a frame at the start of every frame-ready wait.
    #[must_use]
    pub fn complete_on_wait(self, enabled: bool) -> Self {
        self.state().complete_on_wait = enabled;
        self
    }

    /// Complete one frame into the active slot.
    pub fn advance(&self) -> bool {
        let (width, height, pattern) = {
            let state = self.state();
            (state.frame_size.0, state.frame_size.1, state.pattern)
        };
        let frame = generate_test_frame(width, height, pattern);
        self.inner.sequence.complete_frame(&frame)
    }

    /// Simulate the capture stream dying.
    pub fn fail_stream(&self, reason: &str) {
        self.inner.sequence.fail(reason);
    }

    /// Format id passed to `set_image_format`.
    pub fn selected_format(&self) -> Option<u32> {
        self.state().selected_format
    }

    /// Region of interest last applied.
    pub fn roi(&self) -> Option<RegionOfInterest> {
        self.state().roi
    }

    /// Exposure last applied.
    pub fn exposure(&self) -> Option<f64> {
        self.state().exposure
    }

    /// Gains last applied.
    pub fn gains(&self) -> Option<HardwareGains> {
        self.state().gains
    }

    /// Anti-flicker mode last applied.
    pub fn anti_flicker(&self) -> Option<AntiFlickerMode> {
        self.state().anti_flicker
    }

    /// Color mode last applied.
    pub fn color_mode(&self) -> Option<ColorFormat> {
        self.state().color_mode
    }

    /// Edge enhancement level last applied successfully.
    pub fn edge_enhancement(&self) -> Option<u32> {
        self.state().edge_enhancement
    }

    /// Whether continuous capture is running.
    pub fn is_capturing(&self) -> bool {
        self.state().capturing
    }

    /// Whether a camera handle is open.
    pub fn is_open(&self) -> bool {
        self.state().open.is_some()
    }

    /// Successful `device_exit` calls.
    pub fn exit_count(&self) -> usize {
        self.state().exit_count
    }

    /// Successful `free_buffer` calls.
    pub fn freed_count(&self) -> usize {
        self.state().freed_count
    }

    /// `wait_for_frame_event` calls.
    pub fn wait_calls(&self) -> usize {
        self.state().wait_calls
    }

    /// Buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.inner.sequence.live_buffers()
    }

    /// Slots in the capture sequence, in write order.
    pub fn registered_slots(&self) -> Vec<SlotId> {
        self.inner.sequence.registered()
    }
}

impl CameraSdk for MockSdk {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn device_init(&self, camera_id: u32) -> Result<CameraHandle> {
        let mut state = self.state();
        if state.failures.init {
            return Err(CameraError::DeviceInit {
                camera_id,
                reason: "no camera connected".to_owned(),
            });
        }
        state.next_handle += 1;
        let handle = CameraHandle(state.next_handle);
        state.open = Some(handle);
        Ok(handle)
    }

    fn device_exit(&self, handle: CameraHandle) -> Result<()> {
        self.check(handle)?;
        let mut state = self.state();
        state.open = None;
        state.capturing = false;
        state.exit_count += 1;
        Ok(())
    }

    fn query_format_list(&self, handle: CameraHandle) -> Result<Vec<ImageFormatInfo>> {
        self.check(handle)?;
        Ok(self.state().formats.clone())
    }

    fn set_image_format(&self, handle: CameraHandle, format_id: u32) -> Result<()> {
        self.check(handle)?;
        self.state().selected_format = Some(format_id);
        Ok(())
    }

    fn set_region_of_interest(&self, handle: CameraHandle, roi: RegionOfInterest) -> Result<()> {
        self.check(handle)?;
        self.state().roi = Some(roi);
        Ok(())
    }

    fn allocate_buffer(
        &self,
        handle: CameraHandle,
        width: u32,
        height: u32,
        bit_depth: u32,
    ) -> Result<(MemoryHandle, u32)> {
        self.check(handle)?;
        let live = self.inner.sequence.live_buffers();
        {
            let mut state = self.state();
            if state.failures.allocation_at == Some(live) {
                return Err(CameraError::BufferAllocation {
                    index: live,
                    reason: "out of image memory".to_owned(),
                });
            }
            state.frame_size = (width, height);
        }
        let size = width as usize * height as usize * (bit_depth as usize).div_ceil(8);
        Ok(self.inner.sequence.allocate(size))
    }

    fn register_buffer(
        &self,
        handle: CameraHandle,
        memory: MemoryHandle,
        slot: SlotId,
    ) -> Result<()> {
        self.check(handle)?;
        self.inner.sequence.register(memory, slot)
    }

    fn clear_sequence(&self, handle: CameraHandle) -> Result<()> {
        self.check(handle)?;
        self.inner.sequence.clear();
        Ok(())
    }

    fn free_buffer(&self, handle: CameraHandle, memory: MemoryHandle, _raw_slot: u32) -> Result<()> {
        self.check(handle)?;
        self.inner.sequence.free(memory)?;
        self.state().freed_count += 1;
        Ok(())
    }

    fn set_exposure(&self, handle: CameraHandle, exposure_ms: f64) -> Result<()> {
        self.check(handle)?;
        self.state().exposure = Some(exposure_ms);
        Ok(())
    }

    fn set_gains(&self, handle: CameraHandle, gains: HardwareGains) -> Result<()> {
        self.check(handle)?;
        self.state().gains = Some(gains);
        Ok(())
    }

    fn set_anti_flicker(&self, handle: CameraHandle, mode: AntiFlickerMode) -> Result<()> {
        self.check(handle)?;
        self.state().anti_flicker = Some(mode);
        Ok(())
    }

    fn set_color_mode(&self, handle: CameraHandle, format: ColorFormat) -> Result<()> {
        self.check(handle)?;
        self.state().color_mode = Some(format);
        Ok(())
    }

    fn set_frame_rate(&self, handle: CameraHandle, fps: f64) -> Result<f64> {
        self.check(handle)?;
        Ok(fps)
    }

    fn enable_frame_event(&self, handle: CameraHandle) -> Result<()> {
        self.check(handle)?;
        self.inner.sequence.set_event_enabled(true);
        Ok(())
    }

    fn start_continuous_capture(&self, handle: CameraHandle) -> Result<()> {
        self.check(handle)?;
        let mut state = self.state();
        if state.failures.start_capture {
            return Err(CameraError::StreamError(
                "capture could not be started".to_owned(),
            ));
        }
        state.capturing = true;
        Ok(())
    }

    fn stop_capture(&self, handle: CameraHandle) -> Result<()> {
        self.check(handle)?;
        self.state().capturing = false;
        self.inner.sequence.set_event_enabled(false);
        Ok(())
    }

    fn active_slot(&self, handle: CameraHandle) -> Result<ActiveSlot> {
        self.check(handle)?;
        self.inner.sequence.active_slot()
    }

    fn wait_for_frame_event(
        &self,
        handle: CameraHandle,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        self.check(handle)?;
        let complete = {
            let mut state = self.state();
            state.wait_calls += 1;
            state.complete_on_wait
        };
        if complete {
            self.advance();
        }
        self.inner.sequence.wait_event(timeout)
    }

    fn slot_data(&self, handle: CameraHandle, memory: MemoryHandle) -> Result<Arc<[u8]>> {
        self.check(handle)?;
        self.inner.sequence.data(memory)
    }

    fn set_edge_enhancement(&self, handle: CameraHandle, level: u32) -> Result<()> {
        self.check(handle)?;
        let mut state = self.state();
        if state.failures.edge_enhancement {
            return Err(CameraError::Control {
                control: "edge enhancement",
                reason: "not supported by sensor".to_owned(),
            });
        }
        state.edge_enhancement = Some(level);
        Ok(())
    }
}

/// Generate a packed UYVY frame.
pub fn generate_test_frame(width: u32, height: u32, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; width as usize * height as usize * 2];

    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut data, width),
        TestPattern::Gradient => generate_gradient(&mut data, width),
        TestPattern::Solid(y, u, v) => generate_solid(&mut data, y, u, v),
    }

    data
}

/// SMPTE bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black.
pub const COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

fn generate_color_bars(data: &mut [u8], width: u32) {
    let bar_width = (width / 8).max(1) as usize;
    for row in data.chunks_exact_mut(width as usize * 2) {
        for (pair, quad) in row.chunks_exact_mut(4).enumerate() {
            let bar = (pair * 2 / bar_width).min(7);
            let (y, u, v) = COLOR_BARS.get(bar).copied().unwrap_or((16, 128, 128));
            quad.copy_from_slice(&[u, y, v, y]);
        }
    }
}

fn generate_gradient(data: &mut [u8], width: u32) {
    for row in data.chunks_exact_mut(width as usize * 2) {
        for (pair, quad) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let y = (pair * 2 * 255 / width as usize) as u8;
            quad.copy_from_slice(&[128, y, 128, y]);
        }
    }
}

fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for quad in data.chunks_exact_mut(4) {
        quad.copy_from_slice(&[u, y, v, y]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_name_and_formats() {
        let sdk = MockSdk::new();
        let handle = sdk.device_init(1).expect("device_init failed");
        assert_eq!(sdk.name(), "mock");
        let formats = sdk.query_format_list(handle).expect("query failed");
        assert_eq!(formats.len(), 3);
        assert_eq!(formats.first().map(|format| format.format_id), Some(1));
    }

    #[test]
    fn test_closed_handle_is_rejected() {
        let sdk = MockSdk::new();
        let handle = sdk.device_init(1).expect("device_init failed");
        sdk.device_exit(handle).expect("device_exit failed");

        assert!(matches!(
            sdk.set_exposure(handle, 1.0),
            Err(CameraError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let sdk = MockSdk::new();
        let other = sdk.clone();
        sdk.device_init(1).expect("device_init failed");
        assert!(other.is_open());
    }

    #[test]
    fn test_advance_without_buffers() {
        let sdk = MockSdk::new();
        assert!(!sdk.advance());
    }

    #[test]
    fn test_color_bars_pattern() {
        let data = generate_test_frame(640, 480, TestPattern::ColorBars);

        assert_eq!(data.len(), 640 * 480 * 2);
        // First bar is white: U, Y, V, Y
        assert_eq!(&data[..4], &[128, 235, 128, 235]);
    }

    #[test]
    fn test_gradient_pattern() {
        let data = generate_test_frame(640, 480, TestPattern::Gradient);

        assert!(data[1] < 10);
        let last_row_start = 479 * 640 * 2;
        let last_pixel_y = data[last_row_start + 638 * 2 + 1];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let data = generate_test_frame(64, 64, TestPattern::Solid(128, 64, 192));

        assert_eq!(&data[..4], &[64, 128, 192, 128]);
        assert_eq!(&data[data.len() - 4..], &[64, 128, 192, 128]);
    }
}
