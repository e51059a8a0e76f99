//! Acquisition cursor: hands out the most recently completed slot.
//!
//! The hardware writes slots round-robin and reports the slot it is writing
//! now. The completed frame is the slot one behind it. When the completed
//! buffer is the one already handed out, the cursor waits once on the
//! frame-ready event (bounded by [`FRAME_WAIT_TIMEOUT`]) and looks again.
//!
//! A timed-out wait does not produce an error. The cursor hands the same
//! buffer out again with [`RawFrame::fresh`] cleared, so a stalled sensor
//! shows up as repeated frames rather than as a failed acquisition. Staleness
//! is judged by buffer identity, so a hardware that re-completes the same slot
//! without advancing is also reported as not fresh.

use std::time::Duration;

use log::trace;

use crate::frame::RawFrame;
use crate::traits::{CameraHandle, CameraSdk, ColorFormat, MemoryHandle, Result, SlotId, WaitOutcome};

/// Upper bound of a single frame-ready wait.
pub const FRAME_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Geometry and layout stamped onto every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Layout written by the hardware.
    pub format: ColorFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Delivered {
    slot: SlotId,
    memory: MemoryHandle,
}

/// Remembers the last delivered buffer so each call can detect staleness.
#[derive(Debug)]
pub struct AcquisitionCursor {
    last_delivered: Option<Delivered>,
    timeout: Duration,
}

impl Default for AcquisitionCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionCursor {
    /// Cursor with the default 100 ms wait.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_timeout(FRAME_WAIT_TIMEOUT)
    }

    /// Cursor with a custom wait bound.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            last_delivered: None,
            timeout,
        }
    }

    /// Wait bound used per call.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Slot handed out by the previous call, if any.
    #[must_use]
    pub fn last_delivered_slot(&self) -> Option<SlotId> {
        self.last_delivered.map(|delivered| delivered.slot)
    }

    /// Memory handed out by the previous call, if any.
    #[must_use]
    pub fn last_delivered_memory(&self) -> Option<MemoryHandle> {
        self.last_delivered.map(|delivered| delivered.memory)
    }

    /// Forget the previous hand-off.
    pub fn reset(&mut self) {
        self.last_delivered = None;
    }

    /// Return the most recently completed frame.
    ///
    /// Blocks for at most one [`timeout`](Self::timeout) when the hardware has
    /// not completed a new frame since the previous call. Never loops.
    pub fn next_frame<'a, S: CameraSdk + ?Sized>(
        &mut self,
        sdk: &'a S,
        handle: CameraHandle,
        geometry: FrameGeometry,
    ) -> Result<RawFrame<'a>> {
        let active = sdk.active_slot(handle)?;
        let mut slot = active.active.previous();
        let mut memory = active.last_completed;

        if self.is_stale(memory) {
            let outcome = sdk.wait_for_frame_event(handle, self.timeout)?;
            trace!("Frame wait on slot {slot}: {outcome:?}");
            let active = sdk.active_slot(handle)?;
            slot = active.active.previous();
            memory = active.last_completed;
            if outcome == WaitOutcome::TimedOut && self.is_stale(memory) {
                trace!("No new frame within {:?}; repeating slot {slot}", self.timeout);
            }
        }

        let fresh = !self.is_stale(memory);
        let data = sdk.slot_data(handle, memory)?;
        self.last_delivered = Some(Delivered { slot, memory });

        Ok(RawFrame::from_slot(
            data,
            geometry.width,
            geometry.height,
            geometry.format,
            slot,
            memory,
            fresh,
        ))
    }

    fn is_stale(&self, memory: MemoryHandle) -> bool {
        self.last_delivered
            .is_some_and(|delivered| delivered.memory == memory)
    }
}
