//! Raw frames handed out by the acquisition cursor.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::traits::{CameraError, ColorFormat, MemoryHandle, Result, SlotId};

/// A frame as it sits in a capture slot.
///
/// The lifetime ties the frame to the capture session that produced it. The
/// hardware may overwrite the backing slot once the next frame is requested,
/// so convert or [`detach`](RawFrame::detach) a frame before asking for another.
#[derive(Clone)]
pub struct RawFrame<'a> {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Declared source colour layout.
    pub format: ColorFormat,
    /// Slot the frame was read from.
    pub slot: SlotId,
    /// Memory handle of that slot.
    pub memory: MemoryHandle,
    /// Wall-clock seconds since the epoch, taken at hand-off (not sensor time).
    pub timestamp: f64,
    /// `false` when the frame-ready wait timed out and this is the same
    /// buffer as the previous hand-off.
    pub fresh: bool,
    data: Arc<[u8]>,
    _slot: PhantomData<&'a [u8]>,
}

impl fmt::Debug for RawFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("slot", &self.slot)
            .field("memory", &self.memory)
            .field("timestamp", &self.timestamp)
            .field("fresh", &self.fresh)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl RawFrame<'_> {
    pub(crate) fn from_slot(
        data: Arc<[u8]>,
        width: u32,
        height: u32,
        format: ColorFormat,
        slot: SlotId,
        memory: MemoryHandle,
        fresh: bool,
    ) -> Self {
        Self {
            width,
            height,
            format,
            slot,
            memory,
            timestamp: unix_time_now(),
            fresh,
            data,
            _slot: PhantomData,
        }
    }

    /// Raw bytes of the slot.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes required by the declared geometry and format.
    #[must_use]
    pub const fn expected_len(&self) -> usize {
        self.format.buffer_size(self.width, self.height)
    }

    /// Copy the frame out of its slot into memory owned by the caller.
    #[must_use]
    pub fn detach(&self) -> RawFrame<'static> {
        RawFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            slot: self.slot,
            memory: self.memory,
            timestamp: self.timestamp,
            fresh: self.fresh,
            data: Arc::from(self.data.to_vec()),
            _slot: PhantomData,
        }
    }

    /// The first `width * height * bytes_per_pixel` bytes of the slot.
    pub(crate) fn pixels(&self, bytes_per_pixel: usize) -> Result<&[u8]> {
        let expected = self.width as usize * self.height as usize * bytes_per_pixel;
        self.data
            .get(..expected)
            .ok_or(CameraError::BufferTooSmall {
                expected,
                actual: self.data.len(),
            })
    }
}

impl RawFrame<'static> {
    /// Wrap bytes from elsewhere (a file, a network stream) as a frame.
    #[must_use]
    pub fn from_bytes(width: u32, height: u32, format: ColorFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            slot: SlotId::FIRST,
            memory: MemoryHandle(0),
            timestamp: unix_time_now(),
            fresh: true,
            data: Arc::from(data),
            _slot: PhantomData,
        }
    }
}

fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
