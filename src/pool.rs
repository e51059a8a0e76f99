//! Fixed pool of driver buffers forming the capture ring.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::traits::{
    CameraError, CameraHandle, CameraSdk, MemoryHandle, Result, SlotId, SLOT_COUNT,
};

/// The eight buffers registered with the driver's capture sequence.
///
/// A pool exists only between a successful [`allocate`](FrameSlotPool::allocate)
/// and [`release`](FrameSlotPool::release). `release` consumes the pool, so
/// the buffers cannot be freed twice.
#[derive(Debug)]
pub struct FrameSlotPool {
    slots: BTreeMap<SlotId, MemoryHandle>,
    width: u32,
    height: u32,
    bit_depth: u32,
}

impl FrameSlotPool {
    /// Allocate and register one buffer per slot.
    ///
    /// On any failure the buffers allocated so far are freed and the sequence
    /// cleared before the error is returned.
    pub fn allocate<S: CameraSdk + ?Sized>(
        sdk: &S,
        handle: CameraHandle,
        width: u32,
        height: u32,
        bit_depth: u32,
    ) -> Result<Self> {
        sdk.clear_sequence(handle)?;

        let mut slots = BTreeMap::new();
        for index in 0..usize::from(SLOT_COUNT) {
            if let Err(err) = allocate_one(sdk, handle, width, height, bit_depth, index, &mut slots)
            {
                rollback(sdk, handle, &slots);
                return Err(err);
            }
        }

        debug!(
            "Allocated {} slots of {width}x{height} @ {bit_depth} bit",
            slots.len()
        );
        Ok(Self {
            slots,
            width,
            height,
            bit_depth,
        })
    }

    /// Clear the capture sequence and free every slot.
    ///
    /// Every slot is attempted even if an earlier one fails; the first error is returned.
    pub fn release<S: CameraSdk + ?Sized>(self, sdk: &S, handle: CameraHandle) -> Result<()> {
        let mut first_error = sdk.clear_sequence(handle).err();
        for (slot, memory) in &self.slots {
            if let Err(err) = sdk.free_buffer(handle, *memory, u32::from(slot.get())) {
                warn!("Failed to free slot {slot}: {err}");
                first_error.get_or_insert(err);
            }
        }
        debug!("Released {} slots", self.slots.len());
        first_error.map_or(Ok(()), Err)
    }

    /// Number of slots held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot ids in ring order.
    pub fn slot_ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots.keys().copied()
    }

    /// Memory registered for a slot.
    #[must_use]
    pub fn memory(&self, slot: SlotId) -> Option<MemoryHandle> {
        self.slots.get(&slot).copied()
    }

    /// Buffer width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Buffer height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Bits per pixel of each buffer.
    #[must_use]
    pub const fn bit_depth(&self) -> u32 {
        self.bit_depth
    }
}

fn allocate_one<S: CameraSdk + ?Sized>(
    sdk: &S,
    handle: CameraHandle,
    width: u32,
    height: u32,
    bit_depth: u32,
    index: usize,
    slots: &mut BTreeMap<SlotId, MemoryHandle>,
) -> Result<()> {
    let (memory, raw_slot) = sdk.allocate_buffer(handle, width, height, bit_depth)?;

    let slot = match SlotId::new(raw_slot) {
        Some(slot) if !slots.contains_key(&slot) => slot,
        _ => {
            free_quietly(sdk, handle, memory, raw_slot);
            return Err(CameraError::InvalidSlot(raw_slot));
        }
    };

    if let Err(err) = sdk.register_buffer(handle, memory, slot) {
        free_quietly(sdk, handle, memory, raw_slot);
        return Err(CameraError::BufferAllocation {
            index,
            reason: err.to_string(),
        });
    }

    slots.insert(slot, memory);
    Ok(())
}

fn rollback<S: CameraSdk + ?Sized>(
    sdk: &S,
    handle: CameraHandle,
    slots: &BTreeMap<SlotId, MemoryHandle>,
) {
    if let Err(err) = sdk.clear_sequence(handle) {
        warn!("Failed to clear capture sequence during rollback: {err}");
    }
    for (slot, memory) in slots {
        free_quietly(sdk, handle, *memory, u32::from(slot.get()));
    }
}

fn free_quietly<S: CameraSdk + ?Sized>(
    sdk: &S,
    handle: CameraHandle,
    memory: MemoryHandle,
    raw_slot: u32,
) {
    if let Err(err) = sdk.free_buffer(handle, memory, raw_slot) {
        warn!("Failed to free buffer {memory:?} (slot {raw_slot}): {err}");
    }
}
