//! Software capture sequence.
//!
//! Backends without a driver-managed ring (V4L2, the test mock) keep their
//! registered buffers here. A producer calls [`CaptureSequence::complete_frame`]
//! for every captured image; the sequence writes it into the active slot,
//! advances, and signals the frame-ready event.
//!
//! The event is edge-triggered relative to the last [`CaptureSequence::active_slot`]
//! query: a wait only returns `Ready` for a frame completed after that query.
//! A producer that dies calls [`CaptureSequence::fail`]; queries and waits then
//! report the failure instead of serving the last frame forever.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::traits::{ActiveSlot, CameraError, MemoryHandle, Result, SlotId, WaitOutcome};

struct Buffer {
    raw_id: u32,
    data: Arc<[u8]>,
}

#[derive(Default)]
struct SequenceState {
    buffers: BTreeMap<MemoryHandle, Buffer>,
    order: Vec<(SlotId, MemoryHandle)>,
    active: usize,
    next_memory: u32,
    event_enabled: bool,
    event_pending: bool,
    frames_completed: u64,
    failure: Option<String>,
}

impl SequenceState {
    fn check_failure(&self) -> Result<()> {
        self.failure
            .as_ref()
            .map_or(Ok(()), |reason| Err(CameraError::StreamError(reason.clone())))
    }
}

/// Registered buffers plus the position of the writer within them.
#[derive(Default)]
pub struct CaptureSequence {
    state: Mutex<SequenceState>,
    frame_ready: Condvar,
}

impl CaptureSequence {
    /// Create an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SequenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a zeroed buffer of `size` bytes.
    ///
    /// Returns its memory handle and the lowest raw slot id not held by a live buffer.
    pub fn allocate(&self, size: usize) -> (MemoryHandle, u32) {
        let mut state = self.lock();
        state.next_memory = state.next_memory.wrapping_add(1);
        let memory = MemoryHandle(state.next_memory);
        let raw_id = (1..)
            .find(|id| state.buffers.values().all(|buffer| buffer.raw_id != *id))
            .unwrap_or_default();
        state.buffers.insert(
            memory,
            Buffer {
                raw_id,
                data: Arc::from(vec![0u8; size]),
            },
        );
        (memory, raw_id)
    }

    /// Append a live buffer to the write order.
    pub fn register(&self, memory: MemoryHandle, slot: SlotId) -> Result<()> {
        let mut state = self.lock();
        if !state.buffers.contains_key(&memory) {
            return Err(CameraError::UnknownMemory(memory));
        }
        if !state.order.iter().any(|(_, registered)| *registered == memory) {
            state.order.push((slot, memory));
        }
        Ok(())
    }

    /// Empty the write order and forget a previous producer failure.
    /// Buffers stay allocated.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.order.clear();
        state.active = 0;
        state.event_pending = false;
        state.failure = None;
    }

    /// Record that the producer stopped for good and wake any waiter.
    pub fn fail(&self, reason: &str) {
        let mut state = self.lock();
        state.failure = Some(reason.to_owned());
        self.frame_ready.notify_all();
    }

    /// Release a buffer.
    pub fn free(&self, memory: MemoryHandle) -> Result<()> {
        let mut state = self.lock();
        if state.buffers.remove(&memory).is_none() {
            return Err(CameraError::UnknownMemory(memory));
        }
        state.order.retain(|(_, registered)| *registered != memory);
        if state.active >= state.order.len() {
            state.active = 0;
        }
        Ok(())
    }

    /// Enable or disable signalling of completed frames.
    pub fn set_event_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.event_enabled = enabled;
        state.event_pending = false;
    }

    /// Slot being written and the buffer completed just before it.
    ///
    /// Frames completed up to this point no longer count as pending events.
    pub fn active_slot(&self) -> Result<ActiveSlot> {
        let mut state = self.lock();
        state.check_failure()?;
        state.event_pending = false;
        let len = state.order.len();
        let (active, _) = state
            .order
            .get(state.active)
            .copied()
            .ok_or_else(|| CameraError::StreamError("capture sequence is empty".to_owned()))?;
        let (_, last_completed) = state
            .order
            .get((state.active + len - 1) % len)
            .copied()
            .ok_or_else(|| CameraError::StreamError("capture sequence is empty".to_owned()))?;
        Ok(ActiveSlot {
            active,
            last_completed,
        })
    }

    /// Write a captured image into the active slot and advance.
    ///
    /// Returns `false` when no buffers are registered.
    pub fn complete_frame(&self, bytes: &[u8]) -> bool {
        let mut state = self.lock();
        let Some((_, memory)) = state.order.get(state.active).copied() else {
            return false;
        };
        if let Some(buffer) = state.buffers.get_mut(&memory) {
            overwrite(&mut buffer.data, bytes);
        }
        state.active = (state.active + 1) % state.order.len();
        state.frames_completed += 1;
        if state.event_enabled {
            state.event_pending = true;
            self.frame_ready.notify_all();
        }
        true
    }

    /// Block until a frame completes or `timeout` elapses. Consumes the event.
    pub fn wait_event(&self, timeout: Duration) -> Result<WaitOutcome> {
        let state = self.lock();
        let (mut state, _) = self
            .frame_ready
            .wait_timeout_while(state, timeout, |state| {
                !state.event_pending && state.failure.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);
        state.check_failure()?;
        if state.event_pending {
            state.event_pending = false;
            Ok(WaitOutcome::Ready)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }

    /// Current bytes of a live buffer.
    pub fn data(&self, memory: MemoryHandle) -> Result<Arc<[u8]>> {
        self.lock()
            .buffers
            .get(&memory)
            .map(|buffer| Arc::clone(&buffer.data))
            .ok_or(CameraError::UnknownMemory(memory))
    }

    /// Number of allocated buffers.
    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Registered slots in write order.
    pub fn registered(&self) -> Vec<SlotId> {
        self.lock().order.iter().map(|(slot, _)| *slot).collect()
    }

    /// Frames written since creation.
    pub fn frames_completed(&self) -> u64 {
        self.lock().frames_completed
    }
}

/// Copy `bytes` into a slot, reusing its allocation when no reader holds it.
fn overwrite(slot: &mut Arc<[u8]>, bytes: &[u8]) {
    if let Some(buffer) = Arc::get_mut(slot) {
        buffer
            .iter_mut()
            .zip(bytes)
            .for_each(|(dst, src)| *dst = *src);
        return;
    }
    let mut replacement = vec![0u8; slot.len()];
    replacement
        .iter_mut()
        .zip(bytes)
        .for_each(|(dst, src)| *dst = *src);
    *slot = Arc::from(replacement);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(raw: u32) -> SlotId {
        SlotId::new(raw).expect("valid slot")
    }

    fn filled(count: u32, size: usize) -> (CaptureSequence, Vec<MemoryHandle>) {
        let sequence = CaptureSequence::new();
        let mut handles = Vec::new();
        for _ in 0..count {
            let (memory, raw) = sequence.allocate(size);
            sequence.register(memory, slot(raw)).expect("register");
            handles.push(memory);
        }
        (sequence, handles)
    }

    #[test]
    fn test_allocate_assigns_sequential_ids() {
        let sequence = CaptureSequence::new();
        let ids: Vec<u32> = (0..8).map(|_| sequence.allocate(4).1).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_freed_id_is_reused() {
        let sequence = CaptureSequence::new();
        let (first, _) = sequence.allocate(4);
        sequence.allocate(4);
        sequence.free(first).expect("free");
        assert_eq!(sequence.allocate(4).1, 1);
    }

    #[test]
    fn test_initial_last_completed_is_previous_slot() {
        let (sequence, handles) = filled(8, 4);
        let active = sequence.active_slot().expect("active slot");
        assert_eq!(active.active, slot(1));
        assert_eq!(Some(&active.last_completed), handles.last());
    }

    #[test]
    fn test_complete_frame_writes_and_advances() {
        let (sequence, handles) = filled(8, 4);
        assert!(sequence.complete_frame(&[9, 9, 9, 9]));

        let active = sequence.active_slot().expect("active slot");
        assert_eq!(active.active, slot(2));
        assert_eq!(Some(&active.last_completed), handles.first());
        let data = sequence.data(active.last_completed).expect("data");
        assert_eq!(&*data, &[9, 9, 9, 9]);
    }

    #[test]
    fn test_held_reader_keeps_old_contents() {
        let (sequence, handles) = filled(1, 2);
        let memory = handles.first().copied().expect("one buffer");
        sequence.complete_frame(&[1, 1]);
        let held = sequence.data(memory).expect("data");
        sequence.complete_frame(&[2, 2]);

        assert_eq!(&*held, &[1, 1]);
        assert_eq!(&*sequence.data(memory).expect("data"), &[2, 2]);
    }

    #[test]
    fn test_wait_times_out_without_event() {
        let (sequence, _) = filled(8, 4);
        sequence.set_event_enabled(true);
        assert_eq!(
            sequence.wait_event(Duration::from_millis(10)).expect("wait"),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_wait_consumes_pending_event() {
        let (sequence, _) = filled(8, 4);
        sequence.set_event_enabled(true);
        sequence.complete_frame(&[0; 4]);
        assert_eq!(
            sequence.wait_event(Duration::from_millis(10)).expect("wait"),
            WaitOutcome::Ready
        );
        assert_eq!(
            sequence.wait_event(Duration::from_millis(10)).expect("wait"),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_wait_wakes_on_producer_thread() {
        let (sequence, _) = filled(8, 4);
        let sequence = Arc::new(sequence);
        sequence.set_event_enabled(true);

        let producer = Arc::clone(&sequence);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            producer.complete_frame(&[1; 4]);
        });

        assert_eq!(
            sequence.wait_event(Duration::from_secs(5)).expect("wait"),
            WaitOutcome::Ready
        );
        handle.join().expect("producer thread");
    }

    #[test]
    fn test_query_discards_earlier_completions() {
        let (sequence, _) = filled(8, 4);
        sequence.set_event_enabled(true);
        sequence.complete_frame(&[0; 4]);
        sequence.active_slot().expect("active slot");

        assert_eq!(
            sequence.wait_event(Duration::from_millis(10)).expect("wait"),
            WaitOutcome::TimedOut,
            "a frame already seen by the query must not satisfy the wait"
        );
    }

    #[test]
    fn test_failure_is_reported_until_cleared() {
        let (sequence, _) = filled(8, 4);
        sequence.set_event_enabled(true);
        sequence.fail("device unplugged");

        assert!(matches!(
            sequence.active_slot(),
            Err(CameraError::StreamError(reason)) if reason == "device unplugged"
        ));
        assert!(sequence.wait_event(Duration::from_millis(10)).is_err());

        sequence.clear();
        assert!(sequence.wait_event(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_failure_wakes_waiter() {
        let (sequence, _) = filled(8, 4);
        let sequence = Arc::new(sequence);
        sequence.set_event_enabled(true);

        let producer = Arc::clone(&sequence);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            producer.fail("stream stopped");
        });

        let started = std::time::Instant::now();
        assert!(sequence.wait_event(Duration::from_secs(5)).is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().expect("producer thread");
    }

    #[test]
    fn test_empty_sequence_has_no_active_slot() {
        let sequence = CaptureSequence::new();
        assert!(sequence.active_slot().is_err());
        assert!(!sequence.complete_frame(&[0]));
    }

    #[test]
    fn test_free_unknown_memory_fails() {
        let sequence = CaptureSequence::new();
        assert!(matches!(
            sequence.free(MemoryHandle(42)),
            Err(CameraError::UnknownMemory(MemoryHandle(42)))
        ));
    }
}
