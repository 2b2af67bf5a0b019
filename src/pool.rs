//! Fixed-slot frame buffer pool with ownership transfer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};
use crate::frame::FrameMetadata;

/// What `acquire` does when every slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExhaustionPolicy {
    /// Wait for a slot, optionally bounded by a timeout
    Block,
    /// Return `PoolExhausted` immediately
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Slot count, fixed at configure time
    pub depth: usize,
    /// Consumer-side acquire policy; the hardware path always uses try_acquire
    pub exhaustion: ExhaustionPolicy,
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            depth: 4,
            exhaustion: ExhaustionPolicy::Block,
            acquire_timeout_ms: Some(1000),
        }
    }
}

/// Ownership states of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    InFlight,
    Delivered,
}

struct Slot {
    state: SlotState,
    /// Payload storage parked here only while the slot is Free
    payload: Option<BytesMut>,
}

struct Shared {
    slots: Mutex<Vec<Slot>>,
    available: Condvar,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicUsize,
    released: AtomicUsize,
    exhausted: AtomicUsize,
}

/// Pre-allocated pool of reusable frame buffers.
///
/// Every buffer is allocated once at pool creation and reused for the life of
/// the device. A buffer is owned by exactly one holder at a time; ownership
/// moves with the [`FrameBuffer`] guard and returns on `release`. Transitions
/// other than `Free -> InFlight -> Delivered -> Free` are contract violations
/// and panic rather than returning a recoverable error.
pub struct FramePool {
    shared: Arc<Shared>,
    depth: usize,
}

impl FramePool {
    pub fn new(depth: usize, payload_bytes: usize) -> Self {
        let slots = (0..depth)
            .map(|_| Slot {
                state: SlotState::Free,
                payload: Some(BytesMut::zeroed(payload_bytes)),
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(slots),
                available: Condvar::new(),
                stats: CachePadded::new(Stats::default()),
            }),
            depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Non-blocking acquire. This is the only path the hardware thread uses.
    pub fn try_acquire(&self) -> Option<FrameBuffer> {
        let mut slots = self.shared.slots.lock().unwrap();
        self.take_free(&mut slots)
    }

    /// Consumer-side acquire honoring the configured exhaustion policy.
    pub fn acquire(&self, config: &PoolConfig) -> Result<FrameBuffer> {
        let mut slots = self.shared.slots.lock().unwrap();
        if let Some(buf) = self.take_free(&mut slots) {
            return Ok(buf);
        }
        match config.exhaustion {
            ExhaustionPolicy::Fail => {
                self.shared.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                Err(DeviceError::PoolExhausted)
            }
            ExhaustionPolicy::Block => {
                let deadline = config.acquire_timeout_ms.map(Duration::from_millis);
                loop {
                    slots = match deadline {
                        Some(timeout) => {
                            let (guard, wait) = self
                                .shared
                                .available
                                .wait_timeout(slots, timeout)
                                .unwrap();
                            if wait.timed_out() {
                                self.shared.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                                return Err(DeviceError::PoolExhausted);
                            }
                            guard
                        }
                        None => self.shared.available.wait(slots).unwrap(),
                    };
                    if let Some(buf) = self.take_free(&mut slots) {
                        return Ok(buf);
                    }
                }
            }
        }
    }

    fn take_free(&self, slots: &mut Vec<Slot>) -> Option<FrameBuffer> {
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.state == SlotState::Free)?;
        slot.state = SlotState::InFlight;
        let payload = slot
            .payload
            .take()
            .expect("free slot always parks its payload");
        self.shared.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Some(FrameBuffer {
            shared: Arc::clone(&self.shared),
            index,
            payload,
            metadata: None,
            state: SlotState::InFlight,
        })
    }

    /// (acquired, released, exhaustion events)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.shared.stats.acquired.load(Ordering::Relaxed),
            self.shared.stats.released.load(Ordering::Relaxed),
            self.shared.stats.exhausted.load(Ordering::Relaxed),
        )
    }

    pub fn free_count(&self) -> usize {
        let slots = self.shared.slots.lock().unwrap();
        slots.iter().filter(|s| s.state == SlotState::Free).count()
    }
}

/// Exclusively-owned frame buffer checked out of a [`FramePool`].
///
/// Holding the guard IS holding the buffer; there is no way to alias the
/// payload from another thread. Dropping a guard without `release` returns
/// the slot to the pool (teardown path).
pub struct FrameBuffer {
    shared: Arc<Shared>,
    index: usize,
    payload: BytesMut,
    metadata: Option<FrameMetadata>,
    state: SlotState,
}

impl FrameBuffer {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    /// Attach metadata; immutable once set.
    pub fn attach(&mut self, metadata: FrameMetadata) {
        assert!(
            self.metadata.is_none(),
            "frame metadata is immutable once attached"
        );
        self.metadata = Some(metadata);
    }

    pub fn metadata(&self) -> Option<&FrameMetadata> {
        self.metadata.as_ref()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// InFlight -> Delivered, on handoff from the engine to the consumer.
    pub fn mark_delivered(&mut self) {
        assert_eq!(
            self.state,
            SlotState::InFlight,
            "only an in-flight buffer can be delivered"
        );
        self.state = SlotState::Delivered;
        let mut slots = self.shared.slots.lock().unwrap();
        slots[self.index].state = SlotState::Delivered;
    }

    /// Return the buffer to the pool. Wipes the metadata reference and wakes
    /// one blocked `acquire`.
    pub fn release(self) {
        assert!(
            matches!(self.state, SlotState::InFlight | SlotState::Delivered),
            "released buffer must be InFlight or Delivered"
        );
        self.shared.stats.released.fetch_add(1, Ordering::Relaxed);
        // Drop returns the slot.
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        // Single return path: explicit release and guard teardown (consumer
        // panicked, engine shutdown) both land here, so a slot can never come
        // back twice or leak.
        self.metadata = None;
        let payload = std::mem::take(&mut self.payload);
        if let Ok(mut slots) = self.shared.slots.lock() {
            let slot = &mut slots[self.index];
            slot.state = SlotState::Free;
            slot.payload = Some(payload);
        }
        self.shared.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFlags, Timecode};

    fn meta(sequence: u64) -> FrameMetadata {
        FrameMetadata {
            sequence,
            timecode: Timecode::ZERO,
            stream_timestamp: Duration::ZERO,
            flags: FrameFlags::default(),
            hdr: None,
        }
    }

    #[test]
    fn no_double_ownership() {
        let pool = FramePool::new(2, 64);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_ne!(a.index, b.index);
        assert!(pool.try_acquire().is_none());
        a.release();
        let c = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        drop(b);
        drop(c);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn fail_policy_surfaces_exhaustion() {
        let pool = FramePool::new(1, 64);
        let config = PoolConfig {
            depth: 1,
            exhaustion: ExhaustionPolicy::Fail,
            acquire_timeout_ms: None,
        };
        let held = pool.acquire(&config).unwrap();
        assert!(matches!(
            pool.acquire(&config),
            Err(DeviceError::PoolExhausted)
        ));
        held.release();
        assert!(pool.acquire(&config).is_ok());
    }

    #[test]
    fn blocking_acquire_wakes_on_release() {
        let pool = Arc::new(FramePool::new(1, 64));
        let config = PoolConfig {
            depth: 1,
            exhaustion: ExhaustionPolicy::Block,
            acquire_timeout_ms: Some(2000),
        };
        let held = pool.try_acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let config = config.clone();
            std::thread::spawn(move || pool.acquire(&config).map(|b| b.release()))
        };
        std::thread::sleep(Duration::from_millis(50));
        held.release();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn release_wipes_metadata() {
        let pool = FramePool::new(1, 64);
        let mut buf = pool.try_acquire().unwrap();
        buf.attach(meta(1));
        buf.mark_delivered();
        buf.release();

        let buf = pool.try_acquire().unwrap();
        assert!(buf.metadata().is_none());
    }

    #[test]
    #[should_panic(expected = "immutable once attached")]
    fn reattaching_metadata_panics() {
        let pool = FramePool::new(1, 64);
        let mut buf = pool.try_acquire().unwrap();
        buf.attach(meta(1));
        buf.attach(meta(2));
    }

    #[test]
    #[should_panic(expected = "only an in-flight buffer")]
    fn delivering_twice_panics() {
        let pool = FramePool::new(1, 64);
        let mut buf = pool.try_acquire().unwrap();
        buf.mark_delivered();
        buf.mark_delivered();
    }
}
