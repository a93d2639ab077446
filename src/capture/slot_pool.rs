//! Ownership ledger for device frame buffers.
//!
//! A capture device owns a handful of buffers (four on typical V4L2 webcams)
//! that are shared between two parties: the hardware, which fills them, and the
//! consumer, which reads them. The pool records which party holds each slot so
//! that the two never touch the same memory at the same time.
//!
//! # State Machine
//!
//! ```text
//!            mark_queued            take
//!   Free ----------------> QueuedToHardware ----------------> OwnedByConsumer
//!    ^                           ^                                  |
//!    |        reset              |             give_back            |
//!    +---------------------------+----------------------------------+
//!    |                                                              |
//!    +------------------------- abandon ----------------------------+
//! ```
//!
//! `abandon` records a consumer slot the hardware refused to take back. It is
//! `Free` again, so the pump can queue it on a later attempt.
//!
//! The pool has no internal locking. It is single-writer by construction: only
//! the thread that owns the [`FramePump`](super::FramePump) ever touches it.

use crate::error::{CaptureError, CaptureResult};

/// Which party currently owns a buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Mapped but not handed to the hardware (before streaming starts).
    Free,
    /// Eligible for the hardware to fill.
    QueuedToHardware,
    /// Lent to application code; the hardware must not touch it.
    OwnedByConsumer,
}

/// One buffer slot: fixed backing memory plus its owner.
#[derive(Debug)]
struct BufferSlot<R> {
    region: R,
    state: SlotState,
}

/// Fixed set of buffer slots allocated once when the device is opened.
///
/// Slots are never reallocated mid-stream; the backing regions are released
/// (unmapped) when the pool is dropped.
#[derive(Debug)]
pub struct BufferSlotPool<R> {
    slots: Vec<BufferSlot<R>>,
}

impl<R: AsRef<[u8]> + AsMut<[u8]>> BufferSlotPool<R> {
    /// Build a pool over already-mapped regions. Every slot starts `Free`.
    #[must_use]
    pub fn new(regions: Vec<R>) -> Self {
        let slots = regions
            .into_iter()
            .map(|region| BufferSlot {
                region,
                state: SlotState::Free,
            })
            .collect();
        Self { slots }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True for a pool without slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current owner of slot `index`.
    pub fn state(&self, index: usize) -> CaptureResult<SlotState> {
        self.slot(index).map(|slot| slot.state)
    }

    /// Number of slots in `state`.
    #[must_use]
    pub fn count_in(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// Indices of all `Free` slots, in order.
    #[must_use]
    pub fn free_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::Free)
            .map(|(index, _)| index)
            .collect()
    }

    /// Record that a `Free` slot was handed to the hardware.
    pub fn mark_queued(&mut self, index: usize) -> CaptureResult<()> {
        let slot = self.slot_mut(index)?;
        match slot.state {
            SlotState::Free => {
                slot.state = SlotState::QueuedToHardware;
                Ok(())
            }
            state => Err(CaptureError::SlotNotFree { index, state }),
        }
    }

    /// Move a slot the hardware signalled as ready to the consumer.
    ///
    /// Fails if the index is out of range or the slot was not queued, which
    /// also guarantees a consumer-owned slot is never handed out twice.
    pub fn take(&mut self, index: usize) -> CaptureResult<&R> {
        let slot = self.slot_mut(index)?;
        if slot.state != SlotState::QueuedToHardware {
            return Err(CaptureError::SlotNotQueued {
                index,
                state: slot.state,
            });
        }
        slot.state = SlotState::OwnedByConsumer;
        Ok(&slot.region)
    }

    /// Return a consumer-owned slot to the hardware.
    pub fn give_back(&mut self, index: usize) -> CaptureResult<()> {
        let slot = self.slot_mut(index)?;
        if slot.state != SlotState::OwnedByConsumer {
            return Err(CaptureError::SlotNotOwned {
                index,
                state: slot.state,
            });
        }
        slot.state = SlotState::QueuedToHardware;
        Ok(())
    }

    /// Mark a consumer-owned slot `Free` after the hardware rejected it.
    pub fn abandon(&mut self, index: usize) -> CaptureResult<()> {
        let slot = self.slot_mut(index)?;
        if slot.state != SlotState::OwnedByConsumer {
            return Err(CaptureError::SlotNotOwned {
                index,
                state: slot.state,
            });
        }
        slot.state = SlotState::Free;
        Ok(())
    }

    /// Mark every slot `Free` (streaming stopped; the hardware dropped its queue).
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.state = SlotState::Free;
        }
    }

    /// Read access to a consumer-owned slot.
    pub fn region(&self, index: usize) -> CaptureResult<&[u8]> {
        let slot = self.slot(index)?;
        if slot.state != SlotState::OwnedByConsumer {
            return Err(CaptureError::SlotNotOwned {
                index,
                state: slot.state,
            });
        }
        Ok(slot.region.as_ref())
    }

    /// Write access for the hardware side, only while the slot is queued to it.
    pub fn hardware_region_mut(&mut self, index: usize) -> CaptureResult<&mut R> {
        let slot = self.slot_mut(index)?;
        if slot.state != SlotState::QueuedToHardware {
            return Err(CaptureError::SlotNotQueued {
                index,
                state: slot.state,
            });
        }
        Ok(&mut slot.region)
    }

    fn slot(&self, index: usize) -> CaptureResult<&BufferSlot<R>> {
        let count = self.slots.len();
        self.slots
            .get(index)
            .ok_or(CaptureError::SlotOutOfRange { index, count })
    }

    fn slot_mut(&mut self, index: usize) -> CaptureResult<&mut BufferSlot<R>> {
        let count = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(CaptureError::SlotOutOfRange { index, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_pool(n: usize) -> BufferSlotPool<Vec<u8>> {
        let mut pool = BufferSlotPool::new((0..n).map(|_| vec![0u8; 16]).collect());
        for i in 0..n {
            pool.mark_queued(i).unwrap();
        }
        pool
    }

    #[test]
    fn test_new_slots_are_free() {
        let pool = BufferSlotPool::new(vec![vec![0u8; 4], vec![0u8; 4]]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.count_in(SlotState::Free), 2);
        assert_eq!(pool.free_indices(), vec![0, 1]);
    }

    #[test]
    fn test_take_and_give_back() {
        let mut pool = queued_pool(2);

        pool.take(1).unwrap();
        assert_eq!(pool.state(1).unwrap(), SlotState::OwnedByConsumer);
        assert_eq!(pool.count_in(SlotState::QueuedToHardware), 1);

        pool.give_back(1).unwrap();
        assert_eq!(pool.state(1).unwrap(), SlotState::QueuedToHardware);
    }

    #[test]
    fn test_consumer_owned_slot_not_handed_out_twice() {
        let mut pool = queued_pool(4);
        pool.take(2).unwrap();

        let err = pool.take(2).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::SlotNotQueued {
                index: 2,
                state: SlotState::OwnedByConsumer
            }
        ));
    }

    #[test]
    fn test_released_slot_may_be_reused() {
        let mut pool = queued_pool(2);
        pool.take(0).unwrap();
        pool.give_back(0).unwrap();
        assert!(pool.take(0).is_ok());
    }

    #[test]
    fn test_out_of_range_index() {
        let mut pool = queued_pool(2);
        assert!(matches!(
            pool.take(5),
            Err(CaptureError::SlotOutOfRange { index: 5, count: 2 })
        ));
    }

    #[test]
    fn test_double_give_back_rejected() {
        let mut pool = queued_pool(2);
        pool.take(0).unwrap();
        pool.give_back(0).unwrap();
        assert!(pool.give_back(0).is_err());
    }

    #[test]
    fn test_region_requires_consumer_ownership() {
        let mut pool = queued_pool(1);
        assert!(pool.region(0).is_err());
        pool.take(0).unwrap();
        assert_eq!(pool.region(0).unwrap().len(), 16);
        assert!(pool.hardware_region_mut(0).is_err());
    }

    #[test]
    fn test_mark_queued_requires_free_slot() {
        let mut pool = queued_pool(2);
        assert!(matches!(
            pool.mark_queued(1),
            Err(CaptureError::SlotNotFree {
                index: 1,
                state: SlotState::QueuedToHardware
            })
        ));
    }

    #[test]
    fn test_abandoned_slot_can_be_queued_again() {
        let mut pool = queued_pool(2);
        assert!(pool.abandon(0).is_err());

        pool.take(0).unwrap();
        pool.abandon(0).unwrap();
        assert_eq!(pool.state(0).unwrap(), SlotState::Free);
        assert_eq!(pool.free_indices(), vec![0]);
        pool.mark_queued(0).unwrap();
        assert_eq!(pool.count_in(SlotState::QueuedToHardware), 2);
    }

    #[test]
    fn test_reset_frees_everything() {
        let mut pool = queued_pool(3);
        pool.take(1).unwrap();
        pool.reset();
        assert_eq!(pool.count_in(SlotState::Free), 3);
    }
}
