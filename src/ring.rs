//! The HDLC-to-modem ring: frames and indicators queued from the packet side
//! for the audio transmit chain.
//!
//! Single producer (T.38 ingress advances `in`), single consumer (the
//! transmit underflow path advances `out`). `in == out` means empty; a slot
//! being filled at `in` is also the slot being drained at `out` when a frame
//! streams straight through.

use bitflags::bitflags;

use crate::hdlc::MAX_FRAME_LEN;
use crate::t38::{T38DataType, T38Indicator};

pub(crate) const RING_SLOTS: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SlotFlags: u8 {
        const FINISHED = 0x01;
        const CORRUPT_CRC = 0x02;
        const PROCEED_WITH_OUTPUT = 0x04;
        const MISSING_DATA = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotContents {
    Empty,
    Indicator(T38Indicator),
    Data(T38DataType),
}

#[derive(Clone, Copy)]
pub(crate) struct HdlcSlot {
    pub contents: SlotContents,
    pub flags: SlotFlags,
    pub len: usize,
    pub buf: [u8; MAX_FRAME_LEN],
}

impl HdlcSlot {
    const EMPTY: Self = Self {
        contents: SlotContents::Empty,
        flags: SlotFlags::empty(),
        len: 0,
        buf: [0; MAX_FRAME_LEN],
    };

    pub fn clear(&mut self) {
        self.contents = SlotContents::Empty;
        self.flags = SlotFlags::empty();
        self.len = 0;
    }
}

pub(crate) struct HdlcRing {
    slots: [HdlcSlot; RING_SLOTS],
    in_idx: usize,
    out_idx: usize,
}

impl HdlcRing {
    pub fn new() -> Self {
        Self {
            slots: [HdlcSlot::EMPTY; RING_SLOTS],
            in_idx: 0,
            out_idx: 0,
        }
    }

    /// True when the producer and consumer point at the same slot, i.e. the
    /// slot being filled is also the one at the output.
    pub fn is_empty(&self) -> bool {
        self.in_idx == self.out_idx
    }

    pub fn out_index(&self) -> usize {
        self.out_idx
    }

    pub fn slot_in(&self) -> &HdlcSlot {
        &self.slots[self.in_idx]
    }

    pub fn slot_in_mut(&mut self) -> &mut HdlcSlot {
        &mut self.slots[self.in_idx]
    }

    pub fn slot_out(&self) -> &HdlcSlot {
        &self.slots[self.out_idx]
    }

    pub fn slot_out_mut(&mut self) -> &mut HdlcSlot {
        &mut self.slots[self.out_idx]
    }

    pub fn advance_in(&mut self) {
        self.in_idx = (self.in_idx + 1) % RING_SLOTS;
    }

    pub fn advance_out(&mut self) {
        self.out_idx = (self.out_idx + 1) % RING_SLOTS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let ring = HdlcRing::new();
        assert!(ring.is_empty());
        assert_eq!(ring.slot_out().contents, SlotContents::Empty);
    }

    #[test]
    fn producer_and_consumer_meet_after_wrap() {
        let mut ring = HdlcRing::new();
        for _ in 0..RING_SLOTS {
            ring.slot_in_mut().contents = SlotContents::Data(T38DataType::V21);
            ring.advance_in();
            ring.advance_out();
        }
        assert!(ring.is_empty());
        assert_eq!(ring.out_index(), 0);
    }

    #[test]
    fn slot_clear_resets_tag_and_flags() {
        let mut ring = HdlcRing::new();
        let slot = ring.slot_in_mut();
        slot.contents = SlotContents::Indicator(T38Indicator::NoSignal);
        slot.flags = SlotFlags::PROCEED_WITH_OUTPUT | SlotFlags::FINISHED;
        slot.len = 5;
        slot.clear();
        assert_eq!(slot.contents, SlotContents::Empty);
        assert_eq!(slot.flags, SlotFlags::empty());
        assert_eq!(slot.len, 0);
    }
}
