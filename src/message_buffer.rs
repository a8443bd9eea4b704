//! # Message Buffer
//!
//! A fixed-capacity (256-slot) sliding window keyed by `seq_num mod 256`,
//! reconciling unordered arrivals of CTRL/EAGER messages with receiver and
//! sender posts for the same sequence number (spec.md §4.2). The window
//! width (256) is less than the 10-bit sequence space (1024), so no two
//! in-flight sequence numbers can ever alias onto the same slot
//! (spec.md §3's aliasing invariant).

use crate::error::TransportError;

/// Window width. Must stay `<= 1 << SEQ_BITS` (see [`crate::wire::SEQ_BITS`]).
pub const WINDOW_SIZE: usize = 256;

/// Distinguishes an unsolicited incoming message from a local post
/// waiting for its counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// An arrived CTRL or EAGER message waiting for a local post.
    Buffer,
    /// A local `send`/`recv` post waiting for its counterpart.
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    NotStarted,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Success,
    /// The slot was already `InProgress`; its current type/status are
    /// returned so the caller can decide whether to `replace` (opposite
    /// side) or treat it as a duplicate post (same side).
    InvalidIdx { occupant: ElementType, status: SlotStatus },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    status: SlotStatus,
    element_type: ElementType,
    ptr: usize,
}

/// Sliding window of `WINDOW_SIZE` slots, indexed by `seq % WINDOW_SIZE`.
/// `ptr` is an opaque index into whichever pool the caller uses (the
/// bounce-buffer pool for `Buffer` elements, the request pool for
/// `Request` elements) — the message buffer itself never dereferences it.
#[derive(Debug)]
pub struct MessageBuffer {
    slots: Vec<Option<Slot>>,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            slots: vec![None; WINDOW_SIZE],
        }
    }

    fn idx(seq: u16) -> usize {
        (seq as usize) % WINDOW_SIZE
    }

    /// Insert `ptr` at `seq`. Succeeds only when the slot is empty or
    /// already `Complete` (the window has wrapped and this is a fresh
    /// use of the slot), moving it to `InProgress`. Otherwise returns
    /// `InvalidIdx` describing the current occupant so the caller can
    /// decide what to do (spec.md §4.2's tie-break contract).
    pub fn insert(&mut self, seq: u16, ptr: usize, element_type: ElementType) -> InsertOutcome {
        let idx = Self::idx(seq);
        match &self.slots[idx] {
            None | Some(Slot { status: SlotStatus::Complete, .. }) => {
                self.slots[idx] = Some(Slot {
                    status: SlotStatus::InProgress,
                    element_type,
                    ptr,
                });
                InsertOutcome::Success
            }
            Some(slot) => InsertOutcome::InvalidIdx {
                occupant: slot.element_type,
                status: slot.status,
            },
        }
    }

    /// Overwrite an `InProgress` slot's element without changing its
    /// status. Fails if the slot is not currently `InProgress`.
    pub fn replace(
        &mut self,
        seq: u16,
        ptr: usize,
        element_type: ElementType,
    ) -> Result<(), TransportError> {
        let idx = Self::idx(seq);
        match &mut self.slots[idx] {
            Some(slot) if slot.status == SlotStatus::InProgress => {
                slot.ptr = ptr;
                slot.element_type = element_type;
                Ok(())
            }
            _ => Err(TransportError::Protocol(format!(
                "replace on seq {seq} requires an in-progress slot"
            ))),
        }
    }

    /// Read the element/type/status at `seq` without modifying it.
    pub fn retrieve(&self, seq: u16) -> Option<(usize, ElementType, SlotStatus)> {
        self.slots[Self::idx(seq)].map(|s| (s.ptr, s.element_type, s.status))
    }

    /// Transition an `InProgress` slot to `Complete`. Fails if the slot is
    /// not `InProgress`.
    pub fn complete(&mut self, seq: u16) -> Result<(), TransportError> {
        let idx = Self::idx(seq);
        match &mut self.slots[idx] {
            Some(slot) if slot.status == SlotStatus::InProgress => {
                slot.status = SlotStatus::Complete;
                Ok(())
            }
            _ => Err(TransportError::Protocol(format!(
                "complete on seq {seq} requires an in-progress slot"
            ))),
        }
    }

    /// Drop a `Complete` slot back to empty, letting the window reuse it
    /// the next time the sequence number wraps around.
    pub fn clear(&mut self, seq: u16) {
        let idx = Self::idx(seq);
        if let Some(Slot { status: SlotStatus::Complete, .. }) = &self.slots[idx] {
            self.slots[idx] = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_retrieve_round_trips() {
        let mut mb = MessageBuffer::new();
        assert_eq!(mb.insert(5, 42, ElementType::Buffer), InsertOutcome::Success);
        let (ptr, ty, status) = mb.retrieve(5).unwrap();
        assert_eq!(ptr, 42);
        assert_eq!(ty, ElementType::Buffer);
        assert_eq!(status, SlotStatus::InProgress);
    }

    #[test]
    fn second_insert_on_same_slot_is_invalid_idx() {
        let mut mb = MessageBuffer::new();
        mb.insert(5, 1, ElementType::Buffer);
        let outcome = mb.insert(5, 2, ElementType::Request);
        assert_eq!(
            outcome,
            InsertOutcome::InvalidIdx {
                occupant: ElementType::Buffer,
                status: SlotStatus::InProgress
            }
        );
    }

    #[test]
    fn replace_overwrites_without_changing_status() {
        let mut mb = MessageBuffer::new();
        mb.insert(5, 1, ElementType::Buffer);
        mb.replace(5, 99, ElementType::Request).unwrap();
        let (ptr, ty, status) = mb.retrieve(5).unwrap();
        assert_eq!(ptr, 99);
        assert_eq!(ty, ElementType::Request);
        assert_eq!(status, SlotStatus::InProgress);
    }

    #[test]
    fn replace_on_empty_slot_fails() {
        let mut mb = MessageBuffer::new();
        assert!(mb.replace(5, 99, ElementType::Request).is_err());
    }

    #[test]
    fn complete_then_clear_frees_the_slot_for_reuse() {
        let mut mb = MessageBuffer::new();
        mb.insert(5, 1, ElementType::Buffer);
        mb.complete(5).unwrap();
        assert_eq!(mb.retrieve(5).unwrap().2, SlotStatus::Complete);
        mb.clear(5);
        assert!(mb.retrieve(5).is_none());
        // Window has wrapped (seq 5 + 256): fresh insert succeeds again.
        assert_eq!(
            mb.insert(5 + WINDOW_SIZE as u16, 7, ElementType::Request),
            InsertOutcome::Success
        );
    }

    #[test]
    fn race_closure_either_order_both_sides_eventually_insert() {
        // Side A (local post) wins the race.
        let mut mb = MessageBuffer::new();
        assert_eq!(mb.insert(9, 1, ElementType::Request), InsertOutcome::Success);
        match mb.insert(9, 2, ElementType::Buffer) {
            InsertOutcome::InvalidIdx { occupant, .. } => assert_eq!(occupant, ElementType::Request),
            InsertOutcome::Success => panic!("second insert on same slot must not succeed"),
        }
        mb.replace(9, 2, ElementType::Buffer).unwrap();
        assert_eq!(mb.retrieve(9).unwrap().0, 2);

        // Side B (peer arrival) wins the race.
        let mut mb = MessageBuffer::new();
        assert_eq!(mb.insert(9, 1, ElementType::Buffer), InsertOutcome::Success);
        match mb.insert(9, 2, ElementType::Request) {
            InsertOutcome::InvalidIdx { occupant, .. } => assert_eq!(occupant, ElementType::Buffer),
            InsertOutcome::Success => panic!("second insert on same slot must not succeed"),
        }
        mb.replace(9, 2, ElementType::Request).unwrap();
        assert_eq!(mb.retrieve(9).unwrap().0, 2);
    }
}
