//! Per-buffer ownership state machine.
//!
//! A slot tracks which subsystem may touch the physical buffer behind it.
//! `Capturing` and `Displayed` both mean live hardware access, so the table
//! refuses any transition that would let one slot hold both at once, and
//! keeps at most one slot `Displayed` per plane.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the capture driver; hardware may be writing into it.
    Capturing,
    /// Fully captured, not yet claimed by the coordinator.
    Ready,
    /// Bound to a plane; scanout hardware may be reading it.
    Displayed,
    /// Claimed back from display, about to be resubmitted to capture.
    Returning,
}

impl SlotState {
    pub fn name(self) -> &'static str {
        match self {
            SlotState::Capturing => "CAPTURING",
            SlotState::Ready => "READY",
            SlotState::Displayed => "DISPLAYED",
            SlotState::Returning => "RETURNING",
        }
    }
}

/// Slot states for one stream's buffer pool, plus the index currently bound
/// to the stream's plane.
pub struct SlotTable {
    slots: Vec<SlotState>,
    displayed: Option<u32>,
}

impl SlotTable {
    /// A fresh table after `start()`: the reserved slot begins `Displayed`
    /// (it is the buffer held back from the capture queue for the first
    /// scanout), every other slot begins `Capturing`.
    pub fn new(count: u32, reserved: Option<u32>) -> Self {
        let mut slots = vec![SlotState::Capturing; count as usize];
        if let Some(idx) = reserved {
            slots[idx as usize] = SlotState::Displayed;
        }
        Self {
            slots,
            displayed: reserved,
        }
    }

    pub fn state(&self, index: u32) -> Option<SlotState> {
        self.slots.get(index as usize).copied()
    }

    pub fn displayed_index(&self) -> Option<u32> {
        self.displayed
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn get(&mut self, index: u32) -> Result<&mut SlotState> {
        let count = self.slots.len() as u32;
        self.slots
            .get_mut(index as usize)
            .ok_or(Error::BadIndex { index, count })
    }

    fn transition(&mut self, index: u32, from: SlotState, to: SlotState) -> Result<()> {
        let slot = self.get(index)?;
        if *slot != from {
            return Err(Error::SlotTransition {
                index,
                from: slot.name(),
                to: to.name(),
            });
        }
        *slot = to;
        Ok(())
    }

    /// Capture-completion event: `Capturing -> Ready`.
    pub fn captured(&mut self, index: u32) -> Result<()> {
        self.transition(index, SlotState::Capturing, SlotState::Ready)
    }

    /// Successful scanout bind: `Ready -> Displayed`, displacing the
    /// previous `Displayed` slot into `Returning`. Returns the displaced
    /// index, the one now safe to hand back to capture.
    pub fn displayed(&mut self, index: u32) -> Result<Option<u32>> {
        self.transition(index, SlotState::Ready, SlotState::Displayed)?;
        let previous = self.displayed.replace(index);
        if let Some(prev) = previous {
            // Already checked Displayed when it was bound; a mismatch here
            // is table corruption.
            self.transition(prev, SlotState::Displayed, SlotState::Returning)?;
        }
        Ok(previous)
    }

    /// Successful resubmission into the capture queue:
    /// `Returning -> Capturing`, or `Ready -> Capturing` when a failed
    /// scanout bind sends a claimed buffer straight back.
    pub fn requeued(&mut self, index: u32) -> Result<()> {
        let slot = self.get(index)?;
        match *slot {
            SlotState::Returning | SlotState::Ready => {
                *slot = SlotState::Capturing;
                Ok(())
            }
            other => Err(Error::SlotTransition {
                index,
                from: other.name(),
                to: SlotState::Capturing.name(),
            }),
        }
    }

    /// The safety property: no slot owned by both engines, and at most one
    /// slot on the plane.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let displayed: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == SlotState::Displayed)
            .collect();
        assert!(displayed.len() <= 1, "more than one DISPLAYED slot");
        match (self.displayed, displayed.first()) {
            (Some(idx), Some((i, _))) => assert_eq!(idx as usize, *i),
            (None, None) => {}
            other => panic!("displayed bookkeeping out of sync: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_cycle() {
        let mut table = SlotTable::new(4, Some(0));
        assert_eq!(table.displayed_index(), Some(0));

        table.captured(1).unwrap();
        assert_eq!(table.state(1), Some(SlotState::Ready));

        let displaced = table.displayed(1).unwrap();
        assert_eq!(displaced, Some(0));
        assert_eq!(table.state(0), Some(SlotState::Returning));
        assert_eq!(table.state(1), Some(SlotState::Displayed));
        table.check_invariants();

        table.requeued(0).unwrap();
        assert_eq!(table.state(0), Some(SlotState::Capturing));
        table.check_invariants();
    }

    #[test]
    fn double_capture_rejected() {
        let mut table = SlotTable::new(2, None);
        table.captured(1).unwrap();
        assert!(matches!(
            table.captured(1),
            Err(Error::SlotTransition { index: 1, .. })
        ));
    }

    #[test]
    fn display_requires_ready() {
        let mut table = SlotTable::new(2, None);
        // Slot 0 is Capturing; binding it would put it on both engines.
        assert!(table.displayed(0).is_err());
    }

    #[test]
    fn requeue_requires_claimed_buffer() {
        let mut table = SlotTable::new(3, Some(0));
        // Slot 1 is still Capturing.
        assert!(table.requeued(1).is_err());
        // Slot 0 is Displayed, not yet displaced.
        assert!(table.requeued(0).is_err());
    }

    #[test]
    fn failed_bind_path_requeues_from_ready() {
        let mut table = SlotTable::new(2, None);
        table.captured(0).unwrap();
        table.requeued(0).unwrap();
        assert_eq!(table.state(0), Some(SlotState::Capturing));
    }

    #[test]
    fn out_of_range_index() {
        let mut table = SlotTable::new(2, None);
        assert!(matches!(
            table.captured(5),
            Err(Error::BadIndex { index: 5, count: 2 })
        ));
    }
}
