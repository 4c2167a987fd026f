// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Sequence-gap detection.
//!
//! Trace events carry an 8-bit rolling counter but arrive reordered by the
//! transport. Events are parked in a 256-slot table indexed by their counter
//! value and released from a read pointer that trails the newest insertion
//! by a fixed warm-up depth. An empty slot at release time means the event
//! with that counter value never arrived; the miss count is attached to the
//! next released event as its `sequence_gap`.

use static_assertions::const_assert;

use crate::event::TraceEvent;

/// One slot per possible sequence counter value.
const SEQ_SLOTS: usize = 256;

/// Insertions held back before releases begin. The smallest window that
/// reliably distinguishes reordering from loss at the observed reordering
/// depth.
pub const SEQ_WARMUP_DEPTH: usize = 20;

const_assert!(SEQ_WARMUP_DEPTH < SEQ_SLOTS);

pub(crate) struct SeqBuffer {
    slots: Vec<Option<TraceEvent>>,
    /// Next slot to release; trails insertions by the warm-up depth.
    read_ptr: Option<u8>,
    fill: usize,
    /// Consecutive misses since the last successful release.
    gap: u32,
}

impl SeqBuffer {
    pub fn new() -> Self {
        Self {
            slots: (0..SEQ_SLOTS).map(|_| None).collect(),
            read_ptr: None,
            fill: 0,
            gap: 0,
        }
    }

    /// Parks `event` and, once warmed up, releases the event at the read
    /// pointer with its `sequence_gap` filled in. Returns `None` during
    /// warm-up and whenever the release slot is empty (a lost event).
    pub fn push(&mut self, event: TraceEvent) -> Option<TraceEvent> {
        let seq = event.seq;
        let ptr = *self.read_ptr.get_or_insert(seq);
        self.slots[seq as usize] = Some(event);

        if self.fill < SEQ_WARMUP_DEPTH {
            self.fill += 1;
            return None;
        }

        let mut out = self.slots[ptr as usize].take();
        match out.as_mut() {
            Some(ev) => {
                ev.sequence_gap = self.gap;
                self.gap = 0;
            }
            None => self.gap += 1,
        }
        self.read_ptr = Some(ptr.wrapping_add(1));
        out
    }
}
