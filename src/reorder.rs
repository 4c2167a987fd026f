// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Timestamp reordering.
//!
//! Events leave the sequence-gap detector ordered by counter, not by time.
//! A fixed-capacity buffer sorted youngest-first absorbs the remaining
//! jitter and releases its oldest element once full, so everything
//! downstream sees non-decreasing ZGT. A timestamp older than all buffered
//! events is a regression the buffer cannot absorb; the buffer restarts
//! from scratch and the caller must reset dependent state.

use crate::event::TraceEvent;

/// Buffered events before releases begin.
pub const REORDER_CAPACITY: usize = 300;

pub(crate) enum ReorderPush {
    /// Oldest buffered event, released in non-decreasing time order.
    Released(TraceEvent),
    /// Still filling up.
    Buffered,
    /// Non-monotonic regression beyond capacity; the buffer reinitialized
    /// itself with the offending event as its only element. Carries the
    /// offending timestamp.
    Overflow(u64),
}

pub(crate) struct ReorderBuffer {
    /// Sorted descending by time; tail is the oldest event. A new event
    /// with an equal timestamp sorts toward the head so earlier arrivals
    /// release first.
    buf: Vec<TraceEvent>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(REORDER_CAPACITY + 1),
        }
    }

    pub fn push(&mut self, event: TraceEvent) -> ReorderPush {
        match self.buf.iter().position(|e| e.time <= event.time) {
            Some(idx) => self.buf.insert(idx, event),
            None if self.buf.len() < REORDER_CAPACITY => self.buf.push(event),
            None => {
                let zgt = event.time;
                self.buf.clear();
                self.buf.push(event);
                return ReorderPush::Overflow(zgt);
            }
        }
        if self.buf.len() > REORDER_CAPACITY {
            if let Some(oldest) = self.buf.pop() {
                return ReorderPush::Released(oldest);
            }
        }
        ReorderPush::Buffered
    }
}
