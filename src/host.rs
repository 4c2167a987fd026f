// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-host event pipeline.
//!
//! Every trace event of a host passes two buffering stages before it
//! reaches a core: the sequence buffer, which restores the rolling-counter
//! order and flags lost events, and the reorder buffer, which restores ZGT
//! order. Timestamp sanity checks sit between the stages. Logging frames
//! carry task-id-name mappings on a separate sequence counter and bypass
//! both stages.

use log::{debug, warn};

use crate::core::Core;
use crate::event::{EventPayload, TaskNameMsg, TraceEvent, INVALID_ZGT};
use crate::reorder::{ReorderBuffer, ReorderPush};
use crate::seq_buffer::SeqBuffer;
use crate::signal::{
    EventReceived, SequenceError, Signal, SignalHub, TaskIdName, ZgtCorrection, ZgtError,
};

/// Released events whose ZGT is further than this from the highest ZGT seen
/// indicate a discontinuity in the stream.
pub const ZGT_JUMP_THRESHOLD: u64 = 1_000_000;

pub struct Host {
    id: u8,
    name: String,
    cores: Vec<Core>,
    seq_buffer: SeqBuffer,
    reorder: ReorderBuffer,
    /// Highest corrected ZGT released so far.
    max_zgt: u64,
    /// Offset subtracted from every timestamp, announced by the target.
    zgt_correction: i64,
    /// Task-name transfer bookkeeping.
    tm_expected: u32,
    tm_current: u32,
}

impl Host {
    pub fn new(id: u8, name: impl Into<String>, num_cores: u8) -> Self {
        Self {
            id,
            name: name.into(),
            cores: (0..num_cores).map(|core| Core::new(id, core)).collect(),
            seq_buffer: SeqBuffer::new(),
            reorder: ReorderBuffer::new(),
            max_zgt: 0,
            zgt_correction: 0,
            tm_expected: 0,
            tm_current: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resets every core model. Buffer contents survive; the stream itself
    /// is still intact when only the reconstruction state is suspect.
    pub fn reset(&mut self) {
        for core in self.cores.iter_mut() {
            core.reset();
        }
    }

    /// Feeds one event through sequencing, timestamp validation, reordering
    /// and finally core dispatch. Detected stream errors are published as
    /// signals and recovered from locally.
    pub fn process(&mut self, event: TraceEvent, hub: &mut SignalHub) {
        if event.event_type.is_log() {
            self.process_log(event, hub);
            return;
        }

        let Some(event) = self.seq_buffer.push(event) else {
            return;
        };

        if event.time == INVALID_ZGT {
            warn!("host {}: invalid ZGT received", self.name);
            hub.emit(Signal::ZgtError(ZgtError {
                host: self.id,
                zgt: event.time,
                info: "invalid ZGT received",
            }));
            self.reset();
            return;
        }

        if let EventPayload::ZgtCorrection { value } = event.payload {
            // Correction events carry the offset itself, not a measurement;
            // they skip the reorder buffer.
            debug!("host {}: ZGT correction {}", self.name, value);
            self.zgt_correction = value;
            hub.emit(Signal::ZgtCorrection(ZgtCorrection {
                host: self.id,
                zgt: event.time,
                value,
            }));
            return;
        }

        let mut event = event;
        event.time = (event.time as i64).wrapping_sub(self.zgt_correction) as u64;

        let released = match self.reorder.push(event) {
            ReorderPush::Buffered => return,
            ReorderPush::Overflow(zgt) => {
                debug!("host {}: reorder buffer overflow @{}", self.name, zgt);
                hub.emit(Signal::ZgtError(ZgtError {
                    host: self.id,
                    zgt,
                    info: "big time gap",
                }));
                self.reset();
                return;
            }
            ReorderPush::Released(released) => released,
        };

        if self.max_zgt > 0 && released.time.abs_diff(self.max_zgt) > ZGT_JUMP_THRESHOLD {
            warn!(
                "host {}: ZGT jump from {} to {}",
                self.name, self.max_zgt, released.time
            );
            hub.emit(Signal::ZgtError(ZgtError {
                host: self.id,
                zgt: released.time,
                info: "ZGT jump",
            }));
            // The event itself is still plausible once the cores restart
            // from scratch; it stays in the stream.
            self.reset();
        }

        hub.emit(Signal::EventReceived(EventReceived {
            host: self.id,
            time: released.time,
            count: released.seq,
            event_type: released.event_type,
            core: released.core,
            swc: released.swc,
            data: released.data,
            entity_id: released.payload.rnbl_id(),
        }));
        self.max_zgt = self.max_zgt.max(released.time);

        if released.sequence_gap > 0 {
            debug!(
                "host {}: {} events lost before ZGT {}",
                self.name, released.sequence_gap, released.time
            );
            hub.emit(Signal::SequenceError(SequenceError {
                host: self.id,
                missing: released.sequence_gap,
                zgt: released.time,
            }));
            // An event adjacent to a gap may describe a transition whose
            // counterpart was lost; skipping it beats corrupting a core.
            return;
        }

        match self.cores.get_mut(released.core as usize) {
            Some(core) => core.dispatch(&released, hub),
            None => warn!(
                "host {}: event for unknown core {} dropped",
                self.name, released.core
            ),
        }
    }

    /// Task-id-name frames arrive on the logging channel with their own
    /// sequence counter and are consumed here.
    fn process_log(&mut self, event: TraceEvent, hub: &mut SignalHub) {
        if let EventPayload::TaskIdName(msg) = &event.payload {
            match msg {
                TaskNameMsg::Preamble { expected } => {
                    debug!(
                        "host {}: expecting {} task name mappings",
                        self.name, expected
                    );
                    self.tm_expected = *expected;
                    self.tm_current = 0;
                }
                TaskNameMsg::Mapping { pairs } => {
                    for (task_id, task_name) in pairs {
                        self.tm_current += 1;
                        hub.emit(Signal::TaskIdName(TaskIdName {
                            host: self.id,
                            task_id: *task_id,
                            task_name: task_name.clone(),
                            msg_counter: self.tm_current,
                            msg_expected: self.tm_expected,
                        }));
                    }
                }
            }
        }
        hub.emit(Signal::EventReceived(EventReceived {
            host: self.id,
            time: event.time,
            count: event.seq,
            event_type: event.event_type,
            core: event.core,
            swc: event.swc,
            data: event.data,
            entity_id: None,
        }));
    }
}
