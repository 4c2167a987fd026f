// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Decoded trace events.
//!
//! A target emits tracing frames carrying an 8-bit rolling sequence counter,
//! a ZGT timestamp and a 64-bit data word whose layout depends on the event
//! type. The transport layer decodes frames into [`TraceEvent`] records and
//! hands them to [`crate::Session::process`] one at a time.

/// Sentinel timestamp written by the target when no valid ZGT was available
/// at capture time (48-bit all-ones).
pub const INVALID_ZGT: u64 = 0xFFFF_FFFF_FFFF;

/// Event type discriminator as emitted on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    StartRunnable,
    StopRunnable,
    TaskSwitch,
    Interrupt,
    StartDriver,
    StopDriver,
    StateChange,
    Checkpoint,
    InputSignal,
    ZgtCorrection,
    StackPeak,
    Runtime,
    Heap,
    NettoRuntime,
    /// Task-id-to-name mapping carried in a logging frame. Logging frames
    /// have their own sequence counter space and bypass the trace pipeline.
    TaskIdName,
}

impl EventType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::StartRunnable,
            1 => Self::StopRunnable,
            2 => Self::TaskSwitch,
            3 => Self::Interrupt,
            4 => Self::StartDriver,
            5 => Self::StopDriver,
            6 => Self::StateChange,
            7 => Self::Checkpoint,
            8 => Self::InputSignal,
            9 => Self::ZgtCorrection,
            10 => Self::StackPeak,
            11 => Self::Runtime,
            12 => Self::Heap,
            13 => Self::NettoRuntime,
            0xFF => Self::TaskIdName,
            _ => return None,
        })
    }

    pub fn as_raw(&self) -> u8 {
        match self {
            Self::StartRunnable => 0,
            Self::StopRunnable => 1,
            Self::TaskSwitch => 2,
            Self::Interrupt => 3,
            Self::StartDriver => 4,
            Self::StopDriver => 5,
            Self::StateChange => 6,
            Self::Checkpoint => 7,
            Self::InputSignal => 8,
            Self::ZgtCorrection => 9,
            Self::StackPeak => 10,
            Self::Runtime => 11,
            Self::Heap => 12,
            Self::NettoRuntime => 13,
            Self::TaskIdName => 0xFF,
        }
    }

    /// Logging frames are not part of the trace sequence space.
    pub fn is_log(&self) -> bool {
        matches!(self, Self::TaskIdName)
    }
}

/// Content of a task-id-name logging frame. The target first announces how
/// many mappings will follow, then sends the mappings in batches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskNameMsg {
    Preamble { expected: u32 },
    Mapping { pairs: Vec<(u32, String)> },
}

/// Event-type specific fields extracted from the 64-bit data word.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Runnable { rnbl_id: u32 },
    TaskSwitch { old_task_id: u32, new_task_id: u32 },
    Interrupt { isr_id: u32, duration: u32 },
    Driver { driver_id: u32 },
    StateChange { host_id: u8, old_state: u8, new_state: u8 },
    Checkpoint { id: u16, data: u16 },
    InputSignal { sig_id: u8 },
    ZgtCorrection { value: i64 },
    StackPeak { task_id: u32, peak: u32 },
    Runtime { rnbl_id: u32, cnt: u8, max_rt: u32, total_rt: u32 },
    Heap { task_id: u32, heap: u32 },
    NettoRuntime { rnbl_id: u32, netto_rt: u32 },
    TaskIdName(TaskNameMsg),
}

impl EventPayload {
    /// Extracts the typed payload for `event_type` from the raw data word.
    ///
    /// Bit-field offsets follow the target's tracing frame layout. Returns
    /// `None` for [`EventType::TaskIdName`], whose payload is textual and
    /// decoded by the logging transport instead.
    pub fn decode(event_type: EventType, data: u64) -> Option<Self> {
        Some(match event_type {
            EventType::StartRunnable | EventType::StopRunnable => Self::Runnable {
                rnbl_id: ((data >> 48) & 0xFFFF) as u32,
            },
            EventType::TaskSwitch => Self::TaskSwitch {
                old_task_id: ((data >> 32) & 0xFFFF_FFFF) as u32,
                new_task_id: (data & 0xFFFF_FFFF) as u32,
            },
            EventType::Interrupt => Self::Interrupt {
                isr_id: ((data >> 32) & 0xFFFF_FFFF) as u32,
                duration: (data & 0xFFFF_FFFF) as u32,
            },
            EventType::StartDriver | EventType::StopDriver => Self::Driver {
                driver_id: ((data >> 56) & 0xFF) as u32,
            },
            EventType::StateChange => Self::StateChange {
                host_id: ((data >> 56) & 0xFF) as u8,
                old_state: ((data >> 48) & 0xFF) as u8,
                new_state: ((data >> 40) & 0xFF) as u8,
            },
            EventType::Checkpoint => Self::Checkpoint {
                id: ((data >> 48) & 0xFFFF) as u16,
                data: ((data >> 16) & 0xFFFF) as u16,
            },
            EventType::InputSignal => Self::InputSignal {
                sig_id: ((data >> 56) & 0xFF) as u8,
            },
            EventType::ZgtCorrection => Self::ZgtCorrection { value: data as i64 },
            EventType::StackPeak => Self::StackPeak {
                task_id: ((data >> 32) & 0xFFFF_FFFF) as u32,
                peak: (data & 0xFFFF_FFFF) as u32,
            },
            EventType::Runtime => Self::Runtime {
                rnbl_id: ((data >> 48) & 0xFFFF) as u32,
                cnt: ((data >> 40) & 0xFF) as u8,
                max_rt: ((data >> 20) & 0xF_FFFF) as u32,
                total_rt: (data & 0xF_FFFF) as u32,
            },
            EventType::Heap => Self::Heap {
                task_id: ((data >> 32) & 0xFFFF_FFFF) as u32,
                heap: (data & 0xFFFF_FFFF) as u32,
            },
            EventType::NettoRuntime => Self::NettoRuntime {
                rnbl_id: ((data >> 48) & 0xFFFF) as u32,
                netto_rt: ((data >> 16) & 0xFFFF_FFFF) as u32,
            },
            EventType::TaskIdName => return None,
        })
    }

    /// Runnable id carried by the payload, if any. Used for the generic
    /// event-received signal.
    pub fn rnbl_id(&self) -> Option<u32> {
        match self {
            Self::Runnable { rnbl_id }
            | Self::Runtime { rnbl_id, .. }
            | Self::NettoRuntime { rnbl_id, .. } => Some(*rnbl_id),
            _ => None,
        }
    }
}

/// One decoded trace or logging event.
///
/// Immutable after decode except for `sequence_gap`, which the sequence-gap
/// detector fills in on release.
#[derive(Clone, Debug)]
pub struct TraceEvent {
    pub host: u8,
    pub core: u8,
    pub seq: u8,
    /// ZGT timestamp. Rewritten in place when the host subtracts its current
    /// ZGT correction.
    pub time: u64,
    /// Software component the event was recorded for.
    pub swc: u32,
    pub event_type: EventType,
    /// Raw 64-bit data word, kept for the event-received signal.
    pub data: u64,
    pub payload: EventPayload,
    /// Number of events lost immediately before this one, filled in by the
    /// sequence-gap detector.
    pub sequence_gap: u32,
}

impl TraceEvent {
    /// Builds a trace event from wire-level fields, decoding the data word
    /// according to `event_type`.
    pub fn from_word(
        host: u8,
        core: u8,
        seq: u8,
        time: u64,
        swc: u32,
        event_type: EventType,
        data: u64,
    ) -> Option<Self> {
        let payload = EventPayload::decode(event_type, data)?;
        Some(Self {
            host,
            core,
            seq,
            time,
            swc,
            event_type,
            data,
            payload,
            sequence_gap: 0,
        })
    }

    /// Builds a logging event carrying a task-id-name message.
    pub fn from_log(host: u8, time: u64, swc: u32, msg: TaskNameMsg) -> Self {
        Self {
            host,
            core: 0,
            seq: 0,
            time,
            swc,
            event_type: EventType::TaskIdName,
            data: 0,
            payload: EventPayload::TaskIdName(msg),
            sequence_gap: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for raw in (0..=13).chain(std::iter::once(0xFF)) {
            let ty = EventType::from_raw(raw).unwrap();
            assert_eq!(ty.as_raw(), raw);
        }
        assert_eq!(EventType::from_raw(14), None);
        assert_eq!(EventType::from_raw(0xFE), None);
    }

    #[test]
    fn test_decode_runnable_id() {
        let word = 0x1234_u64 << 48 | 0xDEAD;
        assert_eq!(
            EventPayload::decode(EventType::StartRunnable, word),
            Some(EventPayload::Runnable { rnbl_id: 0x1234 })
        );
    }

    #[test]
    fn test_decode_task_switch() {
        let word = (7_u64 << 32) | 9;
        assert_eq!(
            EventPayload::decode(EventType::TaskSwitch, word),
            Some(EventPayload::TaskSwitch {
                old_task_id: 7,
                new_task_id: 9
            })
        );
    }

    #[test]
    fn test_decode_zgt_correction_signed() {
        let word = (-250_i64) as u64;
        assert_eq!(
            EventPayload::decode(EventType::ZgtCorrection, word),
            Some(EventPayload::ZgtCorrection { value: -250 })
        );
    }

    #[test]
    fn test_decode_runtime_fields() {
        let word = (0xBEEF_u64 << 48) | (0x2A_u64 << 40) | (0x7_0001_u64 << 20) | 0x3_0002;
        assert_eq!(
            EventPayload::decode(EventType::Runtime, word),
            Some(EventPayload::Runtime {
                rnbl_id: 0xBEEF,
                cnt: 0x2A,
                max_rt: 0x7_0001,
                total_rt: 0x3_0002,
            })
        );
    }

    #[test]
    fn test_log_payload_not_word_decodable() {
        assert_eq!(EventPayload::decode(EventType::TaskIdName, 0), None);
    }
}
