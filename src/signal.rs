// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Typed signal bus between the reconstruction engine and statistics
//! collectors.
//!
//! The engine never aggregates anything itself; every reconstructed fact
//! (an activation period, a runtime, a detected stream error) is published
//! as a [`Signal`] and consumed by [`Observer`] implementations attached to
//! the session's [`SignalHub`].

use crate::entity::EntityKind;
use crate::event::EventType;

/// Generic notification for every event that clears both buffering stages,
/// plus task-id-name logging frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventReceived {
    pub host: u8,
    pub time: u64,
    /// Rolling sequence counter value of the event.
    pub count: u8,
    pub event_type: EventType,
    pub core: u8,
    pub swc: u32,
    pub data: u64,
    /// Runnable id for runnable-scoped events.
    pub entity_id: Option<u32>,
}

/// Events known lost in transit, inferred from the sequence counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceError {
    pub host: u8,
    pub missing: u32,
    pub zgt: u64,
}

/// Invalid or discontinuous ZGT detected; the affected cores were reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZgtError {
    pub host: u8,
    pub zgt: u64,
    pub info: &'static str,
}

/// Protocol violation in an entity state machine; the owning core was reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateError {
    pub host: u8,
    pub zgt: u64,
    pub entity_type: &'static str,
    pub state: &'static str,
    pub transition: &'static str,
}

/// ZGT correction offset announced by the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZgtCorrection {
    pub host: u8,
    pub zgt: u64,
    pub value: i64,
}

/// Time between two consecutive activations of the same entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationPeriod {
    pub host: u8,
    pub kind: EntityKind,
    pub id: u32,
    pub swc: u32,
    pub zgt: u64,
    pub core: u8,
    pub period: u64,
}

/// Wall-clock span from start to stop, preemptions included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrossRuntime {
    pub host: u8,
    pub kind: EntityKind,
    pub id: u32,
    pub swc: u32,
    pub zgt: u64,
    pub core: u8,
    pub gross_rt: u64,
}

/// CPU time actually executed, preemptions excluded. Only emitted when the
/// owning task context was known at start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NettoRuntime {
    pub host: u8,
    pub kind: EntityKind,
    pub id: u32,
    pub swc: u32,
    pub zgt: u64,
    pub core: u8,
    pub netto_rt: u64,
}

/// Scheduling overhead attributed to a runnable, accumulated between
/// adjacent activations under the same task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Overhead {
    pub host: u8,
    pub id: u32,
    pub swc: u32,
    pub zgt: u64,
    pub core: u8,
    pub overhead: u64,
    /// Task under which the overhead was accrued.
    pub task: u32,
}

/// A task was switched out; carries its execution time since switch-in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSwitch {
    pub host: u8,
    pub id: u32,
    pub swc: u32,
    pub zgt: u64,
    pub core: u8,
    pub rt: u64,
    pub next_task: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub host: u8,
    pub id: u16,
    pub zgt: u64,
    pub data: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackPeak {
    pub host: u8,
    pub id: u32,
    pub zgt: u64,
    pub peak: u32,
    pub core: u8,
}

/// On-target sampled runtime measurement, forwarded as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSample {
    pub host: u8,
    pub id: u32,
    pub cnt: u8,
    pub zgt: u64,
    pub total_rt: u32,
    pub max_rt: u32,
    pub core: u8,
}

/// One task-id-to-name mapping extracted from a logging frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskIdName {
    pub host: u8,
    pub task_id: u32,
    pub task_name: String,
    pub msg_counter: u32,
    pub msg_expected: u32,
}

/// Everything the engine can tell its collectors.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    EventReceived(EventReceived),
    SequenceError(SequenceError),
    ZgtError(ZgtError),
    StateError(StateError),
    ZgtCorrection(ZgtCorrection),
    ActivationPeriod(ActivationPeriod),
    GrossRuntime(GrossRuntime),
    NettoRuntime(NettoRuntime),
    Overhead(Overhead),
    TaskSwitch(TaskSwitch),
    Checkpoint(Checkpoint),
    StackPeak(StackPeak),
    RuntimeSample(RuntimeSample),
    TaskIdName(TaskIdName),
}

/// A statistics collector. Implementations filter on the variants and hosts
/// they care about and ignore the rest.
pub trait Observer {
    fn notify(&mut self, signal: &Signal);
}

impl<F: FnMut(&Signal) + Send> Observer for F {
    fn notify(&mut self, signal: &Signal) {
        self(signal)
    }
}

/// Fan-out point for [`Signal`]s. Observers are invoked synchronously, in
/// attach order, from within `process()`.
#[derive(Default)]
pub struct SignalHub {
    observers: Vec<Box<dyn Observer + Send>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, observer: impl Observer + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn emit(&mut self, signal: Signal) {
        for observer in self.observers.iter_mut() {
            observer.notify(&signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_hub_fans_out_in_attach_order() {
        let seen: Arc<Mutex<Vec<(u8, u64)>>> = Arc::default();
        let mut hub = SignalHub::new();
        for tag in 0..3u8 {
            let seen = seen.clone();
            hub.attach(move |signal: &Signal| {
                if let Signal::Checkpoint(cp) = signal {
                    seen.lock().unwrap().push((tag, cp.zgt));
                }
            });
        }
        hub.emit(Signal::Checkpoint(Checkpoint {
            host: 1,
            id: 4,
            zgt: 77,
            data: 0,
        }));
        assert_eq!(&*seen.lock().unwrap(), &[(0, 77), (1, 77), (2, 77)]);
    }
}
