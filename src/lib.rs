// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Reconstruction of task, runnable and driver activation timelines from
//! the instrumentation event stream of multi-core embedded hosts.
//!
//! The target emits fixed-size trace events with a rolling sequence
//! counter and a global timebase (ZGT) timestamp. The transport is lossy
//! and reorders events, so every host pipeline first restores sequence
//! order to detect lost events, then restores timestamp order, and only
//! then replays the stream through per-core state machines that mirror the
//! target's scheduler: tasks switch in and out, runnables and drivers nest
//! on the running task's preemption stack. From the replay the engine
//! derives activation periods, gross and netto runtimes and scheduling
//! overhead, and publishes every derived fact as a [`Signal`].
//!
//! Detected stream corruption (lost events, invalid or discontinuous
//! timestamps, illegal transitions) never aborts processing; it is
//! published alongside the measurements and the affected reconstruction
//! state resets itself.
//!
//! ```no_run
//! use retrace::{Session, SessionConfig, Signal};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = SessionConfig::load("hosts.json")?;
//! let mut session = Session::new(&config)?;
//! session.attach(|signal: &Signal| {
//!     if let Signal::GrossRuntime(rt) = signal {
//!         println!("runnable {} ran for {}us", rt.id, rt.gross_rt);
//!     }
//! });
//! # Ok(())
//! # }
//! ```

mod core;
mod entity;
mod event;
mod host;
mod reorder;
mod seq_buffer;
mod session;
mod signal;
pub mod stats;

pub use entity::{EntityKind, EntityState};
pub use event::{EventPayload, EventType, TaskNameMsg, TraceEvent, INVALID_ZGT};
pub use host::{Host, ZGT_JUMP_THRESHOLD};
pub use reorder::REORDER_CAPACITY;
pub use seq_buffer::SEQ_WARMUP_DEPTH;
pub use session::{HostConfig, Session, SessionConfig};
pub use signal::{
    ActivationPeriod, Checkpoint, EventReceived, GrossRuntime, NettoRuntime, Observer, Overhead,
    RuntimeSample, SequenceError, Signal, SignalHub, StackPeak, StateError, TaskIdName, TaskSwitch,
    ZgtCorrection, ZgtError,
};
