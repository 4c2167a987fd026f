// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Entity records.
//!
//! Tasks, runnables, drivers and interrupts share one arena-allocated
//! record type; the transition tables that operate on them live in
//! [`crate::core`] because most transitions touch more than one entity
//! (nested preemption, overhead attribution). Entities are addressed by
//! arena index, never by reference, which keeps ownership acyclic: the core
//! owns every entity, a task's preemption stack and the core's active-task
//! pointer are plain indices.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Task,
    Runnable,
    Driver,
    Interrupt,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Runnable => "runnable",
            Self::Driver => "driver",
            Self::Interrupt => "interrupt",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityState {
    Init,
    Running,
    Preempted,
    Delayed,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Preempted => "preempted",
            Self::Delayed => "delayed",
        }
    }
}

/// Index into a core's entity arena.
pub(crate) type EntityIdx = usize;

pub(crate) struct Entity {
    pub kind: EntityKind,
    pub id: u32,
    pub swc: u32,
    pub state: EntityState,

    /// Timestamp of the most recent start, kept across activations for the
    /// activation-period computation.
    pub last_start: Option<u64>,
    /// Resume timestamps of the current activation.
    pub resumed: Vec<u64>,
    /// Preempt timestamps of the current activation.
    pub preempted: Vec<u64>,
    /// Pending pre-activation overhead shares. Halved shares are fractional,
    /// the emitted total is rounded up.
    pub overhead: Vec<f64>,
    /// Set when the entity started with no known task context; netto
    /// runtime is unavailable and stray resumes are tolerated.
    pub no_task_at_start: bool,
    /// Owning task, bound on the first start under a known context. Survives
    /// a reset so a rebinding mismatch stays detectable.
    pub task: Option<EntityIdx>,

    // Task-kind state.
    /// When the task was last switched in.
    pub time_resumed: Option<u64>,
    /// Runnables/drivers currently nested on this task, innermost last.
    pub active_stack: Vec<EntityIdx>,
    /// Entity and timestamp of the last overhead synchronization point (a
    /// runnable stop or the task's own switch-in).
    pub last_sync: Option<(EntityIdx, u64)>,
}

impl Entity {
    pub fn new(kind: EntityKind, id: u32, swc: u32) -> Self {
        Self {
            kind,
            id,
            swc,
            state: EntityState::Init,
            last_start: None,
            resumed: Vec::new(),
            preempted: Vec::new(),
            overhead: Vec::new(),
            no_task_at_start: false,
            task: None,
            time_resumed: None,
            active_stack: Vec::new(),
            last_sync: None,
        }
    }

    /// Back to `Init` without losing identity or task binding.
    pub fn reset(&mut self) {
        self.state = EntityState::Init;
        self.last_start = None;
        self.resumed.clear();
        self.preempted.clear();
        self.overhead.clear();
        self.no_task_at_start = false;
        self.time_resumed = None;
        self.active_stack.clear();
        self.last_sync = None;
    }

    /// Netto runtime accumulated since the last start: the sum of
    /// resume/preempt pairs.
    pub fn netto_runtime(&self) -> u64 {
        self.preempted
            .iter()
            .zip(self.resumed.iter())
            .map(|(p, r)| p.saturating_sub(*r))
            .sum()
    }

    /// Pending overhead total, rounded up.
    pub fn overhead_total(&self) -> u64 {
        self.overhead.iter().sum::<f64>().ceil() as u64
    }
}
