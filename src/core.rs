// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-core reconstruction model.
//!
//! A [`Core`] owns one entity arena per physical core and replays validated,
//! time-ordered events through the task/runnable/driver transition tables.
//! Tasks are paused and resumed by task-switch events; runnables and
//! drivers start and stop explicitly and nest on their owning task's
//! preemption stack. Any illegal transition is a protocol violation: it is
//! reported and the whole core resets, because partial state after a
//! violation cannot be trusted.

use std::collections::HashMap;

use log::debug;

use crate::entity::{Entity, EntityIdx, EntityKind, EntityState};
use crate::event::{EventPayload, EventType, TraceEvent};
use crate::signal::{
    ActivationPeriod, Checkpoint, GrossRuntime, NettoRuntime, Overhead, RuntimeSample, Signal,
    SignalHub, StackPeak, StateError, TaskSwitch,
};

/// Transition names reported in state-error signals.
struct TransitionNames {
    start: &'static str,
    stop: &'static str,
    pause: &'static str,
    resume: &'static str,
    task_context: &'static str,
    stop_task_context: &'static str,
    stop_unexpected: &'static str,
}

const RUNNABLE_NAMES: TransitionNames = TransitionNames {
    start: "start_runnable",
    stop: "stop_runnable",
    pause: "pause_runnable",
    resume: "resume_runnable",
    task_context: "runnable_task_context",
    stop_task_context: "stop_runnable_task_context",
    stop_unexpected: "stop_runnable_unexpected_runnable",
};

const DRIVER_NAMES: TransitionNames = TransitionNames {
    start: "start_driver",
    stop: "stop_driver",
    pause: "pause_driver",
    resume: "resume_driver",
    task_context: "driver_task_context",
    stop_task_context: "stop_driver_task_context",
    stop_unexpected: "stop_driver_unexpected_driver",
};

fn names(kind: EntityKind) -> &'static TransitionNames {
    match kind {
        EntityKind::Driver => &DRIVER_NAMES,
        _ => &RUNNABLE_NAMES,
    }
}

pub(crate) struct Core {
    host: u8,
    id: u8,
    arena: Vec<Entity>,
    index: HashMap<(EntityKind, u32), EntityIdx>,
    /// Arena index of the task currently switched in, if known.
    active_task: Option<EntityIdx>,
}

impl Core {
    pub fn new(host: u8, id: u8) -> Self {
        Self {
            host,
            id,
            arena: Vec::new(),
            index: HashMap::new(),
            active_task: None,
        }
    }

    /// Clears the active-task pointer and returns every owned entity to
    /// `Init`. Entities keep their table slots and task bindings.
    pub fn reset(&mut self) {
        self.active_task = None;
        for entity in self.arena.iter_mut() {
            entity.reset();
        }
    }

    fn lookup(&mut self, kind: EntityKind, id: u32, swc: u32) -> EntityIdx {
        if let Some(&idx) = self.index.get(&(kind, id)) {
            return idx;
        }
        let idx = self.arena.len();
        self.arena.push(Entity::new(kind, id, swc));
        self.index.insert((kind, id), idx);
        idx
    }

    /// Routes a validated, ordered event to the addressed entity.
    pub fn dispatch(&mut self, event: &TraceEvent, hub: &mut SignalHub) {
        let time = event.time;
        match (&event.payload, event.event_type) {
            (EventPayload::Runnable { rnbl_id }, EventType::StartRunnable) => {
                let idx = self.lookup(EntityKind::Runnable, *rnbl_id, event.swc);
                self.start(idx, time, hub);
            }
            (EventPayload::Runnable { rnbl_id }, _) => {
                let idx = self.lookup(EntityKind::Runnable, *rnbl_id, event.swc);
                self.stop(idx, time, hub);
            }
            (EventPayload::Driver { driver_id }, EventType::StartDriver) => {
                let idx = self.lookup(EntityKind::Driver, *driver_id, event.swc);
                self.start(idx, time, hub);
            }
            (EventPayload::Driver { driver_id }, _) => {
                let idx = self.lookup(EntityKind::Driver, *driver_id, event.swc);
                self.stop(idx, time, hub);
            }
            (
                EventPayload::TaskSwitch {
                    old_task_id,
                    new_task_id,
                },
                _,
            ) => {
                self.task_switch(*old_task_id, *new_task_id, event.swc, time, hub);
            }
            (EventPayload::Checkpoint { id, data }, _) => {
                hub.emit(Signal::Checkpoint(Checkpoint {
                    host: self.host,
                    id: *id,
                    zgt: time,
                    data: *data,
                }));
            }
            (EventPayload::StackPeak { task_id, peak }, _) => {
                hub.emit(Signal::StackPeak(StackPeak {
                    host: self.host,
                    id: *task_id,
                    zgt: time,
                    peak: *peak,
                    core: self.id,
                }));
            }
            (
                EventPayload::Runtime {
                    rnbl_id,
                    cnt,
                    max_rt,
                    total_rt,
                },
                _,
            ) => {
                hub.emit(Signal::RuntimeSample(RuntimeSample {
                    host: self.host,
                    id: *rnbl_id,
                    cnt: *cnt,
                    zgt: time,
                    total_rt: *total_rt,
                    max_rt: *max_rt,
                    core: self.id,
                }));
            }
            (EventPayload::NettoRuntime { rnbl_id, netto_rt }, _) => {
                hub.emit(Signal::NettoRuntime(NettoRuntime {
                    host: self.host,
                    kind: EntityKind::Runnable,
                    id: *rnbl_id,
                    swc: event.swc,
                    zgt: time,
                    core: self.id,
                    netto_rt: *netto_rt as u64,
                }));
            }
            // Interrupt, state-change, input-signal and heap events carry no
            // state machine of their own.
            (EventPayload::Interrupt { .. }, _)
            | (EventPayload::StateChange { .. }, _)
            | (EventPayload::InputSignal { .. }, _)
            | (EventPayload::Heap { .. }, _) => {}
            // Intercepted at the host before dispatch.
            (EventPayload::ZgtCorrection { .. }, _) | (EventPayload::TaskIdName(_), _) => {
                debug!(
                    "host {} core {}: unexpected {:?} reached dispatch",
                    self.host, self.id, event.event_type
                );
            }
        }
    }

    /// Reports a protocol violation and resets the core.
    fn state_error(
        &mut self,
        hub: &mut SignalHub,
        time: u64,
        kind: EntityKind,
        state: EntityState,
        transition: &'static str,
    ) {
        debug!(
            "host {} core {}: illegal transition {} for {} in state {} @{}",
            self.host,
            self.id,
            transition,
            kind.as_str(),
            state.as_str(),
            time
        );
        hub.emit(Signal::StateError(StateError {
            host: self.host,
            zgt: time,
            entity_type: kind.as_str(),
            state: state.as_str(),
            transition,
        }));
        self.reset();
    }

    fn emit_overhead(&self, idx: EntityIdx, time: u64, hub: &mut SignalHub) {
        let entity = &self.arena[idx];
        let task = entity.task.map(|t| self.arena[t].id).unwrap_or(0);
        hub.emit(Signal::Overhead(Overhead {
            host: self.host,
            id: entity.id,
            swc: entity.swc,
            zgt: time,
            core: self.id,
            overhead: entity.overhead_total(),
            task,
        }));
    }

    /// Accrues pre-activation overhead for a runnable that is starting. If
    /// the previous runnable under the same task stopped without an
    /// intervening task switch, the gap is split between the two and the
    /// previous runnable's accumulated overhead is published.
    fn accrue_overhead(&mut self, idx: EntityIdx, time: u64, hub: &mut SignalHub) {
        let Some(tidx) = self.arena[idx].task else {
            return;
        };
        let Some((sync_idx, old_ts)) = self.arena[tidx].last_sync else {
            return;
        };
        let mut dt = time.saturating_sub(old_ts) as f64;
        if sync_idx != tidx && !self.arena[sync_idx].overhead.is_empty() {
            dt /= 2.0;
            self.arena[sync_idx].overhead.push(dt);
            self.emit_overhead(sync_idx, time, hub);
            self.arena[sync_idx].overhead.clear();
        }
        self.arena[idx].overhead.push(dt);
    }

    /// Runnable/driver start transition.
    fn start(&mut self, idx: EntityIdx, time: u64, hub: &mut SignalHub) {
        let kind = self.arena[idx].kind;
        let active = self.active_task;

        // Bind the owning task on the first start under a known context.
        if self.arena[idx].task.is_none() {
            self.arena[idx].task = active;
        }
        if active.is_some() && self.arena[idx].task != active {
            // Entities must always run in the context of the same task.
            let state = self.arena[idx].state;
            self.state_error(hub, time, kind, state, names(kind).task_context);
        }
        // With no active task the owning context is unknown and netto
        // runtime cannot be attributed for this activation.
        self.arena[idx].no_task_at_start = active.is_none();

        match self.arena[idx].state {
            EntityState::Init | EntityState::Delayed => {
                if let Some(tidx) = self.arena[idx].task {
                    let top = self.arena[tidx].active_stack.last().copied();
                    if let Some(top) = top {
                        self.pause(top, time, hub);
                    }
                    self.arena[tidx].active_stack.push(idx);
                }
                if let Some(last_start) = self.arena[idx].last_start {
                    if kind == EntityKind::Runnable {
                        self.accrue_overhead(idx, time, hub);
                    }
                    let entity = &self.arena[idx];
                    hub.emit(Signal::ActivationPeriod(ActivationPeriod {
                        host: self.host,
                        kind,
                        id: entity.id,
                        swc: entity.swc,
                        zgt: time,
                        core: self.id,
                        period: time.saturating_sub(last_start),
                    }));
                }
                let entity = &mut self.arena[idx];
                entity.last_start = Some(time);
                entity.resumed.push(time);
                entity.state = EntityState::Running;
            }
            state @ (EntityState::Running | EntityState::Preempted) => {
                self.state_error(hub, time, kind, state, names(kind).start);
            }
        }
    }

    /// Runnable/driver stop transition.
    fn stop(&mut self, idx: EntityIdx, time: u64, hub: &mut SignalHub) {
        let kind = self.arena[idx].kind;
        match self.arena[idx].state {
            // Self transition after a reset.
            EntityState::Init => {}
            EntityState::Running => {
                let entity = &self.arena[idx];
                if entity.task.is_some()
                    && !entity.no_task_at_start
                    && entity.task != self.active_task
                {
                    self.state_error(
                        hub,
                        time,
                        kind,
                        EntityState::Running,
                        names(kind).stop_task_context,
                    );
                    return;
                }
                if let Some(tidx) = self.arena[idx].task {
                    if kind == EntityKind::Runnable {
                        self.arena[tidx].last_sync = Some((idx, time));
                    }
                    if let Some(popped) = self.arena[tidx].active_stack.pop() {
                        if popped != idx {
                            self.state_error(
                                hub,
                                time,
                                kind,
                                EntityState::Running,
                                names(kind).stop_unexpected,
                            );
                            return;
                        }
                        let top = self.arena[tidx].active_stack.last().copied();
                        if let Some(top) = top {
                            self.resume(top, time, hub);
                        }
                    }
                }
                let entity = &mut self.arena[idx];
                entity.preempted.push(time);
                let netto = entity.netto_runtime();
                let gross = time.saturating_sub(entity.last_start.unwrap_or(time));
                let (id, swc, no_task) = (entity.id, entity.swc, entity.no_task_at_start);
                entity.preempted.clear();
                entity.resumed.clear();
                entity.state = EntityState::Delayed;
                hub.emit(Signal::GrossRuntime(GrossRuntime {
                    host: self.host,
                    kind,
                    id,
                    swc,
                    zgt: time,
                    core: self.id,
                    gross_rt: gross,
                }));
                if !no_task {
                    hub.emit(Signal::NettoRuntime(NettoRuntime {
                        host: self.host,
                        kind,
                        id,
                        swc,
                        zgt: time,
                        core: self.id,
                        netto_rt: netto,
                    }));
                }
            }
            state @ (EntityState::Delayed | EntityState::Preempted) => {
                self.state_error(hub, time, kind, state, names(kind).stop);
            }
        }
    }

    /// Runnable/driver pause, driven by a nested start or a task switch.
    fn pause(&mut self, idx: EntityIdx, time: u64, hub: &mut SignalHub) {
        let kind = self.arena[idx].kind;
        match self.arena[idx].state {
            EntityState::Running => {
                self.arena[idx].preempted.push(time);
                self.arena[idx].state = EntityState::Preempted;
            }
            state => {
                self.state_error(hub, time, kind, state, names(kind).pause);
            }
        }
    }

    /// Runnable/driver resume, driven by a nested stop or a task switch.
    fn resume(&mut self, idx: EntityIdx, time: u64, hub: &mut SignalHub) {
        let kind = self.arena[idx].kind;
        match self.arena[idx].state {
            EntityState::Preempted => {
                self.arena[idx].resumed.push(time);
                self.arena[idx].state = EntityState::Running;
            }
            state => {
                // An entity that started before its task context was known
                // may see a resume it never asked for; tolerated.
                if !self.arena[idx].no_task_at_start {
                    self.state_error(hub, time, kind, state, names(kind).resume);
                }
            }
        }
    }

    pub fn task_switch(
        &mut self,
        old_task_id: u32,
        new_task_id: u32,
        swc: u32,
        time: u64,
        hub: &mut SignalHub,
    ) {
        let old = self.lookup(EntityKind::Task, old_task_id, swc);
        let new = self.lookup(EntityKind::Task, new_task_id, swc);
        self.task_pause(old, time, new_task_id, hub);
        self.task_resume(new, time, hub);
    }

    fn task_pause(&mut self, idx: EntityIdx, time: u64, next_task: u32, hub: &mut SignalHub) {
        let state = self.arena[idx].state;
        if let Some(active) = self.active_task {
            if active != idx {
                debug!(
                    "host {} core {}: pause for task {} while task {} is active @{}",
                    self.host, self.id, self.arena[idx].id, self.arena[active].id, time
                );
                self.state_error(
                    hub,
                    time,
                    EntityKind::Task,
                    state,
                    "pause_task_unexpected_task",
                );
                return;
            }
        }
        match state {
            EntityState::Preempted | EntityState::Delayed => {
                self.state_error(hub, time, EntityKind::Task, state, "pause_task");
            }
            // Self transition after a reset.
            EntityState::Init => {}
            EntityState::Running => {
                let top = self.arena[idx].active_stack.last().copied();
                if let Some(top) = top {
                    self.pause(top, time, hub);
                }
                // Close out the pending overhead of the runnable that
                // stopped last under this task, if any.
                if let Some((sync_idx, old_ts)) = self.arena[idx].last_sync {
                    if sync_idx != idx && !self.arena[sync_idx].overhead.is_empty() {
                        self.arena[sync_idx]
                            .overhead
                            .push(time.saturating_sub(old_ts) as f64);
                        self.emit_overhead(sync_idx, time, hub);
                        self.arena[sync_idx].overhead.clear();
                    }
                }
                self.active_task = None;
                self.arena[idx].state = EntityState::Preempted;
                let entity = &self.arena[idx];
                hub.emit(Signal::TaskSwitch(TaskSwitch {
                    host: self.host,
                    id: entity.id,
                    swc: entity.swc,
                    zgt: time,
                    core: self.id,
                    rt: time.saturating_sub(entity.time_resumed.unwrap_or(time)),
                    next_task,
                }));
            }
        }
    }

    fn task_resume(&mut self, idx: EntityIdx, time: u64, hub: &mut SignalHub) {
        let state = self.arena[idx].state;
        if let Some(active) = self.active_task {
            debug!(
                "host {} core {}: resume for task {} while task {} is active @{}",
                self.host, self.id, self.arena[idx].id, self.arena[active].id, time
            );
            self.state_error(
                hub,
                time,
                EntityKind::Task,
                state,
                "resume_task_unexpected_task",
            );
            return;
        }
        match state {
            EntityState::Delayed | EntityState::Running => {
                self.state_error(hub, time, EntityKind::Task, state, "resume_task");
            }
            EntityState::Preempted | EntityState::Init => {
                let top = self.arena[idx].active_stack.last().copied();
                if let Some(top) = top {
                    self.resume(top, time, hub);
                }
                self.arena[idx].last_sync = Some((idx, time));
                self.arena[idx].state = EntityState::Running;
                self.arena[idx].time_resumed = Some(time);
                self.active_task = Some(idx);
            }
        }
    }

    #[cfg(test)]
    pub fn active_task_id(&self) -> Option<u32> {
        self.active_task.map(|idx| self.arena[idx].id)
    }

    #[cfg(test)]
    pub fn entity_state(&self, kind: EntityKind, id: u32) -> Option<EntityState> {
        self.index
            .get(&(kind, id))
            .map(|&idx| self.arena[idx].state)
    }
}
