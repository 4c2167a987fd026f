// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Statistics collectors.
//!
//! Everything in here consumes [`Signal`]s through the same observer API
//! that external collectors use; nothing reaches into the engine. Each
//! collector is a cheaply cloneable handle around shared state: attach the
//! closure returned by `observer()` to a session and keep the handle to
//! pull a report later.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::debug;
use serde::Serialize;

use crate::entity::EntityKind;
use crate::signal::{Observer, Signal};

/// Default sampling window for load measurements, in ZGT units.
pub const DEFAULT_SAMPLE_RATE: u64 = 1_000_000;

/// Task id the target reports for execution outside any traced task.
pub const IDLE_TASK_ID: u32 = 0xFFFF_FFFF;

/// Count/min/max/sum accumulator for integer metrics.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Accum {
    pub cnt: u64,
    pub min: u64,
    pub max: u64,
    pub sum: u64,
}

impl Accum {
    pub fn add(&mut self, value: u64) {
        if self.cnt == 0 {
            self.min = value;
            self.max = value;
            self.sum = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
            self.sum += value;
        }
        self.cnt += 1;
    }

    pub fn avg(&self) -> u64 {
        if self.cnt == 0 {
            0
        } else {
            self.sum / self.cnt
        }
    }
}

/// Count/min/max/sum accumulator for load fractions.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LoadAccum {
    pub cnt: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl LoadAccum {
    pub fn add(&mut self, load: f64) {
        if self.cnt == 0 {
            self.min = load;
            self.max = load;
            self.sum = load;
        } else {
            self.min = self.min.min(load);
            self.max = self.max.max(load);
            self.sum += load;
        }
        self.cnt += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.cnt == 0 {
            0.0
        } else {
            self.sum / self.cnt as f64
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct EntityMeasurement {
    pub swc: u32,
    pub core: u8,
    pub period: Accum,
    pub netto: Accum,
    pub gross: Accum,
    pub overhead: Accum,
}

/// Per-entity timing summary for one host, either for runnables or for
/// drivers.
#[derive(Clone)]
pub struct EntitySummary {
    host: u8,
    kind: EntityKind,
    inner: Arc<Mutex<BTreeMap<u32, EntityMeasurement>>>,
}

impl EntitySummary {
    pub fn new(host: u8, kind: EntityKind) -> Self {
        Self {
            host,
            kind,
            inner: Arc::default(),
        }
    }

    pub fn observer(&self) -> impl Observer + Send + 'static {
        let this = self.clone();
        move |signal: &Signal| this.handle(signal)
    }

    pub fn report(&self) -> BTreeMap<u32, EntityMeasurement> {
        self.inner.lock().unwrap().clone()
    }

    fn handle(&self, signal: &Signal) {
        let mut inner = self.inner.lock().unwrap();
        match signal {
            Signal::ActivationPeriod(p) if p.host == self.host && p.kind == self.kind => {
                inner.entry(p.id).or_default().period.add(p.period);
            }
            Signal::GrossRuntime(g) if g.host == self.host && g.kind == self.kind => {
                let m = inner.entry(g.id).or_default();
                if m.gross.cnt == 0 {
                    m.swc = g.swc;
                    m.core = g.core;
                }
                m.gross.add(g.gross_rt);
            }
            Signal::NettoRuntime(n) if n.host == self.host && n.kind == self.kind => {
                inner.entry(n.id).or_default().netto.add(n.netto_rt);
            }
            // Overhead is only attributed to runnables.
            Signal::Overhead(o) if o.host == self.host && self.kind == EntityKind::Runnable => {
                inner.entry(o.id).or_default().overhead.add(o.overhead);
            }
            _ => {}
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TaskMeasurement {
    pub core: u8,
    /// CPU load fraction per valid sampling window.
    pub runtime: LoadAccum,
    /// Scheduling-overhead load fraction per valid sampling window.
    pub overhead: LoadAccum,
    pub stack_cnt: u64,
    pub stack_peak: u32,
    #[serde(skip)]
    runtime_sample: u64,
    #[serde(skip)]
    overhead_sample: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ErrorTotals {
    pub state_errors: u64,
    pub sequence_errors: u64,
    pub zgt_errors: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskLoadEntry {
    pub id: u64,
    pub name: Option<String>,
    #[serde(flatten)]
    pub measurement: TaskMeasurement,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskLoadReport {
    /// Number of valid sampling windows.
    pub samples: u64,
    pub events: u64,
    pub session_length: u64,
    pub errors: ErrorTotals,
    pub tasks: Vec<TaskLoadEntry>,
}

#[derive(Default)]
struct TaskLoadInner {
    tasks: BTreeMap<u64, TaskMeasurement>,
    names: HashMap<u64, String>,
    /// State/sequence/ZGT error counts of the current window.
    window_errors: [u64; 3],
    last_update: Option<u64>,
    sample_cnt: u64,
    totals: ErrorTotals,
    event_cnt: u64,
    start_time: u64,
    current_time: u64,
}

impl TaskLoadInner {
    /// A window is valid iff no stream errors were seen during it and its
    /// length is within ten percent of the sample rate.
    fn close_window(&mut self, dt: u64, rate: u64, range: u64) {
        let rate_ok = dt.abs_diff(rate) <= range;
        let error_ok = self.window_errors.iter().all(|&e| e == 0);
        self.window_errors = [0; 3];
        if !rate_ok {
            debug!("invalid sample length {} @{}", dt, self.current_time);
        }
        let valid = rate_ok && error_ok;
        if valid {
            self.sample_cnt += 1;
        }
        for m in self.tasks.values_mut() {
            if valid {
                if m.runtime_sample > 0 {
                    m.runtime.add(m.runtime_sample as f64 / dt as f64);
                }
                if m.overhead_sample > 0 {
                    m.overhead.add(m.overhead_sample as f64 / dt as f64);
                }
            }
            m.runtime_sample = 0;
            m.overhead_sample = 0;
        }
    }
}

/// Per-task CPU-load collector for one host.
///
/// Execution time is sampled into fixed windows driven by the event stream
/// itself. Untraced execution, reported under [`IDLE_TASK_ID`], is kept per
/// core under a synthetic task.
#[derive(Clone)]
pub struct TaskLoadStats {
    host: u8,
    sample_rate: u64,
    rate_range: u64,
    inner: Arc<Mutex<TaskLoadInner>>,
}

fn untraced_key(core: u8) -> u64 {
    IDLE_TASK_ID as u64 + core as u64
}

impl TaskLoadStats {
    pub fn new(host: u8, num_cores: u8) -> Self {
        Self::with_sample_rate(host, num_cores, DEFAULT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(host: u8, num_cores: u8, sample_rate: u64) -> Self {
        let mut inner = TaskLoadInner::default();
        for core in 0..num_cores {
            inner
                .names
                .insert(untraced_key(core), format!("non_traced_tasks_C{:02}", core));
        }
        Self {
            host,
            sample_rate,
            rate_range: sample_rate / 10,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn observer(&self) -> impl Observer + Send + 'static {
        let this = self.clone();
        move |signal: &Signal| this.handle(signal)
    }

    pub fn report(&self) -> TaskLoadReport {
        let inner = self.inner.lock().unwrap();
        TaskLoadReport {
            samples: inner.sample_cnt,
            events: inner.event_cnt,
            session_length: inner.current_time.saturating_sub(inner.start_time),
            errors: inner.totals,
            tasks: inner
                .tasks
                .iter()
                .map(|(&id, m)| TaskLoadEntry {
                    id,
                    name: inner.names.get(&id).cloned(),
                    measurement: m.clone(),
                })
                .collect(),
        }
    }

    fn handle(&self, signal: &Signal) {
        let mut inner = self.inner.lock().unwrap();
        match signal {
            Signal::EventReceived(e) if e.host == self.host => {
                inner.event_cnt += 1;
                if inner.start_time == 0 {
                    inner.start_time = e.time;
                }
                inner.current_time = e.time;
                match inner.last_update {
                    None => inner.last_update = Some(e.time),
                    Some(last) => {
                        let dt = e.time.saturating_sub(last);
                        if dt >= self.sample_rate {
                            inner.close_window(dt, self.sample_rate, self.rate_range);
                            inner.last_update = Some(e.time);
                        }
                    }
                }
            }
            Signal::TaskSwitch(t) if t.host == self.host => {
                let key = if t.id == IDLE_TASK_ID {
                    untraced_key(t.core)
                } else {
                    t.id as u64
                };
                let m = inner.tasks.entry(key).or_default();
                m.runtime_sample += t.rt;
                m.core = t.core;
            }
            Signal::Overhead(o) if o.host == self.host => {
                inner
                    .tasks
                    .entry(o.task as u64)
                    .or_default()
                    .overhead_sample += o.overhead;
            }
            Signal::StackPeak(p) if p.host == self.host => {
                let m = inner.tasks.entry(p.id as u64).or_default();
                if m.stack_cnt == 0 {
                    m.stack_peak = p.peak;
                    m.core = p.core;
                } else {
                    m.stack_peak = m.stack_peak.max(p.peak);
                }
                m.stack_cnt += 1;
            }
            Signal::TaskIdName(t) if t.host == self.host => {
                inner.names.insert(t.task_id as u64, t.task_name.clone());
            }
            Signal::StateError(e) if e.host == self.host => {
                inner.window_errors[0] += 1;
                inner.totals.state_errors += 1;
            }
            Signal::SequenceError(e) if e.host == self.host => {
                inner.window_errors[1] += e.missing as u64;
                inner.totals.sequence_errors += e.missing as u64;
            }
            Signal::ZgtError(e) if e.host == self.host => {
                inner.window_errors[2] += 1;
                inner.totals.zgt_errors += 1;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{
        ActivationPeriod, EventReceived, GrossRuntime, NettoRuntime, Overhead, SequenceError,
        SignalHub, TaskIdName, TaskSwitch,
    };
    use crate::event::EventType;

    fn received(host: u8, time: u64) -> Signal {
        Signal::EventReceived(EventReceived {
            host,
            time,
            count: 0,
            event_type: EventType::Checkpoint,
            core: 0,
            swc: 0,
            data: 0,
            entity_id: None,
        })
    }

    fn switch(host: u8, id: u32, core: u8, rt: u64) -> Signal {
        Signal::TaskSwitch(TaskSwitch {
            host,
            id,
            swc: 0,
            zgt: 0,
            core,
            rt,
            next_task: 0,
        })
    }

    #[test]
    fn test_accum() {
        let mut a = Accum::default();
        assert_eq!(a.avg(), 0);
        for v in [30, 10, 20] {
            a.add(v);
        }
        assert_eq!((a.cnt, a.min, a.max, a.sum, a.avg()), (3, 10, 30, 60, 20));
    }

    #[test]
    fn test_entity_summary_collects_per_runnable() {
        let summary = EntitySummary::new(1, EntityKind::Runnable);
        let mut hub = SignalHub::new();
        hub.attach(summary.observer());

        for (id, gross, netto) in [(7, 500, 400), (7, 700, 600), (8, 100, 90)] {
            hub.emit(Signal::GrossRuntime(GrossRuntime {
                host: 1,
                kind: EntityKind::Runnable,
                id,
                swc: 3,
                zgt: 0,
                core: 2,
                gross_rt: gross,
            }));
            hub.emit(Signal::NettoRuntime(NettoRuntime {
                host: 1,
                kind: EntityKind::Runnable,
                id,
                swc: 3,
                zgt: 0,
                core: 2,
                netto_rt: netto,
            }));
        }
        hub.emit(Signal::ActivationPeriod(ActivationPeriod {
            host: 1,
            kind: EntityKind::Runnable,
            id: 7,
            swc: 3,
            zgt: 0,
            core: 2,
            period: 10_000,
        }));
        // Different kind and different host are ignored.
        hub.emit(Signal::GrossRuntime(GrossRuntime {
            host: 1,
            kind: EntityKind::Driver,
            id: 7,
            swc: 3,
            zgt: 0,
            core: 2,
            gross_rt: 999,
        }));
        hub.emit(Signal::NettoRuntime(NettoRuntime {
            host: 2,
            kind: EntityKind::Runnable,
            id: 7,
            swc: 3,
            zgt: 0,
            core: 2,
            netto_rt: 999,
        }));

        let report = summary.report();
        let r7 = &report[&7];
        assert_eq!((r7.swc, r7.core), (3, 2));
        assert_eq!((r7.gross.cnt, r7.gross.avg()), (2, 600));
        assert_eq!((r7.netto.min, r7.netto.max), (400, 600));
        assert_eq!(r7.period.cnt, 1);
        assert_eq!(report[&8].gross.sum, 100);
    }

    #[test]
    fn test_task_load_valid_window() {
        let stats = TaskLoadStats::with_sample_rate(1, 1, 1000);
        let mut hub = SignalHub::new();
        hub.attach(stats.observer());

        hub.emit(received(1, 0));
        hub.emit(switch(1, 5, 0, 400));
        hub.emit(Signal::Overhead(Overhead {
            host: 1,
            id: 9,
            swc: 0,
            zgt: 0,
            core: 0,
            overhead: 100,
            task: 5,
        }));
        hub.emit(received(1, 1000));

        let report = stats.report();
        assert_eq!(report.samples, 1);
        assert_eq!(report.events, 2);
        assert_eq!(report.session_length, 1000);
        let task = report.tasks.iter().find(|t| t.id == 5).unwrap();
        assert_eq!(task.measurement.runtime.cnt, 1);
        assert!((task.measurement.runtime.avg() - 0.4).abs() < 1e-9);
        assert!((task.measurement.overhead.avg() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_task_load_default_sample_rate() {
        let stats = TaskLoadStats::new(1, 1);
        let mut hub = SignalHub::new();
        hub.attach(stats.observer());

        hub.emit(received(1, 0));
        hub.emit(switch(1, 5, 0, 400_000));
        hub.emit(received(1, DEFAULT_SAMPLE_RATE));

        let report = stats.report();
        assert_eq!(report.samples, 1);
        let task = report.tasks.iter().find(|t| t.id == 5).unwrap();
        assert!((task.measurement.runtime.avg() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_task_load_skips_window_with_errors() {
        let stats = TaskLoadStats::with_sample_rate(1, 1, 1000);
        let mut hub = SignalHub::new();
        hub.attach(stats.observer());

        hub.emit(received(1, 0));
        hub.emit(switch(1, 5, 0, 400));
        hub.emit(Signal::SequenceError(SequenceError {
            host: 1,
            missing: 3,
            zgt: 500,
        }));
        hub.emit(received(1, 1000));
        // Next window is clean again.
        hub.emit(switch(1, 5, 0, 200));
        hub.emit(received(1, 2000));

        let report = stats.report();
        assert_eq!(report.samples, 1);
        assert_eq!(report.errors.sequence_errors, 3);
        let task = report.tasks.iter().find(|t| t.id == 5).unwrap();
        // Only the clean window contributed.
        assert_eq!(task.measurement.runtime.cnt, 1);
        assert!((task.measurement.runtime.avg() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_task_load_skips_overlong_window() {
        let stats = TaskLoadStats::with_sample_rate(1, 1, 1000);
        let mut hub = SignalHub::new();
        hub.attach(stats.observer());

        hub.emit(received(1, 0));
        hub.emit(switch(1, 5, 0, 400));
        // Window runs three times the sample rate; no load can be derived.
        hub.emit(received(1, 3000));

        let report = stats.report();
        assert_eq!(report.samples, 0);
        let task = report.tasks.iter().find(|t| t.id == 5).unwrap();
        assert_eq!(task.measurement.runtime.cnt, 0);
    }

    #[test]
    fn test_untraced_execution_is_kept_per_core() {
        let stats = TaskLoadStats::with_sample_rate(1, 3, 1000);
        let mut hub = SignalHub::new();
        hub.attach(stats.observer());

        hub.emit(received(1, 0));
        hub.emit(switch(1, IDLE_TASK_ID, 2, 300));
        hub.emit(received(1, 1000));

        let report = stats.report();
        let untraced = report
            .tasks
            .iter()
            .find(|t| t.id == untraced_key(2))
            .unwrap();
        assert_eq!(untraced.name.as_deref(), Some("non_traced_tasks_C02"));
        assert!((untraced.measurement.runtime.avg() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_task_names_come_from_mapping_signals() {
        let stats = TaskLoadStats::with_sample_rate(1, 1, 1000);
        let mut hub = SignalHub::new();
        hub.attach(stats.observer());

        hub.emit(Signal::TaskIdName(TaskIdName {
            host: 1,
            task_id: 5,
            task_name: "vision".into(),
            msg_counter: 1,
            msg_expected: 1,
        }));
        hub.emit(received(1, 0));
        hub.emit(switch(1, 5, 0, 100));
        hub.emit(received(1, 1000));

        let report = stats.report();
        let task = report.tasks.iter().find(|t| t.id == 5).unwrap();
        assert_eq!(task.name.as_deref(), Some("vision"));
    }
}
