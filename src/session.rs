// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Session setup and event routing.
//!
//! A [`Session`] owns one [`Host`] pipeline per traced ECU plus the
//! [`SignalHub`] all of them publish into. The host topology comes from a
//! [`SessionConfig`], typically loaded from a JSON file:
//!
//! ```json
//! {
//!   "hosts": [
//!     { "name": "appl", "id": 1, "num_cores": 2 },
//!     { "name": "safety", "id": 2, "num_cores": 1 }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::event::TraceEvent;
use crate::host::Host;
use crate::signal::{Observer, Signal, SignalHub};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
    /// Human-readable host name used in log output.
    pub name: String,
    /// Host id carried in the frame header of every event.
    pub id: u8,
    pub num_cores: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub hosts: Vec<HostConfig>,
}

impl SessionConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("No hosts configured");
        }
        let mut seen = BTreeMap::new();
        for host in &self.hosts {
            if host.num_cores == 0 {
                bail!("Host {} has no cores", host.name);
            }
            if let Some(other) = seen.insert(host.id, &host.name) {
                bail!(
                    "Host id {} used by both {} and {}",
                    host.id,
                    other,
                    host.name
                );
            }
        }
        Ok(())
    }
}

/// One reconstruction session over a set of hosts.
pub struct Session {
    hosts: BTreeMap<u8, Host>,
    hub: SignalHub,
}

impl Session {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let hosts = config
            .hosts
            .iter()
            .map(|hc| (hc.id, Host::new(hc.id, hc.name.clone(), hc.num_cores)))
            .collect();
        Ok(Self {
            hosts,
            hub: SignalHub::new(),
        })
    }

    /// Attaches a statistics collector. Observers see the signals of every
    /// host; they filter on the host id themselves.
    pub fn attach(&mut self, observer: impl Observer + Send + 'static) {
        self.hub.attach(observer);
    }

    pub fn emit(&mut self, signal: Signal) {
        self.hub.emit(signal);
    }

    /// Routes one event to its host pipeline. Events for unconfigured hosts
    /// are dropped.
    pub fn process(&mut self, event: TraceEvent) {
        match self.hosts.get_mut(&event.host) {
            Some(host) => host.process(event, &mut self.hub),
            None => warn!("event for unconfigured host {} dropped", event.host),
        }
    }

    /// Resets the reconstruction state of every host.
    pub fn reset(&mut self) {
        for host in self.hosts.values_mut() {
            host.reset();
        }
    }

    /// Consumes events from `events` until `shutdown` is set or the sender
    /// side hangs up.
    pub fn run(&mut self, events: &Receiver<TraceEvent>, shutdown: Arc<AtomicBool>) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => self.process(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::reorder::REORDER_CAPACITY;
    use crate::seq_buffer::SEQ_WARMUP_DEPTH;
    use std::sync::Mutex;

    fn init_log() {
        let _ = simplelog::TermLogger::init(
            simplelog::LevelFilter::Debug,
            simplelog::Config::default(),
            simplelog::TerminalMode::Stderr,
            simplelog::ColorChoice::Never,
        );
    }

    fn two_host_config() -> SessionConfig {
        serde_json::from_str(
            r#"{
                "hosts": [
                    { "name": "appl", "id": 1, "num_cores": 2 },
                    { "name": "safety", "id": 2, "num_cores": 1 }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(two_host_config().validate().is_ok());

        let dup: SessionConfig = serde_json::from_str(
            r#"{
                "hosts": [
                    { "name": "a", "id": 1, "num_cores": 1 },
                    { "name": "b", "id": 1, "num_cores": 1 }
                ]
            }"#,
        )
        .unwrap();
        assert!(dup.validate().is_err());

        let empty: SessionConfig = serde_json::from_str(r#"{ "hosts": [] }"#).unwrap();
        assert!(empty.validate().is_err());

        let zero_cores: SessionConfig = serde_json::from_str(
            r#"{ "hosts": [ { "name": "a", "id": 1, "num_cores": 0 } ] }"#,
        )
        .unwrap();
        assert!(zero_cores.validate().is_err());
    }

    #[test]
    fn test_events_are_routed_by_host_id() {
        init_log();
        let mut session = Session::new(&two_host_config()).unwrap();
        let seen: Arc<Mutex<Vec<u8>>> = Arc::default();
        let sink = seen.clone();
        session.attach(move |signal: &Signal| {
            if let Signal::EventReceived(e) = signal {
                sink.lock().unwrap().push(e.host);
            }
        });

        // Interleave two host streams; each host keeps its own sequence
        // numbering and buffers.
        let mut time = 100;
        for seq in 0..(SEQ_WARMUP_DEPTH + REORDER_CAPACITY + 5) as u16 {
            for host in [1u8, 2u8] {
                let ev = TraceEvent::from_word(
                    host,
                    0,
                    seq as u8,
                    time,
                    0,
                    EventType::Checkpoint,
                    0,
                )
                .unwrap();
                session.process(ev);
                time += 1;
            }
        }

        let seen = seen.lock().unwrap();
        let per_host =
            |id: u8| seen.iter().filter(|&&h| h == id).count();
        assert_eq!(per_host(1), 5);
        assert_eq!(per_host(2), 5);
        // Unconfigured host: dropped without a signal.
        drop(seen);
        let stray =
            TraceEvent::from_word(9, 0, 0, 1, 0, EventType::Checkpoint, 0).unwrap();
        session.process(stray);
    }

    #[test]
    fn test_run_drains_the_channel_until_disconnect() {
        let mut session = Session::new(&two_host_config()).unwrap();
        let count: Arc<Mutex<usize>> = Arc::default();
        let sink = count.clone();
        session.attach(move |signal: &Signal| {
            if matches!(signal, Signal::EventReceived(_)) {
                *sink.lock().unwrap() += 1;
            }
        });

        let (tx, rx) = crossbeam::channel::unbounded();
        let feeder = std::thread::spawn(move || {
            let total = SEQ_WARMUP_DEPTH + REORDER_CAPACITY + 5;
            for seq in 0..total {
                let ev = TraceEvent::from_word(
                    1,
                    0,
                    seq as u8,
                    100 + seq as u64,
                    0,
                    EventType::Checkpoint,
                    0,
                )
                .unwrap();
                tx.send(ev).unwrap();
            }
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        session.run(&rx, shutdown).unwrap();
        feeder.join().unwrap();
        assert_eq!(*count.lock().unwrap(), 5);
    }
}
