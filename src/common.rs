//! A library of routines commonly used by the benchmark routines.

#[macro_use]
pub mod macros;

#[macro_use]
pub mod output;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::hypervisor::Hypervisor;
use crate::vm::VmHandle;

#[derive(Copy, Clone, Debug)]
pub struct Username<'u>(pub &'u str);

impl Username<'_> {
    pub fn as_str(&self) -> &str {
        self.0
    }
}

pub struct Login<'u, 'h> {
    pub hostname: &'h str,
    pub username: Username<'u>,
}

/// Source of time for everything that measures latency or waits. All marks are seconds on this
/// clock.
pub trait Clock: Send + Sync {
    /// Seconds since some fixed point.
    fn now(&self) -> f64;

    fn sleep(&self, duration: Duration);
}

/// Real time, counted from the creation of the clock.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when somebody sleeps on it.
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<f64>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: std::sync::Mutex::new(0.0),
        }
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock().unwrap() += secs;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration.as_secs_f64());
    }
}

/// How VM names are derived from a base name and an index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameScheme {
    /// `Tiny7`
    Plain,

    /// `Tiny_C007`
    Padded,
}

impl NameScheme {
    pub fn name(self, base: &str, index: usize) -> String {
        match self {
            NameScheme::Plain => format!("{}{}", base, index),
            NameScheme::Padded => format!("{}_C{:03}", base, index),
        }
    }
}

/// Settings of a benchmark run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Base name of the VMs.
    pub vm_name: String,
    pub scheme: NameScheme,

    /// Index of the first VM.
    pub first: usize,
    pub num_vms: usize,

    /// Number of threads issuing start requests, or `None` to start VMs one after another.
    pub workers: Option<usize>,

    pub poll_interval: Duration,

    /// How long to wait for a group of VMs to come up before giving up on the trial.
    pub deadline: Duration,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            vm_name: "Tiny".into(),
            scheme: NameScheme::Plain,
            first: 0,
            num_vms: 32,
            workers: Some(32),
            poll_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(300),
        }
    }
}

impl BenchConfig {
    /// Names of the VMs `first..first+num_vms`.
    pub fn names(&self) -> Vec<String> {
        (self.first..self.first + self.num_vms)
            .map(|i| self.scheme.name(&self.vm_name, i))
            .collect()
    }
}

/// Everything a benchmark routine needs, passed around explicitly.
pub struct BenchCtx {
    pub config: BenchConfig,
    pub api: Arc<dyn Hypervisor>,
    pub clock: Arc<dyn Clock>,
}

impl BenchCtx {
    pub fn new(config: BenchConfig, api: Arc<dyn Hypervisor>, clock: Arc<dyn Clock>) -> Self {
        BenchCtx { config, api, clock }
    }

    /// Fresh handles for all VMs of the configuration.
    pub fn handles(&self) -> Vec<VmHandle<'_>> {
        self.handles_for(self.config.names())
    }

    pub fn handles_for(&self, names: Vec<String>) -> Vec<VmHandle<'_>> {
        names
            .into_iter()
            .map(|name| VmHandle::new(name, &*self.api, &*self.clock))
            .collect()
    }
}

/// Render a list of timers as one `label: seconds` line each.
pub fn timings_str(timings: &[(String, Duration)]) -> String {
    timings
        .iter()
        .map(|(label, d)| format!("{}: {:.3}s", label, d.as_secs_f64()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_schemes() {
        assert_eq!(NameScheme::Plain.name("Tiny", 7), "Tiny7");
        assert_eq!(NameScheme::Padded.name("Tiny", 7), "Tiny_C007");
        assert_eq!(NameScheme::Padded.name("Tiny", 1234), "Tiny_C1234");
    }

    #[test]
    fn config_names() {
        let config = BenchConfig {
            first: 3,
            num_vms: 2,
            scheme: NameScheme::Padded,
            ..BenchConfig::default()
        };
        assert_eq!(config.names(), vec!["Tiny_C003", "Tiny_C004"]);
    }

    #[test]
    fn manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0.0);
        clock.sleep(Duration::from_millis(1500));
        assert_eq!(clock.now(), 1.5);
    }

    #[test]
    fn timings() {
        let timings = vec![
            ("Trial 0".to_owned(), Duration::from_millis(1500)),
            ("Trial 1".to_owned(), Duration::from_secs(2)),
        ];
        assert_eq!(timings_str(&timings), "Trial 0: 1.500s\nTrial 1: 2.000s");
    }
}
