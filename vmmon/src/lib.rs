//! Common definitions for the `vmmon` sampling daemon and the tools that read its output.
//!
//! The daemon attaches to the processes of the virtualization management stack (e.g. `libvirtd`
//! and `vdsm`) and writes one [`Sample`] per tick as a line of JSON until it is signalled to stop.

pub mod daemon;
pub mod discover;
pub mod probe;
pub mod sampler;

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use failure_derive::Fail;

use serde::{Deserialize, Serialize};

/// Exit status used when the monitored processes cannot be found at startup.
pub const EXIT_PROCESS_NOT_FOUND: i32 = 2;

/// Exit status used when a tracked process goes away while we are sampling it.
pub const EXIT_PROCESS_GONE: i32 = 3;

/// Exit status for any other failure (I/O, bad arguments...).
pub const EXIT_FAILURE: i32 = 1;

/// One record of the sample stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the epoch.
    pub timestamp: f64,

    /// Host-wide usage.
    pub host: HostSample,

    /// Per tracked process, keyed by label.
    #[serde(flatten)]
    pub processes: BTreeMap<String, ProcessSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSample {
    /// Aggregate CPU usage in percent.
    pub cpu: f32,

    /// Per-core CPU usage in percent, only recorded with `--percpu`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percpu: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    /// CPU usage in percent since the previous sample. Can exceed 100 for multithreaded
    /// processes.
    pub cpu: f32,
    pub memory: MemoryInfo,
    pub threads: u64,
}

/// Memory usage in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    #[serde(rename = "resident")]
    pub rss: u64,
    #[serde(rename = "virtual")]
    pub vms: u64,
}

/// A process the daemon samples, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked {
    /// The key under which samples for this process are recorded.
    pub label: String,
    pub pid: u32,
}

/// Shared flag used to ask the sampling loop to stop. Signal handlers only ever set it.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn flag(&self) -> &Arc<AtomicBool> {
        &self.0
    }
}

#[derive(Debug, Fail)]
pub enum MonError {
    #[fail(display = "unable to find process `{}`: {}", spec, reason)]
    ProcessNotFound { spec: String, reason: String },

    #[fail(display = "tracked process {} (pid {}) went away", label, pid)]
    ProcessGone { label: String, pid: u32 },

    #[fail(display = "invalid process spec `{}`: {}", spec, reason)]
    BadSpec { spec: String, reason: String },

    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] std::io::Error),

    #[fail(display = "unable to serialize sample: {}", _0)]
    Serialize(#[cause] serde_json::Error),
}

impl MonError {
    /// The process exit status that reports this error to whoever launched the daemon.
    pub fn exit_code(&self) -> i32 {
        match self {
            MonError::ProcessNotFound { .. } => EXIT_PROCESS_NOT_FOUND,
            MonError::ProcessGone { .. } => EXIT_PROCESS_GONE,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<std::io::Error> for MonError {
    fn from(err: std::io::Error) -> Self {
        MonError::Io(err)
    }
}

impl From<serde_json::Error> for MonError {
    fn from(err: serde_json::Error) -> Self {
        MonError::Serialize(err)
    }
}

/// Parse a sample stream (one JSON record per line). Blank lines are ignored.
pub fn parse_samples(text: &str) -> Result<Vec<Sample>, serde_json::Error> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(serde_json::from_str)
        .collect()
}
