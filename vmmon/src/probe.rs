//! Per-tick measurements of the host and of the tracked processes.

use sysinfo::{Pid, System};

use crate::{HostSample, MemoryInfo, MonError, ProcessSample, Tracked};

/// Source of measurements for the sampling loop.
pub trait Probe {
    /// Take the baseline that the first CPU percentages are computed against. Called once,
    /// before the first tick.
    fn prime(&mut self, tracked: &[Tracked]) -> Result<(), MonError>;

    /// Host-wide CPU usage since the previous call.
    fn host(&mut self, percpu: bool) -> HostSample;

    /// Usage of one tracked process since the previous call.
    fn process(&mut self, tracked: &Tracked) -> Result<ProcessSample, MonError>;
}

/// Measures the live system.
pub struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        SysinfoProbe { sys: System::new() }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for SysinfoProbe {
    fn prime(&mut self, tracked: &[Tracked]) -> Result<(), MonError> {
        self.sys.refresh_cpu_usage();
        for t in tracked {
            if !self.sys.refresh_process(Pid::from_u32(t.pid)) {
                return Err(MonError::ProcessGone {
                    label: t.label.clone(),
                    pid: t.pid,
                });
            }
        }
        Ok(())
    }

    fn host(&mut self, percpu: bool) -> HostSample {
        self.sys.refresh_cpu_usage();
        HostSample {
            cpu: self.sys.global_cpu_info().cpu_usage(),
            percpu: if percpu {
                Some(self.sys.cpus().iter().map(|cpu| cpu.cpu_usage()).collect())
            } else {
                None
            },
        }
    }

    fn process(&mut self, tracked: &Tracked) -> Result<ProcessSample, MonError> {
        let pid = Pid::from_u32(tracked.pid);
        let gone = || MonError::ProcessGone {
            label: tracked.label.clone(),
            pid: tracked.pid,
        };

        if !self.sys.refresh_process(pid) {
            return Err(gone());
        }
        let process = self.sys.process(pid).ok_or_else(gone)?;
        let threads = thread_count(tracked.pid).map_err(|_| gone())?;

        Ok(ProcessSample {
            cpu: process.cpu_usage(),
            memory: MemoryInfo {
                rss: process.memory(),
                vms: process.virtual_memory(),
            },
            threads,
        })
    }
}

/// Number of threads of `pid`, from the `Threads:` line of `/proc/<pid>/status`.
pub fn thread_count(pid: u32) -> std::io::Result<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid))?;
    parse_threads(&status).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("no thread count in /proc/{}/status", pid),
        )
    })
}

fn parse_threads(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("Threads:"))
        .and_then(|line| line["Threads:".len()..].trim().parse().ok())
}
