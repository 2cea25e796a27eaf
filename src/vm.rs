//! A handle on one VM that remembers when it was seen entering each stage of its lifecycle.

use log::debug;

use crate::common::Clock;
use crate::error::BenchError;
use crate::hypervisor::{Hypervisor, VmState};

/// Points in a VM's lifecycle that are timestamped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mark {
    Created,
    Started,
    Powered,
    Up,
    Stopped,
}

impl Mark {
    pub fn as_str(self) -> &'static str {
        match self {
            Mark::Created => "created",
            Mark::Started => "started",
            Mark::Powered => "powered",
            Mark::Up => "up",
            Mark::Stopped => "stopped",
        }
    }
}

/// The result of polling a VM once.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub state: VmState,

    /// The mark recorded by this observation, if it was the first time the state was seen.
    pub newly_marked: Option<Mark>,
}

pub struct VmHandle<'c> {
    name: String,
    api: &'c dyn Hypervisor,
    clock: &'c dyn Clock,

    /// In the order they were recorded. Each mark appears at most once.
    marks: Vec<(Mark, f64)>,

    /// Set once a start request has been sent, so that it is never sent twice.
    start_issued: bool,
}

impl<'c> VmHandle<'c> {
    pub fn new(name: String, api: &'c dyn Hypervisor, clock: &'c dyn Clock) -> Self {
        let mut handle = VmHandle {
            name,
            api,
            clock,
            marks: Vec::new(),
            start_issued: false,
        };
        handle.mark(Mark::Created);
        handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &'c dyn Clock {
        self.clock
    }

    /// When `mark` was recorded, if it was.
    pub fn get(&self, mark: Mark) -> Option<f64> {
        self.marks
            .iter()
            .find(|(m, _)| *m == mark)
            .map(|&(_, t)| t)
    }

    pub fn marks(&self) -> &[(Mark, f64)] {
        &self.marks
    }

    /// Record `mark` now, unless it was recorded before. Returns whether it was recorded.
    fn mark(&mut self, mark: Mark) -> bool {
        if self.get(mark).is_some() {
            return false;
        }
        let now = self.clock.now();
        debug!("{}: {} at {:.3}", self.name, mark.as_str(), now);
        self.marks.push((mark, now));
        true
    }

    /// Query the current state, recording `powered` or `up` the first time they are seen.
    pub fn observe(&mut self) -> Result<Observation, BenchError> {
        let state = VmState::from(self.api.status(&self.name)?.as_str());

        let mark = match state {
            VmState::PoweringUp => Some(Mark::Powered),
            VmState::Up => Some(Mark::Up),
            VmState::Other(_) => None,
        };

        let newly_marked = match mark {
            Some(mark) if self.mark(mark) => Some(mark),
            _ => None,
        };

        Ok(Observation {
            state,
            newly_marked,
        })
    }

    /// Request a start, unless one was already requested through this handle or the VM is
    /// already up. Does not wait for the VM. Returns whether a request was sent.
    pub fn start(&mut self) -> Result<bool, BenchError> {
        if self.start_issued {
            return Ok(false);
        }

        if self.observe()?.state == VmState::Up {
            debug!("{}: already up", self.name);
            return Ok(false);
        }

        self.mark(Mark::Started);
        self.start_issued = true;
        self.api.start(&self.name)?;

        Ok(true)
    }

    /// Power the VM off if it is up. Returns whether a request was sent.
    pub fn stop(&mut self) -> Result<bool, BenchError> {
        if self.observe()?.state != VmState::Up {
            return Ok(false);
        }

        self.api.stop(&self.name)?;
        self.mark(Mark::Stopped);

        Ok(true)
    }

    pub fn is_running(&mut self) -> Result<bool, BenchError> {
        Ok(self.observe()?.state == VmState::Up)
    }

    /// Seconds from the creation of this handle to the first time the VM was seen up.
    pub fn startup_time(&self) -> Result<f64, BenchError> {
        match (self.get(Mark::Created), self.get(Mark::Up)) {
            (Some(created), Some(up)) => Ok(up - created),
            _ => Err(BenchError::NeverReady {
                vm: self.name.clone(),
            }),
        }
    }
}
