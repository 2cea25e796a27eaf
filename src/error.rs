//! Typed failures of the benchmark. Routines convert these into `failure::Error` at their
//! boundary.

use failure_derive::Fail;

#[derive(Debug, Fail)]
pub enum BenchError {
    /// A call to the hypervisor control API failed. Aborts the current trial.
    #[fail(display = "{} of VM {} failed: {}", op, vm, reason)]
    Api {
        vm: String,
        op: &'static str,
        reason: String,
    },

    /// Startup latency was requested for a VM that was never seen `up`.
    #[fail(display = "VM {} never reached `up`", vm)]
    NeverReady { vm: String },

    /// Waiting for a group of VMs exceeded its deadline.
    #[fail(
        display = "timed out waiting for {:?} (ready: {:?})",
        timed_out, ready
    )]
    Timeout {
        ready: Vec<String>,
        timed_out: Vec<String>,
    },

    /// A trial did not produce a value for exactly the VMs of the previous trials.
    #[fail(
        display = "incomplete trial: expected VMs {:?}, got {:?}",
        expected, got
    )]
    IncompleteTrial {
        expected: Vec<String>,
        got: Vec<String>,
    },

    /// A malformed line in a raw result dump.
    #[fail(display = "line {}: {}: {:?}", line, reason, text)]
    Parse {
        line: usize,
        text: String,
        reason: String,
    },

    /// A step of launching, stopping or collecting the remote sampler failed.
    #[fail(display = "remote sampler: {} failed: {}", step, reason)]
    RemoteCoordination { step: &'static str, reason: String },
}

impl BenchError {
    pub fn api(vm: &str, op: &'static str, reason: impl std::fmt::Display) -> Self {
        BenchError::Api {
            vm: vm.into(),
            op,
            reason: reason.to_string(),
        }
    }

    pub fn remote(step: &'static str, reason: impl std::fmt::Display) -> Self {
        BenchError::RemoteCoordination {
            step,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn messages() {
        let err = BenchError::Timeout {
            ready: vec!["Tiny0".into()],
            timed_out: vec!["Tiny1".into(), "Tiny2".into()],
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for [\"Tiny1\", \"Tiny2\"] (ready: [\"Tiny0\"])"
        );

        let err = BenchError::api("Tiny0", "start", "HTTP 409");
        assert_eq!(err.to_string(), "start of VM Tiny0 failed: HTTP 409");

        let err = BenchError::Parse {
            line: 3,
            text: "Tiny0\tabc".into(),
            reason: "invalid float literal".into(),
        };
        assert_eq!(
            err.to_string(),
            "line 3: invalid float literal: \"Tiny0\\tabc\""
        );
    }
}
