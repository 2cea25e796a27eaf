//! The boundary to the hypervisor's control API.

use crate::error::BenchError;

/// Control-plane operations on VMs, addressed by name. Shared by all handles of a run, possibly
/// from several threads at once.
pub trait Hypervisor: Sync {
    /// The API's status string for `vm` (e.g. `down`, `powering_up`, `up`).
    fn status(&self, vm: &str) -> Result<String, BenchError>;

    /// Ask for `vm` to be started. Returns once the request is accepted, not when the VM is up.
    fn start(&self, vm: &str) -> Result<(), BenchError>;

    /// Ask for `vm` to be powered off.
    fn stop(&self, vm: &str) -> Result<(), BenchError>;
}

/// The lifecycle states the benchmark cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmState {
    PoweringUp,
    Up,

    /// Anything else, passed through as reported.
    Other(String),
}

impl From<&str> for VmState {
    fn from(status: &str) -> Self {
        match status.trim() {
            "powering_up" => VmState::PoweringUp,
            "up" => VmState::Up,
            other => VmState::Other(other.into()),
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VmState::PoweringUp => write!(f, "powering_up"),
            VmState::Up => write!(f, "up"),
            VmState::Other(s) => write!(f, "{}", s),
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn states() {
        assert_eq!(VmState::from("powering_up"), VmState::PoweringUp);
        assert_eq!(VmState::from("up"), VmState::Up);
        assert_eq!(
            VmState::from("wait_for_launch"),
            VmState::Other("wait_for_launch".into())
        );
        assert_eq!(VmState::from("down").to_string(), "down");
    }
}
