//! Running VM records.

pub mod registry;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::hypervisor::{HypervisorHandle, Launched, LogTasks, VmIdentity};
use crate::network::NetworkLease;

pub use registry::{ReservationGuard, VmRegistry};

/// Lifecycle state of a registered VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    /// Hypervisor is up.
    Running,
    /// A stop is in progress.
    Stopping,
    /// Hypervisor exited without being asked to.
    Failed {
        /// What happened.
        reason: String,
    },
}

impl VmState {
    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the node holds for one VM.
#[derive(Debug)]
pub struct RunningVm {
    identity: VmIdentity,
    hypervisor: HypervisorHandle,
    lease: NetworkLease,
    logs: LogTasks,
    state: Mutex<VmState>,
    network_released: AtomicBool,
    started_at: SystemTime,
}

impl RunningVm {
    /// Record a freshly launched VM.
    pub fn new(identity: VmIdentity, lease: NetworkLease, launched: Launched) -> Self {
        Self {
            identity,
            hypervisor: launched.handle,
            lease,
            logs: launched.logs,
            state: Mutex::new(VmState::Running),
            network_released: AtomicBool::new(false),
            started_at: SystemTime::now(),
        }
    }

    /// VM id.
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Identity the VM was started with.
    pub fn identity(&self) -> &VmIdentity {
        &self.identity
    }

    /// Hypervisor control handle.
    pub fn hypervisor(&self) -> &HypervisorHandle {
        &self.hypervisor
    }

    /// Network lease held by the VM.
    pub fn lease(&self) -> &NetworkLease {
        &self.lease
    }

    /// Log drains.
    pub fn logs(&self) -> &LogTasks {
        &self.logs
    }

    /// Current state.
    pub fn state(&self) -> VmState {
        self.state.lock().clone()
    }

    /// When the VM was registered.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Transition to `Stopping`, returning the previous state.
    pub(crate) fn begin_stop(&self) -> VmState {
        std::mem::replace(&mut *self.state.lock(), VmState::Stopping)
    }

    /// Record an unexpected exit. Returns false if a stop is already running.
    pub(crate) fn mark_failed(&self, reason: String) -> bool {
        let mut state = self.state.lock();
        match *state {
            VmState::Running => {
                *state = VmState::Failed { reason };
                true
            }
            _ => false,
        }
    }

    /// Claim the network teardown. Only the first caller gets true.
    pub(crate) fn claim_network_release(&self) -> bool {
        !self.network_released.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(VmState::Running.to_string(), "running");
        assert_eq!(VmState::Stopping.to_string(), "stopping");
        assert_eq!(
            VmState::Failed {
                reason: "exit code 1".into()
            }
            .as_str(),
            "failed"
        );
    }
}
