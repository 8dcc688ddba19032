//! Process management utilities.
//!
//! A thin wrapper over `kill(2)` used by the hypervisor supervisor, plus the
//! [`VmExit`] summary recorded when a hypervisor process goes away.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

/// Default timeout for graceful shutdown before SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code returned when the actual exit status cannot be determined.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Send SIGTERM to a process.
///
/// Returns true if the signal was sent successfully.
pub fn terminate(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// How a hypervisor process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmExit {
    /// Exit code, or [`UNKNOWN_EXIT_CODE`] when killed by a signal.
    pub code: i32,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Whether the supervisor had to escalate to SIGKILL.
    pub forced: bool,
}

impl VmExit {
    /// Build from a reaped child's status.
    pub fn from_status(status: ExitStatus, forced: bool) -> Self {
        Self {
            code: status.code().unwrap_or(UNKNOWN_EXIT_CODE),
            signal: status.signal(),
            forced,
        }
    }

    /// Exit whose status could not be collected.
    pub fn unknown() -> Self {
        Self {
            code: UNKNOWN_EXIT_CODE,
            signal: None,
            forced: false,
        }
    }

    /// True for a zero exit code without a signal.
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl fmt::Display for VmExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(sig) => write!(f, "killed by {}", signal_name(sig))?,
            None => write!(f, "exit code {}", self.code)?,
        }
        if self.forced {
            write!(f, " (forced)")?;
        }
        Ok(())
    }
}

/// Short name for the signals the supervisor deals with.
pub fn signal_name(sig: i32) -> String {
    match sig {
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        other => format!("signal {}", other),
    }
}
