//! External command execution.
//!
//! Every host tool the node drives (`ip`, `nmap`, `skopeo`, `umoci`,
//! `mkfs.ext4`, `mount`, `rbd-nbd`) goes through a [`CommandRunner`]. The
//! runner is synchronous; async callers wrap it in `spawn_blocking`.

use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Common search paths for system tools that are often missing from a
/// service's `PATH` (mkfs.ext4, ip, rbd-nbd).
const SBIN_PATH_PREFIXES: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// Runs an external program to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning combined stdout and stderr with
    /// surrounding whitespace trimmed.
    ///
    /// A non-zero exit is an [`Error::CommandFailed`] carrying the output.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let command_line = format_command(program, args);
        let resolved = find_tool(program).unwrap_or_else(|| program.to_string());

        tracing::debug!(command = %command_line, "running command");

        let output = Command::new(&resolved).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::command_failed(&command_line, format!("{} not found", program))
            } else {
                Error::command_failed(&command_line, e.to_string())
            }
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        if !output.status.success() {
            let reason = if combined.is_empty() {
                format!("exited with {}", output.status)
            } else {
                format!("exited with {}: {}", output.status, combined)
            };
            return Err(Error::command_failed(command_line, reason));
        }

        Ok(combined)
    }
}

/// Find a tool by name.
///
/// Absolute and relative paths are returned as-is when they exist. Bare names
/// are looked up in the sbin prefixes first, then in `PATH`.
pub fn find_tool(name: &str) -> Option<String> {
    if name.contains('/') {
        return Path::new(name).exists().then(|| name.to_string());
    }

    // Check known paths first
    for prefix in SBIN_PATH_PREFIXES {
        let path = format!("{}/{}", prefix, name);
        if Path::new(&path).exists() {
            return Some(path);
        }
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
        .map(|candidate| candidate.to_string_lossy().into_owned())
}

/// Borrow a path as a command argument.
pub fn path_arg<'a>(path: &'a Path, step: &str) -> Result<&'a str> {
    path.to_str().ok_or_else(|| {
        Error::provisioning(
            step,
            format!("path contains invalid characters: {}", path.display()),
        )
    })
}

/// Flags whose value is a secret and must not reach logs or error messages.
const SECRET_FLAGS: &[&str] = &["--src-creds", "--creds"];

fn format_command(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    let mut redact_next = false;
    for arg in args {
        line.push(' ');
        if redact_next {
            line.push_str("<redacted>");
        } else {
            line.push_str(arg);
        }
        redact_next = SECRET_FLAGS.contains(arg);
    }
    line
}
