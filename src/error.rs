//! Error types for catapult-node.
//!
//! # Error Message Style Guide
//!
//! All error messages follow a consistent format for clarity and actionability:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: All lowercase (Rust convention for error messages)
//! - **Context**: Include relevant identifiers (VM id, tap device, step name) when available
//!
//! ## Preferred Patterns
//!
//! ```text
//! // Operation failures (use "failed" consistently)
//! "network operation failed: create tap device: fc-456789: file exists"
//! "provisioning step failed: unpack image: umoci exited with status 1"
//!
//! // Not found errors
//! "vm not found: vm-1"
//! ```
//!
//! Every variant maps onto one class of the node's error taxonomy, which the
//! API layer turns into an HTTP status and a stable `code` string.

use thiserror::Error;

/// Result type alias using catapult-node's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in catapult-node operations.
///
/// Error messages follow a consistent format. See module documentation for style guide.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Missing binary, kernel or drive, or a malformed config. Not retried.
    #[error("configuration failed: {operation}: {reason}")]
    Configuration {
        /// The operation that failed (e.g., "locate hypervisor", "load").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Network Errors
    // ========================================================================
    /// Bridge missing, address pool exhausted, or tap device failure.
    #[error("network operation failed: {operation}: {reason}")]
    Network {
        /// The operation that failed (e.g., "create tap device", "allocate ip").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Provisioning Errors
    // ========================================================================
    /// A step of the image or volume pipeline failed.
    #[error("provisioning step failed: {step}: {reason}")]
    Provisioning {
        /// The pipeline step that failed (e.g., "copy image", "format drive").
        step: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Hypervisor Process Errors
    // ========================================================================
    /// The hypervisor failed to start, exited unexpectedly, or did not stop.
    #[error("hypervisor process failed: {operation}: {reason}")]
    Process {
        /// The operation that failed (e.g., "spawn", "startup", "stop").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // VM Lifecycle Errors
    // ========================================================================
    /// VM not found by id.
    #[error("vm not found: {id}")]
    VmNotFound {
        /// Id of the VM that was not found.
        id: String,
    },

    /// A VM with this id is already running or starting.
    #[error("vm already exists: {id}")]
    VmAlreadyExists {
        /// Id of the conflicting VM.
        id: String,
    },

    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state: {id}: expected {expected}, got {actual}")]
    InvalidState {
        /// Id of the VM.
        id: String,
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Another operation on the same image or volume is in flight.
    #[error("resource busy: {resource}")]
    Busy {
        /// The contended resource (e.g., "volume rbd/volume-7").
        resource: String,
    },

    /// Request rejected before any work was done.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Explanation of why the request is invalid.
        reason: String,
    },

    // ========================================================================
    // Command Execution Errors
    // ========================================================================
    /// External command failed.
    #[error("command '{command}' failed: {reason}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message or reason for failure.
        reason: String,
    },

    // ========================================================================
    // IO Errors
    // ========================================================================
    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn configuration(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a network operation error.
    pub fn network(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a provisioning step error.
    pub fn provisioning(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provisioning {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Create a hypervisor process error.
    pub fn process(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Process {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a VM not found error.
    pub fn vm_not_found(id: impl Into<String>) -> Self {
        Self::VmNotFound { id: id.into() }
    }

    /// Create a VM already exists error.
    pub fn vm_already_exists(id: impl Into<String>) -> Self {
        Self::VmAlreadyExists { id: id.into() }
    }

    /// Create an invalid state error.
    pub fn invalid_state(
        id: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a resource busy error.
    pub fn busy(resource: impl Into<String>) -> Self {
        Self::Busy {
            resource: resource.into(),
        }
    }

    /// Create an invalid request error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Stable taxonomy code, used by the API error body.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration { .. } => "CONFIGURATION_ERROR",
            Error::Network { .. } => "NETWORK_ERROR",
            Error::Provisioning { .. } => "PROVISIONING_ERROR",
            Error::Process { .. } => "PROCESS_ERROR",
            Error::VmNotFound { .. } => "NOT_FOUND",
            Error::VmAlreadyExists { .. } | Error::InvalidState { .. } | Error::Busy { .. } => {
                "CONFLICT"
            }
            Error::InvalidRequest { .. } => "BAD_REQUEST",
            Error::CommandFailed { .. } | Error::Io(_) => "INTERNAL_ERROR",
        }
    }
}
