//! Hosting VM lifecycle control
//!
//! The orchestration core can drive the virtual machine that hosts the
//! emulated devices through a pluggable backend driver. Backends differ
//! in their control plane: some complete state transitions synchronously,
//! others hand back a job that must be polled to completion. The
//! controller hides that difference behind a uniform start/suspend/stop
//! surface.

pub mod backend;
pub mod controller;

use thiserror::Error;

pub use backend::{
    BackendDriver, DriverRegistry, JobStatus, TransitionJob, TransitionOutcome, VmHandle, VmState,
};
pub use controller::{VmController, VmControllerConfig};

/// Errors surfaced by VM lifecycle operations
#[derive(Error, Debug)]
pub enum VmError {
    #[error("Could not connect to the virtualization backend: {0}")]
    Connection(String),

    #[error("The current account does not have the required permissions: {0}")]
    Permission(String),

    #[error("Duplicate VM name found for {0}")]
    DuplicateName(String),

    #[error("VM '{0}' was not found on the backend")]
    NotFound(String),

    #[error("You have allocated too many vCPUs ({requested}) for the VM, max available is {available}")]
    ResourceExhausted { requested: u32, available: u32 },

    #[error("No usable '{0}' backend driver on this platform")]
    DriverUnavailable(String),

    #[error("Timed out waiting to {action} the VM")]
    Timeout { action: &'static str },

    #[error("Failed to {action} the VM: {cause}")]
    Backend { action: &'static str, cause: String },
}

/// Number of physical cores on this host
///
/// Used by backend drivers to validate vCPU allocations before mutating
/// any VM configuration.
pub fn host_physical_cores() -> u32 {
    sysinfo::System::new().physical_core_count().unwrap_or(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_has_at_least_one_physical_core() {
        assert!(host_physical_cores() >= 1);
    }
}
