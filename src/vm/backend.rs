//! Backend driver abstraction
//!
//! A `BackendDriver` encapsulates one hypervisor's management API. The
//! controller only ever talks through this trait, so backends whose
//! transitions complete synchronously and backends that hand back a
//! pollable job are driven identically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::VmError;

/// Desired or observed VM state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Suspended,
}

/// Opaque backend-side identity of one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle(pub String);

/// Terminal or in-flight status of an asynchronous transition job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// The job is still executing
    Running,
    /// The job finished successfully
    Completed,
    /// The job reached any other terminal state; carries the backend's
    /// own error description
    Failed(String),
}

/// A pollable handle for an asynchronous state transition
#[async_trait]
pub trait TransitionJob: Send + Sync {
    /// Query the job's current status. One bounded backend call, no
    /// internal waiting.
    async fn poll(&self) -> Result<JobStatus, VmError>;
}

/// Result of requesting a state transition from a backend
pub enum TransitionOutcome {
    /// The transition completed synchronously
    Complete,
    /// The backend returned a job that must be polled to completion
    Pending(Box<dyn TransitionJob>),
}

/// One hypervisor's management API
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Engine name, e.g. "hyper-v"
    fn name(&self) -> &str;

    /// Connect to the management API. Fails with `Connection` when the
    /// API is unreachable and `Permission` when the account lacks
    /// rights.
    async fn connect(&self) -> Result<(), VmError>;

    /// Find a VM by display name
    ///
    /// More than one match is a hard configuration error
    /// (`DuplicateName`), never silently resolved.
    async fn find(&self, name: &str) -> Result<Option<VmHandle>, VmError>;

    /// Whether the VM is currently in the enabled/running state
    async fn is_enabled(&self, handle: &VmHandle) -> Result<bool, VmError>;

    /// Apply vCPU and RAM settings
    ///
    /// Validates the vCPU count against the host's physical core count
    /// and fails with `ResourceExhausted` before mutating anything when
    /// it exceeds capacity.
    async fn configure_resources(
        &self,
        handle: &VmHandle,
        vcpus: u32,
        ram_mb: u64,
    ) -> Result<(), VmError>;

    /// Ask the backend to move the VM towards `target`
    async fn request_transition(
        &self,
        handle: &VmHandle,
        target: VmState,
    ) -> Result<TransitionOutcome, VmError>;

    /// Display names of all real VMs known to the backend, excluding
    /// templates and snapshots
    async fn list_vms(&self) -> Result<Vec<String>, VmError>;
}

/// Registry of available backend drivers
///
/// Drivers register under their engine name at startup; platforms where
/// an engine cannot work simply never register it, and resolving it
/// becomes a configuration error at first use rather than a crash at
/// load time.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn BackendDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its engine name
    pub fn register(&mut self, driver: Arc<dyn BackendDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Resolve an engine name to a driver
    pub fn resolve(&self, engine: &str) -> Result<Arc<dyn BackendDriver>, VmError> {
        self.drivers
            .get(engine)
            .cloned()
            .ok_or_else(|| VmError::DriverUnavailable(engine.to_string()))
    }

    /// Registered engine names
    pub fn engines(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedDriver(&'static str);

    #[async_trait]
    impl BackendDriver for NamedDriver {
        fn name(&self) -> &str {
            self.0
        }

        async fn connect(&self) -> Result<(), VmError> {
            Ok(())
        }

        async fn find(&self, _name: &str) -> Result<Option<VmHandle>, VmError> {
            Ok(None)
        }

        async fn is_enabled(&self, _handle: &VmHandle) -> Result<bool, VmError> {
            Ok(false)
        }

        async fn configure_resources(
            &self,
            _handle: &VmHandle,
            _vcpus: u32,
            _ram_mb: u64,
        ) -> Result<(), VmError> {
            Ok(())
        }

        async fn request_transition(
            &self,
            _handle: &VmHandle,
            _target: VmState,
        ) -> Result<TransitionOutcome, VmError> {
            Ok(TransitionOutcome::Complete)
        }

        async fn list_vms(&self) -> Result<Vec<String>, VmError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_missing_driver_is_a_config_error() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.resolve("hyper-v"),
            Err(VmError::DriverUnavailable(engine)) if engine == "hyper-v"
        ));
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(NamedDriver("hyper-v")));
        assert!(registry.resolve("hyper-v").is_ok());
        assert_eq!(registry.engines(), vec!["hyper-v".to_string()]);
    }
}
