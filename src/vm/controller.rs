//! VM lifecycle controller
//!
//! Drives one hosting VM through start/suspend/stop transitions using a
//! pluggable backend driver, whether the backend completes transitions
//! synchronously or returns a job that must be polled. Operations on the
//! same VM are mutually exclusive; the mirrored `running` flag only flips
//! once a transition has been confirmed complete.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::info;

use super::backend::{BackendDriver, JobStatus, TransitionOutcome, VmHandle, VmState};
use super::VmError;

/// Default interval between job status polls
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a VM controller
#[derive(Debug, Clone)]
pub struct VmControllerConfig {
    /// Display name of the VM on the backend
    pub vmname: String,
    /// vCPU count applied before starting
    pub vcpus: u32,
    /// RAM in megabytes applied before starting
    pub ram_mb: u64,
    /// Interval between polls of an asynchronous transition job
    pub poll_interval: Duration,
    /// Upper bound on one transition wait; `None` waits indefinitely,
    /// matching backends that give no progress guarantee
    pub transition_timeout: Option<Duration>,
}

impl VmControllerConfig {
    pub fn new(vmname: impl Into<String>) -> Self {
        Self {
            vmname: vmname.into(),
            vcpus: 1,
            ram_mb: 2048,
            poll_interval: JOB_POLL_INTERVAL,
            transition_timeout: None,
        }
    }

    /// Set the vCPU and RAM allocation
    pub fn with_resources(mut self, vcpus: u32, ram_mb: u64) -> Self {
        self.vcpus = vcpus;
        self.ram_mb = ram_mb;
        self
    }

    /// Set the job poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound every transition wait by a timeout
    pub fn with_transition_timeout(mut self, timeout: Duration) -> Self {
        self.transition_timeout = Some(timeout);
        self
    }
}

struct ControllerState {
    connected: bool,
    handle: Option<VmHandle>,
    running: bool,
}

/// Controller for one hosting VM
pub struct VmController {
    config: VmControllerConfig,
    driver: Arc<dyn BackendDriver>,
    /// Per-VM gate: every operation holds this for its full duration
    state: Mutex<ControllerState>,
}

impl VmController {
    pub fn new(config: VmControllerConfig, driver: Arc<dyn BackendDriver>) -> Self {
        Self {
            config,
            driver,
            state: Mutex::new(ControllerState {
                connected: false,
                handle: None,
                running: false,
            }),
        }
    }

    /// Last confirmed running state. Refreshed by operations, not polled.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Start the VM
    ///
    /// Applies the pending vCPU/RAM configuration when the VM is not
    /// already enabled, then drives the transition to the running state.
    pub async fn vm_start(&self) -> Result<(), VmError> {
        let mut state = self.state.lock().await;
        let handle = self.ensure_vm(&mut state).await?;

        let enabled = self
            .driver
            .is_enabled(&handle)
            .await
            .map_err(|e| wrap("start", e))?;
        if !enabled {
            self.driver
                .configure_resources(&handle, self.config.vcpus, self.config.ram_mb)
                .await?;
            self.transition(&handle, VmState::Running, "start").await?;
            info!("VM '{}' has been started", self.config.vmname);
        }

        state.running = true;
        Ok(())
    }

    /// Suspend the VM
    pub async fn vm_suspend(&self) -> Result<(), VmError> {
        let mut state = self.state.lock().await;
        let handle = self.ensure_vm(&mut state).await?;
        self.transition(&handle, VmState::Suspended, "suspend")
            .await?;
        info!("VM '{}' has been suspended", self.config.vmname);
        state.running = false;
        Ok(())
    }

    /// Stop the VM
    pub async fn vm_stop(&self) -> Result<(), VmError> {
        let mut state = self.state.lock().await;
        let handle = self.ensure_vm(&mut state).await?;
        self.transition(&handle, VmState::Stopped, "stop").await?;
        info!("VM '{}' has been stopped", self.config.vmname);
        state.running = false;
        Ok(())
    }

    /// Display names of all real VMs on the backend, sorted
    pub async fn list_vms(&self) -> Result<Vec<String>, VmError> {
        {
            let mut state = self.state.lock().await;
            self.ensure_connected(&mut state).await?;
        }
        let mut vms = self
            .driver
            .list_vms()
            .await
            .map_err(|e| wrap("list", e))?;
        vms.sort();
        Ok(vms)
    }

    async fn ensure_connected(&self, state: &mut ControllerState) -> Result<(), VmError> {
        if !state.connected {
            self.driver.connect().await?;
            state.connected = true;
        }
        Ok(())
    }

    async fn ensure_vm(&self, state: &mut ControllerState) -> Result<VmHandle, VmError> {
        self.ensure_connected(state).await?;
        match &state.handle {
            Some(handle) => Ok(handle.clone()),
            None => {
                let handle = self
                    .driver
                    .find(&self.config.vmname)
                    .await?
                    .ok_or_else(|| VmError::NotFound(self.config.vmname.clone()))?;
                state.handle = Some(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Drive one state transition to confirmed completion
    ///
    /// Synchronous outcomes finish immediately; pending jobs are polled
    /// on a fixed interval until they leave the running state. A job
    /// ending in any status other than completed fails with the
    /// backend's own error description. Cancellation (timeout or caller
    /// abort) only stops the wait; the in-flight backend job is left
    /// as-is.
    async fn transition(
        &self,
        handle: &VmHandle,
        target: VmState,
        action: &'static str,
    ) -> Result<(), VmError> {
        let outcome = self
            .driver
            .request_transition(handle, target)
            .await
            .map_err(|e| wrap(action, e))?;

        let job = match outcome {
            TransitionOutcome::Complete => return Ok(()),
            TransitionOutcome::Pending(job) => job,
        };

        let poll_interval = self.config.poll_interval;
        let wait = async {
            loop {
                match job.poll().await.map_err(|e| wrap(action, e))? {
                    JobStatus::Running => sleep(poll_interval).await,
                    JobStatus::Completed => return Ok(()),
                    JobStatus::Failed(cause) => return Err(VmError::Backend { action, cause }),
                }
            }
        };

        match self.config.transition_timeout {
            Some(bound) => timeout(bound, wait)
                .await
                .map_err(|_| VmError::Timeout { action })?,
            None => wait.await,
        }
    }
}

/// Wrap a backend failure so the attempted action is always named
fn wrap(action: &'static str, err: VmError) -> VmError {
    match err {
        e @ VmError::Timeout { .. } | e @ VmError::Backend { .. } => e,
        other => VmError::Backend {
            action,
            cause: other.to_string(),
        },
    }
}
