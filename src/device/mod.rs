//! Emulated device orchestration
//!
//! This module owns the lifecycle of emulated network device instances:
//! the shared console/data port pools, the network I/O (NIO) endpoint
//! abstraction, the per-instance process management, the registry that
//! ties them together and the periodic health supervisor.

pub mod allocator;
pub mod caps;
pub mod instance;
pub mod nio;
pub mod registry;
pub mod supervisor;

use thiserror::Error;

pub use allocator::{PortPool, Protocol};
pub use caps::{CapabilityProbe, OsCapabilityProbe};
pub use instance::DeviceInstance;
pub use nio::{EndpointSpec, NetworkEndpoint};
pub use registry::{CreatedDevice, DeviceRegistry, RegistrySettings, SettingsUpdate};
pub use supervisor::{spawn_supervisor, HealthSupervisor, SupervisorConfig};

/// Default console (TCP) port range
pub const CONSOLE_START_PORT: u16 = 4001;
pub const CONSOLE_END_PORT: u16 = 4512;

/// Default data (UDP tunnel) port range
pub const DATA_START_PORT: u16 = 30001;
pub const DATA_END_PORT: u16 = 40001;

/// Default liveness check interval in seconds
pub const SUPERVISION_INTERVAL_SECS: u64 = 5;

/// Errors that can occur during device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device {0} doesn't exist")]
    NotFound(u64),

    #[error("Device name '{0}' is already in use")]
    NameConflict(String),

    #[error("Slot {slot} port {port} already has an endpoint binding")]
    SlotConflict { slot: u8, port: u8 },

    #[error("No endpoint binding on slot {slot} port {port}")]
    BindingNotFound { slot: u8, port: u8 },

    #[error("No free port available in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("{binary} has no privileged access to {device}")]
    PermissionDenied { binary: String, device: String },

    #[error("Device '{0}' is already running")]
    AlreadyRunning(String),

    #[error("{0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
