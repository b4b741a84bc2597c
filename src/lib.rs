//! Orchestration core for a network-emulation platform
//!
//! `emunet` manages the lifecycle of emulated network device instances
//! (each wrapping an external emulator process) and of the hosting
//! virtual machine that may run them. It provides:
//!
//! - a device registry with create/update/start/stop/reload/delete
//!   semantics and shared console/data port pools
//! - a network I/O endpoint model wiring device ports to UDP tunnels or
//!   host TAP interfaces, with a privileged-capability gate for the
//!   latter
//! - a periodic health supervisor that detects crashed or hung instances
//!   and reports them through a notification sink
//! - a VM controller that drives start/suspend/stop transitions
//!   uniformly across synchronous and job-polling hypervisor backends
//!
//! The request transport is deliberately out of scope: embedders call
//! the registry and controller methods directly.

pub mod config;
pub mod device;
pub mod notify;
pub mod vm;

pub use device::{
    DeviceError, DeviceInstance, DeviceRegistry, EndpointSpec, HealthSupervisor, NetworkEndpoint,
    PortPool, RegistrySettings, SettingsUpdate, SupervisorConfig,
};
pub use notify::{ChannelSink, LogSink, Notification, NotificationSink};
pub use vm::{BackendDriver, DriverRegistry, VmController, VmControllerConfig, VmError};
