//! Server configuration
//!
//! Settings are read from a JSON file through a thin I/O wrapper over
//! pure parsing, with sensible defaults for everything. When no device
//! binary is configured, one is discovered next to the current directory
//! or on `PATH`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::device::{
    RegistrySettings, CONSOLE_END_PORT, CONSOLE_START_PORT, DATA_END_PORT, DATA_START_PORT,
};

/// Errors for settings loading (file I/O separate from parsing)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Top-level server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Path to the device emulator binary; discovered when unset
    pub binary: Option<String>,
    /// Root of all instance working directories
    pub working_dir: Option<String>,
    /// Host address for console and tunnel binding
    pub host: String,
    /// Device type prefix for default instance names
    pub device_type: String,
    /// Console (TCP) port range
    pub console_start_port: u16,
    pub console_end_port: u16,
    /// Data (UDP) port range
    pub data_start_port: u16,
    pub data_end_port: u16,
    /// Name of the hosting VM, when one is managed
    pub vmname: Option<String>,
    /// Backend engine driving the hosting VM, e.g. "hyper-v"
    pub vm_engine: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            binary: None,
            working_dir: None,
            host: "127.0.0.1".to_string(),
            device_type: "pc".to_string(),
            console_start_port: CONSOLE_START_PORT,
            console_end_port: CONSOLE_END_PORT,
            data_start_port: DATA_START_PORT,
            data_end_port: DATA_END_PORT,
            vmname: None,
            vm_engine: None,
        }
    }
}

impl ServerSettings {
    /// Parse settings from a JSON string. Pure, no I/O.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Resolve into registry settings, expanding paths and falling back
    /// to binary discovery
    pub fn registry_settings(&self, binary_name: &str) -> RegistrySettings {
        let binary = self
            .binary
            .as_deref()
            .map(expand_path)
            .filter(|p| p.is_file())
            .or_else(|| {
                let found = find_device_binary(binary_name);
                if found.is_none() {
                    warn!("device binary '{}' couldn't be found", binary_name);
                }
                found
            });

        let working_dir = self
            .working_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(default_working_dir);

        RegistrySettings {
            binary,
            working_dir,
            host: self.host.clone(),
            device_type: self.device_type.clone(),
        }
    }
}

/// Load and parse a settings file from disk
///
/// The I/O boundary; delegates to the pure parser.
pub fn load_settings_file(path: &Path) -> Result<ServerSettings, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    ServerSettings::from_str(&content)
}

/// Expand a leading `~` in a configured path
fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Default root for instance working directories
fn default_working_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("emunet")
        .join("projects")
}

/// Look for the device binary beside the current directory, then on PATH
pub fn find_device_binary(name: &str) -> Option<PathBuf> {
    let in_cwd = std::env::current_dir().ok()?.join(name);
    if is_executable(&in_cwd) {
        return Some(in_cwd);
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
