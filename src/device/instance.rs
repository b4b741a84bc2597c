//! A single emulated device instance
//!
//! Each instance wraps one external emulator process: its identity, its
//! exclusively-owned console port, its startup configuration and the
//! endpoint bindings wiring its physical ports to the outside world.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::nio::NetworkEndpoint;
use super::DeviceError;

/// How long the console probe waits before declaring the emulator hung
const CONSOLE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How much of the instance log is attached to crash notifications
const DIAGNOSTIC_TAIL_BYTES: u64 = 4096;

/// One emulated network device backed by an external process
pub struct DeviceInstance {
    id: u64,
    name: String,
    binary: PathBuf,
    working_dir: PathBuf,
    host: String,
    console: u16,
    startup_config: Option<String>,
    bindings: HashMap<(u8, u8), NetworkEndpoint>,
    child: Option<Child>,
    /// Set on a successful start, cleared on stop. The supervisor uses
    /// this to tell a crashed instance from one that was never started.
    started: bool,
}

impl DeviceInstance {
    pub fn new(
        id: u64,
        name: String,
        binary: PathBuf,
        working_dir: PathBuf,
        host: String,
        console: u16,
    ) -> Self {
        Self {
            id,
            name,
            binary,
            working_dir,
            host,
            console,
            startup_config: None,
            bindings: HashMap::new(),
            child: None,
            started: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn console(&self) -> u16 {
        self.console
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Repoint the instance at a new working directory root
    pub fn set_working_dir(&mut self, dir: PathBuf) {
        self.working_dir = dir;
    }

    pub fn set_binary(&mut self, binary: PathBuf) {
        self.binary = binary;
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Default settings reported back on creation
    pub fn defaults(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("name".to_string(), Value::from(self.name.clone()));
        defaults.insert("console".to_string(), Value::from(self.console));
        defaults.insert(
            "binary".to_string(),
            Value::from(self.binary.display().to_string()),
        );
        defaults
    }

    /// Command line used to launch the emulator
    pub fn command(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.console.to_string()];

        for nio in self.bindings.values() {
            match nio {
                NetworkEndpoint::UdpTunnel {
                    lport,
                    rhost,
                    rport,
                } => {
                    args.push("-s".to_string());
                    args.push(lport.to_string());
                    args.push("-c".to_string());
                    args.push(rport.to_string());
                    args.push("-t".to_string());
                    args.push(rhost.clone());
                }
                NetworkEndpoint::Tap { device } => {
                    args.push("-e".to_string());
                    args.push(device.clone());
                }
            }
        }

        if self.startup_config.is_some() {
            args.push("-R".to_string());
            args.push(self.config_path().display().to_string());
        }

        args
    }

    /// Start the emulator process
    ///
    /// Fails with `AlreadyRunning` if the process is alive; spawn
    /// failures surface as `Backend` errors carrying the OS cause.
    pub async fn start(&mut self) -> Result<(), DeviceError> {
        if self.is_running() {
            return Err(DeviceError::AlreadyRunning(self.name.clone()));
        }

        std::fs::create_dir_all(&self.working_dir)?;
        self.write_startup_config()?;

        let log = std::fs::File::create(self.log_path())?;
        let stderr_log = log.try_clone()?;

        debug!("starting '{}' with command: {:?}", self.name, self.command());
        let child = Command::new(&self.binary)
            .args(self.command())
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log))
            .spawn()
            .map_err(|e| {
                DeviceError::Backend(format!(
                    "Could not start {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        self.child = Some(child);
        self.started = true;
        info!("device '{}' [id={}] has started", self.name, self.id);
        Ok(())
    }

    /// Stop the emulator process. Stopping a stopped instance is a no-op.
    pub async fn stop(&mut self) -> Result<(), DeviceError> {
        if let Some(mut child) = self.child.take() {
            // the process may already have exited on its own
            let _ = child.start_kill();
            let _ = child.wait().await;
            info!("device '{}' [id={}] has stopped", self.name, self.id);
        }
        self.started = false;
        Ok(())
    }

    /// Stop (if running) then start
    pub async fn reload(&mut self) -> Result<(), DeviceError> {
        if self.is_running() {
            self.stop().await?;
        }
        self.start().await
    }

    /// True iff the owning OS process handle is alive
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// True iff the emulator itself answers on its console port
    ///
    /// A hung emulator can leave the OS process alive while its console
    /// stops responding; this probe catches that case.
    pub async fn is_backend_alive(&self) -> bool {
        matches!(
            timeout(
                CONSOLE_PROBE_TIMEOUT,
                TcpStream::connect((self.host.as_str(), self.console)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Attach or reject an endpoint binding on (slot, port)
    pub fn bind_endpoint(
        &mut self,
        slot: u8,
        port: u8,
        nio: NetworkEndpoint,
    ) -> Result<(), DeviceError> {
        if self.bindings.contains_key(&(slot, port)) {
            return Err(DeviceError::SlotConflict { slot, port });
        }
        info!(
            "device '{}' [id={}]: added {} on slot {} port {}",
            self.name, self.id, nio, slot, port
        );
        self.bindings.insert((slot, port), nio);
        Ok(())
    }

    /// Remove an endpoint binding, destroying the endpoint
    pub fn unbind_endpoint(&mut self, slot: u8, port: u8) -> Result<NetworkEndpoint, DeviceError> {
        match self.bindings.remove(&(slot, port)) {
            Some(nio) => {
                info!(
                    "device '{}' [id={}]: removed {} from slot {} port {}",
                    self.name, self.id, nio, slot, port
                );
                Ok(nio)
            }
            None => Err(DeviceError::BindingNotFound { slot, port }),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.bindings.len()
    }

    /// Apply a partial update, returning the names of fields that changed
    ///
    /// Only fields the instance enumerates as settable are considered;
    /// unknown fields are silently ignored so callers may send extra
    /// informational keys.
    pub fn apply_update(&mut self, patch: &Map<String, Value>) -> Vec<String> {
        let mut changed = Vec::new();

        for (field, value) in patch {
            match (field.as_str(), value) {
                ("name", Value::String(name)) if *name != self.name => {
                    self.name = name.clone();
                    changed.push(field.clone());
                }
                ("startup_config", Value::String(config))
                    if self.startup_config.as_deref() != Some(config) =>
                {
                    self.startup_config = Some(config.clone());
                    changed.push(field.clone());
                }
                ("binary", Value::String(path))
                    if Path::new(path) != self.binary.as_path() =>
                {
                    self.binary = PathBuf::from(path);
                    changed.push(field.clone());
                }
                _ => {}
            }
        }

        changed
    }

    /// Tail of the instance log, for crash diagnostics
    pub fn read_diagnostics(&self) -> String {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = match std::fs::File::open(self.log_path()) {
            Ok(f) => f,
            Err(_) => return String::new(),
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len > DIAGNOSTIC_TAIL_BYTES {
            let _ = file.seek(SeekFrom::Start(len - DIAGNOSTIC_TAIL_BYTES));
        }
        let mut out = String::new();
        let _ = file.read_to_string(&mut out);
        out
    }

    /// Stop the process and remove transient artifacts
    ///
    /// Only files this instance generated are removed; caller data in the
    /// working directory is left in place.
    pub async fn delete(&mut self) -> Result<(), DeviceError> {
        self.stop().await?;
        self.bindings.clear();
        for path in [self.log_path(), self.config_path()] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("could not remove {}: {}", path.display(), e);
                }
            }
        }
        info!("device '{}' [id={}] has been deleted", self.name, self.id);
        Ok(())
    }

    fn log_path(&self) -> PathBuf {
        self.working_dir.join(format!("device-{}.log", self.id))
    }

    fn config_path(&self) -> PathBuf {
        self.working_dir.join(format!("startup-{}.cfg", self.id))
    }

    /// Persist the startup configuration next to the instance
    ///
    /// `%h` expands to the device name; carriage returns are stripped the
    /// way the emulator expects.
    fn write_startup_config(&self) -> Result<(), DeviceError> {
        let Some(config) = &self.startup_config else {
            return Ok(());
        };
        let rendered = format!("!\n{}", config.replace('\r', "").replace("%h", &self.name));
        std::fs::write(self.config_path(), rendered).map_err(|e| {
            DeviceError::Backend(format!(
                "Could not save the configuration {}: {}",
                self.config_path().display(),
                e
            ))
        })
    }
}
