//! Device instance registry
//!
//! The registry owns every device instance, the shared console/data port
//! pools and the global settings. All mutating bookkeeping is serialized
//! through the registry's maps and pools; operations that block on
//! external process I/O (start/stop/reload) hold only the per-instance
//! lock so they never stall unrelated operations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::allocator::{PortPool, Protocol};
use super::caps::CapabilityProbe;
use super::instance::DeviceInstance;
use super::nio::EndpointSpec;
use super::{
    DeviceError, CONSOLE_END_PORT, CONSOLE_START_PORT, DATA_END_PORT, DATA_START_PORT,
};

/// Global registry settings
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Device emulator binary; resolved at startup, overridable per create
    pub binary: Option<PathBuf>,
    /// Root directory for instance working directories
    pub working_dir: PathBuf,
    /// Host address used for console/data port binding
    pub host: String,
    /// Device type prefix used for default instance names
    pub device_type: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            binary: None,
            working_dir: std::env::temp_dir().join("emunet"),
            host: "127.0.0.1".to_string(),
            device_type: "pc".to_string(),
        }
    }
}

/// Partial global settings update, tolerant-merge semantics
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub binary: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub console_start_port: Option<u16>,
    pub console_end_port: Option<u16>,
    pub data_start_port: Option<u16>,
    pub data_end_port: Option<u16>,
}

/// Response payload for a successful create
#[derive(Debug, Clone, Serialize)]
pub struct CreatedDevice {
    pub id: u64,
    pub name: String,
    pub console: u16,
    pub defaults: Map<String, Value>,
}

type SharedInstance = Arc<Mutex<DeviceInstance>>;

/// Owner of all device instances and the shared port pools
pub struct DeviceRegistry {
    instances: DashMap<u64, SharedInstance>,
    names: DashMap<String, u64>,
    console_pool: StdMutex<PortPool>,
    data_pool: StdMutex<PortPool>,
    settings: RwLock<RegistrySettings>,
    caps: Arc<dyn CapabilityProbe>,
    next_id: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(settings: RegistrySettings, caps: Arc<dyn CapabilityProbe>) -> Self {
        Self {
            instances: DashMap::new(),
            names: DashMap::new(),
            console_pool: StdMutex::new(PortPool::new(
                CONSOLE_START_PORT,
                CONSOLE_END_PORT,
                Protocol::Tcp,
            )),
            data_pool: StdMutex::new(PortPool::new(
                DATA_START_PORT,
                DATA_END_PORT,
                Protocol::Udp,
            )),
            settings: RwLock::new(settings),
            caps,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new device instance
    ///
    /// The requested name is claimed atomically up front, so concurrent
    /// creates with the same name race on one map entry rather than on a
    /// check followed by a later insert. The claim is released again if
    /// port allocation or directory creation fails.
    pub fn create(
        &self,
        binary: Option<PathBuf>,
        name: Option<String>,
    ) -> Result<CreatedDevice, DeviceError> {
        let (binary, working_dir, host, device_type) = {
            let settings = self.settings.read().expect("settings lock");
            (
                binary.or_else(|| settings.binary.clone()).ok_or_else(|| {
                    DeviceError::Backend("no device binary configured".to_string())
                })?,
                settings.working_dir.clone(),
                settings.host.clone(),
                settings.device_type.clone(),
            )
        };

        if let Some(name) = &name {
            match self.names.entry(name.clone()) {
                Entry::Occupied(_) => return Err(DeviceError::NameConflict(name.clone())),
                Entry::Vacant(slot) => {
                    // placeholder until the instance exists; id 0 is
                    // never assigned
                    slot.insert(0);
                }
            }
        }

        let console = match self
            .console_pool
            .lock()
            .expect("console pool lock")
            .allocate(&host)
        {
            Ok(port) => port,
            Err(e) => {
                if let Some(name) = &name {
                    self.names.remove_if(name, |_, owner| *owner == 0);
                }
                return Err(e);
            }
        };

        if let Err(e) = std::fs::create_dir_all(&working_dir) {
            self.console_pool
                .lock()
                .expect("console pool lock")
                .release(console);
            if let Some(name) = &name {
                self.names.remove_if(name, |_, owner| *owner == 0);
            }
            return Err(DeviceError::Backend(format!(
                "Could not create working directory {}: {}",
                working_dir.display(),
                e
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = match name {
            Some(name) => {
                self.names.insert(name.clone(), id);
                name
            }
            None => self.default_name(&device_type, id),
        };

        let instance = DeviceInstance::new(id, name.clone(), binary, working_dir, host, console);
        let defaults = instance.defaults();

        self.instances.insert(id, Arc::new(Mutex::new(instance)));
        info!("device '{}' [id={}] created, console {}", name, id, console);

        Ok(CreatedDevice {
            id,
            name,
            console,
            defaults,
        })
    }

    /// Pick and claim the first free `{PREFIX}{n}` name
    fn default_name(&self, device_type: &str, id: u64) -> String {
        let prefix = device_type.to_uppercase();
        let mut n = id;
        loop {
            let candidate = format!("{}{}", prefix, n);
            if let Entry::Vacant(slot) = self.names.entry(candidate.clone()) {
                slot.insert(id);
                return candidate;
            }
            n += 1;
        }
    }

    /// Look up an instance by id
    pub fn get(&self, id: u64) -> Result<SharedInstance, DeviceError> {
        self.instances
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(DeviceError::NotFound(id))
    }

    /// All known instance ids
    pub fn ids(&self) -> Vec<u64> {
        self.instances.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Delete an instance, stopping it first if needed
    ///
    /// Releases the console port and drops all endpoint bindings.
    pub async fn delete(&self, id: u64) -> Result<(), DeviceError> {
        let instance = self.get(id)?;
        let (name, console) = {
            let mut dev = instance.lock().await;
            dev.delete().await?;
            (dev.name().to_string(), dev.console())
        };

        self.console_pool
            .lock()
            .expect("console pool lock")
            .release(console);
        // after a rename onto this name, another instance may own the
        // index entry
        self.names.remove_if(&name, |_, owner| *owner == id);
        self.instances.remove(&id);
        Ok(())
    }

    pub async fn start(&self, id: u64) -> Result<(), DeviceError> {
        let instance = self.get(id)?;
        let mut dev = instance.lock().await;
        dev.start().await
    }

    pub async fn stop(&self, id: u64) -> Result<(), DeviceError> {
        let instance = self.get(id)?;
        let mut dev = instance.lock().await;
        dev.stop().await
    }

    pub async fn reload(&self, id: u64) -> Result<(), DeviceError> {
        let instance = self.get(id)?;
        let mut dev = instance.lock().await;
        dev.reload().await
    }

    /// Apply a partial update to an instance, returning the changed fields
    ///
    /// The name index follows a rename; uniqueness is only enforced at
    /// creation time, not retroactively.
    pub async fn update(
        &self,
        id: u64,
        patch: &Map<String, Value>,
    ) -> Result<Vec<String>, DeviceError> {
        let instance = self.get(id)?;
        let mut dev = instance.lock().await;
        let old_name = dev.name().to_string();
        let changed = dev.apply_update(patch);
        if changed.iter().any(|f| f == "name") {
            self.names.remove_if(&old_name, |_, owner| *owner == id);
            self.names.insert(dev.name().to_string(), id);
        }
        Ok(changed)
    }

    /// Allocate a UDP data port for a tunnel endpoint
    pub fn allocate_data_port(&self, id: u64) -> Result<u16, DeviceError> {
        if !self.instances.contains_key(&id) {
            return Err(DeviceError::NotFound(id));
        }
        let host = self.settings.read().expect("settings lock").host.clone();
        self.data_pool
            .lock()
            .expect("data pool lock")
            .allocate(&host)
    }

    /// Build and attach an endpoint to (slot, port) on an instance
    pub async fn add_endpoint(
        &self,
        id: u64,
        slot: u8,
        port: u8,
        spec: &EndpointSpec,
    ) -> Result<(), DeviceError> {
        let instance = self.get(id)?;
        let mut dev = instance.lock().await;
        let nio = spec.build(dev.binary(), self.caps.as_ref())?;
        dev.bind_endpoint(slot, port, nio)
    }

    /// Remove the endpoint bound to (slot, port) on an instance
    pub async fn remove_endpoint(&self, id: u64, slot: u8, port: u8) -> Result<(), DeviceError> {
        let instance = self.get(id)?;
        let mut dev = instance.lock().await;
        dev.unbind_endpoint(slot, port).map(|_| ())
    }

    /// Delete every instance and return counters and pool cursors to
    /// their configured starts
    pub async fn reset(&self) {
        self.shutdown().await;
        self.next_id.store(1, Ordering::SeqCst);
        self.console_pool.lock().expect("console pool lock").reset();
        self.data_pool.lock().expect("data pool lock").reset();
        info!("device registry has been reset");
    }

    /// Drain all instances, stopping their processes
    pub async fn shutdown(&self) {
        for id in self.ids() {
            if let Err(e) = self.delete(id).await {
                warn!("could not delete device {}: {}", id, e);
            }
        }
    }

    /// Apply a partial global settings update
    ///
    /// Port range changes take effect for subsequent allocations only.
    /// A working-directory change attempts an atomic rename of the old
    /// root when the new one does not exist yet; a failed move is
    /// reported but non-fatal, leaving data in place.
    pub async fn update_settings(&self, update: SettingsUpdate) {
        if let Some(binary) = update.binary {
            info!("device binary set to {}", binary.display());
            self.settings.write().expect("settings lock").binary = Some(binary);
        }

        if let Some(new_dir) = update.working_dir {
            let old_dir = self
                .settings
                .read()
                .expect("settings lock")
                .working_dir
                .clone();
            if new_dir != old_dir {
                if old_dir.is_dir() && !new_dir.exists() {
                    if let Err(e) = std::fs::rename(&old_dir, &new_dir) {
                        error!(
                            "could not move working directory from {} to {}: {}",
                            old_dir.display(),
                            new_dir.display(),
                            e
                        );
                    }
                }
                self.settings.write().expect("settings lock").working_dir = new_dir.clone();
                for id in self.ids() {
                    if let Ok(instance) = self.get(id) {
                        instance.lock().await.set_working_dir(new_dir.clone());
                    }
                }
                info!("working directory set to {}", new_dir.display());
            }
        }

        if let (Some(start), Some(end)) = (update.console_start_port, update.console_end_port) {
            self.console_pool
                .lock()
                .expect("console pool lock")
                .set_range(start, end);
            info!("console port range set to {}-{}", start, end);
        }

        if let (Some(start), Some(end)) = (update.data_start_port, update.data_end_port) {
            self.data_pool
                .lock()
                .expect("data pool lock")
                .set_range(start, end);
            info!("data port range set to {}-{}", start, end);
        }
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> RegistrySettings {
        self.settings.read().expect("settings lock").clone()
    }
}
