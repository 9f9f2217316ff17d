//! Persistent configuration store.
//!
//! One redb database holds every configuration document the gateway owns:
//! the per-device map plus the server, logging and OTA scalar documents.
//! All values are stored as JSON under namespaced keys in a single unified
//! table; every mutation is one committed transaction, so readers never see
//! a partial document.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use fieldgate_core::{
    generate_device_id, DeviceConfig, LoggingConfig, OtaConfig, ServerConfig,
};

use crate::error::{Error, Result};

// Single unified table for all documents - using namespaced keys
// Format: "namespace:key"
const UNIFIED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("fieldgate_config");

const NS_DEVICE: &str = "device";
const NS_DOC: &str = "doc";

const DOC_SERVER: &str = "server_config";
const DOC_LOGGING: &str = "logging_config";
const DOC_OTA: &str = "ota_config";

/// Everything the store persists, as one exportable object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullConfig {
    pub devices: Vec<DeviceConfig>,
    pub server_config: ServerConfig,
    pub logging_config: LoggingConfig,
    pub ota_config: OtaConfig,
}

fn make_key(namespace: &str, key: &str) -> String {
    let mut out = String::with_capacity(namespace.len() + key.len() + 1);
    out.push_str(namespace);
    out.push(':');
    out.push_str(key);
    out
}

/// redb-backed configuration store.
pub struct ConfigStore {
    db: Arc<Database>,
    /// Backing file for throwaway stores (removed on drop).
    temp_path: Option<PathBuf>,
}

impl ConfigStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };
        let store = Self {
            db: Arc::new(db),
            temp_path: None,
        };
        store.ensure_table()?;
        Ok(store)
    }

    /// Create a throwaway store backed by a temporary file.
    ///
    /// redb has no true in-memory mode; the file is removed when the store
    /// is dropped.
    pub fn ephemeral() -> Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "fieldgate_{}_{}.redb",
            std::process::id(),
            generate_device_id()
        ));
        let db = Database::create(&path)?;
        let store = Self {
            db: Arc::new(db),
            temp_path: Some(path),
        };
        store.ensure_table()?;
        Ok(store)
    }

    fn ensure_table(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.open_table(UNIFIED_TABLE)?;
        txn.commit()?;
        Ok(())
    }

    fn read_raw(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let namespaced = make_key(namespace, key);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(UNIFIED_TABLE)?;
        Ok(table.get(&*namespaced)?.map(|v| v.value().to_vec()))
    }

    fn write_raw(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let namespaced = make_key(namespace, key);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(UNIFIED_TABLE)?;
            table.insert(&*namespaced, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn delete_raw(&self, namespace: &str, key: &str) -> Result<bool> {
        let namespaced = make_key(namespace, key);
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(UNIFIED_TABLE)?;
            let existed = table.remove(&*namespaced)?.is_some();
            existed
        };
        txn.commit()?;
        Ok(removed)
    }

    fn scan_namespace(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = format!("{}:", namespace);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(UNIFIED_TABLE)?;
        let mut results = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let key_str = key.value();
            if let Some(rest) = key_str.strip_prefix(&prefix) {
                results.push((rest.to_string(), value.value().to_vec()));
            }
        }
        Ok(results)
    }

    // ---- devices ----

    /// Persist a new device. An empty `device_id` gets a generated one;
    /// a provided id must be free. Returns the stored document.
    pub fn create_device(&self, mut config: DeviceConfig) -> Result<DeviceConfig> {
        if config.device_id.is_empty() {
            loop {
                let candidate = generate_device_id();
                if self.read_raw(NS_DEVICE, &candidate)?.is_none() {
                    config.device_id = candidate;
                    break;
                }
            }
        } else if self.read_raw(NS_DEVICE, &config.device_id)?.is_some() {
            return Err(Error::Rejected(format!(
                "device '{}' already exists",
                config.device_id
            )));
        }
        config.validate()?;
        self.write_raw(
            NS_DEVICE,
            &config.device_id,
            &serde_json::to_vec(&config)?,
        )?;
        tracing::info!(device_id = %config.device_id, name = %config.name, "device created");
        Ok(config)
    }

    pub fn get_device(&self, device_id: &str) -> Result<DeviceConfig> {
        match self.read_raw(NS_DEVICE, device_id)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(Error::Missing(format!("device '{}'", device_id))),
        }
    }

    pub fn device_exists(&self, device_id: &str) -> Result<bool> {
        Ok(self.read_raw(NS_DEVICE, device_id)?.is_some())
    }

    /// All devices, ordered by device id.
    pub fn list_devices(&self) -> Result<Vec<DeviceConfig>> {
        let mut devices = Vec::new();
        for (_, bytes) in self.scan_namespace(NS_DEVICE)? {
            devices.push(serde_json::from_slice::<DeviceConfig>(&bytes)?);
        }
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    pub fn device_count(&self) -> Result<usize> {
        Ok(self.scan_namespace(NS_DEVICE)?.len())
    }

    /// Replace an existing device document. Returns the stored document.
    pub fn update_device(&self, config: DeviceConfig) -> Result<DeviceConfig> {
        if self.read_raw(NS_DEVICE, &config.device_id)?.is_none() {
            return Err(Error::Missing(format!("device '{}'", config.device_id)));
        }
        config.validate()?;
        self.write_raw(
            NS_DEVICE,
            &config.device_id,
            &serde_json::to_vec(&config)?,
        )?;
        tracing::debug!(device_id = %config.device_id, "device updated");
        Ok(config)
    }

    /// Delete a device. Returns the removed document.
    pub fn delete_device(&self, device_id: &str) -> Result<DeviceConfig> {
        let existing = self.get_device(device_id)?;
        self.delete_raw(NS_DEVICE, device_id)?;
        tracing::info!(device_id = %device_id, "device deleted");
        Ok(existing)
    }

    // ---- scalar documents ----

    /// Server configuration; defaults when never written.
    pub fn server_config(&self) -> Result<ServerConfig> {
        match self.read_raw(NS_DOC, DOC_SERVER)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ServerConfig::default()),
        }
    }

    pub fn set_server_config(&self, config: &ServerConfig) -> Result<()> {
        self.write_raw(NS_DOC, DOC_SERVER, &serde_json::to_vec(config)?)
    }

    /// Logging configuration; defaults when never written.
    pub fn logging_config(&self) -> Result<LoggingConfig> {
        match self.read_raw(NS_DOC, DOC_LOGGING)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(LoggingConfig::default()),
        }
    }

    pub fn set_logging_config(&self, config: &LoggingConfig) -> Result<()> {
        self.write_raw(NS_DOC, DOC_LOGGING, &serde_json::to_vec(config)?)
    }

    /// OTA configuration; defaults when never written.
    pub fn ota_config(&self) -> Result<OtaConfig> {
        match self.read_raw(NS_DOC, DOC_OTA)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(OtaConfig::default()),
        }
    }

    pub fn set_ota_config(&self, config: &OtaConfig) -> Result<()> {
        self.write_raw(NS_DOC, DOC_OTA, &serde_json::to_vec(config)?)
    }

    // ---- backup / reset ----

    /// Snapshot of every persisted document.
    pub fn export(&self) -> Result<FullConfig> {
        Ok(FullConfig {
            devices: self.list_devices()?,
            server_config: self.server_config()?,
            logging_config: self.logging_config()?,
            ota_config: self.ota_config()?,
        })
    }

    /// Replace the entire store contents with a snapshot. Devices are
    /// validated before anything is written; an invalid snapshot leaves the
    /// store untouched.
    pub fn restore(&self, snapshot: &FullConfig) -> Result<()> {
        for device in &snapshot.devices {
            if device.device_id.is_empty() {
                return Err(Error::Rejected("device with empty id in snapshot".into()));
            }
            device.validate()?;
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(UNIFIED_TABLE)?;
            // Wipe, then rebuild from the snapshot.
            let keys: Vec<String> = table
                .iter()?
                .filter_map(|item| item.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in keys {
                table.remove(&*key)?;
            }
            for device in &snapshot.devices {
                table.insert(
                    &*make_key(NS_DEVICE, &device.device_id),
                    &*serde_json::to_vec(device)?,
                )?;
            }
            table.insert(
                &*make_key(NS_DOC, DOC_SERVER),
                &*serde_json::to_vec(&snapshot.server_config)?,
            )?;
            table.insert(
                &*make_key(NS_DOC, DOC_LOGGING),
                &*serde_json::to_vec(&snapshot.logging_config)?,
            )?;
            table.insert(
                &*make_key(NS_DOC, DOC_OTA),
                &*serde_json::to_vec(&snapshot.ota_config)?,
            )?;
        }
        txn.commit()?;
        tracing::info!(devices = snapshot.devices.len(), "configuration restored");
        Ok(())
    }

    /// Remove every document.
    pub fn factory_reset(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(UNIFIED_TABLE)?;
            let keys: Vec<String> = table
                .iter()?
                .filter_map(|item| item.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in keys {
                table.remove(&*key)?;
            }
        }
        txn.commit()?;
        tracing::warn!("factory reset: store cleared");
        Ok(())
    }

    pub(crate) fn database(&self) -> Arc<Database> {
        self.db.clone()
    }
}

impl Drop for ConfigStore {
    fn drop(&mut self) {
        if let Some(path) = &self.temp_path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!("failed to remove ephemeral store {}: {}", path.display(), e);
            }
        }
    }
}
