//! File-backed endpoint registry
//!
//! The registry is the single writer of an instance's YAML file. Every mutation
//! copies the previous file into `backups/` next to it before the new version is
//! written (temp file + rename). Backups are never pruned.

use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::MetadataError;
use crate::instance::{Endpoint, FilterPolicy, InstanceConfig, NewEndpoint, ENDPOINT_ID_PREFIX};

/// Directory (sibling of the config file) holding timestamped backups
pub const BACKUP_DIR: &str = "backups";

pub struct EndpointRegistry {
    path: PathBuf,
    defaults: InstanceConfig,
    /// Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl EndpointRegistry {
    /// Open the registry at `path`, writing `defaults` there if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>, defaults: InstanceConfig) -> Result<Self, MetadataError> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_atomic(&path, &defaults.to_yaml()?)?;
            info!(path = %path.display(), instance = %defaults.name, "Created default instance config");
        }
        Ok(Self {
            path,
            defaults,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(|p| p.join(BACKUP_DIR))
            .unwrap_or_else(|| PathBuf::from(BACKUP_DIR))
    }

    /// Current persisted configuration, or the defaults if it cannot be read
    pub fn config(&self) -> InstanceConfig {
        InstanceConfig::load_or_default(&self.path, &self.defaults)
    }

    /// All endpoints, in persisted order
    pub fn list(&self) -> Vec<Endpoint> {
        self.config().endpoints
    }

    /// Enabled endpoints, in persisted order
    pub fn list_enabled(&self) -> Vec<Endpoint> {
        self.config().enabled_endpoints()
    }

    pub fn get(&self, id: &str) -> Result<Endpoint, MetadataError> {
        self.config()
            .endpoint(id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))
    }

    pub fn add(&self, new: NewEndpoint) -> Result<Endpoint, MetadataError> {
        new.validate()?;
        self.mutate(|config| {
            let number = config.next_id_number();
            let endpoint = new.into_endpoint(format!("{}{}", ENDPOINT_ID_PREFIX, number));
            config.endpoints.push(endpoint.clone());
            config.next_endpoint_id = Some(number + 1);
            info!(instance = %config.name, endpoint = %endpoint.id, target = %endpoint.address(), "Endpoint added");
            Ok(endpoint)
        })
    }

    /// Replace the fields of an existing endpoint, keeping its id and position
    pub fn update(&self, id: &str, new: NewEndpoint) -> Result<Endpoint, MetadataError> {
        new.validate()?;
        self.mutate(|config| {
            let slot = config
                .endpoints
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| MetadataError::NotFound(id.to_string()))?;
            *slot = new.into_endpoint(id);
            info!(endpoint = %id, target = %slot.address(), "Endpoint updated");
            Ok(slot.clone())
        })
    }

    pub fn delete(&self, id: &str) -> Result<Endpoint, MetadataError> {
        self.mutate(|config| {
            let index = config
                .endpoints
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| MetadataError::NotFound(id.to_string()))?;
            let removed = config.endpoints.remove(index);
            info!(endpoint = %id, "Endpoint deleted");
            Ok(removed)
        })
    }

    /// Flip the enabled flag, returning the endpoint as stored afterwards
    pub fn toggle(&self, id: &str) -> Result<Endpoint, MetadataError> {
        self.mutate(|config| {
            let slot = config
                .endpoints
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| MetadataError::NotFound(id.to_string()))?;
            slot.enabled = !slot.enabled;
            info!(endpoint = %id, enabled = slot.enabled, "Endpoint toggled");
            Ok(slot.clone())
        })
    }

    pub fn set_filter(&self, policy: FilterPolicy) -> Result<FilterPolicy, MetadataError> {
        self.mutate(|config| {
            config.filter = policy;
            let normalized = config.clone().normalized();
            config.filter = normalized.filter;
            info!(instance = %config.name, filter = %config.filter, "Filter updated");
            Ok(config.filter.clone())
        })
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut InstanceConfig) -> Result<T, MetadataError>,
    ) -> Result<T, MetadataError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // A file that exists but does not parse is left alone rather than
        // overwritten with defaults
        let mut config = match InstanceConfig::load(&self.path) {
            Ok(config) => config,
            Err(MetadataError::Io(e)) if e.kind() == io::ErrorKind::NotFound => self.defaults.clone(),
            Err(e) => return Err(e),
        };
        // Pin the counter before anything is removed so freed ids stay retired
        config.next_endpoint_id = Some(config.next_id_number());

        let out = apply(&mut config)?;
        config.validate()?;

        self.backup()?;
        write_atomic(&self.path, &config.to_yaml()?)?;
        Ok(out)
    }

    /// Copy the current file into the backup directory
    fn backup(&self) -> Result<Option<PathBuf>, MetadataError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let dir = self.backup_dir();
        fs::create_dir_all(&dir)?;

        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("config");
        let timestamp = Local::now().format("%Y%m%d_%H%M%S_%6f").to_string();

        let mut target = dir.join(format!("{}_{}.yaml", stem, timestamp));
        let mut n = 1;
        while target.exists() {
            target = dir.join(format!("{}_{}_{}.yaml", stem, timestamp, n));
            n += 1;
        }

        fs::copy(&self.path, &target)?;
        debug!(backup = %target.display(), "Config backed up");
        Ok(Some(target))
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<(), MetadataError> {
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
