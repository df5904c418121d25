//! In-memory store with an optional JSON snapshot

use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ImageStore, InstanceStore, StoreError, WhitelistedAddressStore};
use crate::models::{Image, ImageId, Instance, InstanceId, WhitelistedAddress, WhitelistedInstance};

/// Row in the whitelisted address table
#[derive(Debug, Clone)]
struct AddressRow {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Tables {
    next_image_id: ImageId,
    next_instance_id: InstanceId,
    images: BTreeMap<ImageId, Image>,
    instances: BTreeMap<InstanceId, Instance>,
    addresses: BTreeMap<(IpAddr, InstanceId), AddressRow>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            next_image_id: 1,
            next_instance_id: 1,
            images: BTreeMap::new(),
            instances: BTreeMap::new(),
            addresses: BTreeMap::new(),
        }
    }
}

/// Image, instance and whitelist store held in process memory.
///
/// All writes go through a single lock, so each operation is atomic with
/// respect to the others. With a snapshot path every write is saved to disk
/// before it becomes visible, and [`MemoryStore::open`] restores it.
#[derive(Debug)]
pub struct MemoryStore {
    /// Hostname stamped onto every returned instance
    public_hostname: String,
    snapshot: Option<PathBuf>,
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty, unpersisted store
    #[must_use]
    pub fn new(public_hostname: impl Into<String>) -> Self {
        Self {
            public_hostname: public_hostname.into(),
            snapshot: None,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Create a store saved to `path`, restoring the snapshot there if any
    ///
    /// # Errors
    ///
    /// Returns an error if an existing snapshot cannot be read or parsed.
    pub fn open(public_hostname: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = if path.exists() {
            let tables = load_snapshot(&path)?;
            info!(
                path = %path.display(),
                images = tables.images.len(),
                instances = tables.instances.len(),
                addresses = tables.addresses.len(),
                "Restored store snapshot"
            );
            tables
        } else {
            info!(path = %path.display(), "No store snapshot yet, starting empty");
            Tables::default()
        };

        Ok(Self {
            public_hostname: public_hostname.into(),
            snapshot: Some(path),
            tables: RwLock::new(tables),
        })
    }

    /// Whether records survive a restart
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.snapshot.is_some()
    }

    fn with_hostname(&self, mut instance: Instance) -> Instance {
        instance.hostname.clone_from(&self.public_hostname);
        instance
    }

    /// Apply `change` to a copy of the tables, save it, then publish it
    fn commit<T>(&self, change: impl FnOnce(&mut Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut tables = self.tables.write();
        let mut next = tables.clone();
        let value = change(&mut next)?;
        if let Some(path) = &self.snapshot {
            save_snapshot(path, &next)?;
        }
        *tables = next;
        Ok(value)
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn create(&self, mut image: Image) -> Result<Image, StoreError> {
        self.commit(|tables| {
            image.id = tables.next_image_id;
            tables.next_image_id = image.id + 1;
            tables.images.insert(image.id, image.clone());
            Ok(image)
        })
    }

    async fn list(&self) -> Result<Vec<Image>, StoreError> {
        Ok(self.tables.read().images.values().cloned().collect())
    }

    async fn get(&self, id: ImageId) -> Result<Image, StoreError> {
        self.tables
            .read()
            .images
            .get(&id)
            .cloned()
            .ok_or(StoreError::ImageNotFound(id))
    }

    async fn mark_ready(&self, id: ImageId) -> Result<Image, StoreError> {
        self.commit(|tables| {
            let image = tables.images.get_mut(&id).ok_or(StoreError::ImageNotFound(id))?;
            image.ready = true;
            image.updated_at = Utc::now();
            Ok(image.clone())
        })
    }

    async fn destroy(&self, id: ImageId) -> Result<(), StoreError> {
        self.commit(|tables| {
            if !tables.images.contains_key(&id) {
                return Err(StoreError::ImageNotFound(id));
            }
            let instances = tables.instances.values().filter(|i| i.image_id == id).count();
            if instances > 0 {
                return Err(StoreError::ImageInUse { image_id: id, instances });
            }
            tables.images.remove(&id);
            Ok(())
        })
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn create(&self, mut instance: Instance) -> Result<Instance, StoreError> {
        let instance = self.commit(|tables| {
            if tables.instances.values().any(|i| i.port == instance.port) {
                return Err(StoreError::PortConflict(instance.port));
            }

            instance.id = tables.next_instance_id;
            tables.next_instance_id = instance.id + 1;
            tables.instances.insert(instance.id, instance.clone());
            Ok(instance)
        })?;

        Ok(self.with_hostname(instance))
    }

    async fn list(&self) -> Result<Vec<Instance>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .instances
            .values()
            .cloned()
            .map(|i| self.with_hostname(i))
            .collect())
    }

    async fn get(&self, id: InstanceId) -> Result<Instance, StoreError> {
        let tables = self.tables.read();
        tables
            .instances
            .get(&id)
            .cloned()
            .map(|i| self.with_hostname(i))
            .ok_or(StoreError::NotFound(id))
    }

    async fn destroy(&self, id: InstanceId) -> Result<(), StoreError> {
        self.commit(|tables| {
            if tables.instances.remove(&id).is_none() {
                return Err(StoreError::NotFound(id));
            }
            tables.addresses.retain(|(_, instance_id), _| *instance_id != id);
            Ok(())
        })
    }
}

#[async_trait]
impl WhitelistedAddressStore for MemoryStore {
    async fn create(&self, mut address: WhitelistedAddress) -> Result<WhitelistedAddress, StoreError> {
        let instance_id = address.instance.id;

        let row = self.commit(|tables| {
            if !tables.instances.contains_key(&instance_id) {
                return Err(StoreError::UnknownInstance(instance_id));
            }

            let now = Utc::now();
            let row = tables
                .addresses
                .entry((address.ip_address, instance_id))
                .and_modify(|row| row.updated_at = now)
                .or_insert_with(|| AddressRow {
                    created_at: address.created_at,
                    updated_at: address.updated_at,
                });
            Ok(row.clone())
        })?;

        address.created_at = row.created_at;
        address.updated_at = row.updated_at;
        Ok(address)
    }

    async fn list(&self) -> Result<Vec<WhitelistedAddress>, StoreError> {
        let tables = self.tables.read();

        let mut addresses: Vec<WhitelistedAddress> = tables
            .addresses
            .iter()
            .filter_map(|((ip, instance_id), row)| {
                let instance = tables.instances.get(instance_id)?;
                Some(WhitelistedAddress {
                    ip_address: *ip,
                    instance: WhitelistedInstance {
                        id: instance.id,
                        port: instance.port,
                        user_email: instance.user_email.clone(),
                    },
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                })
            })
            .collect();

        addresses.sort_by_key(|a| a.created_at);
        Ok(addresses)
    }
}

/// On-disk form of the tables. Unlike the API models it keeps refresh
/// tokens and anonymisation scripts.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    next_image_id: ImageId,
    next_instance_id: InstanceId,
    images: Vec<ImageRecord>,
    instances: Vec<InstanceRecord>,
    addresses: Vec<AddressRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageRecord {
    id: ImageId,
    backed_up_at: DateTime<Utc>,
    ready: bool,
    anonymisation_script: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InstanceRecord {
    id: InstanceId,
    image_id: ImageId,
    user_email: String,
    refresh_token: String,
    port: u16,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddressRecord {
    ip_address: IpAddr,
    instance_id: InstanceId,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Tables> for Snapshot {
    fn from(tables: &Tables) -> Self {
        Self {
            next_image_id: tables.next_image_id,
            next_instance_id: tables.next_instance_id,
            images: tables
                .images
                .values()
                .map(|i| ImageRecord {
                    id: i.id,
                    backed_up_at: i.backed_up_at,
                    ready: i.ready,
                    anonymisation_script: i.anonymisation_script.clone(),
                    created_at: i.created_at,
                    updated_at: i.updated_at,
                })
                .collect(),
            instances: tables
                .instances
                .values()
                .map(|i| InstanceRecord {
                    id: i.id,
                    image_id: i.image_id,
                    user_email: i.user_email.clone(),
                    refresh_token: i.refresh_token.clone(),
                    port: i.port,
                    created_at: i.created_at,
                    updated_at: i.updated_at,
                })
                .collect(),
            addresses: tables
                .addresses
                .iter()
                .map(|((ip, instance_id), row)| AddressRecord {
                    ip_address: *ip,
                    instance_id: *instance_id,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                })
                .collect(),
        }
    }
}

impl From<Snapshot> for Tables {
    fn from(snapshot: Snapshot) -> Self {
        let images = snapshot
            .images
            .into_iter()
            .map(|r| {
                let image = Image {
                    id: r.id,
                    backed_up_at: r.backed_up_at,
                    ready: r.ready,
                    anonymisation_script: r.anonymisation_script,
                    created_at: r.created_at,
                    updated_at: r.updated_at,
                };
                (image.id, image)
            })
            .collect();

        let instances = snapshot
            .instances
            .into_iter()
            .map(|r| {
                let mut instance = Instance::new(r.image_id, r.user_email, r.refresh_token);
                instance.id = r.id;
                instance.port = r.port;
                instance.created_at = r.created_at;
                instance.updated_at = r.updated_at;
                (instance.id, instance)
            })
            .collect();

        let addresses = snapshot
            .addresses
            .into_iter()
            .map(|r| {
                (
                    (r.ip_address, r.instance_id),
                    AddressRow {
                        created_at: r.created_at,
                        updated_at: r.updated_at,
                    },
                )
            })
            .collect();

        Self {
            next_image_id: snapshot.next_image_id.max(1),
            next_instance_id: snapshot.next_instance_id.max(1),
            images,
            instances,
            addresses,
        }
    }
}

fn load_snapshot(path: &Path) -> Result<Tables, StoreError> {
    let content = fs::read_to_string(path).map_err(|source| StoreError::Snapshot {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: Snapshot = serde_json::from_str(&content).map_err(|source| StoreError::CorruptSnapshot {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(snapshot.into())
}

/// Write to a sibling file and rename it over the snapshot
fn save_snapshot(path: &Path, tables: &Tables) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Snapshot {
        path: path.to_path_buf(),
        source,
    };

    let content = serde_json::to_vec_pretty(&Snapshot::from(tables)).map_err(|source| StoreError::CorruptSnapshot {
        path: path.to_path_buf(),
        source,
    })?;

    let staging = path.with_extension("tmp");
    fs::write(&staging, content).map_err(io_error)?;

    // Refresh tokens are credentials
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o600)).map_err(io_error)?;
    }

    fs::rename(&staging, path).map_err(io_error)?;
    debug!(path = %path.display(), "Saved store snapshot");
    Ok(())
}
