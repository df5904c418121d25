//! Persistence interfaces for images, instances and whitelisted addresses
//!
//! The API and the background loops only depend on these traits. The
//! in-process [`MemoryStore`] implements all three and is what the server runs
//! with, optionally snapshotted to a file so records survive restarts.

mod memory;

pub use memory::MemoryStore;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Image, ImageId, Instance, InstanceId, WhitelistedAddress};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No instance with this id
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    /// No image with this id
    #[error("image {0} not found")]
    ImageNotFound(ImageId),

    /// Instances still reference the image
    #[error("image {image_id} still has {instances} instance(s)")]
    ImageInUse {
        /// Image being destroyed
        image_id: ImageId,
        /// Instances cloned from it
        instances: usize,
    },

    /// Another instance already holds the port
    #[error("port {0} is already allocated to another instance")]
    PortConflict(u16),

    /// Whitelist entry refers to an instance that does not exist
    #[error("cannot whitelist address for unknown instance {0}")]
    UnknownInstance(InstanceId),

    /// The snapshot file could not be read or written
    #[error("store snapshot {path}: {source}")]
    Snapshot {
        /// Snapshot file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The snapshot file is not valid
    #[error("store snapshot {path} is corrupt: {source}")]
    CorruptSnapshot {
        /// Snapshot file
        path: PathBuf,
        /// Parse failure
        source: serde_json::Error,
    },
}

/// Image persistence
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persist a new image, assigning its id
    async fn create(&self, image: Image) -> Result<Image, StoreError>;

    /// List all images ordered by id
    async fn list(&self) -> Result<Vec<Image>, StoreError>;

    /// Fetch one image
    async fn get(&self, id: ImageId) -> Result<Image, StoreError>;

    /// Flag a finalised image as usable
    async fn mark_ready(&self, id: ImageId) -> Result<Image, StoreError>;

    /// Remove an image.
    ///
    /// Fails with [`StoreError::ImageInUse`] while instances of it exist.
    async fn destroy(&self, id: ImageId) -> Result<(), StoreError>;
}

/// Instance persistence
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Persist a new instance, assigning its id.
    ///
    /// Fails with [`StoreError::PortConflict`] when the port is taken; this is
    /// the authority on port uniqueness.
    async fn create(&self, instance: Instance) -> Result<Instance, StoreError>;

    /// List all instances ordered by id
    async fn list(&self) -> Result<Vec<Instance>, StoreError>;

    /// Fetch one instance
    async fn get(&self, id: InstanceId) -> Result<Instance, StoreError>;

    /// Remove an instance and every whitelisted address attached to it
    async fn destroy(&self, id: InstanceId) -> Result<(), StoreError>;
}

/// Whitelisted address persistence
#[async_trait]
pub trait WhitelistedAddressStore: Send + Sync {
    /// Insert or refresh `updated_at` on the `(ip_address, instance)` key
    async fn create(&self, address: WhitelistedAddress) -> Result<WhitelistedAddress, StoreError>;

    /// List every entry joined with its instance's id, port and owner,
    /// oldest first
    async fn list(&self) -> Result<Vec<WhitelistedAddress>, StoreError>;
}
