//! Ephemeral port allocation for new instances

use std::collections::HashSet;

use thiserror::Error;

use crate::store::{InstanceStore, StoreError};

/// Attempts made before reporting the pool as exhausted
pub const MAX_ATTEMPTS: u32 = 100;

/// Port allocation errors
#[derive(Debug, Error)]
pub enum PortError {
    /// No free port was found within the retry budget
    #[error("no free port found after {attempts} attempts")]
    Exhausted {
        /// Attempts made
        attempts: u32,
    },

    /// The range `[min, max)` is empty
    #[error("invalid port range [{min}, {max})")]
    InvalidRange {
        /// Lower bound (inclusive)
        min: u16,
        /// Upper bound (exclusive)
        max: u16,
    },

    /// Existing ports could not be read
    #[error("failed to list instances to determine free port: {0}")]
    Store(#[from] StoreError),
}

/// Pick a uniformly random port in `[min, max)` that is not in `existing`.
///
/// Nothing is reserved: the instance store's uniqueness check remains the
/// authority if two allocations race.
pub fn allocate(existing: &HashSet<u16>, min: u16, max: u16) -> Result<u16, PortError> {
    if min >= max {
        return Err(PortError::InvalidRange { min, max });
    }

    for _ in 0..MAX_ATTEMPTS {
        let port = rand::random_range(min..max);
        if !existing.contains(&port) {
            return Ok(port);
        }
    }

    Err(PortError::Exhausted {
        attempts: MAX_ATTEMPTS,
    })
}

/// Allocate a port against the ports currently held in `store`
pub async fn allocate_free_port(store: &dyn InstanceStore, min: u16, max: u16) -> Result<u16, PortError> {
    let existing: HashSet<u16> = store.list().await?.into_iter().map(|i| i.port).collect();
    allocate(&existing, min, max)
}
