//! Draupnir
//!
//! Provisions throwaway database instances cloned from snapshotted images and
//! controls who may reach them, from where, and for how long.
//!
//! # Access control
//!
//! - **Authentication**: bearer refresh tokens checked against the identity
//!   provider and a trusted email domain, plus a shared upload secret
//! - **OAuth handshake**: joins a blocked API client with the browser redirect
//!   that completes its login
//! - **Instance cleaner**: destroys instances whose owner's grant was revoked
//! - **IP whitelist**: keeps a firewall chain in step with the addresses that
//!   recently used each instance

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod auth;
pub mod cleaner;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod models;
pub mod oauth;
pub mod ports;
pub mod report;
pub mod server;
pub mod store;
pub mod whitelist;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
