//! Domain models shared by the stores, the API and the background loops

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an instance, assigned by the instance store
pub type InstanceId = u64;

/// Identifier of an image, assigned by the image store
pub type ImageId = u64;

/// A snapshotted database that instances are cloned from.
///
/// The upload identity creates an image, fills its upload directory, then
/// marks it done; only then is it `ready` for cloning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Store-assigned identifier (0 until persisted)
    pub id: ImageId,
    /// When the source database was backed up
    pub backed_up_at: DateTime<Utc>,
    /// Finalised and usable for new instances
    pub ready: bool,
    /// SQL run against the image before it is snapshotted
    #[serde(skip_serializing, default)]
    pub anonymisation_script: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Image {
    /// Build an unpersisted, unfinalised image
    #[must_use]
    pub fn new(backed_up_at: DateTime<Utc>, anonymisation_script: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            backed_up_at,
            ready: false,
            anonymisation_script: anonymisation_script.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// An ephemeral database instance cloned from an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Store-assigned identifier (0 until persisted)
    pub id: InstanceId,
    /// Image the instance was cloned from
    pub image_id: ImageId,
    /// Hostname clients should connect to
    pub hostname: String,
    /// Identity of the owning user
    pub user_email: String,
    /// Long-lived refresh token bound to the owner. Empty for the upload identity.
    #[serde(skip_serializing, default)]
    pub refresh_token: String,
    /// TCP port the instance listens on
    pub port: u16,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// TLS credentials, only populated when returned to the owner
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub credentials: Option<InstanceCredentials>,
}

impl Instance {
    /// Build an unpersisted instance for `user_email`
    #[must_use]
    pub fn new(image_id: ImageId, user_email: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            image_id,
            hostname: String::new(),
            user_email: user_email.into(),
            refresh_token: refresh_token.into(),
            port: 0,
            created_at: now,
            updated_at: now,
            credentials: None,
        }
    }
}

/// Client certificate material for connecting to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCredentials {
    /// CA certificate (PEM)
    pub ca_certificate: String,
    /// Client certificate (PEM)
    pub client_certificate: String,
    /// Client private key (PEM)
    pub client_key: String,
}

/// The minimal instance projection joined onto whitelist entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistedInstance {
    /// Owning instance id
    pub id: InstanceId,
    /// Owning instance port
    pub port: u16,
    /// Owning instance user
    pub user_email: String,
}

/// An IP address permitted to reach an instance.
///
/// Keyed by `(ip_address, instance.id)`; there is no surrogate key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistedAddress {
    /// Address of the user's client
    pub ip_address: IpAddr,
    /// Instance the address is whitelisted for (lookup only)
    pub instance: WhitelistedInstance,
    /// First time the address was recorded
    pub created_at: DateTime<Utc>,
    /// Last time the address accessed the instance
    pub updated_at: DateTime<Utc>,
}

impl WhitelistedAddress {
    /// Build a new entry for `instance`
    #[must_use]
    pub fn new(ip_address: IpAddr, instance: &Instance) -> Self {
        let now = Utc::now();
        Self {
            ip_address,
            instance: WhitelistedInstance {
                id: instance.id,
                port: instance.port,
                user_email: instance.user_email.clone(),
            },
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_token_is_never_serialized() {
        let instance = Instance::new(3, "alice@example.com", "secret-refresh-token");
        let json = serde_json::to_string(&instance).unwrap();
        assert!(!json.contains("secret-refresh-token"));
        assert!(!json.contains("credentials"));
    }

    #[test]
    fn new_images_are_not_ready_and_hide_their_script() {
        let image = Image::new(Utc::now(), "UPDATE users SET email = 'x';");
        assert!(!image.ready);

        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["ready"], false);
        assert!(json.get("anonymisation_script").is_none());
    }

    #[test]
    fn whitelisted_address_copies_instance_projection() {
        let mut instance = Instance::new(1, "bob@example.com", "");
        instance.id = 7;
        instance.port = 6000;

        let address = WhitelistedAddress::new("9.9.9.9".parse().unwrap(), &instance);
        assert_eq!(address.instance.id, 7);
        assert_eq!(address.instance.port, 6000);
        assert_eq!(address.instance.user_email, "bob@example.com");
        assert_eq!(address.created_at, address.updated_at);
    }
}
