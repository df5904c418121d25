//! Privileged OS operations on images and instances
//!
//! Finalising images and creating or destroying instances requires root, so
//! the work is done by `draupnir-*` scripts invoked through `sudo`. This
//! module only shells out and logs what the scripts printed.
//!
//! Commands are not tied to the caller's future: a dropped request must not
//! kill a script halfway through.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::models::{Image, ImageId, InstanceCredentials, InstanceId};

/// Postgres port used while an image is being finalised is this plus its id
const FINALISE_BASE_PORT: u64 = 5432;

/// Executor errors
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command could not be spawned
    #[error("failed to run {command}: {source}")]
    Spawn {
        /// Program name
        command: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The command exited unsuccessfully
    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        /// Program name
        command: String,
        /// Exit status description
        status: String,
        /// Captured stderr
        stderr: String,
    },

    /// A local file operation failed
    #[error("{action} {path}: {source}")]
    Io {
        /// What was being done
        action: &'static str,
        /// File or directory involved
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// A credential file could not be read
    #[error("failed to read credentials file {file}: {source}")]
    Credentials {
        /// File name
        file: String,
        /// Underlying IO error
        source: std::io::Error,
    },
}

/// Privileged operations on images and instances
#[async_trait]
pub trait Executor: Send + Sync {
    /// Create the writable upload directory for a new image
    async fn create_image_volume(&self, image_id: ImageId) -> Result<(), ExecError>;

    /// Anonymise the uploaded data and snapshot it as the finished image
    async fn finalise_image(&self, image: &Image) -> Result<(), ExecError>;

    /// Remove an image from disk
    async fn destroy_image(&self, image_id: ImageId) -> Result<(), ExecError>;

    /// Clone `image_id` into a new instance listening on `port`
    async fn create_instance(&self, image_id: ImageId, instance_id: InstanceId, port: u16) -> Result<(), ExecError>;

    /// Stop the instance and remove it from disk
    async fn destroy_instance(&self, instance_id: InstanceId) -> Result<(), ExecError>;

    /// Read the TLS client credentials generated for the instance
    async fn retrieve_instance_credentials(&self, instance_id: InstanceId) -> Result<InstanceCredentials, ExecError>;
}

/// Executor backed by the `draupnir-*` scripts
#[derive(Debug, Clone)]
pub struct OsExecutor {
    data_path: PathBuf,
}

impl OsExecutor {
    /// Create an executor operating under `data_path`
    #[must_use]
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }

    fn instance_dir(&self, instance_id: InstanceId) -> PathBuf {
        self.data_path.join("instances").join(instance_id.to_string())
    }

    fn upload_dir(&self, image_id: ImageId) -> PathBuf {
        self.data_path.join("image_uploads").join(image_id.to_string())
    }

    async fn run_script(&self, script: &str, args: &[String]) -> Result<Output, ExecError> {
        let mut command = Command::new("sudo");
        command.arg(script).arg(&self.data_path).args(args);
        run(script, command, args).await
    }
}

/// Run `command` to completion, logging its output
async fn run(name: &str, mut command: Command, args: &[String]) -> Result<Output, ExecError> {
    let output = command.output().await.map_err(|source| ExecError::Spawn {
        command: name.to_string(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    info!(
        script = name,
        args = ?args,
        status = %output.status,
        stdout = %stdout.trim_end(),
        stderr = %stderr.trim_end(),
        "Ran script"
    );

    if output.status.success() {
        Ok(output)
    } else {
        Err(ExecError::Failed {
            command: name.to_string(),
            status: output.status.to_string(),
            stderr: stderr.trim_end().to_string(),
        })
    }
}

#[async_trait]
impl Executor for OsExecutor {
    async fn create_image_volume(&self, image_id: ImageId) -> Result<(), ExecError> {
        let path = self.upload_dir(image_id);
        let mut command = Command::new("btrfs");
        command.args(["subvolume", "create"]).arg(&path);
        run("btrfs", command, &[path.display().to_string()]).await?;

        // The upload identity writes into the subvolume
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o775))
                .await
                .map_err(|source| ExecError::Io {
                    action: "failed to set permissions on",
                    path: path.clone(),
                    source,
                })?;
        }

        info!(image_id, path = %path.display(), "Created image upload volume");
        Ok(())
    }

    async fn finalise_image(&self, image: &Image) -> Result<(), ExecError> {
        // Removed when dropped, after the script has read it
        let script = tempfile::Builder::new()
            .prefix("draupnir")
            .tempfile()
            .map_err(|source| ExecError::Io {
                action: "failed to create",
                path: std::env::temp_dir(),
                source,
            })?;
        tokio::fs::write(script.path(), &image.anonymisation_script)
            .await
            .map_err(|source| ExecError::Io {
                action: "failed to write",
                path: script.path().to_path_buf(),
                source,
            })?;

        self.run_script(
            "draupnir-finalise-image",
            &[
                image.id.to_string(),
                (FINALISE_BASE_PORT + image.id).to_string(),
                script.path().display().to_string(),
            ],
        )
        .await
        .map(drop)
    }

    async fn destroy_image(&self, image_id: ImageId) -> Result<(), ExecError> {
        self.run_script("draupnir-destroy-image", &[image_id.to_string()])
            .await
            .map(drop)
    }

    async fn create_instance(&self, image_id: ImageId, instance_id: InstanceId, port: u16) -> Result<(), ExecError> {
        self.run_script(
            "draupnir-create-instance",
            &[image_id.to_string(), instance_id.to_string(), port.to_string()],
        )
        .await
        .map(drop)
    }

    async fn destroy_instance(&self, instance_id: InstanceId) -> Result<(), ExecError> {
        self.run_script("draupnir-destroy-instance", &[instance_id.to_string()])
            .await
            .map(drop)
    }

    async fn retrieve_instance_credentials(&self, instance_id: InstanceId) -> Result<InstanceCredentials, ExecError> {
        let dir = self.instance_dir(instance_id);
        let read = |file: &'static str| {
            let path = dir.join(file);
            async move {
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ExecError::Credentials {
                        file: file.to_string(),
                        source,
                    })
            }
        };

        let credentials = InstanceCredentials {
            ca_certificate: read("ca.crt").await?,
            client_certificate: read("client.crt").await?,
            client_key: read("client.key").await?,
        };

        info!(instance_id, "Retrieved instance credentials");
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retrieves_credentials_from_instance_directory() {
        let data = tempfile::tempdir().unwrap();
        let dir = data.path().join("instances").join("12");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ca.crt"), "CA").unwrap();
        std::fs::write(dir.join("client.crt"), "CERT").unwrap();
        std::fs::write(dir.join("client.key"), "KEY").unwrap();

        let executor = OsExecutor::new(data.path());
        let creds = executor.retrieve_instance_credentials(12).await.unwrap();

        assert_eq!(creds.ca_certificate, "CA");
        assert_eq!(creds.client_certificate, "CERT");
        assert_eq!(creds.client_key, "KEY");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_command_reports_stderr() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo nope >&2; exit 3"]);
        let err = run("sh", command, &[]).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed { ref stderr, .. } if stderr == "nope"));
    }

    #[tokio::test]
    async fn missing_credentials_file_names_the_file() {
        let data = tempfile::tempdir().unwrap();
        let dir = data.path().join("instances").join("3");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ca.crt"), "CA").unwrap();

        let executor = OsExecutor::new(data.path());
        let err = executor.retrieve_instance_credentials(3).await.unwrap_err();
        assert!(err.to_string().contains("client.crt"));
    }
}
