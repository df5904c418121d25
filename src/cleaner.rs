//! Instance cleaner
//!
//! Periodically re-checks the refresh token stored with every instance and
//! destroys instances whose grant has been revoked. A check that fails for any
//! other reason leaves the instance alone.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::auth::{Authenticator, CredentialValidity};
use crate::exec::Executor;
use crate::models::Instance;
use crate::report::ErrorReporter;
use crate::store::InstanceStore;
use crate::whitelist::ReconcileHandle;

/// Trigger source recorded for reconciles requested by the cleaner
pub const CLEANER_SOURCE: &str = "cleaner";

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Instances whose token was checked
    pub checked: usize,
    /// Instances destroyed because their grant was revoked
    pub destroyed: usize,
    /// Checks or destructions that failed
    pub failed: usize,
}

/// Destroys instances whose stored credential is no longer honoured
pub struct InstanceCleaner {
    store: Arc<dyn InstanceStore>,
    executor: Arc<dyn Executor>,
    authenticator: Arc<dyn Authenticator>,
    whitelist: ReconcileHandle,
    reporter: Arc<dyn ErrorReporter>,
}

impl InstanceCleaner {
    /// Create a cleaner
    pub fn new(
        store: Arc<dyn InstanceStore>,
        executor: Arc<dyn Executor>,
        authenticator: Arc<dyn Authenticator>,
        whitelist: ReconcileHandle,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            store,
            executor,
            authenticator,
            whitelist,
            reporter,
        }
    }

    /// Sweep every `interval` until `cancel` fires. The first sweep happens
    /// one interval after start.
    pub async fn start(&self, cancel: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs_f64(), "Instance cleaner started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.sweep().await;
        }

        info!("Instance cleaner stopped");
    }

    /// Run one sweep over all instances
    pub async fn sweep(&self) -> SweepSummary {
        info!("Cleaning old instances with invalid tokens");
        let mut summary = SweepSummary::default();

        let instances = match self.store.list().await {
            Ok(instances) => instances,
            Err(e) => {
                self.reporter.report("cannot clean instances: unable to list instances", &e);
                summary.failed += 1;
                return summary;
            }
        };

        for instance in instances.iter().filter(|i| !i.refresh_token.is_empty()) {
            summary.checked += 1;

            let reason = match self.authenticator.is_credential_valid(&instance.refresh_token).await {
                Ok(CredentialValidity::Valid) => continue,
                Ok(CredentialValidity::Revoked { reason }) => reason,
                Err(e) => {
                    warn!(instance_id = instance.id, error = %e, "Failed to validate token");
                    self.reporter.report("failed to validate token", &e);
                    summary.failed += 1;
                    continue;
                }
            };

            info!(
                instance_id = instance.id,
                user_email = %instance.user_email,
                reason = %reason,
                "Token for instance invalid: destroying instance"
            );

            match self.destroy(instance).await {
                Ok(()) => summary.destroyed += 1,
                Err(e) => {
                    warn!(instance_id = instance.id, user_email = %instance.user_email, error = %e, "Failed to destroy instance");
                    self.reporter.report("failed to destroy instance", &e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn destroy(&self, instance: &Instance) -> Result<()> {
        self.executor
            .destroy_instance(instance.id)
            .await
            .map_err(|e| crate::error::Error::context("executor", e))?;
        self.store.destroy(instance.id).await?;
        self.whitelist.trigger(CLEANER_SOURCE);
        Ok(())
    }
}
