//! IP whitelist reconciler
//!
//! Keeps the firewall chain in step with the whitelisted address store.
//! Reconciles are requested through a [`ReconcileHandle`] and consumed one at
//! a time by [`IpWhitelister::start`], so the chain only ever has one writer.
//! A timer requests a reconcile on startup and every interval, which repairs
//! drift caused outside this process.

mod firewall;
mod rules;

pub use firewall::{Firewall, FirewallError, IptablesFirewall};
pub use rules::{RuleDiff, RuleEntry, diff};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::report::{ErrorReporter, LogReporter};
use crate::store::{StoreError, WhitelistedAddressStore};

/// Pending reconcile requests before triggers start failing
pub const QUEUE_CAPACITY: usize = 100;

/// Trigger source used by the periodic timer
pub const TIMER_SOURCE: &str = "timer";

/// Request for one reconcile cycle
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    /// Who asked (`timer`, `api`, `cleaner`, ...)
    pub source: String,
    /// When it was queued
    pub requested_at: Instant,
}

impl ReconcileRequest {
    /// Request stamped with the current time
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            requested_at: Instant::now(),
        }
    }
}

/// Errors raised when queueing a reconcile
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Every queue slot is taken
    #[error("whitelist reconcile queue is full ({capacity} pending requests), dropping request from {source_name}")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
        /// Trigger source of the dropped request
        source_name: String,
    },
}

/// A whitelisted address the firewall cannot express, left out of the chain
#[derive(Debug, Error)]
#[error("firewall cannot express rule, skipping it: {rule}")]
pub struct UnsupportedRule {
    /// Rule that was skipped
    pub rule: RuleEntry,
}

/// Errors that abort a reconcile cycle
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Desired state could not be read
    #[error("failed to retrieve whitelisted IP addresses: {0}")]
    Store(#[from] StoreError),

    /// Existing state could not be read
    #[error("failed to retrieve existing rules: {0}")]
    ListRules(#[source] FirewallError),

    /// A rule could not be appended
    #[error("failed to add rule to chain: {rule}: {source}")]
    Add {
        /// Rule being added
        rule: RuleEntry,
        /// Firewall failure
        source: FirewallError,
    },

    /// A rule could not be deleted
    #[error("failed to remove rule from chain: {rule}: {source}")]
    Remove {
        /// Rule being removed
        rule: RuleEntry,
        /// Firewall failure
        source: FirewallError,
    },
}

/// Cloneable handle for requesting reconciles.
///
/// A disabled handle accepts triggers and does nothing with them.
#[derive(Clone)]
pub struct ReconcileHandle {
    sender: Option<mpsc::Sender<ReconcileRequest>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl ReconcileHandle {
    /// Handle used when whitelisting is turned off
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sender: None,
            reporter: Arc::new(LogReporter),
        }
    }

    /// Whether triggers reach a reconciler
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue a reconcile without waiting.
    ///
    /// A full queue means reconciles are not being consumed at all; the
    /// request is dropped and the condition reported.
    pub fn trigger(&self, source: &str) {
        let Some(sender) = &self.sender else {
            return;
        };

        match sender.try_send(ReconcileRequest::new(source)) {
            Ok(()) => debug!(trigger_source = source, "Queued whitelist reconcile"),
            Err(TrySendError::Full(_)) => {
                let err = TriggerError::QueueFull {
                    capacity: QUEUE_CAPACITY,
                    source_name: source.to_string(),
                };
                self.reporter.report("trigger whitelist reconcile", &err);
            }
            Err(TrySendError::Closed(_)) => {
                warn!(trigger_source = source, "Whitelist reconciler has stopped, ignoring trigger");
            }
        }
    }
}

/// Summary of a completed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Rules appended
    pub added: usize,
    /// Rules deleted
    pub removed: usize,
}

/// Reconciles the firewall chain against the whitelist store
pub struct IpWhitelister {
    firewall: Arc<dyn Firewall>,
    store: Arc<dyn WhitelistedAddressStore>,
    reporter: Arc<dyn ErrorReporter>,
    sender: mpsc::Sender<ReconcileRequest>,
    receiver: mpsc::Receiver<ReconcileRequest>,
}

impl IpWhitelister {
    /// Create a whitelister
    pub fn new(
        firewall: Arc<dyn Firewall>,
        store: Arc<dyn WhitelistedAddressStore>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            firewall,
            store,
            reporter,
            sender,
            receiver,
        }
    }

    /// Handle for requesting reconciles
    #[must_use]
    pub fn handle(&self) -> ReconcileHandle {
        ReconcileHandle {
            sender: Some(self.sender.clone()),
            reporter: Arc::clone(&self.reporter),
        }
    }

    /// Ensure the chain exists, then consume reconcile requests until
    /// `cancel` fires.
    ///
    /// Cycle failures are logged and reported; the next trigger retries.
    ///
    /// # Errors
    ///
    /// Returns an error only if the chain cannot be created.
    pub async fn start(mut self, cancel: CancellationToken, interval: Duration) -> Result<(), FirewallError> {
        self.firewall.ensure_chain().await?;

        let timer_handle = self.handle();
        let timer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                timer_handle.trigger(TIMER_SOURCE);

                tokio::select! {
                    () = timer_cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });

        info!(interval_secs = interval.as_secs_f64(), "Whitelist reconciler started");

        loop {
            let request = tokio::select! {
                () = cancel.cancelled() => break,
                request = self.receiver.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            if let Err(e) = self.reconcile(&request).await {
                self.reporter.report("reconcile whitelist rules", &e);
            }
        }

        info!("Whitelist reconciler stopped");
        Ok(())
    }

    /// Run one reconcile cycle
    ///
    /// # Errors
    ///
    /// Returns the first failure; rules applied before it stay applied.
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileOutcome, ReconcileError> {
        let start = Instant::now();
        let source = request.source.as_str();

        info!(
            trigger_source = source,
            latency_secs = start.duration_since(request.requested_at).as_secs_f64(),
            "Starting whitelist reconciliation"
        );

        let (desired, unsupported): (Vec<RuleEntry>, Vec<RuleEntry>) = self
            .store
            .list()
            .await?
            .iter()
            .map(RuleEntry::from_address)
            .partition(|rule| self.firewall.accepts(rule.source));

        for rule in unsupported {
            warn!(
                trigger_source = source,
                user_email = %rule.owner,
                ip_address = %rule.source,
                port = rule.port,
                "Skipping whitelisted address the firewall cannot express"
            );
            self.reporter
                .report("reconcile whitelist rules", &UnsupportedRule { rule });
        }

        let existing = self
            .firewall
            .list_rules()
            .await
            .map_err(ReconcileError::ListRules)?;

        let changes = diff(&desired, &existing);

        for rule in &changes.add {
            self.firewall
                .append_rule(rule)
                .await
                .map_err(|err| ReconcileError::Add {
                    rule: rule.clone(),
                    source: err,
                })?;
            info!(
                trigger_source = source,
                user_email = %rule.owner,
                ip_address = %rule.source,
                port = rule.port,
                "Added rule to whitelist chain"
            );
        }

        for rule in &changes.remove {
            self.firewall
                .delete_rule(rule)
                .await
                .map_err(|err| ReconcileError::Remove {
                    rule: rule.clone(),
                    source: err,
                })?;
            info!(
                trigger_source = source,
                user_email = %rule.owner,
                ip_address = %rule.source,
                port = rule.port,
                "Removed rule from whitelist chain"
            );
        }

        if changes.is_empty() {
            info!(trigger_source = source, "No changes to whitelist chain required");
        }

        info!(
            trigger_source = source,
            duration_secs = start.elapsed().as_secs_f64(),
            "Finished whitelist reconciliation"
        );

        Ok(ReconcileOutcome {
            added: changes.add.len(),
            removed: changes.remove.len(),
        })
    }
}

impl std::fmt::Debug for ReconcileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileHandle")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
