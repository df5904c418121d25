//! Error reporting
//!
//! Background loops cannot return their errors to anyone, so they hand them to
//! an [`ErrorReporter`]. The log reporter is always active; the webhook
//! reporter also forwards each report to an external collector.

use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, warn};

/// Sink for errors that have no caller to return to
pub trait ErrorReporter: Send + Sync {
    /// Report `error`, which happened while doing `context`
    fn report(&self, context: &str, error: &dyn std::error::Error);
}

/// Reporter that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, context: &str, error: &dyn std::error::Error) {
        error!(reported = true, context = context, error = %error, "Reported error");
    }
}

/// Payload posted to the collector
#[derive(Debug, Serialize)]
struct ErrorReport<'a> {
    context: &'a str,
    error: String,
    environment: &'a str,
    timestamp: String,
}

/// Reporter that logs and posts each report to a webhook
#[derive(Debug, Clone)]
pub struct WebhookReporter {
    client: Client,
    url: String,
    environment: String,
}

impl WebhookReporter {
    /// Create a reporter posting to `url`
    #[must_use]
    pub fn new(client: Client, url: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            environment: environment.into(),
        }
    }
}

impl ErrorReporter for WebhookReporter {
    fn report(&self, context: &str, error: &dyn std::error::Error) {
        LogReporter.report(context, error);

        let body = match serde_json::to_vec(&ErrorReport {
            context,
            error: error.to_string(),
            environment: &self.environment,
            timestamp: Utc::now().to_rfc3339(),
        }) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize error report");
                return;
            }
        };

        // No runtime means nothing to post from (e.g. during process teardown)
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);

        handle.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(status = %resp.status(), "Error collector rejected report"),
                Err(e) => warn!(error = %e, "Failed to deliver error report"),
            }
        });
    }
}

/// Build the reporter selected by configuration
#[must_use]
pub fn from_config(webhook_url: Option<&str>, environment: &str) -> Arc<dyn ErrorReporter> {
    match webhook_url.filter(|u| !u.is_empty()) {
        Some(url) => Arc::new(WebhookReporter::new(Client::new(), url, environment)),
        None => Arc::new(LogReporter),
    }
}
