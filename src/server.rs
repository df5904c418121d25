//! Process wiring
//!
//! Builds every component from configuration and runs the HTTP API, the
//! instance cleaner and (when enabled) the whitelist reconciler under one
//! cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, AppState, middleware::ClientIpResolver};
use crate::auth::{GoogleAuthenticator, GoogleProvider, IntegrationTestProvider, TokenVerifier};
use crate::cleaner::InstanceCleaner;
use crate::config::Config;
use crate::exec::OsExecutor;
use crate::oauth::OAuthCoordinator;
use crate::report::{self, ErrorReporter};
use crate::store::MemoryStore;
use crate::whitelist::{IpWhitelister, IptablesFirewall, ReconcileHandle};
use crate::{Error, Result};

/// The running service
pub struct Server {
    config: Config,
    store: Arc<MemoryStore>,
    state: AppState,
    cleaner: InstanceCleaner,
    whitelister: Option<IpWhitelister>,
}

impl Server {
    /// Build every component from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the configured store snapshot cannot be read.
    pub fn new(config: Config) -> Result<Self> {
        let reporter: Arc<dyn ErrorReporter> =
            report::from_config(config.error_webhook_url.as_deref(), &config.environment);

        let store = Arc::new(match &config.state_path {
            Some(path) => MemoryStore::open(&config.public_hostname, path)?,
            None => MemoryStore::new(&config.public_hostname),
        });
        let executor = Arc::new(OsExecutor::new(&config.data_path));
        let google = Arc::new(GoogleProvider::new(&config.oauth));

        let verifier: Arc<dyn TokenVerifier> = if config.is_test_environment() {
            warn!("Test environment: accepting only the integration test token");
            Arc::new(IntegrationTestProvider)
        } else {
            google.clone()
        };
        let authenticator = Arc::new(GoogleAuthenticator::new(
            verifier,
            &config.shared_secret,
            &config.trusted_user_email_domain,
        ));

        let whitelister = config.whitelist.enabled.then(|| {
            IpWhitelister::new(
                Arc::new(IptablesFirewall::from_config(&config.whitelist)),
                store.clone(),
                Arc::clone(&reporter),
            )
        });
        let whitelist = whitelister
            .as_ref()
            .map_or_else(ReconcileHandle::disabled, IpWhitelister::handle);

        let cleaner = InstanceCleaner::new(
            store.clone(),
            executor.clone(),
            authenticator.clone(),
            whitelist.clone(),
            Arc::clone(&reporter),
        );

        let state = AppState {
            authenticator,
            oauth: Arc::new(OAuthCoordinator::from_config(google, &config.oauth)),
            images: store.clone(),
            instances: store.clone(),
            addresses: store.clone(),
            executor,
            whitelist,
            client_ip: Arc::new(ClientIpResolver::new(
                config.use_x_forwarded_for,
                &config.trusted_proxy_cidrs,
            )),
            min_instance_port: config.min_instance_port,
            max_instance_port: config.max_instance_port,
        };

        Ok(Self {
            config,
            store,
            state,
            cleaner,
            whitelister,
        })
    }

    /// Serve until a shutdown signal arrives or the reconciler fails to start
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound, the server fails, or
    /// the whitelist chain cannot be created.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            store,
            state,
            cleaner,
            whitelister,
        } = self;

        let cancel = CancellationToken::new();
        let addr = format!("{}:{}", config.http.host, config.http.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::context(&format!("failed to bind {addr}"), e))?;

        info!("============================================================");
        info!(version = env!("CARGO_PKG_VERSION"), "Draupnir listening on http://{addr}");
        info!(
            whitelisting = config.whitelist.enabled,
            clean_interval_secs = config.clean_interval.as_secs_f64(),
            ports = %format!("{}..{}", config.min_instance_port, config.max_instance_port),
            "Access control"
        );
        match &config.state_path {
            Some(path) if store.is_persistent() => info!(path = %path.display(), "Store snapshot"),
            _ => warn!("No state_path configured: instance records are lost on restart and their ports may be reused"),
        }
        info!("============================================================");

        let whitelist_task = whitelister.map(|whitelister| {
            let cancel = cancel.clone();
            let interval = config.whitelist.reconcile_interval;
            tokio::spawn(async move {
                let result = whitelister.start(cancel.clone(), interval).await;
                if let Err(e) = &result {
                    error!(error = %e, "Failed to ensure whitelist chain is present, shutting down");
                    cancel.cancel();
                }
                result
            })
        });

        let cleaner_task = {
            let cancel = cancel.clone();
            let interval = config.clean_interval;
            tokio::spawn(async move { cleaner.start(cancel, interval).await })
        };

        let app = api::create_router(state);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(cancel.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        cancel.cancel();
        let drain = async {
            if let Err(e) = cleaner_task.await {
                warn!(error = %e, "Instance cleaner task failed");
            }
            match whitelist_task {
                Some(task) => match task.await {
                    Ok(result) => result.map_err(Error::from),
                    Err(e) => Err(Error::context("whitelist reconciler task failed", e)),
                },
                None => Ok(()),
            }
        };

        let result = tokio::time::timeout(config.http.shutdown_timeout, drain)
            .await
            .unwrap_or_else(|_| {
                warn!(
                    timeout = ?config.http.shutdown_timeout,
                    "Background tasks did not stop in time"
                );
                Ok(())
            });

        info!("Draupnir shutdown complete");
        result
    }
}

/// Resolve on Ctrl+C, SIGTERM or cancellation, then cancel everything
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Shutdown signal received"),
        () = terminate => info!("Shutdown signal received"),
        () = cancel.cancelled() => {}
    }

    cancel.cancel();
}
