//! # Switchyard
//!
//! Switchyard is an Envoy control plane. It watches declarative routing
//! configuration (upstreams, virtual services, roles) together with the
//! secrets, files and endpoints that configuration references, translates
//! every role into a versioned xDS snapshot, and serves those snapshots to
//! proxies over the aggregated and per-type discovery services.
//!
//! ## Architecture
//!
//! ```text
//! watchers → Emitter → Syncer → Translator(role) → SnapshotCache → xDS streams
//!                                     ↓
//!                                 Reporter
//! ```
//!
//! - **Watchers**: push the config, secrets, files and endpoints
//! - **Emitter**: folds watcher output into one [`snapshot::Cache`] stream
//! - **Translator**: plugin pipeline building clusters, routes and listeners
//! - **xDS server**: one snapshot per proxy group, keyed by the node's role

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod config;
pub mod endpoints;
pub mod errors;
pub mod model;
pub mod observability;
pub mod plugins;
pub mod reporter;
pub mod snapshot;
pub mod syncer;
pub mod translator;
pub mod watchers;
pub mod xds;

pub use config::AppConfig;
pub use errors::{Error, Result};

use endpoints::{DiscoveryOptions, EndpointsWatcher};
use plugins::{Plugin, PluginRegistry};
use reporter::LoggingReporter;
use snapshot::{Emitter, EmitterOutputs};
use syncer::Syncer;
use translator::Translator;
use watchers::{DirFileWatcher, DirSecretWatcher, FileConfigWatcher};
use xds::{fallback_snapshot, run_xds};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Run the control plane until `stop` is cancelled.
///
/// `plugins` are registered after the core plugins. Failing to bind the xDS
/// port is returned immediately; a server failure later on cancels `stop`
/// and is returned once every other task has wound down.
pub async fn run(config: AppConfig, plugins: Vec<Arc<dyn Plugin>>, stop: CancellationToken) -> Result<()> {
    let registry = Arc::new(PluginRegistry::new(plugins));

    let bind_address = config.xds.bind_address();
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| Error::config(format!("Invalid xDS bind address {}: {}", bind_address, e)))?;
    let (cache, server) =
        run_xds(addr, fallback_snapshot(u32::from(config.xds.fallback_port)), stop.clone()).await?;

    let interval = config.sources.poll_interval();
    let endpoints = EndpointsWatcher::new(&DiscoveryOptions::default(), registry.discovery_plugins());
    info!(backends = endpoints.backend_count(), "Endpoint aggregator ready");

    let (emitter, EmitterOutputs { snapshots, errors }) = Emitter::new(
        Arc::new(FileConfigWatcher::new(config.sources.config_path.clone(), interval)),
        Arc::new(DirSecretWatcher::new(config.sources.secrets_dir.clone(), interval)),
        Arc::new(DirFileWatcher::new(config.sources.files_dir.clone(), interval)),
        Arc::new(endpoints),
        registry.clone(),
    );
    let syncer = Syncer::new(Translator::new(registry), cache, Arc::new(LoggingReporter::new()));

    let server_stop = stop.clone();
    let server = tokio::spawn(async move {
        let result = server
            .await
            .unwrap_or_else(|e| Err(Error::internal(format!("XDS server task failed: {}", e))));
        if result.is_err() {
            server_stop.cancel();
        }
        result
    });

    let mut tasks = JoinSet::new();
    let emitter_stop = stop.clone();
    tasks.spawn(async move { emitter.run(emitter_stop).await });
    tasks.spawn(syncer.run(snapshots, stop.clone()));
    tasks.spawn(log_watcher_errors(errors, stop.clone()));

    info!(app_name = APP_NAME, version = VERSION, "Switchyard control plane running");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Control plane task failed");
        }
    }

    server
        .await
        .map_err(|e| Error::internal(format!("XDS server task failed: {}", e)))?
}

async fn log_watcher_errors(mut errors: mpsc::Receiver<Error>, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = errors.recv() => match received {
                Some(e) => error!(error = %e, "Watcher error"),
                None => break,
            },
        }
    }
}
