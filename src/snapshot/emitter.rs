use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Cache;
use crate::errors::Error;
use crate::model::{Config, SslSource};
use crate::plugins::{Dependencies, DependencyExtractor};
use crate::watchers::{ConfigWatcher, EndpointDiscovery, FileWatcher, SecretWatcher};

const CONFIG_SOURCE: &str = "config watcher";
const SECRET_SOURCE: &str = "secret watcher";
const FILE_SOURCE: &str = "file watcher";
const ENDPOINTS_SOURCE: &str = "endpoints watcher";

/// Receiving ends of the emitter: one snapshot per input change, plus every
/// watcher error tagged with its source.
pub struct EmitterOutputs {
    pub snapshots: mpsc::Receiver<Cache>,
    pub errors: mpsc::Receiver<Error>,
}

/// Runs all watchers and folds their emissions into one [`Cache`] stream.
///
/// Every config update also recomputes the dependency set and pushes it back
/// to the secret, file and endpoint watchers so they follow exactly what the
/// config references.
pub struct Emitter {
    config_watcher: Arc<dyn ConfigWatcher>,
    secret_watcher: Arc<dyn SecretWatcher>,
    file_watcher: Arc<dyn FileWatcher>,
    endpoints_watcher: Arc<dyn EndpointDiscovery>,
    dependencies: Arc<dyn DependencyExtractor>,
    snapshots: mpsc::Sender<Cache>,
    errors: mpsc::Sender<Error>,
}

impl Emitter {
    pub fn new(
        config_watcher: Arc<dyn ConfigWatcher>,
        secret_watcher: Arc<dyn SecretWatcher>,
        file_watcher: Arc<dyn FileWatcher>,
        endpoints_watcher: Arc<dyn EndpointDiscovery>,
        dependencies: Arc<dyn DependencyExtractor>,
    ) -> (Self, EmitterOutputs) {
        // Capacity one: the consumer decides whether a snapshot is worth translating.
        let (snapshots_tx, snapshots_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(16);
        let emitter = Self {
            config_watcher,
            secret_watcher,
            file_watcher,
            endpoints_watcher,
            dependencies,
            snapshots: snapshots_tx,
            errors: errors_tx,
        };
        (emitter, EmitterOutputs { snapshots: snapshots_rx, errors: errors_rx })
    }

    /// Run until `stop` is cancelled; returns after every child task joined.
    pub async fn run(&self, stop: CancellationToken) {
        let stop = stop.child_token();
        let mut tasks = JoinSet::new();

        let (cfg_tx, mut cfg_rx) = mpsc::channel(1);
        let (cfg_err_tx, cfg_err_rx) = mpsc::channel(1);
        let watcher = Arc::clone(&self.config_watcher);
        let watcher_stop = stop.clone();
        tasks.spawn(async move { watcher.run(watcher_stop, cfg_tx, cfg_err_tx).await });
        tasks.spawn(forward_errors(CONFIG_SOURCE, stop.clone(), cfg_err_rx, self.errors.clone()));

        let (secrets_tx, mut secrets_rx) = mpsc::channel(1);
        let (secrets_err_tx, secrets_err_rx) = mpsc::channel(1);
        let watcher = Arc::clone(&self.secret_watcher);
        let watcher_stop = stop.clone();
        tasks.spawn(async move { watcher.run(watcher_stop, secrets_tx, secrets_err_tx).await });
        tasks.spawn(forward_errors(SECRET_SOURCE, stop.clone(), secrets_err_rx, self.errors.clone()));

        let (files_tx, mut files_rx) = mpsc::channel(1);
        let (files_err_tx, files_err_rx) = mpsc::channel(1);
        let watcher = Arc::clone(&self.file_watcher);
        let watcher_stop = stop.clone();
        tasks.spawn(async move { watcher.run(watcher_stop, files_tx, files_err_tx).await });
        tasks.spawn(forward_errors(FILE_SOURCE, stop.clone(), files_err_rx, self.errors.clone()));

        let (endpoints_tx, mut endpoints_rx) = mpsc::channel(1);
        let (endpoints_err_tx, endpoints_err_rx) = mpsc::channel(1);
        let watcher = Arc::clone(&self.endpoints_watcher);
        let watcher_stop = stop.clone();
        tasks.spawn(async move { watcher.run(watcher_stop, endpoints_tx, endpoints_err_tx).await });
        tasks.spawn(forward_errors(
            ENDPOINTS_SOURCE,
            stop.clone(),
            endpoints_err_rx,
            self.errors.clone(),
        ));

        let mut latest = Cache::default();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(cfg) = cfg_rx.recv() => {
                    let cfg = Arc::new(cfg);
                    self.track_dependencies(&cfg, &stop, &mut tasks);
                    latest.cfg = Some(cfg);
                }
                Some(secrets) = secrets_rx.recv() => {
                    debug!(count = secrets.len(), "Secrets updated");
                    latest.secrets = Arc::new(secrets);
                }
                Some(files) = files_rx.recv() => {
                    debug!(count = files.len(), "Files updated");
                    latest.files = Arc::new(files);
                }
                Some(endpoints) = endpoints_rx.recv() => {
                    debug!(upstreams = endpoints.len(), "Endpoints updated");
                    latest.endpoints = Arc::new(endpoints);
                }
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                sent = self.snapshots.send(latest.clone()) => {
                    if sent.is_err() {
                        warn!("Snapshot consumer went away; stopping emitter");
                        break;
                    }
                }
            }
        }

        stop.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Emitter task failed");
            }
        }
        info!("Emitter stopped");
    }

    /// Push the secret refs, file refs and upstream list of `cfg` to the
    /// watchers, each on its own task.
    fn track_dependencies(
        &self,
        cfg: &Arc<Config>,
        stop: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) {
        while tasks.try_join_next().is_some() {}

        let deps = config_dependencies(self.dependencies.as_ref(), cfg);
        info!(
            secrets = deps.secret_refs.len(),
            files = deps.file_refs.len(),
            upstreams = cfg.upstreams.len(),
            "Config updated; tracking dependencies"
        );

        let watcher = Arc::clone(&self.secret_watcher);
        let errors = self.errors.clone();
        let task_stop = stop.clone();
        let refs = deps.secret_refs;
        tasks.spawn(async move {
            if let Err(e) = watcher.track_secrets(refs).await {
                report(&task_stop, &errors, Error::from_watcher(SECRET_SOURCE, e)).await;
            }
        });

        let watcher = Arc::clone(&self.file_watcher);
        let errors = self.errors.clone();
        let task_stop = stop.clone();
        let refs = deps.file_refs;
        tasks.spawn(async move {
            if let Err(e) = watcher.track_files(refs).await {
                report(&task_stop, &errors, Error::from_watcher(FILE_SOURCE, e)).await;
            }
        });

        let watcher = Arc::clone(&self.endpoints_watcher);
        let errors = self.errors.clone();
        let upstreams = cfg.upstreams.clone();
        let task_stop = stop.clone();
        tasks.spawn(async move {
            if let Err(e) = watcher.track_upstreams(upstreams).await {
                report(&task_stop, &errors, Error::from_watcher(ENDPOINTS_SOURCE, e)).await;
            }
        });
    }
}

/// Plugin dependencies plus the secrets and files referenced by virtual
/// service TLS settings.
pub fn config_dependencies(extractor: &dyn DependencyExtractor, cfg: &Config) -> Dependencies {
    let mut deps = extractor.dependencies(cfg);
    for vs in &cfg.virtual_services {
        let Some(ssl) = &vs.ssl_config else { continue };
        match &ssl.source {
            SslSource::SecretRef(secret) => deps.secret_refs.push(secret.clone()),
            SslSource::SslFiles(files) => {
                deps.file_refs.push(files.tls_cert.clone());
                deps.file_refs.push(files.tls_key.clone());
                if let Some(root_ca) = &files.root_ca {
                    deps.file_refs.push(root_ca.clone());
                }
            }
        }
    }
    deps.normalize();
    deps
}

async fn report(stop: &CancellationToken, errors: &mpsc::Sender<Error>, err: Error) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = errors.send(err) => {}
    }
}

async fn forward_errors(
    source: &'static str,
    stop: CancellationToken,
    mut rx: mpsc::Receiver<Error>,
    errors: mpsc::Sender<Error>,
) {
    loop {
        let err = tokio::select! {
            _ = stop.cancelled() => return,
            next = rx.recv() => match next {
                Some(err) => err,
                None => return,
            },
        };
        tokio::select! {
            _ = stop.cancelled() => return,
            sent = errors.send(Error::from_watcher(source, err)) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
