//! # Endpoint aggregation
//!
//! [`EndpointsWatcher`] merges every endpoint discovery backend into a single
//! [`EndpointGroups`] stream and is itself an [`EndpointDiscovery`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::model::{EndpointGroups, Upstream};
use crate::plugins::{EndpointDiscoveryPlugin, Registered};
use crate::watchers::EndpointDiscovery;

/// Settings handed to every discovery plugin when its backend is created.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// How often polling backends refresh.
    pub resync_period: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self { resync_period: Duration::from_secs(30) }
    }
}

struct Backend {
    name: String,
    discovery: Arc<dyn EndpointDiscovery>,
}

/// Fan-in over all endpoint discovery backends.
///
/// Each backend's latest emission replaces its previous one; the merged view
/// is the union of every backend's latest value, with later backends winning
/// when two report the same upstream.
pub struct EndpointsWatcher {
    backends: Vec<Backend>,
}

impl EndpointsWatcher {
    /// Start discovery for every plugin. A plugin that fails to set up its
    /// backend is logged and skipped.
    pub fn new(
        opts: &DiscoveryOptions,
        plugins: &[Registered<dyn EndpointDiscoveryPlugin>],
    ) -> Self {
        let mut backends = Vec::with_capacity(plugins.len());
        for registered in plugins {
            let name = registered.plugin.name();
            match registered.capability.setup_endpoint_discovery(opts) {
                Ok(discovery) => {
                    info!(plugin = name, "Endpoint discovery started");
                    backends.push(Backend { name: name.to_string(), discovery });
                }
                Err(e) => {
                    warn!(plugin = name, error = %e, "Failed to start endpoint discovery; skipping");
                }
            }
        }
        Self { backends }
    }

    /// Aggregate already constructed backends, keyed by name.
    pub fn from_backends(backends: Vec<(String, Arc<dyn EndpointDiscovery>)>) -> Self {
        Self {
            backends: backends
                .into_iter()
                .map(|(name, discovery)| Backend { name, discovery })
                .collect(),
        }
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}

#[async_trait]
impl EndpointDiscovery for EndpointsWatcher {
    async fn run(
        &self,
        stop: CancellationToken,
        endpoints: mpsc::Sender<EndpointGroups>,
        errors: mpsc::Sender<Error>,
    ) {
        let (tagged_tx, tagged_rx) = mpsc::channel::<(usize, EndpointGroups)>(self.backends.len().max(1));
        let mut tasks = Vec::with_capacity(self.backends.len() * 3 + 1);

        for (index, backend) in self.backends.iter().enumerate() {
            let (groups_tx, groups_rx) = mpsc::channel::<EndpointGroups>(1);
            let (errors_tx, errors_rx) = mpsc::channel::<Error>(1);

            let discovery = Arc::clone(&backend.discovery);
            let backend_stop = stop.clone();
            tasks.push(tokio::spawn(async move {
                discovery.run(backend_stop, groups_tx, errors_tx).await;
            }));

            tasks.push(tokio::spawn(forward_endpoints(index, stop.clone(), groups_rx, tagged_tx.clone())));

            tasks.push(tokio::spawn(forward_errors(
                backend.name.clone(),
                stop.clone(),
                errors_rx,
                errors.clone(),
            )));
        }
        drop(tagged_tx);

        tasks.push(tokio::spawn(merge(stop.clone(), tagged_rx, endpoints)));

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                warn!(error = %e, "Endpoint aggregation task failed");
            }
        }
        debug!("Endpoint aggregator stopped");
    }

    async fn track_upstreams(&self, upstreams: Vec<Upstream>) -> Result<()> {
        let results = join_all(self.backends.iter().map(|backend| {
            let upstreams = upstreams.clone();
            async move {
                backend
                    .discovery
                    .track_upstreams(upstreams)
                    .await
                    .map_err(|e| Error::from_discovery(backend.name.clone(), e))
            }
        }))
        .await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!(error = %e, "Endpoint discovery rejected upstream set");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn forward_endpoints(
    index: usize,
    stop: CancellationToken,
    mut groups_rx: mpsc::Receiver<EndpointGroups>,
    tagged_tx: mpsc::Sender<(usize, EndpointGroups)>,
) {
    loop {
        let groups = tokio::select! {
            _ = stop.cancelled() => return,
            next = groups_rx.recv() => match next {
                Some(groups) => groups,
                None => return,
            },
        };
        tokio::select! {
            _ = stop.cancelled() => return,
            sent = tagged_tx.send((index, groups)) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn forward_errors(
    name: String,
    stop: CancellationToken,
    mut errors_rx: mpsc::Receiver<Error>,
    errors: mpsc::Sender<Error>,
) {
    loop {
        let err = tokio::select! {
            _ = stop.cancelled() => return,
            next = errors_rx.recv() => match next {
                Some(err) => err,
                None => return,
            },
        };
        tokio::select! {
            _ = stop.cancelled() => return,
            sent = errors.send(Error::from_discovery(name.clone(), err)) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn merge(
    stop: CancellationToken,
    mut tagged_rx: mpsc::Receiver<(usize, EndpointGroups)>,
    endpoints: mpsc::Sender<EndpointGroups>,
) {
    let mut latest: BTreeMap<usize, EndpointGroups> = BTreeMap::new();
    loop {
        let (index, groups) = tokio::select! {
            _ = stop.cancelled() => return,
            next = tagged_rx.recv() => match next {
                Some(tagged) => tagged,
                None => return,
            },
        };
        latest.insert(index, groups);
        let merged = flatten(&latest);
        tokio::select! {
            _ = stop.cancelled() => return,
            sent = endpoints.send(merged) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

fn flatten(latest: &BTreeMap<usize, EndpointGroups>) -> EndpointGroups {
    let mut merged = EndpointGroups::new();
    for groups in latest.values() {
        for (upstream, endpoints) in groups {
            merged.insert(upstream.clone(), endpoints.clone());
        }
    }
    merged
}
