//! State-of-the-world discovery stream handling.
//!
//! One task per stream owns all of its state: the node group, and per
//! resource type the requested names plus the last version and nonce sent.
//! Requests and snapshot updates for the stream's group are served from the
//! same `select!` loop, so responses on one stream are always ordered.

use std::collections::HashMap;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::{node_group, SnapshotCache};
use super::ResourceType;
use crate::observability::metrics;

const RESPONSE_CHANNEL_CAPACITY: usize = 100;

/// Tracks the last sent version and nonce for ACK/NACK detection
#[derive(Clone, Debug)]
struct LastDiscoverySnapshot {
    version: String,
    nonce: String,
}

#[derive(Debug, Default)]
struct Watch {
    names: Vec<String>,
    last: Option<LastDiscoverySnapshot>,
}

/// Per-stream protocol state. Every method is synchronous; the stream task
/// only moves requests in and responses out.
struct StreamState {
    cache: Arc<SnapshotCache>,
    label: &'static str,
    /// Type assumed for requests that leave `type_url` empty.
    default_type: Option<ResourceType>,
    node_id: String,
    group: Option<String>,
    watches: HashMap<ResourceType, Watch>,
}

impl StreamState {
    fn new(cache: Arc<SnapshotCache>, label: &'static str, default_type: Option<ResourceType>) -> Self {
        Self {
            cache,
            label,
            default_type,
            node_id: String::new(),
            group: None,
            watches: HashMap::new(),
        }
    }

    fn on_request(&mut self, request: DiscoveryRequest) -> Option<DiscoveryResponse> {
        let resource_type = if request.type_url.is_empty() {
            self.default_type
        } else {
            ResourceType::from_type_url(&request.type_url)
        };
        let Some(resource_type) = resource_type else {
            warn!(stream = self.label, type_url = %request.type_url, "Unsupported resource type requested");
            return None;
        };

        if self.group.is_none() {
            let group = node_group(request.node.as_ref());
            self.node_id = request.node.as_ref().map(|n| n.id.clone()).unwrap_or_default();
            info!(stream = self.label, node_id = %self.node_id, group = %group, "Proxy connected");
            self.group = Some(group);
        }

        let current = self.current_version();
        let watch = self.watches.entry(resource_type).or_default();
        if let Some(last) = &watch.last {
            if !request.response_nonce.is_empty() && request.response_nonce != last.nonce {
                debug!(
                    stream = self.label,
                    type_url = resource_type.type_url(),
                    nonce = %request.response_nonce,
                    "Ignoring request with stale nonce"
                );
                return None;
            }
        }

        if let Some(error_detail) = request.error_detail.as_ref() {
            warn!(
                stream = self.label,
                node_id = %self.node_id,
                type_url = resource_type.type_url(),
                version = %request.version_info,
                error_code = error_detail.code,
                error_message = %error_detail.message,
                "[NACK] Envoy rejected previous response"
            );
        }

        let names_changed = watch.names != request.resource_names;
        watch.names = request.resource_names;
        let needs_response = match (&watch.last, current) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(last), Some(version)) => last.version != version || names_changed,
        };
        if !needs_response {
            debug!(
                stream = self.label,
                type_url = resource_type.type_url(),
                version = %request.version_info,
                "[ACK] Nothing new to send"
            );
            return None;
        }
        self.respond(resource_type)
    }

    /// Responses for every watched type whose version moved.
    fn on_update(&mut self) -> Vec<DiscoveryResponse> {
        let Some(current) = self.current_version() else {
            return Vec::new();
        };
        let stale: Vec<ResourceType> = self
            .watches
            .iter()
            .filter(|(_, watch)| watch.last.as_ref().map(|l| l.version.as_str()) != Some(current.as_str()))
            .map(|(resource_type, _)| *resource_type)
            .collect();
        stale.into_iter().filter_map(|resource_type| self.respond(resource_type)).collect()
    }

    fn is_member(&self, group: &str) -> bool {
        self.group.as_deref() == Some(group)
    }

    fn current_version(&self) -> Option<String> {
        let group = self.group.as_deref()?;
        self.cache.snapshot(group).map(|s| s.version.clone())
    }

    fn respond(&mut self, resource_type: ResourceType) -> Option<DiscoveryResponse> {
        let group = self.group.as_deref()?;
        let snapshot = self.cache.snapshot(group)?;
        let watch = self.watches.entry(resource_type).or_default();

        let span = crate::xds_span!(
            "respond",
            self.node_id,
            group = %group,
            type_url = resource_type.type_url()
        );
        let response = span.in_scope(|| {
            let response = DiscoveryResponse {
                version_info: snapshot.version.clone(),
                resources: snapshot.resources(resource_type, &watch.names),
                type_url: resource_type.type_url().to_string(),
                nonce: Uuid::new_v4().to_string(),
                ..Default::default()
            };
            info!(
                stream = self.label,
                version = %response.version_info,
                nonce = %response.nonce,
                resource_count = response.resources.len(),
                "Sending discovery response"
            );
            response
        });

        watch.last = Some(LastDiscoverySnapshot {
            version: response.version_info.clone(),
            nonce: response.nonce.clone(),
        });
        metrics::record_xds_response(resource_type.type_url());
        Some(response)
    }
}

/// Serve one state-of-the-world stream until the client hangs up, the
/// stream errors, or `stop` is cancelled.
pub fn run_stream_loop<S>(
    cache: Arc<SnapshotCache>,
    mut in_stream: S,
    default_type: Option<ResourceType>,
    label: &'static str,
    stop: CancellationToken,
) -> ReceiverStream<Result<DiscoveryResponse, Status>>
where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
    let mut updates = cache.subscribe();
    let mut state = StreamState::new(cache, label, default_type);

    tokio::spawn(async move {
        metrics::record_stream_opened();
        loop {
            let responses = tokio::select! {
                _ = stop.cancelled() => {
                    info!(stream = label, node_id = %state.node_id, "Shutting down discovery stream");
                    break;
                }
                request = in_stream.next() => match request {
                    Some(Ok(request)) => state.on_request(request).into_iter().collect(),
                    Some(Err(e)) => {
                        warn!(stream = label, error = %e, "Error receiving discovery request");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    None => {
                        info!(stream = label, node_id = %state.node_id, "Discovery stream ended by client");
                        break;
                    }
                },
                update = updates.recv() => match update {
                    Ok(group) if state.is_member(&group) => state.on_update(),
                    Ok(_) => Vec::new(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(stream = label, skipped, "Missed snapshot notifications; resyncing");
                        state.on_update()
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(stream = label, "Snapshot notifications closed");
                        break;
                    }
                },
            };

            let mut receiver_gone = false;
            for response in responses {
                if tx.send(Ok(response)).await.is_err() {
                    receiver_gone = true;
                    break;
                }
            }
            if receiver_gone {
                debug!(stream = label, "Discovery response receiver dropped");
                break;
            }
        }
        metrics::record_stream_closed();
    });

    ReceiverStream::new(rx)
}
