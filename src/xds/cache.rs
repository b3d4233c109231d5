use std::sync::Arc;

use dashmap::DashMap;
use envoy_types::pb::envoy::config::core::v3::Node;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::Snapshot;
use crate::observability::metrics;

/// Group that proxies with an unparseable `node.id` are assigned to.
pub const MISCONFIGURED_GROUP: &str = "misconfigured";

const UPDATE_CHANNEL_CAPACITY: usize = 128;

/// Snapshots keyed by node group, shared by every open discovery stream.
///
/// [`SnapshotCache::set_snapshot`] is the only mutation path; each call
/// notifies the streams of that group so they can push the new version.
pub struct SnapshotCache {
    snapshots: DashMap<String, Arc<Snapshot>>,
    updates: broadcast::Sender<String>,
}

impl SnapshotCache {
    /// A cache whose misconfigured group already serves `fallback`.
    pub fn new(fallback: Snapshot) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let snapshots = DashMap::new();
        snapshots.insert(MISCONFIGURED_GROUP.to_string(), Arc::new(fallback));
        Self { snapshots, updates }
    }

    pub fn set_snapshot(&self, group: &str, snapshot: Snapshot) {
        let version = snapshot.version.clone();
        let previous = self.snapshots.insert(group.to_string(), Arc::new(snapshot));
        if previous.as_ref().map(|s| s.version.as_str()) == Some(version.as_str()) {
            debug!(group = %group, version = %version, "Snapshot unchanged");
            return;
        }

        info!(group = %group, version = %version, "Snapshot updated");
        metrics::record_snapshot_update(group);
        // No receivers just means no proxy of any group is connected.
        let _ = self.updates.send(group.to_string());
    }

    pub fn snapshot(&self, group: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.get(group).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of groups whose snapshot changed, in order of change.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }

    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.snapshots.iter().map(|e| e.key().clone()).collect();
        groups.sort();
        groups
    }
}

/// The group a proxy belongs to: the role part of a `<role>~<instance>`
/// node id. Missing nodes, missing separators and empty parts all map to
/// [`MISCONFIGURED_GROUP`].
pub fn node_group(node: Option<&Node>) -> String {
    let Some(node) = node else {
        return MISCONFIGURED_GROUP.to_string();
    };
    let mut parts = node.id.splitn(2, '~');
    match (parts.next(), parts.next()) {
        (Some(role), Some(instance)) if !role.is_empty() && !instance.is_empty() => role.to_string(),
        _ => MISCONFIGURED_GROUP.to_string(),
    }
}
