//! # Translation driver
//!
//! [`Syncer`] consumes emitter snapshots, translates every role when the
//! inputs actually changed, publishes each role's snapshot under its group
//! and hands the merged reports to the [`Reporter`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::{MultiError, Result};
use crate::model::ObjectRef;
use crate::observability::metrics;
use crate::reporter::{ConfigObjectReport, Reporter};
use crate::snapshot::Cache;
use crate::translator::Translator;
use crate::xds::{SnapshotCache, MISCONFIGURED_GROUP};

pub struct Syncer {
    translator: Translator,
    cache: Arc<SnapshotCache>,
    reporter: Arc<dyn Reporter>,
    /// Hash of the last inputs whose reports were written.
    last_hash: Option<u64>,
}

impl Syncer {
    pub fn new(translator: Translator, cache: Arc<SnapshotCache>, reporter: Arc<dyn Reporter>) -> Self {
        Self { translator, cache, reporter, last_hash: None }
    }

    /// Translate and publish `inputs`. Inputs without a config, or with the
    /// same hash as the last successful sync, are skipped.
    pub async fn sync(&mut self, inputs: &Cache) -> Result<()> {
        let Some(cfg) = inputs.cfg.as_deref() else {
            debug!("No config received yet; skipping sync");
            return Ok(());
        };
        let hash = inputs.hash();
        if self.last_hash == Some(hash) {
            debug!(hash, "Inputs unchanged; skipping sync");
            return Ok(());
        }

        let mut merged: BTreeMap<ObjectRef, MultiError> = BTreeMap::new();
        for upstream in &cfg.upstreams {
            merged.entry(ObjectRef::upstream(&upstream.name)).or_default();
        }
        for vs in &cfg.virtual_services {
            merged.entry(ObjectRef::virtual_service(&vs.name)).or_default();
        }

        for role in &cfg.roles {
            let started = Instant::now();
            let (snapshot, reports) = self.translator.translate(role, inputs);
            let rejected = reports.iter().filter(|r| !r.is_accepted()).count();
            metrics::record_translation(&role.name, rejected, started.elapsed().as_secs_f64());
            // The misconfigured group always serves the fallback.
            if role.name != MISCONFIGURED_GROUP {
                self.cache.set_snapshot(&role.name, snapshot);
            }
            merge_reports(&mut merged, reports);
        }

        let reports: Vec<ConfigObjectReport> = merged
            .into_iter()
            .map(|(object, errors)| ConfigObjectReport::new(object, errors))
            .collect();
        self.reporter.write_reports(&reports).await?;
        self.last_hash = Some(hash);

        info!(roles = cfg.roles.len(), objects = reports.len(), "Sync complete");
        Ok(())
    }

    /// Sync every received snapshot until `stop` is cancelled or the emitter
    /// goes away. A failed sync is logged and retried on the next snapshot.
    pub async fn run(mut self, mut snapshots: mpsc::Receiver<Cache>, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                received = snapshots.recv() => {
                    let Some(inputs) = received else { break };
                    if let Err(e) = self.sync(&inputs).await {
                        error!(error = %e, "Sync failed");
                    }
                }
            }
        }
        debug!("Syncer stopped");
    }
}

/// Fold per-role reports into one report per object. An object shared by
/// several roles collects every distinct error.
fn merge_reports(merged: &mut BTreeMap<ObjectRef, MultiError>, reports: Vec<ConfigObjectReport>) {
    for report in reports {
        let slot = merged.entry(report.object).or_default();
        let Some(errors) = report.error else { continue };
        for err in errors.into_errors() {
            let message = err.to_string();
            if !slot.errors().iter().any(|existing| existing.to_string() == message) {
                slot.push(err);
            }
        }
    }
}
