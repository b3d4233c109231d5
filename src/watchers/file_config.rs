use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ConfigWatcher;
use crate::errors::{Error, Result};
use crate::model::Config;

/// Polls a YAML file holding the whole [`Config`].
pub struct FileConfigWatcher {
    path: PathBuf,
    interval: Duration,
}

impl FileConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self { path: path.into(), interval }
    }
}

#[async_trait]
impl ConfigWatcher for FileConfigWatcher {
    async fn run(
        &self,
        stop: CancellationToken,
        configs: mpsc::Sender<Config>,
        errors: mpsc::Sender<Error>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last: Option<Config> = None;
        let mut last_error: Option<String> = None;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(path = %self.path.display(), "Stopping config file watcher");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match read_config(&self.path).await {
                Ok(cfg) => {
                    last_error = None;
                    if last.as_ref() == Some(&cfg) {
                        continue;
                    }
                    info!(
                        path = %self.path.display(),
                        upstreams = cfg.upstreams.len(),
                        virtual_services = cfg.virtual_services.len(),
                        roles = cfg.roles.len(),
                        "Config file changed"
                    );
                    last = Some(cfg.clone());
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        sent = configs.send(cfg) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    if last_error.as_deref() != Some(message.as_str()) {
                        last_error = Some(message);
                        if errors.send(e).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn read_config(path: &Path) -> Result<Config> {
    let raw = tokio::fs::read_to_string(path).await?;
    serde_yaml::from_str(&raw).map_err(|e| Error::serialization(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_parsed_config_then_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("switchyard.yaml");
        std::fs::write(&path, "upstreams:\n  - name: svc-a\n    type: static\n").expect("write config");

        let watcher = FileConfigWatcher::new(&path, Duration::from_millis(10));
        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let (err_tx, mut err_rx) = mpsc::channel(4);
        let handle = {
            let stop = stop.clone();
            tokio::spawn(async move { watcher.run(stop, tx, err_tx).await })
        };

        let cfg = rx.recv().await.expect("config");
        assert_eq!(cfg.upstreams[0].name, "svc-a");

        std::fs::write(&path, "upstreams: [[[").expect("corrupt config");
        let err = err_rx.recv().await.expect("parse error");
        assert!(matches!(err, Error::Serialization { .. }));

        stop.cancel();
        handle.await.expect("watcher task");
    }
}
