use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::poll::{resolve_ref, run_polling};
use super::SecretWatcher;
use crate::errors::{Error, Result};
use crate::model::{Secret, SecretMap};

const SOURCE: &str = "secret watcher";

/// Reads each tracked secret from `<dir>/<ref>.yaml`, a flat map of string
/// keys to string values.
pub struct DirSecretWatcher {
    dir: PathBuf,
    interval: Duration,
    tracked: watch::Sender<Vec<String>>,
}

impl DirSecretWatcher {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        let (tracked, _) = watch::channel(Vec::new());
        Self { dir: dir.into(), interval, tracked }
    }
}

#[async_trait]
impl SecretWatcher for DirSecretWatcher {
    async fn run(
        &self,
        stop: CancellationToken,
        secrets: mpsc::Sender<SecretMap>,
        errors: mpsc::Sender<Error>,
    ) {
        run_polling(
            SOURCE,
            self.dir.clone(),
            self.interval,
            stop,
            self.tracked.subscribe(),
            secrets,
            errors,
            load_secrets,
        )
        .await;
    }

    async fn track_secrets(&self, refs: Vec<String>) -> Result<()> {
        self.tracked.send_replace(refs);
        Ok(())
    }
}

fn load_secrets(dir: &Path, refs: &[String]) -> (SecretMap, Vec<Error>) {
    let mut secrets = SecretMap::new();
    let mut errors = Vec::new();
    for reference in refs {
        match load_secret(dir, reference) {
            Ok(secret) => {
                secrets.insert(reference.clone(), secret);
            }
            Err(e) => errors.push(Error::config(format!("secret {}: {}", reference, e))),
        }
    }
    (secrets, errors)
}

fn load_secret(dir: &Path, reference: &str) -> Result<Secret> {
    let path = resolve_ref(dir, reference, Some("yaml"))?;
    let raw = std::fs::read_to_string(&path)?;
    let data: BTreeMap<String, String> = serde_yaml::from_str(&raw)
        .map_err(|e| Error::serialization(path.display().to_string(), e))?;
    Ok(Secret { data })
}
