//! # Watchers
//!
//! Push-based sources of the four translation inputs. Each `run` streams
//! values into the provided sender until `stop` is cancelled; the `track_*`
//! calls replace the set of refs a watcher follows.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::model::{Config, EndpointGroups, Files, SecretMap, Upstream};

mod file_config;
mod files;
mod poll;
mod secrets;

pub use file_config::FileConfigWatcher;
pub use files::DirFileWatcher;
pub use secrets::DirSecretWatcher;

#[async_trait]
pub trait ConfigWatcher: Send + Sync {
    async fn run(
        &self,
        stop: CancellationToken,
        configs: mpsc::Sender<Config>,
        errors: mpsc::Sender<Error>,
    );
}

#[async_trait]
pub trait SecretWatcher: Send + Sync {
    async fn run(
        &self,
        stop: CancellationToken,
        secrets: mpsc::Sender<SecretMap>,
        errors: mpsc::Sender<Error>,
    );

    /// Follow exactly `refs` from now on.
    async fn track_secrets(&self, refs: Vec<String>) -> Result<()>;
}

#[async_trait]
pub trait FileWatcher: Send + Sync {
    async fn run(
        &self,
        stop: CancellationToken,
        files: mpsc::Sender<Files>,
        errors: mpsc::Sender<Error>,
    );

    /// Follow exactly `refs` from now on.
    async fn track_files(&self, refs: Vec<String>) -> Result<()>;
}

/// A backend producing endpoints for the upstreams it understands.
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    async fn run(
        &self,
        stop: CancellationToken,
        endpoints: mpsc::Sender<EndpointGroups>,
        errors: mpsc::Sender<Error>,
    );

    /// Discover endpoints for exactly `upstreams` from now on.
    async fn track_upstreams(&self, upstreams: Vec<Upstream>) -> Result<()>;
}
