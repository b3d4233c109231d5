use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::poll::{resolve_ref, run_polling};
use super::FileWatcher;
use crate::errors::{Error, Result};
use crate::model::{FileContents, Files};

const SOURCE: &str = "file watcher";

/// Reads each tracked file verbatim from `<dir>/<ref>`.
pub struct DirFileWatcher {
    dir: PathBuf,
    interval: Duration,
    tracked: watch::Sender<Vec<String>>,
}

impl DirFileWatcher {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        let (tracked, _) = watch::channel(Vec::new());
        Self { dir: dir.into(), interval, tracked }
    }
}

#[async_trait]
impl FileWatcher for DirFileWatcher {
    async fn run(
        &self,
        stop: CancellationToken,
        files: mpsc::Sender<Files>,
        errors: mpsc::Sender<Error>,
    ) {
        run_polling(
            SOURCE,
            self.dir.clone(),
            self.interval,
            stop,
            self.tracked.subscribe(),
            files,
            errors,
            load_files,
        )
        .await;
    }

    async fn track_files(&self, refs: Vec<String>) -> Result<()> {
        self.tracked.send_replace(refs);
        Ok(())
    }
}

fn load_files(dir: &Path, refs: &[String]) -> (Files, Vec<Error>) {
    let mut files = Files::new();
    let mut errors = Vec::new();
    for reference in refs {
        let loaded = resolve_ref(dir, reference, None)
            .and_then(|path| std::fs::read(path).map_err(Error::from));
        match loaded {
            Ok(contents) => {
                files.insert(reference.clone(), FileContents { contents });
            }
            Err(e) => errors.push(Error::config(format!("file {}: {}", reference, e))),
        }
    }
    (files, errors)
}
