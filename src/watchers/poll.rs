use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Error, Result};

/// Loads the current value for a set of refs under a directory. Refs that
/// fail to load are reported and left out of the value.
pub(crate) type Loader<T> = fn(&Path, &[String]) -> (T, Vec<Error>);

/// Polls `dir` for the tracked refs, emitting the loaded value whenever it
/// differs from the last emission and reporting each new set of failures once.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_polling<T>(
    source: &'static str,
    dir: PathBuf,
    interval: Duration,
    stop: CancellationToken,
    mut tracked: watch::Receiver<Vec<String>>,
    out: mpsc::Sender<T>,
    errors: mpsc::Sender<Error>,
    load: Loader<T>,
) where
    T: PartialEq + Clone + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<T> = None;
    let mut last_errors: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!(source, "Stopping directory watcher");
                return;
            }
            changed = tracked.changed() => {
                if changed.is_err() {
                    debug!(source, "Tracked refs sender dropped; stopping directory watcher");
                    return;
                }
            }
            _ = ticker.tick() => {}
        }

        let refs = tracked.borrow_and_update().clone();
        let dir = dir.clone();
        let (value, load_errors) =
            match tokio::task::spawn_blocking(move || load(&dir, &refs)).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(source, error = %e, "Directory load task failed");
                    continue;
                }
            };

        let messages: Vec<String> = load_errors.iter().map(ToString::to_string).collect();
        if messages != last_errors {
            for err in load_errors {
                if errors.send(err).await.is_err() {
                    return;
                }
            }
            last_errors = messages;
        }

        if last.as_ref() != Some(&value) {
            last = Some(value.clone());
            tokio::select! {
                _ = stop.cancelled() => return,
                sent = out.send(value) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Resolve `reference` to a path inside `dir`, refusing anything that would
/// escape it.
pub(crate) fn resolve_ref(dir: &Path, reference: &str, extension: Option<&str>) -> Result<PathBuf> {
    let relative = Path::new(reference);
    let plain = !reference.is_empty()
        && relative.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(Error::validation(format!("ref {:?} is not a plain relative name", reference)));
    }
    Ok(match extension {
        Some(ext) => dir.join(format!("{}.{}", reference, ext)),
        None => dir.join(relative),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_cannot_escape_directory() {
        let dir = Path::new("/var/lib/switchyard");
        assert_eq!(
            resolve_ref(dir, "tls-cert", Some("yaml")).expect("plain ref"),
            PathBuf::from("/var/lib/switchyard/tls-cert.yaml")
        );
        assert!(resolve_ref(dir, "../etc/passwd", None).is_err());
        assert!(resolve_ref(dir, "/etc/passwd", None).is_err());
        assert!(resolve_ref(dir, "", None).is_err());
    }
}
