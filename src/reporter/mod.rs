//! # Status reporting
//!
//! Translation produces one [`ConfigObjectReport`] per object it considered.
//! A [`Reporter`] turns those into accept/reject statuses.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::{Error, MultiError, Result};
use crate::model::{ObjectRef, Status, StatusState};
use crate::observability::metrics;

/// Outcome of translating one configuration object; no error means accepted.
#[derive(Debug)]
pub struct ConfigObjectReport {
    pub object: ObjectRef,
    pub error: Option<MultiError>,
}

impl ConfigObjectReport {
    pub fn new(object: ObjectRef, errors: MultiError) -> Self {
        Self { object, error: errors.into_option() }
    }

    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> Status {
        match &self.error {
            None => Status { state: StatusState::Accepted, reason: None },
            Some(errors) => Status { state: StatusState::Rejected, reason: Some(errors.to_string()) },
        }
    }
}

#[async_trait]
pub trait Reporter: Send + Sync {
    /// Record the status of every reported object. Writing the same reports
    /// twice has no further effect.
    async fn write_reports(&self, reports: &[ConfigObjectReport]) -> Result<()>;
}

/// Logs status transitions and remembers the latest status of every object.
/// Each write is treated as the full set of objects; anything missing from
/// it has been deleted and is forgotten.
#[derive(Default)]
pub struct LoggingReporter {
    statuses: Mutex<HashMap<ObjectRef, Status>>,
}

impl LoggingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last status written for `object`.
    pub fn status(&self, object: &ObjectRef) -> Option<Status> {
        self.statuses.lock().ok().and_then(|statuses| statuses.get(object).cloned())
    }
}

#[async_trait]
impl Reporter for LoggingReporter {
    async fn write_reports(&self, reports: &[ConfigObjectReport]) -> Result<()> {
        let mut statuses = self
            .statuses
            .lock()
            .map_err(|_| Error::internal("reporter status lock poisoned"))?;

        for report in reports {
            let status = report.status();
            if statuses.get(&report.object) == Some(&status) {
                continue;
            }
            match &status.reason {
                None => info!(
                    kind = %report.object.kind,
                    name = %report.object.name,
                    "Config object accepted"
                ),
                Some(reason) => warn!(
                    kind = %report.object.kind,
                    name = %report.object.name,
                    reason = %reason,
                    "Config object rejected"
                ),
            }
            metrics::record_status_change(report.is_accepted());
            statuses.insert(report.object.clone(), status);
        }

        let current: HashSet<&ObjectRef> = reports.iter().map(|r| &r.object).collect();
        statuses.retain(|object, _| current.contains(object));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn rejected(name: &str, message: &str) -> ConfigObjectReport {
        ConfigObjectReport::new(ObjectRef::upstream(name), MultiError::from(Error::validation(message)))
    }

    #[test]
    fn empty_error_set_means_accepted() {
        let report = ConfigObjectReport::new(ObjectRef::role("ingress"), MultiError::new());
        assert!(report.is_accepted());
        assert_eq!(report.status().state, StatusState::Accepted);
    }

    #[tokio::test]
    #[traced_test]
    async fn repeated_statuses_are_logged_once() {
        let reporter = LoggingReporter::new();
        let reports = vec![rejected("svc-a", "no hosts")];

        reporter.write_reports(&reports).await.expect("first write");
        reporter.write_reports(&reports).await.expect("second write");

        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("Config object rejected")).count() {
                1 => Ok(()),
                n => Err(format!("expected one rejection log, saw {}", n)),
            }
        });
        let status = reporter.status(&ObjectRef::upstream("svc-a")).expect("status");
        assert_eq!(status.state, StatusState::Rejected);
        assert!(status.reason.expect("reason").contains("no hosts"));
    }

    #[tokio::test]
    async fn status_transitions_are_recorded() {
        let reporter = LoggingReporter::new();
        reporter.write_reports(&[rejected("svc-a", "no hosts")]).await.expect("write");
        reporter
            .write_reports(&[ConfigObjectReport::new(ObjectRef::upstream("svc-a"), MultiError::new())])
            .await
            .expect("write");

        assert_eq!(
            reporter.status(&ObjectRef::upstream("svc-a")).map(|s| s.state),
            Some(StatusState::Accepted)
        );
    }

    #[tokio::test]
    async fn deleted_objects_are_forgotten() {
        let reporter = LoggingReporter::new();
        reporter
            .write_reports(&[rejected("svc-a", "no hosts"), rejected("svc-b", "no hosts")])
            .await
            .expect("write");
        reporter.write_reports(&[rejected("svc-b", "no hosts")]).await.expect("write");

        assert!(reporter.status(&ObjectRef::upstream("svc-a")).is_none());
        assert!(reporter.status(&ObjectRef::upstream("svc-b")).is_some());
    }
}
