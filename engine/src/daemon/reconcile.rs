//! Orphan recovery
//!
//! No session survives a restart, so every worker container that is still
//! around when the service starts is an orphan: either a row left in the
//! registry or a container carrying the `slape.managed` label. Both sources
//! are merged because a crash can land between a create call and the
//! registry insert, or between a remove call and the row delete.

use sdk::errors::EngineError;
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::container::ContainerRuntime;
use crate::db::WorkerRepository;

/// What a reconciliation pass found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Every orphaned container id, sorted
    pub orphans: Vec<String>,
    /// Orphans that were stopped and removed
    pub removed: Vec<String>,
    /// Orphans whose removal failed; their rows are kept for the next pass
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}

/// Find orphaned workers and, when `remove` is set, stop and remove them
///
/// Stop and remove are best effort per container. A failure to list the
/// runtime's containers is returned; a failure to read the registry is
/// logged and the pass continues with the runtime's view.
pub async fn reconcile(
    runtime: &dyn ContainerRuntime,
    registry: Option<&WorkerRepository>,
    remove: bool,
) -> Result<ReconcileReport, EngineError> {
    let mut orphans = BTreeSet::new();

    if let Some(registry) = registry {
        match registry.list_all().await {
            Ok(rows) => orphans.extend(rows.into_iter().map(|row| row.container_id)),
            Err(e) => warn!("Failed to read worker registry: {}", e),
        }
    }

    let managed = runtime.list_managed().await?;
    orphans.extend(managed.into_iter().map(|container| container.id));

    let mut report = ReconcileReport {
        orphans: orphans.into_iter().collect(),
        ..ReconcileReport::default()
    };

    if report.orphans.is_empty() {
        info!("No orphaned workers found");
        return Ok(report);
    }

    info!(count = report.orphans.len(), "Found orphaned workers");
    if !remove {
        return Ok(report);
    }

    for id in &report.orphans {
        if let Err(e) = runtime.stop_worker(id).await {
            warn!(container = %id, error = %e, "Failed to stop orphaned worker");
        }

        match runtime.remove_worker(id).await {
            Ok(()) => {
                info!(container = %id, "Removed orphaned worker");
                report.removed.push(id.clone());

                if let Some(registry) = registry {
                    if let Err(e) = registry.delete(id).await {
                        warn!(container = %id, error = %e, "Failed to delete registry row");
                    }
                }
            }
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to remove orphaned worker");
                report.failed.push(id.clone());
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, WorkerRecord};
    use crate::testkit::{FakeRuntime, RuntimeCall};
    use tempfile::TempDir;

    async fn registry(dir: &TempDir) -> (Database, WorkerRepository) {
        let db = Database::new(&dir.path().join("registry.db")).await.unwrap();
        let repo = db.workers();
        (db, repo)
    }

    #[tokio::test]
    async fn test_merges_registry_and_labels() {
        let dir = TempDir::new().unwrap();
        let (_db, repo) = registry(&dir).await;
        let runtime = FakeRuntime::new();

        // row without container, container without row, and both
        repo.record(&WorkerRecord::new("gone", "s1", "cot", 0, 8000, "m1"))
            .await
            .unwrap();
        repo.record(&WorkerRecord::new("both", "s1", "cot", 1, 8001, "m2"))
            .await
            .unwrap();
        runtime.add_existing("both", Some("s1"), true);
        runtime.add_existing("unrecorded", Some("s2"), false);

        let report = reconcile(&runtime, Some(&repo), true).await.unwrap();

        assert_eq!(report.orphans, vec!["both", "gone", "unrecorded"]);
        assert_eq!(report.removed, report.orphans);
        assert!(report.failed.is_empty());
        assert!(runtime.containers().is_empty());
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stops_before_removing() {
        let runtime = FakeRuntime::new();
        runtime.add_existing("w", Some("s1"), true);

        reconcile(&runtime, None, true).await.unwrap();

        let calls = runtime.calls();
        let stop = calls.iter().position(|c| *c == RuntimeCall::Stop("w".to_string()));
        let remove = calls.iter().position(|c| *c == RuntimeCall::Remove("w".to_string()));
        assert!(stop.unwrap() < remove.unwrap());
    }

    #[tokio::test]
    async fn test_dry_run_leaves_everything() {
        let dir = TempDir::new().unwrap();
        let (_db, repo) = registry(&dir).await;
        let runtime = FakeRuntime::new();
        repo.record(&WorkerRecord::new("w", "s1", "simple", 0, 8000, "m1"))
            .await
            .unwrap();
        runtime.add_existing("w", Some("s1"), true);

        let report = reconcile(&runtime, Some(&repo), false).await.unwrap();

        assert_eq!(report.orphans, vec!["w"]);
        assert!(report.removed.is_empty());
        assert_eq!(runtime.running(), vec!["w"]);
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_row() {
        let dir = TempDir::new().unwrap();
        let (_db, repo) = registry(&dir).await;
        let runtime = FakeRuntime::new();
        repo.record(&WorkerRecord::new("stuck", "s1", "debate", 0, 8000, "m1"))
            .await
            .unwrap();
        runtime.add_existing("stuck", Some("s1"), true);
        runtime.fail_stop("stuck");
        runtime.fail_remove("stuck");

        let report = reconcile(&runtime, Some(&repo), true).await.unwrap();

        assert_eq!(report.failed, vec!["stuck"]);
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let runtime = FakeRuntime::new();

        let report = reconcile(&runtime, None, true).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(runtime.calls(), vec![RuntimeCall::List]);
    }
}
