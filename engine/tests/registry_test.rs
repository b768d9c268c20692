//! Integration tests for the worker registry
//!
//! Sessions record every worker they create and forget it once removed, so
//! the registry only ever holds containers a crash could have orphaned.

use slape_engine::daemon::reconcile;
use slape_engine::db::Database;
use slape_engine::pipeline::{PipelineKind, Services, SessionHandle, SessionSettings};
use slape_engine::scope::RequestScope;
use slape_engine::testkit::{FakeRuntime, ScriptedInference, StaticProbe};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn scope() -> RequestScope {
    RequestScope::detached(Duration::from_secs(60))
}

fn session(db: &Database, runtime: &FakeRuntime, kind: PipelineKind) -> SessionHandle {
    let services = Services::new(
        Arc::new(runtime.clone()),
        Arc::new(ScriptedInference::new()),
        Arc::new(StaticProbe::ready_after(0)),
        SessionSettings::default(),
    )
    .with_registry(db.workers());
    SessionHandle::new(kind, Arc::new(services))
}

#[tokio::test]
async fn test_rows_follow_worker_lifetime() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("registry.db")).await.unwrap();
    let runtime = FakeRuntime::new();
    let chain = session(&db, &runtime, PipelineKind::Chain);

    chain
        .setup(vec!["m1".to_string(), "m2".to_string()], scope())
        .await
        .unwrap();

    let rows = db.workers().list_all().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.pipeline == "cot"));
    let mut ports: Vec<i64> = rows.iter().map(|row| row.port).collect();
    ports.sort();
    assert_eq!(ports, vec![8000, 8001]);

    chain.shutdown().await.unwrap();

    assert!(db.workers().list_all().await.unwrap().is_empty());
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_setup_leaves_no_rows() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("registry.db")).await.unwrap();
    let runtime = FakeRuntime::new();
    runtime.fail_create_at(2);
    let debate = session(&db, &runtime, PipelineKind::Debate);

    let result = debate
        .setup(
            vec!["m1".to_string(), "m2".to_string(), "m3".to_string()],
            scope(),
        )
        .await;

    assert!(result.is_err());
    assert!(db.workers().list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registry_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("registry.db");
    let runtime = FakeRuntime::new();

    {
        let db = Database::new(&db_path).await.unwrap();
        let simple = session(&db, &runtime, PipelineKind::Simple);
        simple.setup(vec!["m1".to_string()], scope()).await.unwrap();
        db.close().await.unwrap();
    }

    let db = Database::new(&db_path).await.unwrap();
    let registry = db.workers();
    assert_eq!(registry.list_all().await.unwrap().len(), 1);

    let report = reconcile(&runtime, Some(&registry), true).await.unwrap();

    assert_eq!(report.removed.len(), 1);
    assert!(registry.list_all().await.unwrap().is_empty());
    assert!(runtime.containers().is_empty());
}
