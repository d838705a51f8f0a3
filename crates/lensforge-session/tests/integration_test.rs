//! End-to-end scenarios across the manager, persistence and middleware.

use std::sync::Arc;
use std::time::Duration;

use lensforge_core::config::BackendKind;
use lensforge_core::{Config, ContextEntry, EvolutionStage, Lens, MetricUpdate};
use lensforge_session::{PersistenceHandler, SessionMiddleware, StateError, StateManager};
use serde_json::json;
use tempfile::TempDir;

fn file_config(dir: &TempDir, compression: bool) -> Config {
    let mut config = Config::default();
    config.persistence.backend = BackendKind::File;
    config.persistence.location = dir.path().join("state");
    config.persistence.compression = compression;
    config
}

fn memory_manager(f: impl FnOnce(&mut Config)) -> StateManager {
    let mut config = Config::default();
    f(&mut config);
    StateManager::with_persistence(config, PersistenceHandler::in_memory())
}

#[tokio::test]
async fn test_session_limit_evicts_oldest_activity() {
    let manager = memory_manager(|c| c.limits.max_sessions = 3);

    let mut created = Vec::new();
    for i in 0..6 {
        created.push(manager.create_session(&format!("user-{}", i), None));
        assert!(manager.session_count() <= 3);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Touching the first survivor makes it the most recent.
    manager
        .update_metrics(&created[3].id, MetricUpdate::TotalGenerations)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.create_session("user-6", None);

    assert_eq!(manager.session_count(), 3);
    assert!(manager.get_session(&created[3].id).is_some());
    assert!(manager.get_session(&created[4].id).is_none());
    assert!(manager.get_session(&created[5].id).is_some());
}

#[tokio::test]
async fn test_fifty_five_snapshots_keep_fifty() {
    let manager = memory_manager(|c| c.limits.max_snapshots = 50);
    let session = manager.create_session("u1", Some("test"));

    for i in 0..55 {
        manager
            .add_to_context(&session.id, ContextEntry::Lens(Lens::new(format!("lens {}", i), vec![])))
            .unwrap();
        manager.create_snapshot(&session.id).unwrap();
    }

    let snapshots = manager.list_snapshots(&session.id);
    assert_eq!(snapshots.len(), 50);
    assert_eq!(snapshots[0].state.context.generated_lenses.len(), 6);
    assert_eq!(snapshots[49].state.context.generated_lenses.len(), 55);
}

#[tokio::test]
async fn test_rollback_then_mutation_leaves_snapshot_intact() {
    let manager = memory_manager(|_| {});
    let session = manager.create_session("u1", Some("test"));
    manager
        .add_to_context(
            &session.id,
            ContextEntry::Evolution {
                original_idea: "lamp".into(),
                stage: EvolutionStage::new("lamp that listens", "personify", 3.0),
            },
        )
        .unwrap();
    let snapshot = manager.create_snapshot(&session.id).unwrap();

    manager
        .add_to_context(&session.id, ContextEntry::Lens(Lens::new("after", vec![])))
        .unwrap();
    manager.rollback_to_snapshot(&snapshot.id).unwrap();

    let live = manager.get_session(&session.id).unwrap();
    assert_eq!(live.context, snapshot.state.context);

    manager
        .add_to_context(
            &session.id,
            ContextEntry::Evolution {
                original_idea: "lamp".into(),
                stage: EvolutionStage::new("lamp that sings", "amplify", 6.0),
            },
        )
        .unwrap();

    let stored = manager
        .list_snapshots(&session.id)
        .into_iter()
        .find(|s| s.id == snapshot.id)
        .unwrap();
    assert_eq!(stored.state.context.evolution_chains[0].stages.len(), 1);
    assert!(manager.verify_snapshot(&stored));
}

#[tokio::test]
async fn test_file_backend_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    let first = StateManager::new(file_config(&dir, true));
    let session = first.create_session("u1", Some("portable bridges"));
    first
        .update_metrics(&session.id, MetricUpdate::Domain("architecture".into()))
        .unwrap();
    first.create_snapshot(&session.id).unwrap();
    first.save_state().await.unwrap();

    assert!(dir.path().join("state").join("state.json").exists());
    assert!(dir
        .path()
        .join("state")
        .join(format!("session_{}.json", session.id))
        .exists());

    let second = StateManager::new(file_config(&dir, false));
    assert_eq!(second.load_state().await.unwrap(), 1);
    let restored = second.get_session(&session.id).unwrap();
    assert_eq!(restored.context.current_problem, "portable bridges");
    assert!(restored.metrics.unique_domains_used.contains("architecture"));
    assert_eq!(second.list_snapshots(&session.id).len(), 1);
}

#[tokio::test]
async fn test_export_import_between_managers() {
    let source = memory_manager(|_| {});
    let session = source.create_session("u1", Some("test"));
    source
        .update_metrics(&session.id, MetricUpdate::Domain("biology".into()))
        .unwrap();
    source
        .update_metrics(&session.id, MetricUpdate::ToolUsage("generate_lens".into()))
        .unwrap();
    source.create_snapshot(&session.id).unwrap();

    let blob = source.export_session(&session.id).unwrap();
    let document: serde_json::Value = serde_json::from_str(&blob).unwrap();
    assert_eq!(document["version"], "1.0");
    assert!(document["report"].is_object());
    assert!(document["exportTimestamp"].is_string());

    let target = memory_manager(|_| {});
    let imported = target.import_session(&blob).unwrap();
    assert_ne!(imported.id, session.id);
    assert_eq!(imported.user_id, "u1");
    assert_eq!(imported.context.current_problem, "test");
    assert!(imported.metrics.unique_domains_used.contains("biology"));
    assert_eq!(imported.metrics.tool_usage.get("generate_lens"), Some(&1));
    assert_eq!(target.list_snapshots(&imported.id).len(), 1);

    assert!(matches!(
        source.export_session("missing"),
        Err(StateError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_middleware_session_flow() {
    let manager = Arc::new(memory_manager(|c| c.persistence.auto_save_interval_ms = 1));
    let middleware = SessionMiddleware::new(Arc::clone(&manager));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let first = middleware
        .around(
            "generate_lens",
            json!({ "userId": "u1", "problem": "quiet cities" }),
            |_id, _args| async {
                Ok(json!({ "prompt": "a city as a library", "domains": ["libraries"], "madnessLevel": 4.0 }))
            },
        )
        .await
        .unwrap();

    let second = middleware
        .around(
            "evolve_idea",
            json!({ "sessionId": first.session_id }),
            |_id, _args| async {
                Ok(json!({ "originalIdea": "a city as a library", "idea": "streets as shelves", "pattern": "extend", "madnessLevel": 6.0 }))
            },
        )
        .await
        .unwrap();
    assert_eq!(first.session_id, second.session_id);

    let session = manager.get_session(&first.session_id).unwrap();
    assert_eq!(session.user_id, "u1");
    assert_eq!(session.metrics.total_generations, 2);
    assert!((session.metrics.average_madness_index - 5.0).abs() < 1e-9);
    assert_eq!(session.metrics.tool_usage["generate_lens"], 1);
    assert_eq!(session.metrics.tool_usage["evolve_idea"], 1);
    assert_eq!(manager.list_snapshots(&session.id).len(), 2);
    assert!(manager.persistence().exists("state").await.unwrap());
}

#[tokio::test]
async fn test_redis_backend_save_fails_with_typed_error() {
    let mut config = Config::default();
    config.persistence.backend = BackendKind::Redis;
    let manager = StateManager::new(config);
    manager.create_session("u1", None);

    let err = manager.save_state().await.unwrap_err();
    assert!(matches!(err, StateError::Persistence(_)));
}
