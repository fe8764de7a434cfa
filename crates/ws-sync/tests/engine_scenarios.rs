//! End-to-end engine scenarios over a pair of in-memory connectors.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use ws_connectors::memory::MemoryConnector;
use ws_core::error::WsError;
use ws_core::store::Store;
use ws_core::types::*;
use ws_mapping::MappingEngine;
use ws_sync::conflict::ConflictResolver;
use ws_sync::{ItemAction, SyncEngine};

struct Fixture {
    store: Arc<Store>,
    config: SyncConfig,
    a: MemoryConnector,
    b: MemoryConnector,
    mapping: Arc<MappingEngine>,
}

impl Fixture {
    fn engine(&self) -> SyncEngine {
        SyncEngine::with_connectors(
            self.store.clone(),
            self.mapping.clone(),
            self.config.clone(),
            Arc::new(self.a.clone()),
            Arc::new(self.b.clone()),
        )
    }

    fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(
            self.store.clone(),
            self.config.clone(),
            Arc::new(self.a.clone()),
            Arc::new(self.b.clone()),
        )
    }
}

fn discovered_task_type(statuses: &[(&str, &str)]) -> DiscoveredType {
    DiscoveredType {
        type_name: "Task".into(),
        type_id: "task".into(),
        fields: ["title", "description", "state"]
            .iter()
            .map(|reference| DiscoveredField {
                reference_name: (*reference).to_string(),
                display_name: reference.to_uppercase(),
                data_type: FieldDataType::String,
                required: *reference == "title",
                read_only: false,
                allowed_values: vec![],
                default_value: None,
                suggestion_score: 50,
            })
            .collect(),
        statuses: statuses
            .iter()
            .enumerate()
            .map(|(i, (name, value))| DiscoveredStatus {
                name: (*name).to_string(),
                value: (*value).to_string(),
                category: StatusCategory::Proposed,
                sort_order: i as i32,
            })
            .collect(),
    }
}

async fn fixture(configure: impl FnOnce(&mut SyncConfig)) -> Fixture {
    let store = Arc::new(Store::open_in_memory().await.unwrap());

    let conn_a = ConnectorRecord::new("source", "memory", "mem://a", AuthKind::Pat, "00");
    let conn_b = ConnectorRecord::new("target", "memory", "mem://b", AuthKind::Pat, "00");
    store.insert_connector(&conn_a).await.unwrap();
    store.insert_connector(&conn_b).await.unwrap();

    store
        .save_discovered_metadata(
            conn_a.id,
            vec![discovered_task_type(&[("New", "new"), ("Active", "active")])],
        )
        .await
        .unwrap();
    store
        .save_discovered_metadata(
            conn_b.id,
            vec![discovered_task_type(&[("Open", "open"), ("Active", "active")])],
        )
        .await
        .unwrap();

    let mut config = SyncConfig::new("a-to-b", conn_a.id, conn_b.id);
    configure(&mut config);
    store.insert_sync_config(&config).await.unwrap();

    // Task → Task with title/description direct mappings and New → Open.
    let src_type = &store.list_types(conn_a.id).await.unwrap()[0];
    let tgt_type = &store.list_types(conn_b.id).await.unwrap()[0];
    let tm = TypeMapping {
        id: Uuid::new_v4(),
        sync_config_id: config.id,
        source_type_id: src_type.id,
        target_type_id: tgt_type.id,
        active: true,
    };
    store.insert_type_mapping(&tm).await.unwrap();

    let src_fields = store.list_fields(src_type.id).await.unwrap();
    let tgt_fields = store.list_fields(tgt_type.id).await.unwrap();
    let field_id = |fields: &[FieldMeta], name: &str| {
        fields.iter().find(|f| f.reference_name == name).unwrap().id
    };
    for reference in ["title", "description"] {
        store
            .insert_field_mapping(&FieldMapping {
                id: Uuid::new_v4(),
                type_mapping_id: tm.id,
                source_field_id: Some(field_id(&src_fields, reference)),
                target_field_id: Some(field_id(&tgt_fields, reference)),
                mapping_kind: MappingKind::Direct,
                constant_value: None,
                transformation: None,
                reverse_transformation: None,
                required: reference == "title",
            })
            .await
            .unwrap();
    }

    let src_statuses = store.list_statuses(src_type.id).await.unwrap();
    let tgt_statuses = store.list_statuses(tgt_type.id).await.unwrap();
    let status_id = |statuses: &[StatusMeta], name: &str| {
        statuses.iter().find(|s| s.name == name).unwrap().id
    };
    for (src_name, tgt_name) in [("New", "Open"), ("Active", "Active")] {
        store
            .insert_status_mapping(&StatusMapping {
                id: Uuid::new_v4(),
                type_mapping_id: tm.id,
                source_status_id: status_id(&src_statuses, src_name),
                target_status_id: status_id(&tgt_statuses, tgt_name),
            })
            .await
            .unwrap();
    }

    let a = MemoryConnector::new("A");
    let b = MemoryConnector::new("B");
    b.set_next_id(7);

    Fixture {
        mapping: Arc::new(MappingEngine::new(store.clone())),
        store,
        config,
        a,
        b,
    }
}

fn options() -> SyncOptions {
    SyncOptions::default()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_time_sync_creates_identity() {
    let f = fixture(|_| {}).await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let report = f
        .engine()
        .execute(options(), ExecutionTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(report.errors, 0);

    let created = f.b.created_calls();
    assert_eq!(created.len(), 1);
    let (id, item_type, fields) = &created[0];
    assert_eq!(id, "B-7");
    assert_eq!(item_type, "Task");
    assert_eq!(fields["title"], json!("Hello"));
    assert_eq!(fields["state"], json!("Open"));

    let identity = f
        .store
        .get_synced_item(f.config.id, f.config.source_connector_id, "A-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.target_item_id, "B-7");
    assert_eq!(identity.sync_count, 1);
    assert_eq!(identity.status, SyncedStatus::Synced);

    let execs = f.store.list_executions(f.config.id).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecutionStatus::Completed);
    assert_eq!(execs[0].items_created, 1);
    assert!(f
        .store
        .get_sync_config(f.config.id)
        .await
        .unwrap()
        .unwrap()
        .last_sync_at
        .is_some());
}

#[tokio::test]
async fn re_sync_updates_instead_of_creating() {
    let f = fixture(|_| {}).await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let engine = f.engine();
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    f.a.set_field("A-1", "title", json!("Hello world"));
    let report = engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 1);
    assert_eq!(f.b.created_calls().len(), 1, "no second create");

    let updates = f.b.updated_calls();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "B-7");
    assert_eq!(updates[0].1["title"], json!("Hello world"));
    assert_eq!(updates[0].1["state"], json!("Open"));

    let identity = f
        .store
        .get_synced_item(f.config.id, f.config.source_connector_id, "A-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.sync_count, 2);
}

#[tokio::test]
async fn bidirectional_field_conflict_last_write_wins() {
    let f = fixture(|cfg| {
        cfg.direction = ConfigDirection::Bidirectional;
        cfg.track_versions = true;
        cfg.conflict_strategy = ConflictStrategy::LastWriteWins;
    })
    .await;
    f.a.seed_item(
        "A-1",
        "Task",
        &[
            ("title", json!("Hello")),
            ("state", json!("New")),
            ("changedDate", json!("2026-03-01T00:00:00+00:00")),
        ],
    );

    let engine = f.engine();
    // Bootstrap the pair with a forward pass.
    engine
        .execute(
            SyncOptions {
                direction: Some(SyncDirection::SourceToTarget),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    // Both sides modified; source is newer.
    f.a.set_field("A-1", "title", json!("S"));
    f.a.set_field("A-1", "changedDate", json!("2026-03-03T00:00:00+00:00"));
    f.b.set_field("B-7", "title", json!("T"));
    f.b.set_field("B-7", "changedDate", json!("2026-03-02T00:00:00+00:00"));

    let report = engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.conflicts_manual, 0);

    let conflicts = f.store.list_conflicts(f.config.id, None).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let c = &conflicts[0];
    assert_eq!(c.kind, ConflictKind::FieldConflict);
    assert_eq!(c.field_name.as_deref(), Some("title"));
    assert_eq!(c.source_value, Some(json!("S")));
    assert_eq!(c.target_value, Some(json!("T")));
    assert_eq!(c.base_value, Some(json!("Hello")));
    assert_eq!(c.status, ConflictStatus::Resolved);
    assert_eq!(c.resolution_strategy, Some(ConflictStrategy::LastWriteWins));
    assert_eq!(c.resolved_value, Some(json!("S")));

    // The winning source value landed on the target.
    assert_eq!(f.b.get_item("B-7").unwrap().field_str("title"), Some("S"));

    let execs = f.store.list_executions(f.config.id).await.unwrap();
    let bidi = execs
        .iter()
        .find(|e| e.direction == SyncDirection::Bidirectional)
        .unwrap();
    assert_eq!(bidi.conflicts_detected, 1);
    assert_eq!(bidi.conflicts_resolved, 1);
}

#[tokio::test]
async fn manual_strategy_leaves_conflict_unresolved_until_a_human_acts() {
    let f = fixture(|cfg| {
        cfg.direction = ConfigDirection::Bidirectional;
        cfg.track_versions = true;
        cfg.conflict_strategy = ConflictStrategy::Manual;
    })
    .await;
    f.a.seed_item(
        "A-1",
        "Task",
        &[("title", json!("Hello")), ("state", json!("New"))],
    );

    let engine = f.engine();
    engine
        .execute(
            SyncOptions {
                direction: Some(SyncDirection::SourceToTarget),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    f.a.set_field("A-1", "title", json!("S"));
    f.b.set_field("B-7", "title", json!("T"));
    let writes_before = (f.a.updated_calls().len(), f.b.updated_calls().len());

    let report = engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_resolved, 0);
    assert_eq!(report.conflicts_manual, 1);
    assert_eq!(report.errors, 0);

    let conflicts = f
        .store
        .list_conflicts(f.config.id, Some(ConflictStatus::Unresolved))
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    // Neither side was written for the conflicted field.
    assert_eq!(f.a.updated_calls().len(), writes_before.0);
    assert_eq!(f.b.updated_calls().len(), writes_before.1);
    assert_eq!(f.a.get_item("A-1").unwrap().field_str("title"), Some("S"));
    assert_eq!(f.b.get_item("B-7").unwrap().field_str("title"), Some("T"));

    // A human picks the target value; bidirectional convergence writes both.
    f.resolver()
        .resolve_manually(conflicts[0].id, json!("T"), "chose target", "alice")
        .await
        .unwrap();
    let row = f.store.get_conflict(conflicts[0].id).await.unwrap().unwrap();
    assert_eq!(row.status, ConflictStatus::Resolved);
    assert_eq!(row.resolved_by.as_deref(), Some("alice"));
    assert_eq!(f.a.get_item("A-1").unwrap().field_str("title"), Some("T"));
    assert_eq!(f.b.get_item("B-7").unwrap().field_str("title"), Some("T"));
}

#[tokio::test]
async fn disjoint_changes_converge_without_conflict_rows() {
    let f = fixture(|cfg| {
        cfg.direction = ConfigDirection::Bidirectional;
        cfg.track_versions = true;
        cfg.conflict_strategy = ConflictStrategy::Merge;
    })
    .await;
    f.a.seed_item(
        "A-1",
        "Task",
        &[
            ("title", json!("Hello")),
            ("description", json!("original")),
            ("state", json!("New")),
        ],
    );

    let engine = f.engine();
    engine
        .execute(
            SyncOptions {
                direction: Some(SyncDirection::SourceToTarget),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    // Disjoint edits: source changes the title, target the description.
    f.a.set_field("A-1", "title", json!("S"));
    f.b.set_field("B-7", "description", json!("target edit"));

    let report = engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();
    assert_eq!(report.conflicts_detected, 0);
    assert!(f.store.list_conflicts(f.config.id, None).await.unwrap().is_empty());

    // Both sides converged.
    assert_eq!(f.b.get_item("B-7").unwrap().field_str("title"), Some("S"));
    assert_eq!(
        f.a.get_item("A-1").unwrap().field_str("description"),
        Some("target edit")
    );
}

#[tokio::test]
async fn only_source_changed_flows_source_to_target() {
    let f = fixture(|cfg| {
        cfg.direction = ConfigDirection::Bidirectional;
        cfg.track_versions = true;
    })
    .await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let engine = f.engine();
    engine
        .execute(
            SyncOptions {
                direction: Some(SyncDirection::SourceToTarget),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    f.a.set_field("A-1", "title", json!("Newer"));
    let report = engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.conflicts_detected, 0);
    assert!(report.items.iter().any(|i| i.action == ItemAction::SourceToTarget));
    assert_eq!(f.b.get_item("B-7").unwrap().field_str("title"), Some("Newer"));

    // Nothing changed: the next pass skips the pair.
    let idle = engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();
    assert_eq!(idle.skipped, 1);
    assert_eq!(idle.updated, 0);
}

#[tokio::test]
async fn only_target_changed_flows_back_with_reverse_mapping() {
    let f = fixture(|cfg| {
        cfg.direction = ConfigDirection::Bidirectional;
        cfg.track_versions = true;
    })
    .await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let engine = f.engine();
    engine
        .execute(
            SyncOptions {
                direction: Some(SyncDirection::SourceToTarget),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    f.b.set_field("B-7", "title", json!("Edited on target"));
    let report = engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    assert!(report.items.iter().any(|i| i.action == ItemAction::TargetToSource));
    assert_eq!(
        f.a.get_item("A-1").unwrap().field_str("title"),
        Some("Edited on target")
    );
}

#[tokio::test]
async fn bidirectional_without_version_tracking_is_rejected() {
    let f = fixture(|cfg| {
        cfg.direction = ConfigDirection::Bidirectional;
        cfg.track_versions = false;
    })
    .await;
    let err = f
        .engine()
        .execute(options(), ExecutionTrigger::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, WsError::Configuration(_)));
    assert!(f.store.list_executions(f.config.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn dry_run_performs_zero_writes() {
    let f = fixture(|cfg| cfg.track_versions = true).await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let report = f
        .engine()
        .execute(
            SyncOptions {
                dry_run: true,
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    assert_eq!(report.total, 1);
    assert_eq!(report.created, 1);
    assert!(report.execution_id.is_none());

    assert!(f.b.created_calls().is_empty());
    assert!(f.b.updated_calls().is_empty());
    assert_eq!(f.store.count_synced_items(f.config.id).await.unwrap(), 0);
    assert!(f.store.list_executions(f.config.id).await.unwrap().is_empty());
    assert_eq!(
        f.store
            .count_versions(f.config.id, f.config.source_connector_id, "A-1")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn preview_classifies_create_update_and_reports_mapped_fields() {
    let f = fixture(|_| {}).await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);
    f.a.seed_item("A-2", "Epic", &[("title", json!("Unmapped type"))]);

    let engine = f.engine();
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();
    f.a.seed_item("A-3", "Task", &[("title", json!("Fresh")), ("state", json!("New"))]);

    let preview = engine.preview(options()).await.unwrap();
    // The default filter only selects mapped source types, so A-2 is absent.
    assert_eq!(preview.total, 2);
    assert_eq!(preview.update_count, 1);
    assert_eq!(preview.create_count, 1);

    let update = preview.items.iter().find(|i| i.source_id == "A-1").unwrap();
    assert_eq!(update.target_id.as_deref(), Some("B-7"));
    assert_eq!(update.sync_count, 1);
    assert_eq!(update.title.as_deref(), Some("Hello"));
    assert_eq!(update.mapped_fields["title"], json!("Hello"));

    // Previewing an unmapped type by explicit id reports an error action.
    let preview = engine
        .preview(SyncOptions {
            work_item_ids: Some(vec!["A-2".into()]),
            ..options()
        })
        .await
        .unwrap();
    assert_eq!(preview.error_count, 1);
}

#[tokio::test]
async fn unchanged_re_sync_is_idempotent_with_versions() {
    let f = fixture(|cfg| cfg.track_versions = true).await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let engine = f.engine();
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    assert_eq!(f.b.created_calls().len(), 1);
    let identity = f
        .store
        .get_synced_item(f.config.id, f.config.source_connector_id, "A-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.sync_count, 2);
    // One snapshot per pass per side.
    assert_eq!(
        f.store
            .count_versions(f.config.id, f.config.source_connector_id, "A-1")
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn comments_are_mirrored_once_with_preamble() {
    let f = fixture(|cfg| {
        cfg.options.sync_comments = true;
    })
    .await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);
    f.a.seed_comment("A-1", "c-100", "Looks broken", "alice");

    let engine = f.engine();
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    let comments = f.b.comments_of("B-7");
    assert_eq!(comments.len(), 1);
    assert!(comments[0].text.starts_with("[Synced from source]\nLooks broken"));
    assert!(comments[0].text.contains("--- alice ("));

    // A second pass must not duplicate the mirrored comment.
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();
    assert_eq!(f.b.comments_of("B-7").len(), 1);
}

#[tokio::test]
async fn links_go_pending_then_promote_when_counterpart_appears() {
    let f = fixture(|cfg| {
        cfg.options.sync_links = true;
    })
    .await;
    f.a.seed_item("A-1", "Task", &[("title", json!("One")), ("state", json!("New"))]);
    f.a.seed_relation("A-1", "A-2", "related");

    let engine = f.engine();
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    // A-2 is not mirrored yet: the link is pending, nothing on the target.
    assert_eq!(f.store.list_pending_links(f.config.id).await.unwrap().len(), 1);
    assert!(f.b.relations_of("B-7").is_empty());

    // A-2 appears; the next pass mirrors it and promotes the pending link.
    f.a.seed_item("A-2", "Task", &[("title", json!("Two")), ("state", json!("New"))]);
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    assert!(f.store.list_pending_links(f.config.id).await.unwrap().is_empty());
    let relations = f.b.relations_of("B-7");
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].linked_work_item_id, "B-8");
    assert_eq!(relations[0].relation_type, "related");
}

#[tokio::test]
async fn per_item_failure_does_not_abort_the_execution() {
    let f = fixture(|_| {}).await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Good")), ("state", json!("New"))]);

    let engine = f.engine();
    let report = engine
        .execute(
            SyncOptions {
                work_item_ids: Some(vec!["A-404".into(), "A-1".into()]),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    // The missing item was recorded, the good one synced.
    assert_eq!(report.created, 1);
    assert_eq!(report.errors, 1);
    let execs = f.store.list_executions(f.config.id).await.unwrap();
    assert_eq!(execs[0].status, ExecutionStatus::CompletedWithErrors);
    let errors = f.store.list_sync_errors(execs[0].id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_type, "sync_failed");
    assert_eq!(errors[0].work_item_id.as_deref(), Some("A-404"));
}

#[tokio::test]
async fn deleted_source_item_with_history_raises_deletion_conflict() {
    let f = fixture(|cfg| cfg.track_versions = true).await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let engine = f.engine();
    engine.execute(options(), ExecutionTrigger::Manual).await.unwrap();

    f.a.remove_item("A-1");
    engine
        .execute(
            SyncOptions {
                work_item_ids: Some(vec!["A-1".into()]),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    let conflicts = f.store.list_conflicts(f.config.id, None).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::DeletionConflict);
    assert_eq!(conflicts[0].source_work_item_id, "A-1");
    assert_eq!(conflicts[0].target_work_item_id, "B-7");
}

#[tokio::test]
async fn cancellation_marks_the_execution_failed() {
    let f = fixture(|_| {}).await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let engine = f.engine();
    engine.cancel_flag().cancel();
    let err = engine.execute(options(), ExecutionTrigger::Manual).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"));

    let execs = f.store.list_executions(f.config.id).await.unwrap();
    assert_eq!(execs[0].status, ExecutionStatus::Failed);
    assert_eq!(execs[0].error_message.as_deref(), Some("execution failure: cancelled"));
}

#[tokio::test]
async fn explicit_target_to_source_pass_reverse_maps() {
    let f = fixture(|cfg| {
        cfg.direction = ConfigDirection::Bidirectional;
        cfg.track_versions = true;
    })
    .await;
    f.a.seed_item("A-1", "Task", &[("title", json!("Hello")), ("state", json!("New"))]);

    let engine = f.engine();
    engine
        .execute(
            SyncOptions {
                direction: Some(SyncDirection::SourceToTarget),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    // Target edits title and moves Open → Active; the reverse pass writes
    // the source using the reverse status mapping.
    f.b.set_field("B-7", "title", json!("From target"));
    f.b.set_field("B-7", "state", json!("Active"));
    let report = engine
        .execute(
            SyncOptions {
                direction: Some(SyncDirection::TargetToSource),
                ..options()
            },
            ExecutionTrigger::Manual,
        )
        .await
        .unwrap();

    assert_eq!(report.updated, 1);
    let source = f.a.get_item("A-1").unwrap();
    assert_eq!(source.field_str("title"), Some("From target"));
    assert_eq!(source.field_str("state"), Some("Active"));
}
