//! The sync engine: orchestrates one execution of a sync configuration.
//!
//! A unidirectional pass queries the originating side, maps each item, and
//! upserts it on the other side while maintaining the identity registry. A
//! bidirectional pass walks the identity registry, detects change on each
//! side against the version store, and reconciles — resolving conflicts by
//! policy where both sides moved.
//!
//! Items are processed sequentially; per-item failures are recorded and never
//! abort the execution. Concurrency lives at the job-queue level.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use ws_connectors::registry::ConnectorRegistry;
use ws_connectors::{Connector, RemoteWorkItem};
use ws_core::error::{Result, WsError};
use ws_core::store::Store;
use ws_core::types::{
    ConfigDirection, ExecutionStatus, ExecutionTrigger, FieldMap, MappingBundle,
    ResolvedTypeMapping, SyncConfig, SyncDirection, SyncErrorRecord, SyncExecution, SyncOptions,
    SyncedComment, SyncedItem, SyncedLink, SyncedStatus,
};
use ws_mapping::engine::{map_with_bundle, reverse_map};
use ws_mapping::MappingEngine;

use crate::conflict::{ConflictDetector, ConflictResolver};
use crate::logger::ExecutionLog;

/// Fallback work-item type when the mapping engine yields no target type.
const DEFAULT_CREATE_TYPE: &str = "Task";

pub use ws_core::cancel::CancelFlag;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Created,
    Updated,
    Skipped,
    SourceToTarget,
    TargetToSource,
    Conflicted,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub source_id: String,
    pub target_id: Option<String>,
    pub action: ItemAction,
    pub error: Option<String>,
}

/// Aggregate result of one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub execution_id: Option<Uuid>,
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub conflicts_manual: usize,
    pub items: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewAction {
    Create,
    Update,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewItem {
    pub source_id: String,
    pub source_type: String,
    pub title: Option<String>,
    pub state: Option<String>,
    pub assigned_to: Option<String>,
    pub action: PreviewAction,
    pub target_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_count: i64,
    pub mapped_fields: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPreview {
    pub total: usize,
    pub create_count: usize,
    pub update_count: usize,
    pub error_count: usize,
    pub items: Vec<PreviewItem>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: Arc<Store>,
    mapping: Arc<MappingEngine>,
    config: SyncConfig,
    source: Arc<dyn Connector>,
    target: Arc<dyn Connector>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    log: ExecutionLog,
    cancel: CancelFlag,
}

impl SyncEngine {
    /// Resolve both connectors through the registry and build the engine.
    pub async fn from_registry(
        store: Arc<Store>,
        registry: &ConnectorRegistry,
        mapping: Arc<MappingEngine>,
        config_id: Uuid,
    ) -> Result<Self> {
        let config = store
            .get_sync_config(config_id)
            .await?
            .ok_or_else(|| WsError::Configuration(format!("sync config {config_id} not found")))?;
        let source = registry.get(config.source_connector_id).await?;
        let target = registry.get(config.target_connector_id).await?;
        Ok(Self::with_connectors(store, mapping, config, source, target))
    }

    /// Build an engine around already-constructed connectors.
    pub fn with_connectors(
        store: Arc<Store>,
        mapping: Arc<MappingEngine>,
        config: SyncConfig,
        source: Arc<dyn Connector>,
        target: Arc<dyn Connector>,
    ) -> Self {
        let detector = ConflictDetector::new(store.clone(), config.clone());
        let resolver =
            ConflictResolver::new(store.clone(), config.clone(), source.clone(), target.clone());
        Self {
            store,
            mapping,
            config,
            source,
            target,
            detector,
            resolver,
            log: ExecutionLog::new(),
            cancel: CancelFlag::new(),
        }
    }

    /// Handle for external cancellation; checked between item iterations.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Bind an externally owned cancellation flag (the job queue's).
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    fn resolve_direction(&self, options: &SyncOptions) -> SyncDirection {
        options.direction.unwrap_or(match self.config.direction {
            ConfigDirection::OneWay => SyncDirection::SourceToTarget,
            ConfigDirection::Bidirectional => SyncDirection::Bidirectional,
        })
    }

    fn mapping_ctx(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        ctx.insert("config".to_string(), self.config.name.clone());
        ctx.insert("config_id".to_string(), self.config.id.to_string());
        ctx
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(WsError::Execution("cancelled".into()))
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    pub async fn execute(
        &self,
        options: SyncOptions,
        trigger: ExecutionTrigger,
    ) -> Result<SyncReport> {
        let direction = self.resolve_direction(&options);
        if direction == SyncDirection::Bidirectional && !self.config.track_versions {
            return Err(WsError::Configuration(
                "bidirectional sync requires track_versions: the version store is the \
                 conflict-detection base"
                    .into(),
            ));
        }

        // A dry run shares the preview path: zero writes, zero side effects.
        if options.dry_run {
            let preview = self.preview(options).await?;
            return Ok(SyncReport {
                execution_id: None,
                total: preview.total,
                created: preview.create_count,
                updated: preview.update_count,
                errors: preview.error_count,
                ..SyncReport::default()
            });
        }

        let mut exec = SyncExecution::start(self.config.id, direction, trigger);
        self.store.insert_execution(&exec).await?;
        self.log.clear();
        self.log.info(
            "execution started",
            serde_json::json!({"direction": direction, "config": self.config.name}),
        );

        let result = self.run_passes(direction, &options, exec.id).await;
        match result {
            Ok(mut report) => {
                report.execution_id = Some(exec.id);
                exec.items_created = report.created as i64;
                exec.items_updated = report.updated as i64;
                exec.items_synced = report.total as i64;
                exec.items_failed = report.errors as i64;
                exec.conflicts_detected = report.conflicts_detected as i64;
                exec.conflicts_resolved = report.conflicts_resolved as i64;
                exec.status = if report.errors > 0 {
                    ExecutionStatus::CompletedWithErrors
                } else {
                    ExecutionStatus::Completed
                };
                exec.completed_at = Some(Utc::now());
                self.log.info(
                    "execution finished",
                    serde_json::json!({
                        "created": report.created,
                        "updated": report.updated,
                        "skipped": report.skipped,
                        "errors": report.errors,
                        "conflicts": report.conflicts_detected,
                    }),
                );
                exec.logs = self.log.to_json();
                self.store.update_execution(&exec).await?;
                self.store.set_last_sync_at(self.config.id, Utc::now()).await?;
                Ok(report)
            }
            Err(e) => {
                exec.status = ExecutionStatus::Failed;
                exec.error_message = Some(e.to_string());
                exec.completed_at = Some(Utc::now());
                self.log.error("execution failed", serde_json::json!({"error": e.to_string()}));
                exec.logs = self.log.to_json();
                self.store.update_execution(&exec).await?;
                self.store
                    .insert_sync_error(&SyncErrorRecord::new(
                        exec.id,
                        "execution_failed",
                        e.to_string(),
                        None,
                    ))
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_passes(
        &self,
        direction: SyncDirection,
        options: &SyncOptions,
        exec_id: Uuid,
    ) -> Result<SyncReport> {
        self.source.connect().await?;
        self.target.connect().await?;

        match direction {
            SyncDirection::SourceToTarget => self.run_unidirectional(false, options, exec_id).await,
            SyncDirection::TargetToSource => self.run_unidirectional(true, options, exec_id).await,
            SyncDirection::Bidirectional => self.run_bidirectional(exec_id).await,
        }
    }

    // -----------------------------------------------------------------------
    // Unidirectional pass
    // -----------------------------------------------------------------------

    async fn run_unidirectional(
        &self,
        reverse: bool,
        options: &SyncOptions,
        exec_id: Uuid,
    ) -> Result<SyncReport> {
        let bundle = self.mapping.bundle(self.config.id).await?;
        let from = if reverse { &self.target } else { &self.source };
        let (items, missing) = self
            .query_items(from.as_ref(), options, &bundle, reverse)
            .await?;

        let mut report = SyncReport::default();
        for id in &missing {
            report.total += 1;
            report.errors += 1;
            self.log.warn(
                "requested item missing on remote",
                serde_json::json!({"id": id}),
            );
            self.handle_missing_item(id, reverse, exec_id).await?;
            report.items.push(ItemOutcome {
                source_id: id.clone(),
                target_id: None,
                action: ItemAction::Error,
                error: Some(format!("work item {id} not found")),
            });
        }
        for item in &items {
            self.check_cancelled()?;
            report.total += 1;
            let outcome = if reverse {
                self.sync_item_reverse(item, exec_id).await
            } else {
                self.sync_item_forward(item, &bundle, exec_id).await
            };
            match outcome {
                Ok(outcome) => {
                    match outcome.action {
                        ItemAction::Created => report.created += 1,
                        ItemAction::Updated => report.updated += 1,
                        ItemAction::Skipped => report.skipped += 1,
                        _ => {}
                    }
                    report.items.push(outcome);
                }
                Err(e) => {
                    report.errors += 1;
                    self.record_item_error(exec_id, &item.id, &e).await?;
                    report.items.push(ItemOutcome {
                        source_id: item.id.clone(),
                        target_id: None,
                        action: ItemAction::Error,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if self.config.options.sync_links && !reverse {
            let promoted = self.promote_pending_links().await?;
            if promoted > 0 {
                self.log.info(
                    "pending links promoted",
                    serde_json::json!({"count": promoted}),
                );
            }
        }

        Ok(report)
    }

    /// Select the items for a pass: explicit ids, the config's filter, or a
    /// default synthesized from the active type mappings. Explicitly
    /// requested ids that are gone come back in the second list.
    async fn query_items(
        &self,
        from: &dyn Connector,
        options: &SyncOptions,
        bundle: &MappingBundle,
        reverse: bool,
    ) -> Result<(Vec<RemoteWorkItem>, Vec<String>)> {
        if let Some(ids) = &options.work_item_ids {
            let mut items = Vec::with_capacity(ids.len());
            let mut missing = Vec::new();
            for id in ids {
                match from.get_work_item(id).await {
                    Ok(item) => items.push(item),
                    Err(WsError::ItemNotFound(_)) => missing.push(id.clone()),
                    Err(e) => return Err(e),
                }
            }
            return Ok((items, missing));
        }

        let filter = match &self.config.sync_filter {
            Some(filter) => filter.clone(),
            None => {
                let type_names: Vec<&str> = bundle
                    .type_mappings
                    .iter()
                    .filter(|tm| tm.active)
                    .map(|tm| {
                        if reverse {
                            tm.target_type_name.as_str()
                        } else {
                            tm.source_type_name.as_str()
                        }
                    })
                    .collect();
                serde_json::json!({"types": type_names})
            }
        };
        Ok((from.query_work_items(&filter).await?, Vec::new()))
    }

    async fn handle_missing_item(&self, id: &str, reverse: bool, exec_id: Uuid) -> Result<()> {
        self.store
            .insert_sync_error(&SyncErrorRecord::new(
                exec_id,
                "sync_failed",
                format!("work item {id} not found"),
                Some(id.to_string()),
            ))
            .await?;

        // A prior version means the item was deleted out from under us.
        let (connector_id, identity) = if reverse {
            (
                self.config.target_connector_id,
                self.store
                    .get_synced_item_by_target(self.config.id, self.config.target_connector_id, id)
                    .await?,
            )
        } else {
            (
                self.config.source_connector_id,
                self.store
                    .get_synced_item(self.config.id, self.config.source_connector_id, id)
                    .await?,
            )
        };
        let counterpart = identity
            .map(|i| {
                if reverse {
                    i.source_item_id
                } else {
                    i.target_item_id
                }
            })
            .unwrap_or_default();
        if let Some(conflict) = self
            .detector
            .detect_deletion(connector_id, id, &counterpart, !reverse, Some(exec_id))
            .await?
        {
            self.detector.save_conflicts(&[conflict]).await?;
        }
        Ok(())
    }

    /// One source item through the forward pipeline: map, upsert, children,
    /// version capture.
    async fn sync_item_forward(
        &self,
        item: &RemoteWorkItem,
        bundle: &MappingBundle,
        exec_id: Uuid,
    ) -> Result<ItemOutcome> {
        let ctx = self.mapping_ctx();
        let mapped = map_with_bundle(item, bundle, &ctx);
        for warning in &mapped.warnings {
            self.log
                .warn(warning.clone(), serde_json::json!({"item": item.id}));
        }

        let mut write_fields = mapped.fields.clone();
        if let Some(status) = &mapped.status {
            write_fields.insert("state".into(), serde_json::json!(status));
        }

        let identity = self
            .store
            .get_synced_item(self.config.id, self.config.source_connector_id, &item.id)
            .await?;

        let (identity, action, written) = match identity {
            Some(identity) => {
                let written = self
                    .target
                    .update_work_item(&identity.target_item_id, &write_fields)
                    .await?;
                self.store
                    .touch_synced_item(identity.id, SyncedStatus::Synced)
                    .await?;
                (identity, ItemAction::Updated, written)
            }
            None => {
                let item_type = mapped.item_type.clone().unwrap_or_else(|| {
                    self.log.warn(
                        "no target type mapped; falling back to default type",
                        serde_json::json!({"item": item.id, "fallback": DEFAULT_CREATE_TYPE}),
                    );
                    DEFAULT_CREATE_TYPE.to_string()
                });
                let created = self.target.create_work_item(&item_type, &write_fields).await?;
                let now = Utc::now();
                let identity = SyncedItem {
                    id: Uuid::new_v4(),
                    sync_config_id: self.config.id,
                    source_connector_id: self.config.source_connector_id,
                    target_connector_id: self.config.target_connector_id,
                    source_item_id: item.id.clone(),
                    target_item_id: created.id.clone(),
                    source_item_type: Some(item.item_type.clone()),
                    target_item_type: Some(item_type),
                    first_synced_at: now,
                    last_synced_at: now,
                    sync_count: 1,
                    status: SyncedStatus::Synced,
                };
                self.store.insert_synced_item(&identity).await?;
                (identity, ItemAction::Created, created)
            }
        };

        if self.config.options.sync_comments {
            self.sync_comments(item, &identity).await?;
        }
        if self.config.options.sync_links {
            self.sync_links(item, &identity).await?;
        }

        if self.config.track_versions {
            self.detector
                .capture_version(self.config.source_connector_id, item, Some(exec_id))
                .await?;
            // The target snapshot after our write becomes the base for the
            // next bidirectional change check.
            self.detector
                .capture_version(self.config.target_connector_id, &written, Some(exec_id))
                .await?;
        }

        Ok(ItemOutcome {
            source_id: item.id.clone(),
            target_id: Some(identity.target_item_id),
            action,
            error: None,
        })
    }

    /// One target item through the reverse pipeline. Only items with an
    /// existing identity are written back; unmatched target items are
    /// skipped.
    async fn sync_item_reverse(&self, item: &RemoteWorkItem, exec_id: Uuid) -> Result<ItemOutcome> {
        let identity = self
            .store
            .get_synced_item_by_target(self.config.id, self.config.target_connector_id, &item.id)
            .await?;
        let Some(identity) = identity else {
            self.log.warn(
                "target item has no identity mapping; skipped",
                serde_json::json!({"item": item.id}),
            );
            return Ok(ItemOutcome {
                source_id: item.id.clone(),
                target_id: None,
                action: ItemAction::Skipped,
                error: None,
            });
        };

        let bundle = self.mapping.bundle(self.config.id).await?;
        let Some(tm) = self.type_mapping_for_target(&bundle, &item.item_type, &identity) else {
            return Ok(ItemOutcome {
                source_id: identity.source_item_id.clone(),
                target_id: Some(item.id.clone()),
                action: ItemAction::Skipped,
                error: None,
            });
        };

        let ctx = self.mapping_ctx();
        let reverse_fields = reverse_map(&item.fields, tm, &ctx);
        let written = self
            .source
            .update_work_item(&identity.source_item_id, &reverse_fields)
            .await?;
        self.store
            .touch_synced_item(identity.id, SyncedStatus::Synced)
            .await?;

        if self.config.track_versions {
            self.detector
                .capture_version(self.config.target_connector_id, item, Some(exec_id))
                .await?;
            self.detector
                .capture_version(self.config.source_connector_id, &written, Some(exec_id))
                .await?;
        }

        Ok(ItemOutcome {
            source_id: identity.source_item_id,
            target_id: Some(item.id.clone()),
            action: ItemAction::Updated,
            error: None,
        })
    }

    fn type_mapping_for_target<'a>(
        &self,
        bundle: &'a MappingBundle,
        target_type: &str,
        identity: &SyncedItem,
    ) -> Option<&'a ResolvedTypeMapping> {
        if let Some(source_type) = &identity.source_item_type {
            if let Some(tm) = bundle.for_source_type(source_type) {
                return Some(tm);
            }
        }
        bundle
            .type_mappings
            .iter()
            .find(|tm| tm.active && tm.target_type_name == target_type)
    }

    // -----------------------------------------------------------------------
    // Comments & links
    // -----------------------------------------------------------------------

    /// Mirror missing source comments onto the target with a provenance
    /// preamble. Skipped when either driver lacks the capability.
    async fn sync_comments(&self, item: &RemoteWorkItem, identity: &SyncedItem) -> Result<usize> {
        if !self.source.capabilities().comments || !self.target.capabilities().comments {
            return Ok(0);
        }
        let comments = self.source.get_comments(&item.id).await?;
        let existing: HashSet<String> = self
            .store
            .list_synced_comments(identity.id)
            .await?
            .into_iter()
            .map(|c| c.source_comment_id)
            .collect();

        let mut added = 0;
        for comment in comments {
            if existing.contains(&comment.id) {
                continue;
            }
            let author = comment.author.as_deref().unwrap_or("unknown");
            let date = comment
                .created_at
                .map(|d| d.to_rfc3339())
                .unwrap_or_default();
            let text = format!(
                "[Synced from source]\n{}\n\n--- {} ({})",
                comment.text, author, date
            );
            let target_comment = self.target.add_comment(&identity.target_item_id, &text).await?;
            self.store
                .insert_synced_comment(&SyncedComment {
                    id: Uuid::new_v4(),
                    synced_item_id: identity.id,
                    source_comment_id: comment.id,
                    target_comment_id: Some(target_comment.id),
                    status: SyncedStatus::Synced,
                    created_at: Utc::now(),
                })
                .await?;
            added += 1;
        }
        Ok(added)
    }

    /// Mirror source relations whose counterpart is already mapped; record
    /// the rest as pending for a later pass. Skipped when either driver
    /// lacks the capability.
    async fn sync_links(&self, item: &RemoteWorkItem, identity: &SyncedItem) -> Result<()> {
        if !self.source.capabilities().links || !self.target.capabilities().links {
            return Ok(());
        }
        let relations = self.source.get_relations(&item.id).await?;
        let existing: HashSet<(String, String)> = self
            .store
            .list_synced_links(identity.id)
            .await?
            .into_iter()
            .map(|l| (l.source_linked_item_id, l.relation_type))
            .collect();

        for relation in relations {
            let key = (
                relation.linked_work_item_id.clone(),
                relation.relation_type.clone(),
            );
            if existing.contains(&key) {
                continue;
            }
            let counterpart = self
                .store
                .get_synced_item(
                    self.config.id,
                    self.config.source_connector_id,
                    &relation.linked_work_item_id,
                )
                .await?;
            let (target_linked, status) = match &counterpart {
                Some(cp) => {
                    self.target
                        .add_relation(
                            &identity.target_item_id,
                            &cp.target_item_id,
                            &relation.relation_type,
                        )
                        .await?;
                    (Some(cp.target_item_id.clone()), SyncedStatus::Synced)
                }
                None => (None, SyncedStatus::Pending),
            };
            self.store
                .insert_synced_link(&SyncedLink {
                    id: Uuid::new_v4(),
                    synced_item_id: identity.id,
                    source_linked_item_id: relation.linked_work_item_id,
                    target_linked_item_id: target_linked,
                    relation_type: relation.relation_type,
                    status,
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    /// Promote pending links whose counterpart identities have appeared since
    /// they were recorded. Every pending link resolves within as many passes
    /// as the longest reference chain.
    async fn promote_pending_links(&self) -> Result<usize> {
        if !self.target.capabilities().links {
            return Ok(0);
        }
        let mut promoted = 0;
        for link in self.store.list_pending_links(self.config.id).await? {
            let counterpart = self
                .store
                .get_synced_item(
                    self.config.id,
                    self.config.source_connector_id,
                    &link.source_linked_item_id,
                )
                .await?;
            let Some(counterpart) = counterpart else {
                continue;
            };
            let Some(parent) = self.store.get_synced_item_by_id(link.synced_item_id).await? else {
                continue;
            };
            self.target
                .add_relation(
                    &parent.target_item_id,
                    &counterpart.target_item_id,
                    &link.relation_type,
                )
                .await?;
            self.store
                .mark_link_synced(link.id, &counterpart.target_item_id)
                .await?;
            promoted += 1;
        }
        Ok(promoted)
    }

    // -----------------------------------------------------------------------
    // Bidirectional pass
    // -----------------------------------------------------------------------

    async fn run_bidirectional(&self, exec_id: Uuid) -> Result<SyncReport> {
        let bundle = self.mapping.bundle(self.config.id).await?;
        let pairs = self.store.list_synced_items(self.config.id).await?;
        let ctx = self.mapping_ctx();

        let mut report = SyncReport::default();
        for pair in &pairs {
            self.check_cancelled()?;
            report.total += 1;
            match self
                .reconcile_pair(pair, &bundle, &ctx, exec_id, &mut report)
                .await
            {
                Ok(outcome) => report.items.push(outcome),
                Err(e) => {
                    report.errors += 1;
                    self.record_item_error(exec_id, &pair.source_item_id, &e).await?;
                    report.items.push(ItemOutcome {
                        source_id: pair.source_item_id.clone(),
                        target_id: Some(pair.target_item_id.clone()),
                        action: ItemAction::Error,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn reconcile_pair(
        &self,
        pair: &SyncedItem,
        bundle: &MappingBundle,
        ctx: &HashMap<String, String>,
        exec_id: Uuid,
        report: &mut SyncReport,
    ) -> Result<ItemOutcome> {
        // Fetch both sides; a vanished side is a deletion conflict.
        let source_item = match self.source.get_work_item(&pair.source_item_id).await {
            Ok(item) => item,
            Err(WsError::ItemNotFound(_)) => {
                return self.pair_deletion(pair, true, exec_id, report).await;
            }
            Err(e) => return Err(e),
        };
        let target_item = match self.target.get_work_item(&pair.target_item_id).await {
            Ok(item) => item,
            Err(WsError::ItemNotFound(_)) => {
                return self.pair_deletion(pair, false, exec_id, report).await;
            }
            Err(e) => return Err(e),
        };

        let source_check = self
            .detector
            .has_changed(
                self.config.source_connector_id,
                &pair.source_item_id,
                &source_item.fields,
            )
            .await?;
        let target_check = self
            .detector
            .has_changed(
                self.config.target_connector_id,
                &pair.target_item_id,
                &target_item.fields,
            )
            .await?;

        let action = match (source_check.changed, target_check.changed) {
            (false, false) => {
                report.skipped += 1;
                ItemAction::Skipped
            }
            (true, false) => {
                let mapped = map_with_bundle(&source_item, bundle, ctx);
                let mut fields = mapped.fields;
                if let Some(status) = mapped.status {
                    fields.insert("state".into(), serde_json::json!(status));
                }
                let written = self
                    .target
                    .update_work_item(&pair.target_item_id, &fields)
                    .await?;
                self.store.touch_synced_item(pair.id, SyncedStatus::Synced).await?;
                self.capture_pair_versions(Some(&source_item), Some(&written), exec_id)
                    .await?;
                report.updated += 1;
                ItemAction::SourceToTarget
            }
            (false, true) => {
                let Some(tm) = self.type_mapping_for_target(bundle, &target_item.item_type, pair)
                else {
                    report.skipped += 1;
                    return Ok(ItemOutcome {
                        source_id: pair.source_item_id.clone(),
                        target_id: Some(pair.target_item_id.clone()),
                        action: ItemAction::Skipped,
                        error: None,
                    });
                };
                let reverse_fields = reverse_map(&target_item.fields, tm, ctx);
                let written = self
                    .source
                    .update_work_item(&pair.source_item_id, &reverse_fields)
                    .await?;
                self.store.touch_synced_item(pair.id, SyncedStatus::Synced).await?;
                self.capture_pair_versions(Some(&written), Some(&target_item), exec_id)
                    .await?;
                report.updated += 1;
                ItemAction::TargetToSource
            }
            (true, true) => {
                self.reconcile_both_changed(
                    pair,
                    &source_item,
                    &target_item,
                    &source_check.previous,
                    &target_check.previous,
                    bundle,
                    ctx,
                    exec_id,
                    report,
                )
                .await?
            }
        };

        Ok(ItemOutcome {
            source_id: pair.source_item_id.clone(),
            target_id: Some(pair.target_item_id.clone()),
            action,
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_both_changed(
        &self,
        pair: &SyncedItem,
        source_item: &RemoteWorkItem,
        target_item: &RemoteWorkItem,
        source_previous: &Option<ws_core::types::WorkItemVersion>,
        target_previous: &Option<ws_core::types::WorkItemVersion>,
        bundle: &MappingBundle,
        ctx: &HashMap<String, String>,
        exec_id: Uuid,
        report: &mut SyncReport,
    ) -> Result<ItemAction> {
        let Some(tm) = self.type_mapping_for_target(bundle, &target_item.item_type, pair) else {
            report.skipped += 1;
            return Ok(ItemAction::Skipped);
        };

        let source_base: Option<FieldMap> = source_previous
            .as_ref()
            .and_then(|v| serde_json::from_value(v.fields_snapshot.clone()).ok());
        let target_base: Option<FieldMap> = target_previous
            .as_ref()
            .and_then(|v| serde_json::from_value(v.fields_snapshot.clone()).ok());

        let analysis = self.detector.analyze_fields(
            source_item,
            target_item,
            tm,
            source_base.as_ref(),
            target_base.as_ref(),
            Some(exec_id),
        );

        // Disjoint changes flow both ways through the normal mapping, limited
        // to the fields that actually moved.
        let mut wrote_target = false;
        let mut wrote_source = false;
        if !analysis.source_to_target.is_empty() {
            let mapped = map_with_bundle(source_item, bundle, ctx);
            let fields: FieldMap = mapped
                .fields
                .into_iter()
                .filter(|(k, _)| analysis.source_to_target.contains_key(k))
                .collect();
            if !fields.is_empty() {
                self.target.update_work_item(&pair.target_item_id, &fields).await?;
                wrote_target = true;
            }
        }
        if !analysis.target_to_source.is_empty() {
            let reverse_fields = reverse_map(&target_item.fields, tm, ctx);
            let fields: FieldMap = reverse_fields
                .into_iter()
                .filter(|(k, _)| analysis.target_to_source.contains_key(k))
                .collect();
            if !fields.is_empty() {
                self.source.update_work_item(&pair.source_item_id, &fields).await?;
                wrote_source = true;
            }
        }

        report.conflicts_detected += analysis.conflicts.len();
        let mut any_manual = false;
        if !analysis.conflicts.is_empty() {
            self.detector.save_conflicts(&analysis.conflicts).await?;
            for conflict in &analysis.conflicts {
                let resolution = self.resolver.resolve(conflict, None).await?;
                if resolution.requires_manual {
                    any_manual = true;
                    report.conflicts_manual += 1;
                    self.log.warn(
                        "conflict requires manual resolution",
                        serde_json::json!({"conflict_id": conflict.id, "field": conflict.field_name}),
                    );
                } else {
                    report.conflicts_resolved += 1;
                    wrote_target = true;
                    wrote_source = true;
                }
            }
        }

        self.store.touch_synced_item(pair.id, SyncedStatus::Synced).await?;

        // Fresh snapshots for whichever sides changed (remotely or by our
        // writes) become the next base.
        let source_fresh;
        let target_fresh;
        let source_to_capture = if wrote_source {
            source_fresh = self.source.get_work_item(&pair.source_item_id).await?;
            Some(&source_fresh)
        } else {
            Some(source_item)
        };
        let target_to_capture = if wrote_target {
            target_fresh = self.target.get_work_item(&pair.target_item_id).await?;
            Some(&target_fresh)
        } else {
            Some(target_item)
        };
        // A pair left for manual resolution keeps its old base so the
        // conflict is re-detectable until someone acts.
        if !any_manual {
            self.capture_pair_versions(source_to_capture, target_to_capture, exec_id)
                .await?;
        }

        report.updated += 1;
        Ok(ItemAction::Conflicted)
    }

    async fn pair_deletion(
        &self,
        pair: &SyncedItem,
        deleted_on_source: bool,
        exec_id: Uuid,
        report: &mut SyncReport,
    ) -> Result<ItemOutcome> {
        let (connector_id, missing_id, counterpart_id) = if deleted_on_source {
            (
                self.config.source_connector_id,
                pair.source_item_id.as_str(),
                pair.target_item_id.as_str(),
            )
        } else {
            (
                self.config.target_connector_id,
                pair.target_item_id.as_str(),
                pair.source_item_id.as_str(),
            )
        };
        if let Some(conflict) = self
            .detector
            .detect_deletion(
                connector_id,
                missing_id,
                counterpart_id,
                deleted_on_source,
                Some(exec_id),
            )
            .await?
        {
            self.detector.save_conflicts(&[conflict]).await?;
            report.conflicts_detected += 1;
        }
        self.store.touch_synced_item(pair.id, SyncedStatus::Error).await?;
        Ok(ItemOutcome {
            source_id: pair.source_item_id.clone(),
            target_id: Some(pair.target_item_id.clone()),
            action: ItemAction::Conflicted,
            error: None,
        })
    }

    async fn capture_pair_versions(
        &self,
        source_item: Option<&RemoteWorkItem>,
        target_item: Option<&RemoteWorkItem>,
        exec_id: Uuid,
    ) -> Result<()> {
        if !self.config.track_versions {
            return Ok(());
        }
        if let Some(item) = source_item {
            self.detector
                .capture_version(self.config.source_connector_id, item, Some(exec_id))
                .await?;
        }
        if let Some(item) = target_item {
            self.detector
                .capture_version(self.config.target_connector_id, item, Some(exec_id))
                .await?;
        }
        Ok(())
    }

    async fn record_item_error(&self, exec_id: Uuid, item_id: &str, error: &WsError) -> Result<()> {
        self.log.error(
            "item sync failed",
            serde_json::json!({"item": item_id, "error": error.to_string()}),
        );
        self.store
            .insert_sync_error(&SyncErrorRecord::new(
                exec_id,
                "sync_failed",
                error.to_string(),
                Some(item_id.to_string()),
            ))
            .await
    }

    // -----------------------------------------------------------------------
    // Preview
    // -----------------------------------------------------------------------

    /// Dry pass over steps 1–3a: query, map, and classify each item without
    /// any writes or side effects.
    pub async fn preview(&self, options: SyncOptions) -> Result<SyncPreview> {
        let bundle = self.mapping.bundle(self.config.id).await?;
        let ctx = self.mapping_ctx();

        let mut preview = SyncPreview::default();
        let items = match &options.work_item_ids {
            Some(ids) => {
                let mut items = Vec::new();
                for id in ids {
                    match self.source.get_work_item(id).await {
                        Ok(item) => items.push(Ok(item)),
                        Err(e) => items.push(Err((id.clone(), e))),
                    }
                }
                items
            }
            None => self
                .query_items(self.source.as_ref(), &options, &bundle, false)
                .await?
                .0
                .into_iter()
                .map(Ok)
                .collect(),
        };

        for entry in items {
            preview.total += 1;
            let item = match entry {
                Ok(item) => item,
                Err((id, e)) => {
                    preview.error_count += 1;
                    preview.items.push(PreviewItem {
                        source_id: id,
                        source_type: String::new(),
                        title: None,
                        state: None,
                        assigned_to: None,
                        action: PreviewAction::Error,
                        target_id: None,
                        last_synced_at: None,
                        sync_count: 0,
                        mapped_fields: serde_json::Value::Null,
                    });
                    let _ = e;
                    continue;
                }
            };

            let mapped = map_with_bundle(&item, &bundle, &ctx);
            let identity = self
                .store
                .get_synced_item(self.config.id, self.config.source_connector_id, &item.id)
                .await?;

            let action = if mapped.item_type.is_none() && mapped.fields.is_empty() {
                preview.error_count += 1;
                PreviewAction::Error
            } else if identity.is_some() {
                preview.update_count += 1;
                PreviewAction::Update
            } else {
                preview.create_count += 1;
                PreviewAction::Create
            };

            preview.items.push(PreviewItem {
                source_id: item.id.clone(),
                source_type: item.item_type.clone(),
                title: item.field_str("title").map(str::to_string),
                state: item.field_str("state").map(str::to_string),
                assigned_to: item
                    .fields
                    .get("assignee")
                    .and_then(|v| v.get("displayName"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                action,
                target_id: identity.as_ref().map(|i| i.target_item_id.clone()),
                last_synced_at: identity.as_ref().map(|i| i.last_synced_at),
                sync_count: identity.as_ref().map(|i| i.sync_count).unwrap_or(0),
                mapped_fields: serde_json::to_value(&mapped.fields)?,
            });
        }

        info!(
            config_id = %self.config.id,
            total = preview.total,
            "preview computed"
        );
        Ok(preview)
    }
}
