//! Strategy-based conflict resolution.
//!
//! A resolution decides a winner, persists an audit record, flips the
//! conflict row, and applies the winning value through the connectors.
//! Application failures are captured in the audit record but do not re-open
//! the conflict.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use ws_connectors::Connector;
use ws_core::error::{Result, WsError};
use ws_core::store::Store;
use ws_core::types::{
    ConfigDirection, ConflictResolution, ConflictStatus, ConflictStrategy, FieldMap, SyncConfig,
    SyncConflict,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Source,
    Target,
}

/// Outcome of strategy selection for one conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: ConflictStrategy,
    pub winner: Winner,
    pub resolved_value: Option<serde_json::Value>,
    pub rationale: String,
    pub requires_manual: bool,
}

pub struct ConflictResolver {
    store: Arc<Store>,
    config: SyncConfig,
    source: Arc<dyn Connector>,
    target: Arc<dyn Connector>,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<Store>,
        config: SyncConfig,
        source: Arc<dyn Connector>,
        target: Arc<dyn Connector>,
    ) -> Self {
        Self {
            store,
            config,
            source,
            target,
        }
    }

    /// Pick the effective strategy: override → config default.
    fn effective_strategy(&self, strategy_override: Option<ConflictStrategy>) -> ConflictStrategy {
        strategy_override.unwrap_or(self.config.conflict_strategy)
    }

    /// Decide a winner without side effects.
    pub fn decide(&self, conflict: &SyncConflict, strategy: ConflictStrategy) -> Resolution {
        match strategy {
            ConflictStrategy::Manual => Resolution {
                strategy,
                winner: Winner::Source,
                resolved_value: None,
                rationale: "manual strategy: left for a human".into(),
                requires_manual: true,
            },
            ConflictStrategy::SourcePriority => Resolution {
                strategy,
                winner: Winner::Source,
                resolved_value: conflict.source_value.clone(),
                rationale: "source side has priority".into(),
                requires_manual: false,
            },
            ConflictStrategy::TargetPriority => Resolution {
                strategy,
                winner: Winner::Target,
                resolved_value: conflict.target_value.clone(),
                rationale: "target side has priority".into(),
                requires_manual: false,
            },
            ConflictStrategy::LastWriteWins => self.last_write_wins(conflict),
            ConflictStrategy::Merge => {
                // Three-way: an unchanged side yields to the changed one;
                // otherwise fall back to last-write-wins.
                if conflict.source_value == conflict.base_value {
                    Resolution {
                        strategy,
                        winner: Winner::Target,
                        resolved_value: conflict.target_value.clone(),
                        rationale: "merge: source equals base, target changed".into(),
                        requires_manual: false,
                    }
                } else if conflict.target_value == conflict.base_value {
                    Resolution {
                        strategy,
                        winner: Winner::Source,
                        resolved_value: conflict.source_value.clone(),
                        rationale: "merge: target equals base, source changed".into(),
                        requires_manual: false,
                    }
                } else {
                    let mut fallback = self.last_write_wins(conflict);
                    fallback.strategy = strategy;
                    fallback.rationale =
                        format!("merge: both sides changed; {}", fallback.rationale);
                    fallback
                }
            }
        }
    }

    fn last_write_wins(&self, conflict: &SyncConflict) -> Resolution {
        let source_date = metadata_date(conflict, "source_changed_date");
        let target_date = metadata_date(conflict, "target_changed_date");
        // Ties (and missing dates) go to the source.
        let target_newer = matches!((source_date, target_date), (Some(s), Some(t)) if t > s)
            || (source_date.is_none() && target_date.is_some());
        if target_newer {
            Resolution {
                strategy: ConflictStrategy::LastWriteWins,
                winner: Winner::Target,
                resolved_value: conflict.target_value.clone(),
                rationale: "last-write-wins: target modified more recently".into(),
                requires_manual: false,
            }
        } else {
            Resolution {
                strategy: ConflictStrategy::LastWriteWins,
                winner: Winner::Source,
                resolved_value: conflict.source_value.clone(),
                rationale: "last-write-wins: source modified more recently or tie".into(),
                requires_manual: false,
            }
        }
    }

    /// Resolve one conflict: decide, apply, audit, and flip the row.
    ///
    /// A `requires_manual` resolution changes nothing — the row stays
    /// `unresolved` for a human.
    pub async fn resolve(
        &self,
        conflict: &SyncConflict,
        strategy_override: Option<ConflictStrategy>,
    ) -> Result<Resolution> {
        let strategy = self.effective_strategy(strategy_override);
        let resolution = self.decide(conflict, strategy);
        if resolution.requires_manual {
            return Ok(resolution);
        }
        self.apply_resolution(conflict, &resolution, "system").await?;
        Ok(resolution)
    }

    /// Human resolution with an explicit value; bypasses strategy selection.
    pub async fn resolve_manually(
        &self,
        conflict_id: Uuid,
        value: serde_json::Value,
        rationale: &str,
        resolved_by: &str,
    ) -> Result<Resolution> {
        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| WsError::Configuration(format!("conflict {conflict_id} not found")))?;
        let resolution = Resolution {
            strategy: ConflictStrategy::Manual,
            winner: Winner::Target,
            resolved_value: Some(value),
            rationale: rationale.to_string(),
            requires_manual: false,
        };
        self.apply_resolution(&conflict, &resolution, resolved_by).await?;
        Ok(resolution)
    }

    /// Write the resolved value through the connectors, record the audit
    /// row, and mark the conflict resolved.
    ///
    /// The target always receives the value. For bidirectional configs where
    /// the target's value won (target-priority, last-write-wins picking the
    /// target, or a manual choice), the source is written too so both sides
    /// converge.
    pub async fn apply_resolution(
        &self,
        conflict: &SyncConflict,
        resolution: &Resolution,
        resolved_by: &str,
    ) -> Result<()> {
        let mut applied_to_source = false;
        let mut applied_to_target = false;
        let mut application_result: Option<String> = None;

        if let (Some(value), Some(field_name)) =
            (&resolution.resolved_value, conflict.field_name.as_deref())
        {
            let target_field = conflict
                .metadata
                .get("target_field")
                .and_then(|v| v.as_str())
                .unwrap_or(field_name);

            let mut target_fields = FieldMap::new();
            target_fields.insert(target_field.to_string(), value.clone());
            match self
                .target
                .update_work_item(&conflict.target_work_item_id, &target_fields)
                .await
            {
                Ok(_) => applied_to_target = true,
                Err(e) => {
                    warn!(conflict_id = %conflict.id, error = %e, "failed to apply resolution to target");
                    application_result = Some(format!("target write failed: {e}"));
                }
            }

            let write_back_to_source = self.config.direction == ConfigDirection::Bidirectional
                && (resolution.winner == Winner::Target
                    || resolution.strategy == ConflictStrategy::Manual);
            if write_back_to_source {
                let mut source_fields = FieldMap::new();
                source_fields.insert(field_name.to_string(), value.clone());
                match self
                    .source
                    .update_work_item(&conflict.source_work_item_id, &source_fields)
                    .await
                {
                    Ok(_) => applied_to_source = true,
                    Err(e) => {
                        warn!(conflict_id = %conflict.id, error = %e, "failed to apply resolution to source");
                        application_result
                            .get_or_insert_with(|| format!("source write failed: {e}"));
                    }
                }
            }
        }

        let audit = ConflictResolution {
            id: Uuid::new_v4(),
            conflict_id: conflict.id,
            strategy: resolution.strategy,
            previous_value: conflict.target_value.clone(),
            resolved_value: resolution.resolved_value.clone(),
            rationale: resolution.rationale.clone(),
            applied_to_source,
            applied_to_target,
            application_result,
            resolved_by: resolved_by.to_string(),
            created_at: Utc::now(),
        };
        self.store.insert_resolution(&audit).await?;

        let mut updated = conflict.clone();
        updated.status = ConflictStatus::Resolved;
        updated.resolution_strategy = Some(resolution.strategy);
        updated.resolved_value = resolution.resolved_value.clone();
        updated.resolved_by = Some(resolved_by.to_string());
        updated.resolved_at = Some(Utc::now());
        self.store.update_conflict_resolution(&updated).await?;

        Ok(())
    }

    /// Resolve a batch; per-conflict outcomes, no cross-item transaction.
    pub async fn resolve_many(
        &self,
        conflicts: &[SyncConflict],
        strategy: Option<ConflictStrategy>,
    ) -> Vec<(Uuid, Result<Resolution>)> {
        let mut results = Vec::with_capacity(conflicts.len());
        for conflict in conflicts {
            let outcome = self.resolve(conflict, strategy).await;
            results.push((conflict.id, outcome));
        }
        results
    }
}

fn metadata_date(conflict: &SyncConflict, key: &str) -> Option<DateTime<Utc>> {
    conflict
        .metadata
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ws_connectors::memory::MemoryConnector;
    use ws_core::types::{AuthKind, ConflictKind, ConnectorRecord};

    struct Fixture {
        store: Arc<Store>,
        config: SyncConfig,
        source: MemoryConnector,
        target: MemoryConnector,
        resolver: ConflictResolver,
    }

    async fn fixture(direction: ConfigDirection, strategy: ConflictStrategy) -> Fixture {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let a = ConnectorRecord::new("src", "memory", "mem://", AuthKind::Pat, "00");
        let b = ConnectorRecord::new("tgt", "memory", "mem://", AuthKind::Pat, "00");
        store.insert_connector(&a).await.unwrap();
        store.insert_connector(&b).await.unwrap();
        let mut config = SyncConfig::new("pair", a.id, b.id);
        config.direction = direction;
        config.conflict_strategy = strategy;
        store.insert_sync_config(&config).await.unwrap();

        let source = MemoryConnector::new("A");
        let target = MemoryConnector::new("B");
        source.seed_item("A-1", "Task", &[("title", json!("S"))]);
        target.seed_item("B-7", "Task", &[("title", json!("T"))]);

        let resolver = ConflictResolver::new(
            store.clone(),
            config.clone(),
            Arc::new(source.clone()),
            Arc::new(target.clone()),
        );
        Fixture {
            store,
            config,
            source,
            target,
            resolver,
        }
    }

    fn title_conflict(
        config: &SyncConfig,
        source_newer: bool,
    ) -> SyncConflict {
        let (src_date, tgt_date) = if source_newer {
            ("2026-03-02T00:00:00+00:00", "2026-03-01T00:00:00+00:00")
        } else {
            ("2026-03-01T00:00:00+00:00", "2026-03-02T00:00:00+00:00")
        };
        SyncConflict {
            id: Uuid::new_v4(),
            sync_config_id: config.id,
            execution_id: None,
            source_work_item_id: "A-1".into(),
            target_work_item_id: "B-7".into(),
            work_item_type: Some("Task".into()),
            kind: ConflictKind::FieldConflict,
            field_name: Some("title".into()),
            source_value: Some(json!("S")),
            target_value: Some(json!("T")),
            base_value: Some(json!("Hello")),
            status: ConflictStatus::Unresolved,
            resolution_strategy: None,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            metadata: json!({
                "target_field": "title",
                "source_changed_date": src_date,
                "target_changed_date": tgt_date,
            }),
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn last_write_wins_prefers_newer_side_and_ties_go_to_source() {
        let f = fixture(ConfigDirection::OneWay, ConflictStrategy::LastWriteWins).await;

        let source_newer = title_conflict(&f.config, true);
        let r = f.resolver.decide(&source_newer, ConflictStrategy::LastWriteWins);
        assert_eq!(r.winner, Winner::Source);
        assert_eq!(r.resolved_value, Some(json!("S")));

        let target_newer = title_conflict(&f.config, false);
        let r = f.resolver.decide(&target_newer, ConflictStrategy::LastWriteWins);
        assert_eq!(r.winner, Winner::Target);

        // Missing dates: source wins.
        let mut no_dates = title_conflict(&f.config, true);
        no_dates.metadata = json!({"target_field": "title"});
        let r = f.resolver.decide(&no_dates, ConflictStrategy::LastWriteWins);
        assert_eq!(r.winner, Winner::Source);
    }

    #[tokio::test]
    async fn merge_yields_to_the_changed_side() {
        let f = fixture(ConfigDirection::OneWay, ConflictStrategy::Merge).await;

        let mut source_unchanged = title_conflict(&f.config, true);
        source_unchanged.source_value = Some(json!("Hello")); // equals base
        let r = f.resolver.decide(&source_unchanged, ConflictStrategy::Merge);
        assert_eq!(r.winner, Winner::Target);

        let mut target_unchanged = title_conflict(&f.config, true);
        target_unchanged.target_value = Some(json!("Hello"));
        let r = f.resolver.decide(&target_unchanged, ConflictStrategy::Merge);
        assert_eq!(r.winner, Winner::Source);

        // Both changed: falls back to last-write-wins (source newer here).
        let both = title_conflict(&f.config, true);
        let r = f.resolver.decide(&both, ConflictStrategy::Merge);
        assert_eq!(r.winner, Winner::Source);
        assert_eq!(r.strategy, ConflictStrategy::Merge);
    }

    #[tokio::test]
    async fn resolve_applies_to_target_and_records_audit() {
        let f = fixture(ConfigDirection::OneWay, ConflictStrategy::LastWriteWins).await;
        let conflict = title_conflict(&f.config, true);
        f.store.insert_conflicts(&[conflict.clone()]).await.unwrap();

        let resolution = f.resolver.resolve(&conflict, None).await.unwrap();
        assert!(!resolution.requires_manual);
        assert_eq!(resolution.resolved_value, Some(json!("S")));

        // Target received the winning value.
        let updates = f.target.updated_calls();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "B-7");
        assert_eq!(updates[0].1["title"], json!("S"));
        // One-way config: no write back to the source.
        assert!(f.source.updated_calls().is_empty());

        let row = f.store.get_conflict(conflict.id).await.unwrap().unwrap();
        assert_eq!(row.status, ConflictStatus::Resolved);
        assert_eq!(row.resolution_strategy, Some(ConflictStrategy::LastWriteWins));
        assert_eq!(row.resolved_value, Some(json!("S")));
        assert_eq!(row.resolved_by.as_deref(), Some("system"));
    }

    #[tokio::test]
    async fn manual_strategy_leaves_row_unresolved() {
        let f = fixture(ConfigDirection::Bidirectional, ConflictStrategy::Manual).await;
        let conflict = title_conflict(&f.config, true);
        f.store.insert_conflicts(&[conflict.clone()]).await.unwrap();

        let resolution = f.resolver.resolve(&conflict, None).await.unwrap();
        assert!(resolution.requires_manual);
        assert!(f.target.updated_calls().is_empty());
        assert!(f.source.updated_calls().is_empty());

        let row = f.store.get_conflict(conflict.id).await.unwrap().unwrap();
        assert_eq!(row.status, ConflictStatus::Unresolved);
    }

    #[tokio::test]
    async fn manual_resolution_converges_both_sides_when_bidirectional() {
        let f = fixture(ConfigDirection::Bidirectional, ConflictStrategy::Manual).await;
        let conflict = title_conflict(&f.config, true);
        f.store.insert_conflicts(&[conflict.clone()]).await.unwrap();

        f.resolver
            .resolve_manually(conflict.id, json!("T"), "chose target", "alice")
            .await
            .unwrap();

        let target_updates = f.target.updated_calls();
        assert_eq!(target_updates[0].1["title"], json!("T"));
        let source_updates = f.source.updated_calls();
        assert_eq!(source_updates.len(), 1);
        assert_eq!(source_updates[0].0, "A-1");
        assert_eq!(source_updates[0].1["title"], json!("T"));

        let row = f.store.get_conflict(conflict.id).await.unwrap().unwrap();
        assert_eq!(row.status, ConflictStatus::Resolved);
        assert_eq!(row.resolved_by.as_deref(), Some("alice"));
        assert_eq!(row.resolved_value, Some(json!("T")));
    }

    #[tokio::test]
    async fn target_priority_writes_back_to_source_in_bidirectional() {
        let f = fixture(ConfigDirection::Bidirectional, ConflictStrategy::TargetPriority).await;
        let conflict = title_conflict(&f.config, true);
        f.store.insert_conflicts(&[conflict.clone()]).await.unwrap();

        f.resolver.resolve(&conflict, None).await.unwrap();
        assert_eq!(f.source.updated_calls().len(), 1);
        assert_eq!(f.source.updated_calls()[0].1["title"], json!("T"));
    }

    #[tokio::test]
    async fn failed_application_is_captured_without_reopening() {
        let f = fixture(ConfigDirection::OneWay, ConflictStrategy::SourcePriority).await;
        let mut conflict = title_conflict(&f.config, true);
        conflict.target_work_item_id = "B-404".into(); // update will fail
        f.store.insert_conflicts(&[conflict.clone()]).await.unwrap();

        let resolution = f.resolver.resolve(&conflict, None).await.unwrap();
        assert!(!resolution.requires_manual);

        // The row is still flipped to resolved; the failure lives in the
        // audit record's application result.
        let row = f.store.get_conflict(conflict.id).await.unwrap().unwrap();
        assert_eq!(row.status, ConflictStatus::Resolved);
    }

    #[tokio::test]
    async fn strategy_override_beats_config_default() {
        let f = fixture(ConfigDirection::OneWay, ConflictStrategy::Manual).await;
        let conflict = title_conflict(&f.config, true);
        f.store.insert_conflicts(&[conflict.clone()]).await.unwrap();

        let resolution = f
            .resolver
            .resolve(&conflict, Some(ConflictStrategy::SourcePriority))
            .await
            .unwrap();
        assert!(!resolution.requires_manual);
        assert_eq!(resolution.winner, Winner::Source);
    }

    #[tokio::test]
    async fn resolve_many_returns_per_conflict_outcomes() {
        let f = fixture(ConfigDirection::OneWay, ConflictStrategy::SourcePriority).await;
        let c1 = title_conflict(&f.config, true);
        let c2 = title_conflict(&f.config, false);
        f.store.insert_conflicts(&[c1.clone(), c2.clone()]).await.unwrap();

        let results = f.resolver.resolve_many(&[c1, c2], None).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
