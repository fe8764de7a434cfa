//! Conflict detector: version snapshots, hash-based change detection, and
//! field-level conflict identification.
//!
//! Remote "last modified" metadata is not trustworthy across drivers, so the
//! engine's own last captured snapshot is the authoritative base. That makes
//! `track_versions` mandatory for bidirectional configs.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use ws_connectors::RemoteWorkItem;
use ws_core::error::Result;
use ws_core::store::Store;
use ws_core::types::{
    ConflictKind, ConflictStatus, FieldMap, ResolvedTypeMapping, SyncConfig, SyncConflict,
    WorkItemVersion,
};

use std::sync::Arc;

/// Deterministic content digest of a field map, lowercase hex SHA-256.
///
/// `FieldMap` is a `BTreeMap`, so serialization order — and therefore the
/// hash — is stable for structurally equal maps.
pub fn content_hash(fields: &FieldMap) -> String {
    let serialized = serde_json::to_string(fields).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    hex::encode(digest)
}

/// Outcome of a change check against the latest stored snapshot.
#[derive(Debug, Clone)]
pub struct ChangeCheck {
    pub changed: bool,
    /// No prior snapshot exists for this item.
    pub is_new: bool,
    pub previous: Option<WorkItemVersion>,
}

/// Field-by-field comparison of both sides against their bases.
#[derive(Debug, Default)]
pub struct FieldAnalysis {
    pub conflicts: Vec<SyncConflict>,
    /// Non-conflicting source changes, keyed by target reference, ready to
    /// write to the target.
    pub source_to_target: FieldMap,
    /// Non-conflicting target changes, keyed by source reference, ready to
    /// write to the source.
    pub target_to_source: FieldMap,
}

pub struct ConflictDetector {
    store: Arc<Store>,
    config: SyncConfig,
}

impl ConflictDetector {
    pub fn new(store: Arc<Store>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Append a version snapshot with the next monotonic number.
    pub async fn capture_version(
        &self,
        connector_id: Uuid,
        item: &RemoteWorkItem,
        execution_id: Option<Uuid>,
    ) -> Result<WorkItemVersion> {
        let snapshot = serde_json::to_value(&item.fields)?;
        let hash = content_hash(&item.fields);
        self.store
            .insert_version(
                self.config.id,
                connector_id,
                &item.id,
                item.rev.clone(),
                item.changed_date(),
                item.changed_by(),
                snapshot,
                hash,
                execution_id,
            )
            .await
    }

    /// Compare current fields against the latest stored snapshot.
    pub async fn has_changed(
        &self,
        connector_id: Uuid,
        work_item_id: &str,
        current: &FieldMap,
    ) -> Result<ChangeCheck> {
        let previous = self
            .store
            .latest_version(self.config.id, connector_id, work_item_id)
            .await?;
        match previous {
            None => Ok(ChangeCheck {
                changed: false,
                is_new: true,
                previous: None,
            }),
            Some(version) => {
                let changed = content_hash(current) != version.hash;
                Ok(ChangeCheck {
                    changed,
                    is_new: false,
                    previous: Some(version),
                })
            }
        }
    }

    /// Compare both sides field-by-field against their base snapshots.
    ///
    /// A `field_conflict` is emitted iff a mapped field changed on *both*
    /// sides and the current values are not semantically equal. A change on
    /// only one side lands in the corresponding update map instead. When both
    /// `changedDate`s moved past their bases but no field-level conflict was
    /// found, a single `version_conflict` carries the timestamps.
    pub fn analyze_fields(
        &self,
        source_item: &RemoteWorkItem,
        target_item: &RemoteWorkItem,
        type_mapping: &ResolvedTypeMapping,
        source_base: Option<&FieldMap>,
        target_base: Option<&FieldMap>,
        execution_id: Option<Uuid>,
    ) -> FieldAnalysis {
        let mut analysis = FieldAnalysis::default();

        for fm in &type_mapping.fields {
            let (Some(source_ref), Some(target_ref)) =
                (fm.source_ref.as_deref(), fm.target_ref.as_deref())
            else {
                continue;
            };

            let source_now = source_item.fields.get(source_ref);
            let target_now = target_item.fields.get(target_ref);
            let source_was = source_base.and_then(|b| b.get(source_ref));
            let target_was = target_base.and_then(|b| b.get(target_ref));

            let source_changed = !values_equal(source_now, source_was);
            let target_changed = !values_equal(target_now, target_was);

            match (source_changed, target_changed) {
                (false, false) => {}
                (true, false) => {
                    if let Some(v) = source_now {
                        analysis
                            .source_to_target
                            .insert(target_ref.to_string(), v.clone());
                    }
                }
                (false, true) => {
                    if let Some(v) = target_now {
                        analysis
                            .target_to_source
                            .insert(source_ref.to_string(), v.clone());
                    }
                }
                (true, true) => {
                    if values_equal(source_now, target_now) {
                        // Both sides arrived at the same value independently.
                        continue;
                    }
                    analysis.conflicts.push(self.field_conflict(
                        source_item,
                        target_item,
                        source_ref,
                        target_ref,
                        source_now.cloned(),
                        target_now.cloned(),
                        source_was.cloned(),
                        execution_id,
                    ));
                }
            }
        }

        if analysis.conflicts.is_empty() {
            if let Some(conflict) =
                self.version_conflict(source_item, target_item, source_base, target_base, execution_id)
            {
                analysis.conflicts.push(conflict);
            }
        }

        analysis
    }

    #[allow(clippy::too_many_arguments)]
    fn field_conflict(
        &self,
        source_item: &RemoteWorkItem,
        target_item: &RemoteWorkItem,
        source_ref: &str,
        target_ref: &str,
        source_value: Option<serde_json::Value>,
        target_value: Option<serde_json::Value>,
        base_value: Option<serde_json::Value>,
        execution_id: Option<Uuid>,
    ) -> SyncConflict {
        SyncConflict {
            id: Uuid::new_v4(),
            sync_config_id: self.config.id,
            execution_id,
            source_work_item_id: source_item.id.clone(),
            target_work_item_id: target_item.id.clone(),
            work_item_type: Some(source_item.item_type.clone()),
            kind: ConflictKind::FieldConflict,
            field_name: Some(source_ref.to_string()),
            source_value,
            target_value,
            base_value,
            status: ConflictStatus::Unresolved,
            resolution_strategy: None,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            metadata: serde_json::json!({
                "target_field": target_ref,
                "source_changed_date": source_item.changed_date().map(|d| d.to_rfc3339()),
                "target_changed_date": target_item.changed_date().map(|d| d.to_rfc3339()),
                "source_revision": source_item.rev,
                "target_revision": target_item.rev,
                "source_changed_by": source_item.changed_by(),
                "target_changed_by": target_item.changed_by(),
            }),
            detected_at: Utc::now(),
        }
    }

    fn version_conflict(
        &self,
        source_item: &RemoteWorkItem,
        target_item: &RemoteWorkItem,
        source_base: Option<&FieldMap>,
        target_base: Option<&FieldMap>,
        execution_id: Option<Uuid>,
    ) -> Option<SyncConflict> {
        let source_now = source_item.changed_date()?;
        let target_now = target_item.changed_date()?;
        let source_was = base_changed_date(source_base)?;
        let target_was = base_changed_date(target_base)?;
        if source_now <= source_was || target_now <= target_was {
            return None;
        }
        Some(SyncConflict {
            id: Uuid::new_v4(),
            sync_config_id: self.config.id,
            execution_id,
            source_work_item_id: source_item.id.clone(),
            target_work_item_id: target_item.id.clone(),
            work_item_type: Some(source_item.item_type.clone()),
            kind: ConflictKind::VersionConflict,
            field_name: None,
            source_value: None,
            target_value: None,
            base_value: None,
            status: ConflictStatus::Unresolved,
            resolution_strategy: None,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            metadata: serde_json::json!({
                "source_changed_date": source_now.to_rfc3339(),
                "target_changed_date": target_now.to_rfc3339(),
                "source_revision": source_item.rev,
                "target_revision": target_item.rev,
            }),
            detected_at: Utc::now(),
        })
    }

    /// A `deletion_conflict` when a prior version exists but the item cannot
    /// be fetched anymore.
    pub async fn detect_deletion(
        &self,
        connector_id: Uuid,
        work_item_id: &str,
        counterpart_id: &str,
        deleted_on_source_side: bool,
        execution_id: Option<Uuid>,
    ) -> Result<Option<SyncConflict>> {
        let previous = self
            .store
            .latest_version(self.config.id, connector_id, work_item_id)
            .await?;
        let Some(previous) = previous else {
            return Ok(None);
        };
        let (source_id, target_id) = if deleted_on_source_side {
            (work_item_id.to_string(), counterpart_id.to_string())
        } else {
            (counterpart_id.to_string(), work_item_id.to_string())
        };
        Ok(Some(SyncConflict {
            id: Uuid::new_v4(),
            sync_config_id: self.config.id,
            execution_id,
            source_work_item_id: source_id,
            target_work_item_id: target_id,
            work_item_type: None,
            kind: ConflictKind::DeletionConflict,
            field_name: None,
            source_value: None,
            target_value: None,
            base_value: Some(previous.fields_snapshot.clone()),
            status: ConflictStatus::Unresolved,
            resolution_strategy: None,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            metadata: serde_json::json!({
                "deleted_side": if deleted_on_source_side { "source" } else { "target" },
                "last_version": previous.version,
            }),
            detected_at: Utc::now(),
        }))
    }

    /// Bulk-insert freshly detected conflicts.
    pub async fn save_conflicts(&self, conflicts: &[SyncConflict]) -> Result<()> {
        if conflicts.is_empty() {
            return Ok(());
        }
        self.store.insert_conflicts(conflicts).await
    }
}

/// Semantic equality: primitives directly, arrays/objects structurally.
/// Absent and null are equivalent.
fn values_equal(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> bool {
    let null = serde_json::Value::Null;
    a.unwrap_or(&null) == b.unwrap_or(&null)
}

fn base_changed_date(base: Option<&FieldMap>) -> Option<DateTime<Utc>> {
    base?
        .get("changedDate")
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
    use ws_core::types::{
        AuthKind, ConnectorRecord, MappingKind, ResolvedFieldMapping, ResolvedStatusMapping,
    };

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn item(id: &str, pairs: &[(&str, serde_json::Value)]) -> RemoteWorkItem {
        RemoteWorkItem {
            id: id.into(),
            item_type: "Task".into(),
            rev: Some("2".into()),
            fields: fields(pairs),
        }
    }

    fn type_mapping(pairs: &[(&str, &str)]) -> ResolvedTypeMapping {
        ResolvedTypeMapping {
            id: Uuid::new_v4(),
            source_type_name: "Task".into(),
            target_type_name: "Task".into(),
            active: true,
            fields: pairs
                .iter()
                .map(|(s, t)| ResolvedFieldMapping {
                    id: Uuid::new_v4(),
                    mapping_kind: MappingKind::Direct,
                    source_ref: Some((*s).to_string()),
                    source_name: None,
                    source_data_type: None,
                    target_ref: Some((*t).to_string()),
                    target_name: None,
                    target_data_type: None,
                    constant_value: None,
                    transformation: None,
                    reverse_transformation: None,
                    required: false,
                })
                .collect(),
            statuses: Vec::<ResolvedStatusMapping>::new(),
        }
    }

    async fn detector() -> (Arc<Store>, ConnectorRecord, ConflictDetector) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let a = ConnectorRecord::new("src", "memory", "mem://", AuthKind::Pat, "00");
        let b = ConnectorRecord::new("tgt", "memory", "mem://", AuthKind::Pat, "00");
        store.insert_connector(&a).await.unwrap();
        store.insert_connector(&b).await.unwrap();
        let cfg = SyncConfig::new("pair", a.id, b.id);
        store.insert_sync_config(&cfg).await.unwrap();
        let det = ConflictDetector::new(store.clone(), cfg);
        (store, a, det)
    }

    #[test]
    fn hash_is_deterministic_and_sensitive() {
        let a = fields(&[("title", json!("Hello")), ("state", json!("New"))]);
        // Same pairs inserted in a different order hash identically.
        let b = fields(&[("state", json!("New")), ("title", json!("Hello"))]);
        assert_eq!(content_hash(&a), content_hash(&b));

        let c = fields(&[("title", json!("Hello!")), ("state", json!("New"))]);
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[tokio::test]
    async fn has_changed_tracks_snapshots() {
        let (_store, a, det) = detector().await;
        let current = fields(&[("title", json!("Hello"))]);

        let check = det.has_changed(a.id, "A-1", &current).await.unwrap();
        assert!(check.is_new);
        assert!(!check.changed);

        det.capture_version(a.id, &item("A-1", &[("title", json!("Hello"))]), None)
            .await
            .unwrap();

        let unchanged = det.has_changed(a.id, "A-1", &current).await.unwrap();
        assert!(!unchanged.is_new);
        assert!(!unchanged.changed);

        let modified = fields(&[("title", json!("Hello world"))]);
        let changed = det.has_changed(a.id, "A-1", &modified).await.unwrap();
        assert!(changed.changed);
        assert_eq!(changed.previous.unwrap().version, 1);
    }

    #[tokio::test]
    async fn both_changed_unequal_is_a_field_conflict() {
        let (_store, _a, det) = detector().await;
        let tm = type_mapping(&[("title", "title")]);
        let base = fields(&[("title", json!("Hello"))]);

        let analysis = det.analyze_fields(
            &item("A-1", &[("title", json!("S"))]),
            &item("B-7", &[("title", json!("T"))]),
            &tm,
            Some(&base),
            Some(&base),
            None,
        );
        assert_eq!(analysis.conflicts.len(), 1);
        let c = &analysis.conflicts[0];
        assert_eq!(c.kind, ConflictKind::FieldConflict);
        assert_eq!(c.field_name.as_deref(), Some("title"));
        assert_eq!(c.source_value, Some(json!("S")));
        assert_eq!(c.target_value, Some(json!("T")));
        assert_eq!(c.base_value, Some(json!("Hello")));
        assert_eq!(c.status, ConflictStatus::Unresolved);
        assert_eq!(c.metadata["target_field"], "title");
    }

    #[tokio::test]
    async fn unchanged_side_never_conflicts() {
        let (_store, _a, det) = detector().await;
        let tm = type_mapping(&[("title", "title"), ("state", "state")]);
        let base = fields(&[("title", json!("Hello")), ("state", json!("New"))]);

        // Source changed title, target changed state — disjoint.
        let analysis = det.analyze_fields(
            &item("A-1", &[("title", json!("S")), ("state", json!("New"))]),
            &item("B-7", &[("title", json!("Hello")), ("state", json!("Active"))]),
            &tm,
            Some(&base),
            Some(&base),
            None,
        );
        assert!(analysis.conflicts.is_empty());
        assert_eq!(analysis.source_to_target["title"], json!("S"));
        assert_eq!(analysis.target_to_source["state"], json!("Active"));
    }

    #[tokio::test]
    async fn convergent_edits_do_not_conflict() {
        let (_store, _a, det) = detector().await;
        let tm = type_mapping(&[("title", "title")]);
        let base = fields(&[("title", json!("Hello"))]);

        let analysis = det.analyze_fields(
            &item("A-1", &[("title", json!("Same"))]),
            &item("B-7", &[("title", json!("Same"))]),
            &tm,
            Some(&base),
            Some(&base),
            None,
        );
        assert!(analysis.conflicts.is_empty());
        assert!(analysis.source_to_target.is_empty());
        assert!(analysis.target_to_source.is_empty());
    }

    #[tokio::test]
    async fn version_conflict_when_dates_moved_but_no_field_differs() {
        let (_store, _a, det) = detector().await;
        // No field mappings at all: field analysis cannot see the change,
        // but both changedDates moved past the bases.
        let tm = type_mapping(&[]);
        let source_base = fields(&[("changedDate", json!("2026-01-01T00:00:00+00:00"))]);
        let target_base = fields(&[("changedDate", json!("2026-01-01T00:00:00+00:00"))]);

        let analysis = det.analyze_fields(
            &item("A-1", &[("changedDate", json!("2026-02-01T00:00:00+00:00"))]),
            &item("B-7", &[("changedDate", json!("2026-02-02T00:00:00+00:00"))]),
            &tm,
            Some(&source_base),
            Some(&target_base),
            None,
        );
        assert_eq!(analysis.conflicts.len(), 1);
        assert_eq!(analysis.conflicts[0].kind, ConflictKind::VersionConflict);
        assert!(analysis.conflicts[0].metadata["source_changed_date"]
            .as_str()
            .is_some());
    }

    #[tokio::test]
    async fn deletion_conflict_requires_prior_version() {
        let (_store, a, det) = detector().await;

        // No snapshot yet: nothing to report.
        let none = det
            .detect_deletion(a.id, "A-1", "B-7", true, None)
            .await
            .unwrap();
        assert!(none.is_none());

        det.capture_version(a.id, &item("A-1", &[("title", json!("Hello"))]), None)
            .await
            .unwrap();
        let conflict = det
            .detect_deletion(a.id, "A-1", "B-7", true, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict.kind, ConflictKind::DeletionConflict);
        assert_eq!(conflict.source_work_item_id, "A-1");
        assert_eq!(conflict.target_work_item_id, "B-7");
        assert_eq!(conflict.metadata["deleted_side"], "source");
    }

    #[tokio::test]
    async fn save_conflicts_persists_unresolved_rows() {
        let (store, _a, det) = detector().await;
        let tm = type_mapping(&[("title", "title")]);
        let base = fields(&[("title", json!("Hello"))]);
        let analysis = det.analyze_fields(
            &item("A-1", &[("title", json!("S"))]),
            &item("B-7", &[("title", json!("T"))]),
            &tm,
            Some(&base),
            Some(&base),
            None,
        );
        det.save_conflicts(&analysis.conflicts).await.unwrap();
        let listed = store
            .list_conflicts(det.config.id, Some(ConflictStatus::Unresolved))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }
}
