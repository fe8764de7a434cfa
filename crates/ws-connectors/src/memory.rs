//! In-memory driver backed by a shared item table.
//!
//! Used by engine-level tests and local dry runs: tests keep a handle to seed
//! and inspect the remote state while the sync engine drives the same
//! instance through the [`Connector`] trait. Every write is also recorded so
//! assertions can check exactly what the engine did.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use ws_core::error::{Result, WsError};
use ws_core::types::{FieldDataType, FieldMap, StatusCategory};

use crate::{
    canonical, Capabilities, ConnectionTest, Connector, RemoteComment, RemoteField,
    RemoteRelation, RemoteStatus, RemoteType, RemoteWorkItem,
};

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<String, RemoteWorkItem>,
    comments: BTreeMap<String, Vec<RemoteComment>>,
    relations: BTreeMap<String, Vec<RemoteRelation>>,
    next_id: u64,
    next_comment_id: u64,
    /// Recorded `create_work_item` calls: (id, type, fields).
    created: Vec<(String, String, FieldMap)>,
    /// Recorded `update_work_item` calls: (id, fields).
    updated: Vec<(String, FieldMap)>,
    fail_connection: bool,
    statuses: Vec<RemoteStatus>,
}

/// A programmable in-memory remote system. Cloning yields another handle to
/// the same state.
#[derive(Clone)]
pub struct MemoryConnector {
    prefix: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    /// A connector whose created items get ids `{prefix}-{n}`.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut state = MemoryState {
            next_id: 1,
            next_comment_id: 1,
            ..MemoryState::default()
        };
        state.statuses = vec![
            status("New", "new", StatusCategory::Proposed, 0),
            status("Open", "open", StatusCategory::Proposed, 1),
            status("Active", "active", StatusCategory::InProgress, 2),
            status("Done", "done", StatusCategory::Completed, 3),
        ];
        Self {
            prefix: prefix.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory connector lock poisoned")
    }

    /// Seed the next id assigned by `create_work_item`.
    pub fn set_next_id(&self, next: u64) {
        self.lock().next_id = next;
    }

    /// Make `connect`/`test_connection` fail (simulates bad credentials).
    pub fn set_fail_connection(&self, fail: bool) {
        self.lock().fail_connection = fail;
    }

    /// Insert or replace a remote item directly.
    pub fn put_item(&self, item: RemoteWorkItem) {
        self.lock().items.insert(item.id.clone(), item);
    }

    /// Convenience: build and insert an item from `(id, type, fields)` pairs.
    pub fn seed_item(&self, id: &str, item_type: &str, fields: &[(&str, serde_json::Value)]) {
        let mut map = FieldMap::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), v.clone());
        }
        self.put_item(RemoteWorkItem {
            id: id.to_string(),
            item_type: item_type.to_string(),
            rev: Some("1".into()),
            fields: map,
        });
    }

    /// Set one field on an existing item, bumping its revision.
    pub fn set_field(&self, id: &str, reference: &str, value: serde_json::Value) {
        let mut state = self.lock();
        if let Some(item) = state.items.get_mut(id) {
            item.fields.insert(reference.to_string(), value);
            let rev = item.rev.take().and_then(|r| r.parse::<u64>().ok()).unwrap_or(1);
            item.rev = Some((rev + 1).to_string());
        }
    }

    /// Remove an item (simulates deletion on the remote).
    pub fn remove_item(&self, id: &str) {
        self.lock().items.remove(id);
    }

    pub fn seed_relation(&self, id: &str, linked_id: &str, relation_type: &str) {
        self.lock()
            .relations
            .entry(id.to_string())
            .or_default()
            .push(RemoteRelation {
                relation_type: relation_type.to_string(),
                linked_work_item_id: linked_id.to_string(),
                url: None,
            });
    }

    pub fn seed_comment(&self, id: &str, comment_id: &str, text: &str, author: &str) {
        self.lock()
            .comments
            .entry(id.to_string())
            .or_default()
            .push(RemoteComment {
                id: comment_id.to_string(),
                text: text.to_string(),
                author: Some(author.to_string()),
                created_at: Some(Utc::now()),
            });
    }

    pub fn get_item(&self, id: &str) -> Option<RemoteWorkItem> {
        self.lock().items.get(id).cloned()
    }

    /// All recorded `create_work_item` calls.
    pub fn created_calls(&self) -> Vec<(String, String, FieldMap)> {
        self.lock().created.clone()
    }

    /// All recorded `update_work_item` calls.
    pub fn updated_calls(&self) -> Vec<(String, FieldMap)> {
        self.lock().updated.clone()
    }

    pub fn comments_of(&self, id: &str) -> Vec<RemoteComment> {
        self.lock().comments.get(id).cloned().unwrap_or_default()
    }

    pub fn relations_of(&self, id: &str) -> Vec<RemoteRelation> {
        self.lock().relations.get(id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            create: true,
            update: true,
            delete: true,
            query: true,
            comments: true,
            links: true,
            history: false,
            bidirectional: true,
            webhooks: true,
            realtime: false,
        }
    }

    async fn connect(&self) -> Result<()> {
        if self.lock().fail_connection {
            return Err(WsError::RemoteAuth("memory connector set to fail".into()));
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<ConnectionTest> {
        if self.lock().fail_connection {
            return Ok(ConnectionTest {
                success: false,
                message: "memory connector set to fail".into(),
                details: None,
            });
        }
        Ok(ConnectionTest {
            success: true,
            message: "ok".into(),
            details: Some(serde_json::json!({"items": self.lock().items.len()})),
        })
    }

    async fn get_work_item_types(&self) -> Result<Vec<RemoteType>> {
        Ok(vec![
            RemoteType { name: "Task".into(), id: "task".into() },
            RemoteType { name: "Bug".into(), id: "bug".into() },
        ])
    }

    async fn get_fields(&self, _type_id: &str) -> Result<Vec<RemoteField>> {
        Ok(vec![
            field(canonical::TITLE, "Title", FieldDataType::String, true, false),
            field(canonical::DESCRIPTION, "Description", FieldDataType::Html, false, false),
            field(canonical::STATE, "State", FieldDataType::Picklist, true, false),
            field(canonical::PRIORITY, "Priority", FieldDataType::Int, false, false),
            field(canonical::ASSIGNEE, "Assigned To", FieldDataType::Identity, false, false),
            field(canonical::CHANGED_DATE, "Changed Date", FieldDataType::Datetime, false, true),
        ])
    }

    async fn get_statuses(&self, _type_id: &str) -> Result<Vec<RemoteStatus>> {
        Ok(self.lock().statuses.clone())
    }

    async fn get_work_item(&self, id: &str) -> Result<RemoteWorkItem> {
        self.lock()
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| WsError::ItemNotFound(id.to_string()))
    }

    /// Filter forms: `{"ids": [...]}` selects by id, `{"types": [...]}` by
    /// work-item type; anything else returns every item.
    async fn query_work_items(&self, filter: &serde_json::Value) -> Result<Vec<RemoteWorkItem>> {
        let state = self.lock();
        if let Some(ids) = filter.get("ids").and_then(|v| v.as_array()) {
            let wanted: Vec<&str> = ids.iter().filter_map(|v| v.as_str()).collect();
            return Ok(state
                .items
                .values()
                .filter(|item| wanted.contains(&item.id.as_str()))
                .cloned()
                .collect());
        }
        if let Some(types) = filter.get("types").and_then(|v| v.as_array()) {
            let wanted: Vec<&str> = types.iter().filter_map(|v| v.as_str()).collect();
            return Ok(state
                .items
                .values()
                .filter(|item| wanted.contains(&item.item_type.as_str()))
                .cloned()
                .collect());
        }
        Ok(state.items.values().cloned().collect())
    }

    async fn create_work_item(&self, item_type: &str, fields: &FieldMap) -> Result<RemoteWorkItem> {
        let mut state = self.lock();
        let id = format!("{}-{}", self.prefix, state.next_id);
        state.next_id += 1;
        let item = RemoteWorkItem {
            id: id.clone(),
            item_type: item_type.to_string(),
            rev: Some("1".into()),
            fields: fields.clone(),
        };
        state.items.insert(id.clone(), item.clone());
        state.created.push((id, item_type.to_string(), fields.clone()));
        Ok(item)
    }

    async fn update_work_item(&self, id: &str, fields: &FieldMap) -> Result<RemoteWorkItem> {
        let mut state = self.lock();
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| WsError::ItemNotFound(id.to_string()))?;
        for (k, v) in fields {
            item.fields.insert(k.clone(), v.clone());
        }
        let rev = item.rev.take().and_then(|r| r.parse::<u64>().ok()).unwrap_or(1);
        item.rev = Some((rev + 1).to_string());
        let updated = item.clone();
        state.updated.push((id.to_string(), fields.clone()));
        Ok(updated)
    }

    async fn delete_work_item(&self, id: &str) -> Result<()> {
        self.lock()
            .items
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| WsError::ItemNotFound(id.to_string()))
    }

    async fn get_comments(&self, id: &str) -> Result<Vec<RemoteComment>> {
        Ok(self.comments_of(id))
    }

    async fn add_comment(&self, id: &str, text: &str) -> Result<RemoteComment> {
        let mut state = self.lock();
        let comment = RemoteComment {
            id: format!("c-{}", state.next_comment_id),
            text: text.to_string(),
            author: None,
            created_at: Some(Utc::now()),
        };
        state.next_comment_id += 1;
        state
            .comments
            .entry(id.to_string())
            .or_default()
            .push(comment.clone());
        Ok(comment)
    }

    async fn get_relations(&self, id: &str) -> Result<Vec<RemoteRelation>> {
        Ok(self.relations_of(id))
    }

    async fn add_relation(&self, id: &str, target_id: &str, relation_type: &str) -> Result<()> {
        self.seed_relation(id, target_id, relation_type);
        Ok(())
    }

    fn get_work_item_url(&self, id: &str) -> String {
        format!("memory://{}/{}", self.prefix, id)
    }
}

fn field(
    reference: &str,
    display: &str,
    data_type: FieldDataType,
    required: bool,
    read_only: bool,
) -> RemoteField {
    RemoteField {
        reference_name: reference.to_string(),
        display_name: display.to_string(),
        data_type,
        required,
        read_only,
        allowed_values: vec![],
        default_value: None,
    }
}

fn status(name: &str, value: &str, category: StatusCategory, sort_order: i32) -> RemoteStatus {
    RemoteStatus {
        name: name.to_string(),
        value: value.to_string(),
        category,
        sort_order,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_assigns_sequential_prefixed_ids() {
        let conn = MemoryConnector::new("B");
        conn.set_next_id(7);
        let a = conn.create_work_item("Task", &FieldMap::new()).await.unwrap();
        let b = conn.create_work_item("Task", &FieldMap::new()).await.unwrap();
        assert_eq!(a.id, "B-7");
        assert_eq!(b.id, "B-8");
        assert_eq!(conn.created_calls().len(), 2);
    }

    #[tokio::test]
    async fn update_merges_fields_and_bumps_rev() {
        let conn = MemoryConnector::new("A");
        conn.seed_item("A-1", "Task", &[("title", serde_json::json!("Hello"))]);

        let mut change = FieldMap::new();
        change.insert("state".into(), serde_json::json!("Open"));
        let updated = conn.update_work_item("A-1", &change).await.unwrap();

        assert_eq!(updated.field_str("title"), Some("Hello"));
        assert_eq!(updated.field_str("state"), Some("Open"));
        assert_eq!(updated.rev.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn missing_item_is_item_not_found() {
        let conn = MemoryConnector::new("A");
        assert!(matches!(
            conn.get_work_item("A-404").await,
            Err(WsError::ItemNotFound(_))
        ));
        assert!(matches!(
            conn.update_work_item("A-404", &FieldMap::new()).await,
            Err(WsError::ItemNotFound(_))
        ));
    }

    #[tokio::test]
    async fn query_filters_by_ids_and_types() {
        let conn = MemoryConnector::new("A");
        conn.seed_item("A-1", "Task", &[]);
        conn.seed_item("A-2", "Bug", &[]);
        conn.seed_item("A-3", "Task", &[]);

        let by_type = conn
            .query_work_items(&serde_json::json!({"types": ["Task"]}))
            .await
            .unwrap();
        assert_eq!(by_type.len(), 2);

        let by_id = conn
            .query_work_items(&serde_json::json!({"ids": ["A-2"]}))
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].item_type, "Bug");

        let all = conn.query_work_items(&serde_json::json!({})).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn comments_and_relations_roundtrip() {
        let conn = MemoryConnector::new("A");
        conn.seed_item("A-1", "Task", &[]);
        conn.add_comment("A-1", "first").await.unwrap();
        conn.add_relation("A-1", "A-2", "related").await.unwrap();

        assert_eq!(conn.get_comments("A-1").await.unwrap().len(), 1);
        let rels = conn.get_relations("A-1").await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].linked_work_item_id, "A-2");
    }

    #[tokio::test]
    async fn failing_connection_reports_unsuccessful_test() {
        let conn = MemoryConnector::new("A");
        conn.set_fail_connection(true);
        assert!(conn.connect().await.is_err());
        let test = conn.test_connection().await.unwrap();
        assert!(!test.success);
    }
}
