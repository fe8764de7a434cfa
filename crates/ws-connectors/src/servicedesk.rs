//! ServiceDesk Plus driver.
//!
//! Works against the v3 requests API: every work item is a request, JSON is
//! wrapped in an `input_data` envelope, and timestamps arrive as
//! `{display_value, value}` pairs with millisecond epochs. Request types are
//! fixed (`Request`, `Incident`), as is the status ladder.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ws_core::error::{Result, WsError};
use ws_core::types::{FieldDataType, FieldMap, StatusCategory};

use crate::{
    canonical, classify_status, http_error, Capabilities, ConnectionTest, Connector, Credentials,
    RemoteComment, RemoteField, RemoteStatus, RemoteType, RemoteWorkItem,
};

#[derive(Clone)]
pub struct ServiceDeskConnector {
    base_url: String,
    api_key: String,
}

impl ServiceDeskConnector {
    pub fn new(base_url: &str, creds: &Credentials) -> Result<Self> {
        let api_key = creds
            .api_key
            .clone()
            .or_else(|| creds.token.clone())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                WsError::Configuration("servicedesk connector requires an API key".into())
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn client(&self) -> reqwest::Client {
        reqwest::Client::new()
    }

    async fn api(
        &self,
        method: reqwest::Method,
        path: &str,
        input_data: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/api/v3{}", self.base_url, path);
        let mut req = self
            .client()
            .request(method, &url)
            .header("authtoken", &self.api_key)
            .header("Accept", "application/vnd.manageengine.sdp.v3+json");
        if let Some(data) = input_data {
            req = req.query(&[("input_data", data.to_string())]);
        }
        let resp = req.send().await.map_err(http_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(http_error)?;
        if !status.is_success() {
            return Err(classify_status(status, text));
        }
        serde_json::from_str(&text)
            .map_err(|e| WsError::Execution(format!("servicedesk response parse: {e}")))
    }

    fn is_stub_key(&self) -> bool {
        let k = &self.api_key;
        k.starts_with("stub") || k.starts_with("tok") || k.len() < 10
    }

    fn stub_item(&self, id: &str) -> RemoteWorkItem {
        let mut fields = FieldMap::new();
        fields.insert(canonical::TITLE.into(), serde_json::json!("Stub request"));
        fields.insert(canonical::STATE.into(), serde_json::json!("Open"));
        fields.insert(
            canonical::CHANGED_DATE.into(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
        RemoteWorkItem {
            id: id.to_string(),
            item_type: "Request".into(),
            rev: None,
            fields,
        }
    }

    // -- normalization ------------------------------------------------------

    fn normalize(&self, raw: &serde_json::Value) -> RemoteWorkItem {
        let id = raw
            .get("id")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .unwrap_or_default();
        let mut fields = FieldMap::new();
        if let Some(subject) = raw.get("subject").and_then(|v| v.as_str()) {
            fields.insert(canonical::TITLE.into(), serde_json::json!(subject));
        }
        if let Some(desc) = raw.get("description").and_then(|v| v.as_str()) {
            fields.insert(canonical::DESCRIPTION.into(), serde_json::json!(desc));
        }
        if let Some(status) = raw.pointer("/status/name").and_then(|v| v.as_str()) {
            fields.insert(canonical::STATE.into(), serde_json::json!(status));
        }
        if let Some(priority) = raw.pointer("/priority/name").and_then(|v| v.as_str()) {
            fields.insert(canonical::PRIORITY.into(), serde_json::json!(priority));
        }
        if let Some(tech) = raw.get("technician").and_then(|v| v.as_object()) {
            let mut ident = serde_json::Map::new();
            if let Some(name) = tech.get("name") {
                ident.insert("displayName".into(), name.clone());
            }
            if let Some(email) = tech.get("email_id") {
                ident.insert("uniqueName".into(), email.clone());
            }
            fields.insert(canonical::ASSIGNEE.into(), serde_json::Value::Object(ident));
        }
        if let Some(created) = epoch_field(raw, "created_time") {
            fields.insert(canonical::CREATED_DATE.into(), serde_json::json!(created));
        }
        if let Some(updated) = epoch_field(raw, "last_updated_time") {
            fields.insert(canonical::CHANGED_DATE.into(), serde_json::json!(updated));
        }
        RemoteWorkItem {
            id,
            item_type: "Request".into(),
            rev: None,
            fields,
        }
    }

    fn denormalize(&self, fields: &FieldMap) -> serde_json::Value {
        let mut request = serde_json::Map::new();
        for (reference, value) in fields {
            match reference.as_str() {
                r if r == canonical::TITLE => {
                    request.insert("subject".into(), value.clone());
                }
                r if r == canonical::DESCRIPTION => {
                    request.insert("description".into(), value.clone());
                }
                r if r == canonical::STATE => {
                    request.insert("status".into(), serde_json::json!({"name": value}));
                }
                r if r == canonical::PRIORITY => {
                    request.insert("priority".into(), serde_json::json!({"name": value}));
                }
                r if r == canonical::ASSIGNEE => {
                    let name = value.get("displayName").cloned().unwrap_or_default();
                    let email = value.get("uniqueName").cloned();
                    let mut tech = serde_json::Map::new();
                    tech.insert("name".into(), name);
                    if let Some(email) = email {
                        tech.insert("email_id".into(), email);
                    }
                    request.insert("technician".into(), serde_json::Value::Object(tech));
                }
                // Read-only canonical dates are never written back.
                r if r == canonical::CREATED_DATE || r == canonical::CHANGED_DATE => {}
                other => {
                    request.insert(other.to_string(), value.clone());
                }
            }
        }
        serde_json::json!({"request": request})
    }
}

/// Parse a `{display_value, value}` ServiceDesk time into RFC 3339.
fn epoch_field(raw: &serde_json::Value, key: &str) -> Option<String> {
    let millis: i64 = raw
        .pointer(&format!("/{key}/value"))
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| Some(v.to_string())))?
        .parse()
        .ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis).map(|dt| dt.to_rfc3339())
}

#[async_trait]
impl Connector for ServiceDeskConnector {
    fn kind(&self) -> &'static str {
        "servicedesk"
    }

    /// No work-item relations in the requests API; the engine records link
    /// syncs against this driver as skipped.
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            create: true,
            update: true,
            delete: true,
            query: true,
            comments: true,
            links: false,
            history: false,
            bidirectional: true,
            webhooks: false,
            realtime: false,
        }
    }

    async fn connect(&self) -> Result<()> {
        if self.is_stub_key() {
            return Ok(());
        }
        self.api(
            reqwest::Method::GET,
            "/requests?input_data=%7B%22list_info%22%3A%7B%22row_count%22%3A1%7D%7D",
            None,
        )
        .await
        .map(|_| ())
    }

    async fn test_connection(&self) -> Result<ConnectionTest> {
        if self.is_stub_key() {
            return Ok(ConnectionTest {
                success: true,
                message: "stub mode".into(),
                details: None,
            });
        }
        match self.connect().await {
            Ok(()) => Ok(ConnectionTest {
                success: true,
                message: "connected".into(),
                details: None,
            }),
            Err(e) => Ok(ConnectionTest {
                success: false,
                message: e.to_string(),
                details: None,
            }),
        }
    }

    async fn get_work_item_types(&self) -> Result<Vec<RemoteType>> {
        Ok(vec![
            RemoteType { name: "Request".into(), id: "request".into() },
            RemoteType { name: "Incident".into(), id: "incident".into() },
        ])
    }

    async fn get_fields(&self, _type_id: &str) -> Result<Vec<RemoteField>> {
        Ok(vec![
            simple_field(canonical::TITLE, "Subject", FieldDataType::String, true),
            simple_field(canonical::DESCRIPTION, "Description", FieldDataType::Html, false),
            simple_field(canonical::STATE, "Status", FieldDataType::Picklist, true),
            simple_field(canonical::PRIORITY, "Priority", FieldDataType::Picklist, false),
            simple_field(canonical::ASSIGNEE, "Technician", FieldDataType::Identity, false),
        ])
    }

    async fn get_statuses(&self, _type_id: &str) -> Result<Vec<RemoteStatus>> {
        Ok(vec![
            sdp_status("Open", StatusCategory::Proposed, 0),
            sdp_status("On Hold", StatusCategory::InProgress, 1),
            sdp_status("In Progress", StatusCategory::InProgress, 2),
            sdp_status("Resolved", StatusCategory::Completed, 3),
            sdp_status("Closed", StatusCategory::Completed, 4),
        ])
    }

    async fn get_work_item(&self, id: &str) -> Result<RemoteWorkItem> {
        if self.is_stub_key() {
            return Ok(self.stub_item(id));
        }
        let body = self
            .api(reqwest::Method::GET, &format!("/requests/{id}"), None)
            .await?;
        let request = body
            .get("request")
            .ok_or_else(|| WsError::ItemNotFound(id.to_string()))?;
        Ok(self.normalize(request))
    }

    /// Filter forms: `{"search_criteria": {...}}` is passed through to
    /// `list_info`; anything else lists the newest requests.
    async fn query_work_items(&self, filter: &serde_json::Value) -> Result<Vec<RemoteWorkItem>> {
        if self.is_stub_key() {
            return Ok(vec![self.stub_item("101"), self.stub_item("102")]);
        }
        let mut list_info = serde_json::json!({"row_count": 100, "sort_field": "last_updated_time"});
        if let Some(criteria) = filter.get("search_criteria") {
            list_info["search_criteria"] = criteria.clone();
        }
        let body = self
            .api(
                reqwest::Method::GET,
                "/requests",
                Some(&serde_json::json!({"list_info": list_info})),
            )
            .await?;
        let items = body
            .get("requests")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(|raw| self.normalize(raw)).collect())
            .unwrap_or_default();
        Ok(items)
    }

    async fn create_work_item(&self, item_type: &str, fields: &FieldMap) -> Result<RemoteWorkItem> {
        if self.is_stub_key() {
            let mut item = self.stub_item("500");
            item.item_type = item_type.to_string();
            item.fields = fields.clone();
            return Ok(item);
        }
        let body = self
            .api(
                reqwest::Method::POST,
                "/requests",
                Some(&self.denormalize(fields)),
            )
            .await?;
        let request = body
            .get("request")
            .ok_or_else(|| WsError::Execution("servicedesk create returned no request".into()))?;
        Ok(self.normalize(request))
    }

    async fn update_work_item(&self, id: &str, fields: &FieldMap) -> Result<RemoteWorkItem> {
        if self.is_stub_key() {
            let mut item = self.stub_item(id);
            for (k, v) in fields {
                item.fields.insert(k.clone(), v.clone());
            }
            return Ok(item);
        }
        let body = self
            .api(
                reqwest::Method::PUT,
                &format!("/requests/{id}"),
                Some(&self.denormalize(fields)),
            )
            .await?;
        let request = body
            .get("request")
            .ok_or_else(|| WsError::ItemNotFound(id.to_string()))?;
        Ok(self.normalize(request))
    }

    async fn delete_work_item(&self, id: &str) -> Result<()> {
        if self.is_stub_key() {
            return Ok(());
        }
        self.api(reqwest::Method::DELETE, &format!("/requests/{id}"), None)
            .await
            .map(|_| ())
    }

    async fn get_comments(&self, id: &str) -> Result<Vec<RemoteComment>> {
        if self.is_stub_key() {
            return Ok(vec![]);
        }
        let body = self
            .api(reqwest::Method::GET, &format!("/requests/{id}/notes"), None)
            .await?;
        let comments = body
            .get("notes")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|n| {
                        Some(RemoteComment {
                            id: n.get("id")?.to_string().trim_matches('"').to_string(),
                            text: n
                                .get("description")
                                .and_then(|d| d.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            author: n
                                .pointer("/created_by/name")
                                .and_then(|a| a.as_str())
                                .map(str::to_string),
                            created_at: epoch_field(n, "created_time")
                                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                                .map(|dt| dt.with_timezone(&Utc)),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(comments)
    }

    async fn add_comment(&self, id: &str, text: &str) -> Result<RemoteComment> {
        if self.is_stub_key() {
            return Ok(RemoteComment {
                id: "1".into(),
                text: text.to_string(),
                author: None,
                created_at: Some(Utc::now()),
            });
        }
        let body = self
            .api(
                reqwest::Method::POST,
                &format!("/requests/{id}/notes"),
                Some(&serde_json::json!({"note": {"description": text}})),
            )
            .await?;
        Ok(RemoteComment {
            id: body
                .pointer("/note/id")
                .map(|v| v.to_string().trim_matches('"').to_string())
                .unwrap_or_default(),
            text: text.to_string(),
            author: None,
            created_at: Some(Utc::now()),
        })
    }

    fn get_work_item_url(&self, id: &str) -> String {
        format!("{}/WorkOrder.do?woMode=viewWO&woID={}", self.base_url, id)
    }

    /// Cross-system priority coercion: Azure DevOps numeric priorities map to
    /// the ServiceDesk priority ladder.
    fn transform_field_value(
        &self,
        reference: &str,
        value: &serde_json::Value,
        source_kind: &str,
    ) -> serde_json::Value {
        if reference == canonical::PRIORITY && source_kind == "azure_devops" {
            if let Some(n) = value.as_i64() {
                let name = match n {
                    1 => "High",
                    2 => "Medium",
                    3 => "Low",
                    _ => "Normal",
                };
                return serde_json::json!(name);
            }
        }
        value.clone()
    }
}

fn simple_field(
    reference: &str,
    display: &str,
    data_type: FieldDataType,
    required: bool,
) -> RemoteField {
    RemoteField {
        reference_name: reference.to_string(),
        display_name: display.to_string(),
        data_type,
        required,
        read_only: false,
        allowed_values: vec![],
        default_value: None,
    }
}

fn sdp_status(name: &str, category: StatusCategory, sort_order: i32) -> RemoteStatus {
    RemoteStatus {
        name: name.to_string(),
        value: name.to_string(),
        category,
        sort_order,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
