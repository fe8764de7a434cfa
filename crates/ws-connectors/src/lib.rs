//! Connector abstraction: a uniform capability surface over heterogeneous
//! issue-tracking systems, plus the per-system drivers.
//!
//! Every driver normalizes remote payloads into the canonical
//! [`RemoteWorkItem`] form on read and denormalizes on write. A small set of
//! canonical reference names ([`canonical`]) is recognized across drivers;
//! anything else passes through unchanged. Optional operations are gated by
//! [`Capabilities`] — read it before calling them and treat an absent
//! capability as a non-fatal skip.

pub mod azure_devops;
pub mod memory;
pub mod registry;
pub mod servicedesk;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use ws_core::error::{Result, WsError};
use ws_core::types::FieldMap;

// ---------------------------------------------------------------------------
// Canonical field references
// ---------------------------------------------------------------------------

/// The stable reference-name vocabulary that makes heterogeneous drivers
/// interoperate. Drivers own their mapping to and from these names.
pub mod canonical {
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const STATE: &str = "state";
    pub const TYPE: &str = "type";
    pub const PRIORITY: &str = "priority";
    pub const ASSIGNEE: &str = "assignee";
    pub const CREATED_DATE: &str = "createdDate";
    pub const CHANGED_DATE: &str = "changedDate";
    pub const AREA_PATH: &str = "areaPath";
    pub const ITERATION_PATH: &str = "iterationPath";

    /// References that strongly suggest a field mapping during discovery.
    pub const CORE_SUGGESTIONS: &[&str] =
        &[TITLE, DESCRIPTION, STATE, "status", PRIORITY, TYPE];
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Boolean capability matrix advertised by each driver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub create: bool,
    pub update: bool,
    pub delete: bool,
    pub query: bool,
    pub comments: bool,
    pub links: bool,
    pub history: bool,
    pub bidirectional: bool,
    pub webhooks: bool,
    pub realtime: bool,
}

/// Result of a cheap read that exercises auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Canonical form of a work item: `{id, type, rev, fields}` with fields keyed
/// by stable reference name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWorkItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub rev: Option<String>,
    pub fields: FieldMap,
}

impl RemoteWorkItem {
    pub fn field_str(&self, reference: &str) -> Option<&str> {
        self.fields.get(reference).and_then(|v| v.as_str())
    }

    /// Best-effort canonical changed date; absence is tolerated.
    pub fn changed_date(&self) -> Option<DateTime<Utc>> {
        self.field_str(canonical::CHANGED_DATE)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Best-effort canonical changed-by display name.
    pub fn changed_by(&self) -> Option<String> {
        match self.fields.get("changedBy") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Object(map)) => map
                .get("displayName")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => None,
        }
    }
}

/// A work-item type as reported by the remote system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteType {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteField {
    pub reference_name: String,
    pub display_name: String,
    pub data_type: ws_core::types::FieldDataType,
    pub required: bool,
    pub read_only: bool,
    pub allowed_values: Vec<String>,
    pub default_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub name: String,
    pub value: String,
    pub category: ws_core::types::StatusCategory,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteComment {
    pub id: String,
    pub text: String,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A relation between two work items on the same remote system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRelation {
    pub relation_type: String,
    pub linked_work_item_id: String,
    pub url: Option<String>,
}

/// Decrypted connector credentials. Zeroed from memory on drop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// The connector trait
// ---------------------------------------------------------------------------

/// Uniform operations over a remote issue-tracking system.
///
/// Optional operations have default bodies returning
/// [`WsError::NotSupported`]; drivers advertising the capability override
/// them. Drivers must be safe for concurrent use — instances are cached
/// process-wide and shared across queue workers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registered driver name, e.g. `"azure_devops"`.
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Establish any persistent client/session. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Cheap read that exercises auth.
    async fn test_connection(&self) -> Result<ConnectionTest>;

    // -- discovery ----------------------------------------------------------

    async fn get_work_item_types(&self) -> Result<Vec<RemoteType>>;
    async fn get_fields(&self, type_id: &str) -> Result<Vec<RemoteField>>;
    async fn get_statuses(&self, type_id: &str) -> Result<Vec<RemoteStatus>>;

    // -- items --------------------------------------------------------------

    async fn get_work_item(&self, id: &str) -> Result<RemoteWorkItem>;

    /// `filter` is opaque to the engine — driver-specific query JSON
    /// (e.g. WIQL for Azure DevOps).
    async fn query_work_items(&self, filter: &serde_json::Value) -> Result<Vec<RemoteWorkItem>>;

    async fn create_work_item(&self, item_type: &str, fields: &FieldMap) -> Result<RemoteWorkItem>;
    async fn update_work_item(&self, id: &str, fields: &FieldMap) -> Result<RemoteWorkItem>;
    async fn delete_work_item(&self, id: &str) -> Result<()>;

    // -- optional capabilities ----------------------------------------------

    async fn get_comments(&self, _id: &str) -> Result<Vec<RemoteComment>> {
        Err(WsError::NotSupported("comments"))
    }

    async fn add_comment(&self, _id: &str, _text: &str) -> Result<RemoteComment> {
        Err(WsError::NotSupported("comments"))
    }

    async fn get_relations(&self, _id: &str) -> Result<Vec<RemoteRelation>> {
        Err(WsError::NotSupported("links"))
    }

    async fn add_relation(&self, _id: &str, _target_id: &str, _relation_type: &str) -> Result<()> {
        Err(WsError::NotSupported("links"))
    }

    async fn get_history(&self, _id: &str) -> Result<Vec<serde_json::Value>> {
        Err(WsError::NotSupported("history"))
    }

    // -- misc ---------------------------------------------------------------

    /// Deep link for UIs.
    fn get_work_item_url(&self, id: &str) -> String;

    /// Driver-specific value coercion on write, e.g. rewriting area-path
    /// prefixes from the source project to this connector's own project.
    fn transform_field_value(
        &self,
        _reference: &str,
        value: &serde_json::Value,
        _source_kind: &str,
    ) -> serde_json::Value {
        value.clone()
    }
}

// ---------------------------------------------------------------------------
// HTTP error classification
// ---------------------------------------------------------------------------

/// Fold an HTTP status + body into the shared error taxonomy.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: String) -> WsError {
    let detail = format!("{} {}", status.as_u16(), body);
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        WsError::RemoteAuth(detail)
    } else if status == reqwest::StatusCode::NOT_FOUND {
        WsError::ItemNotFound(detail)
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        WsError::RemoteTransient(detail)
    } else {
        WsError::Execution(detail)
    }
}

/// Transport-level failures (DNS, connect, timeout) are transient.
pub(crate) fn http_error(err: reqwest::Error) -> WsError {
    WsError::RemoteTransient(err.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
