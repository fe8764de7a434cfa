use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical field map of a work item: stable reference name → value.
///
/// A `BTreeMap` keeps iteration (and therefore serialization) deterministic,
/// which the version store relies on for content hashing.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// How a connector authenticates against its remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Pat,
    ApiKey,
    Basic,
}

/// A configured remote system: a driver plus the settings and credentials
/// needed to reach one tenant/project/site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub id: Uuid,
    pub name: String,
    /// Registered driver name, e.g. `"azure_devops"`.
    pub kind: String,
    pub base_url: String,
    /// Project/site scoping inside the remote system.
    pub endpoint: Option<String>,
    pub auth_kind: AuthKind,
    /// Hex-encoded `iv || tag || ciphertext` produced by the vault.
    pub encrypted_credentials: String,
    pub active: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectorRecord {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        base_url: impl Into<String>,
        auth_kind: AuthKind,
        encrypted_credentials: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: kind.into(),
            base_url: base_url.into(),
            endpoint: None,
            auth_kind,
            encrypted_credentials: encrypted_credentials.into(),
            active: true,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Discovered metadata
// ---------------------------------------------------------------------------

/// A work-item type discovered from a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemTypeMeta {
    pub id: Uuid,
    pub connector_id: Uuid,
    pub type_name: String,
    /// The remote system's own identifier for this type.
    pub type_id: String,
}

/// Data type of a discovered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldDataType {
    String,
    Int,
    Double,
    Datetime,
    Html,
    Picklist,
    Identity,
    Boolean,
}

impl FieldDataType {
    /// Simple types map cleanly across systems and boost the mapping
    /// suggestion score.
    pub fn is_simple(&self) -> bool {
        matches!(
            self,
            FieldDataType::String | FieldDataType::Int | FieldDataType::Double | FieldDataType::Boolean
        )
    }
}

/// A field discovered from a connector, unique per (type, reference name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    pub id: Uuid,
    pub connector_id: Uuid,
    pub work_item_type_id: Uuid,
    pub reference_name: String,
    pub display_name: String,
    pub data_type: FieldDataType,
    pub required: bool,
    pub read_only: bool,
    pub allowed_values: Vec<String>,
    pub default_value: Option<serde_json::Value>,
    /// 0–100 pre-ranking for field-mapping suggestions.
    pub suggestion_score: i32,
}

/// Lifecycle category of a discovered status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Proposed,
    InProgress,
    Completed,
    Removed,
}

/// A status discovered from a connector, unique per (type, name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMeta {
    pub id: Uuid,
    pub connector_id: Uuid,
    pub work_item_type_id: Uuid,
    pub name: String,
    pub value: String,
    pub category: StatusCategory,
    pub sort_order: i32,
}

// ---------------------------------------------------------------------------
// Sync configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    Webhook,
}

/// Configured direction of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigDirection {
    OneWay,
    Bidirectional,
}

/// Direction of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    SourceToTarget,
    TargetToSource,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    LastWriteWins,
    SourcePriority,
    TargetPriority,
    Merge,
    Manual,
}

/// Optional behaviors of a pairing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfigOptions {
    #[serde(default)]
    pub sync_comments: bool,
    #[serde(default)]
    pub sync_links: bool,
}

/// A source/target pairing with its trigger, direction, and policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub id: Uuid,
    pub name: String,
    pub source_connector_id: Uuid,
    pub target_connector_id: Uuid,
    pub active: bool,
    pub trigger_kind: TriggerKind,
    pub cron_expr: Option<String>,
    pub direction: ConfigDirection,
    /// Version snapshots are the authoritative base for conflict detection;
    /// bidirectional executions refuse to run without this.
    pub track_versions: bool,
    pub conflict_strategy: ConflictStrategy,
    pub options: SyncConfigOptions,
    /// Driver-specific query JSON, opaque to the engine.
    pub sync_filter: Option<serde_json::Value>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncConfig {
    pub fn new(
        name: impl Into<String>,
        source_connector_id: Uuid,
        target_connector_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source_connector_id,
            target_connector_id,
            active: true,
            trigger_kind: TriggerKind::Manual,
            cron_expr: None,
            direction: ConfigDirection::OneWay,
            track_versions: false,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            options: SyncConfigOptions::default(),
            sync_filter: None,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------------

/// Pairs a source work-item type with a target type. Both type ids must
/// belong to the config's respective connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeMapping {
    pub id: Uuid,
    pub sync_config_id: Uuid,
    pub source_type_id: Uuid,
    pub target_type_id: Uuid,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    Direct,
    Constant,
    Transformation,
    Computed,
}

/// Per-field rule inside a type mapping.
///
/// `direct` and `transformation` require both field ids; `constant` requires
/// `constant_value`. Forward transformations are never auto-inverted on the
/// target→source path: unless `reverse_transformation` is declared, the raw
/// target value is written back as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub id: Uuid,
    pub type_mapping_id: Uuid,
    pub source_field_id: Option<Uuid>,
    pub target_field_id: Option<Uuid>,
    pub mapping_kind: MappingKind,
    pub constant_value: Option<serde_json::Value>,
    /// A single `{name, args}` step or an ordered chain of them.
    pub transformation: Option<serde_json::Value>,
    pub reverse_transformation: Option<serde_json::Value>,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMapping {
    pub id: Uuid,
    pub type_mapping_id: Uuid,
    pub source_status_id: Uuid,
    pub target_status_id: Uuid,
}

// ---------------------------------------------------------------------------
// Resolved mapping views
// ---------------------------------------------------------------------------

/// A type mapping joined with the discovered names and fields it references,
/// as loaded in one pass by the store for the mapping engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedTypeMapping {
    pub id: Uuid,
    pub source_type_name: String,
    pub target_type_name: String,
    pub active: bool,
    pub fields: Vec<ResolvedFieldMapping>,
    pub statuses: Vec<ResolvedStatusMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedFieldMapping {
    pub id: Uuid,
    pub mapping_kind: MappingKind,
    pub source_ref: Option<String>,
    pub source_name: Option<String>,
    pub source_data_type: Option<FieldDataType>,
    pub target_ref: Option<String>,
    pub target_name: Option<String>,
    pub target_data_type: Option<FieldDataType>,
    pub constant_value: Option<serde_json::Value>,
    pub transformation: Option<serde_json::Value>,
    pub reverse_transformation: Option<serde_json::Value>,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedStatusMapping {
    pub source_name: String,
    pub source_value: String,
    pub target_name: String,
    pub target_value: String,
}

/// Everything the mapping engine needs for one config, loaded in a single
/// joined read and cached with a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingBundle {
    pub sync_config_id: Uuid,
    pub type_mappings: Vec<ResolvedTypeMapping>,
}

impl MappingBundle {
    /// Find the active type mapping for a source type name.
    pub fn for_source_type(&self, source_type_name: &str) -> Option<&ResolvedTypeMapping> {
        self.type_mappings
            .iter()
            .find(|tm| tm.active && tm.source_type_name == source_type_name)
    }
}

// ---------------------------------------------------------------------------
// Discovery payloads
// ---------------------------------------------------------------------------

/// Discovery output for one work-item type, ready to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredType {
    pub type_name: String,
    pub type_id: String,
    pub fields: Vec<DiscoveredField>,
    pub statuses: Vec<DiscoveredStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredField {
    pub reference_name: String,
    pub display_name: String,
    pub data_type: FieldDataType,
    pub required: bool,
    pub read_only: bool,
    pub allowed_values: Vec<String>,
    pub default_value: Option<serde_json::Value>,
    /// Filled in by the registry before persisting.
    pub suggestion_score: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredStatus {
    pub name: String,
    pub value: String,
    pub category: StatusCategory,
    pub sort_order: i32,
}

// ---------------------------------------------------------------------------
// Identity registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncedStatus {
    Synced,
    Pending,
    Error,
}

/// The cross-system identity map row pairing a source and target work item.
/// Unique on (sync_config_id, source_connector_id, source_item_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedItem {
    pub id: Uuid,
    pub sync_config_id: Uuid,
    pub source_connector_id: Uuid,
    pub target_connector_id: Uuid,
    pub source_item_id: String,
    pub target_item_id: String,
    pub source_item_type: Option<String>,
    pub target_item_type: Option<String>,
    pub first_synced_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
    pub sync_count: i64,
    pub status: SyncedStatus,
}

/// Child identity map for mirrored comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedComment {
    pub id: Uuid,
    pub synced_item_id: Uuid,
    pub source_comment_id: String,
    pub target_comment_id: Option<String>,
    pub status: SyncedStatus,
    pub created_at: DateTime<Utc>,
}

/// Child identity map for mirrored links. A link whose counterpart item is
/// not yet mirrored stays `pending` and is promoted by a later pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedLink {
    pub id: Uuid,
    pub synced_item_id: Uuid,
    pub source_linked_item_id: String,
    pub target_linked_item_id: Option<String>,
    pub relation_type: String,
    pub status: SyncedStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// Append-only snapshot of an item's fields with a content hash.
/// `version` is strictly monotonic per (config, connector, item).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemVersion {
    pub id: Uuid,
    pub sync_config_id: Uuid,
    pub connector_id: Uuid,
    pub work_item_id: String,
    pub version: i64,
    /// Remote revision marker, opaque.
    pub revision: Option<String>,
    pub changed_date: Option<DateTime<Utc>>,
    pub changed_by: Option<String>,
    pub fields_snapshot: serde_json::Value,
    /// SHA-256 of the serialized snapshot, lowercase hex.
    pub hash: String,
    pub execution_id: Option<Uuid>,
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    FieldConflict,
    VersionConflict,
    DeletionConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
    Ignored,
}

/// A divergence between the two systems the engine could not reconcile
/// without policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: Uuid,
    pub sync_config_id: Uuid,
    pub execution_id: Option<Uuid>,
    pub source_work_item_id: String,
    pub target_work_item_id: String,
    pub work_item_type: Option<String>,
    pub kind: ConflictKind,
    pub field_name: Option<String>,
    pub source_value: Option<serde_json::Value>,
    pub target_value: Option<serde_json::Value>,
    pub base_value: Option<serde_json::Value>,
    pub status: ConflictStatus,
    pub resolution_strategy: Option<ConflictStrategy>,
    pub resolved_value: Option<serde_json::Value>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Mapping context, timestamps, and actors captured at detection time.
    pub metadata: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

/// Audit record of one resolution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub id: Uuid,
    pub conflict_id: Uuid,
    pub strategy: ConflictStrategy,
    pub previous_value: Option<serde_json::Value>,
    pub resolved_value: Option<serde_json::Value>,
    pub rationale: String,
    pub applied_to_source: bool,
    pub applied_to_target: bool,
    pub application_result: Option<String>,
    pub resolved_by: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTrigger {
    Manual,
    Scheduled,
    Webhook,
    Api,
}

/// One end-to-end run of the sync engine for a config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncExecution {
    pub id: Uuid,
    pub sync_config_id: Uuid,
    pub direction: SyncDirection,
    pub trigger: ExecutionTrigger,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_created: i64,
    pub items_updated: i64,
    pub items_synced: i64,
    pub items_failed: i64,
    pub conflicts_detected: i64,
    pub conflicts_resolved: i64,
    pub error_message: Option<String>,
    /// Structured log entries accumulated by the engine.
    pub logs: serde_json::Value,
}

impl SyncExecution {
    pub fn start(sync_config_id: Uuid, direction: SyncDirection, trigger: ExecutionTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_config_id,
            direction,
            trigger,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            items_created: 0,
            items_updated: 0,
            items_synced: 0,
            items_failed: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            error_message: None,
            logs: serde_json::Value::Array(Vec::new()),
        }
    }
}

/// Per-item error row linked to an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub error_type: String,
    pub message: String,
    pub detail: Option<String>,
    pub work_item_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SyncErrorRecord {
    pub fn new(
        execution_id: Uuid,
        error_type: impl Into<String>,
        message: impl Into<String>,
        work_item_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            error_type: error_type.into(),
            message: message.into(),
            detail: None,
            work_item_id,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

/// An inbound webhook registration. `token` is the opaque URL path segment;
/// `secret` signs payloads with HMAC-SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub name: String,
    pub sync_config_id: Uuid,
    pub connector_id: Option<Uuid>,
    pub token: String,
    pub secret: String,
    pub active: bool,
    pub event_types: Vec<String>,
    pub trigger_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Accepted,
    Rejected,
    Error,
}

/// Audit trail of one received webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub signature_valid: bool,
    pub status: DeliveryStatus,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Options for one execution, shared between the trigger API and the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Explicit items to sync; when absent the config's filter (or a
    /// synthesized default) selects them.
    pub work_item_ids: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
    /// Overrides the direction derived from the config.
    pub direction: Option<SyncDirection>,
}

/// A queue-scheduled intent to perform one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub config_id: Uuid,
    pub options: SyncOptions,
    pub trigger: ExecutionTrigger,
    /// Webhook payload attached by the intake, when applicable.
    pub payload: Option<serde_json::Value>,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(config_id: Uuid, options: SyncOptions, trigger: ExecutionTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id,
            options,
            trigger,
            payload: None,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: 3,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
