//! The trigger-API facade the admin layer consumes, and the queue's job
//! executor.
//!
//! Everything here is a thin composition over the core: resolve connectors
//! through the registry, build a sync engine per call, and translate crypto
//! failures into actionable reports.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use ws_connectors::registry::ConnectorRegistry;
use ws_connectors::ConnectionTest;
use ws_core::cancel::CancelFlag;
use ws_core::error::{Result, WsError};
use ws_core::store::Store;
use ws_core::types::{
    ConflictStrategy, DiscoveredType, ExecutionTrigger, Job, SyncOptions, Webhook,
};
use ws_mapping::{MappingEngine, MappingValidation};
use ws_queue::{JobExecutor, JobQueue};
use ws_sync::conflict::{ConflictResolver, Resolution};
use ws_sync::{SyncEngine, SyncPreview, SyncReport};

pub struct SyncService {
    store: Arc<Store>,
    registry: Arc<ConnectorRegistry>,
    mapping: Arc<MappingEngine>,
    queue: JobQueue,
}

impl SyncService {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ConnectorRegistry>,
        mapping: Arc<MappingEngine>,
        queue: JobQueue,
    ) -> Self {
        Self {
            store,
            registry,
            mapping,
            queue,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    async fn engine(&self, config_id: Uuid) -> Result<SyncEngine> {
        SyncEngine::from_registry(
            self.store.clone(),
            &self.registry,
            self.mapping.clone(),
            config_id,
        )
        .await
    }

    /// Run a sync inline (bypassing the queue).
    pub async fn execute_sync(
        &self,
        config_id: Uuid,
        options: SyncOptions,
        trigger: ExecutionTrigger,
    ) -> Result<SyncReport> {
        self.engine(config_id).await?.execute(options, trigger).await
    }

    /// Dry pass with no writes.
    pub async fn preview(&self, config_id: Uuid, options: SyncOptions) -> Result<SyncPreview> {
        self.engine(config_id).await?.preview(options).await
    }

    /// Queue a sync for the worker pool.
    pub fn enqueue_job(
        &self,
        config_id: Uuid,
        options: SyncOptions,
        trigger: ExecutionTrigger,
        payload: Option<serde_json::Value>,
    ) -> Result<Uuid> {
        self.queue.enqueue(config_id, options, trigger, payload)
    }

    async fn resolver_for(&self, conflict_id: Uuid) -> Result<(ConflictResolver, ws_core::types::SyncConflict)> {
        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| WsError::Configuration(format!("conflict {conflict_id} not found")))?;
        let config = self
            .store
            .get_sync_config(conflict.sync_config_id)
            .await?
            .ok_or_else(|| {
                WsError::Configuration(format!(
                    "sync config {} for conflict {conflict_id} not found",
                    conflict.sync_config_id
                ))
            })?;
        let source = self.registry.get(config.source_connector_id).await?;
        let target = self.registry.get(config.target_connector_id).await?;
        Ok((
            ConflictResolver::new(self.store.clone(), config, source, target),
            conflict,
        ))
    }

    /// Resolve a conflict by strategy (override or the config default).
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        strategy_override: Option<ConflictStrategy>,
    ) -> Result<Resolution> {
        let (resolver, conflict) = self.resolver_for(conflict_id).await?;
        resolver.resolve(&conflict, strategy_override).await
    }

    /// Resolve a conflict with an explicit human-chosen value.
    pub async fn resolve_conflict_manually(
        &self,
        conflict_id: Uuid,
        value: serde_json::Value,
        rationale: &str,
        resolved_by: &str,
    ) -> Result<Resolution> {
        let (resolver, _) = self.resolver_for(conflict_id).await?;
        resolver
            .resolve_manually(conflict_id, value, rationale, resolved_by)
            .await
    }

    /// Probe a connector. Decryption failures come back as an unsuccessful
    /// test with a re-entry message; no driver operation is attempted.
    pub async fn test_connector(&self, connector_id: Uuid) -> Result<ConnectionTest> {
        self.registry.test_connector(connector_id).await
    }

    pub async fn validate_mappings(&self, config_id: Uuid) -> Result<MappingValidation> {
        self.mapping.validate_mappings(config_id).await
    }

    /// Walk a connector's metadata and persist it.
    pub async fn refresh_metadata(&self, connector_id: Uuid) -> Result<Vec<DiscoveredType>> {
        let discovered = self.registry.discover_metadata(connector_id).await?;
        self.registry
            .save_discovered_metadata(connector_id, discovered.clone())
            .await?;
        Ok(discovered)
    }

    /// Register an inbound webhook with a fresh opaque token and signing
    /// secret.
    pub async fn create_webhook(
        &self,
        name: &str,
        sync_config_id: Uuid,
        event_types: Vec<String>,
    ) -> Result<Webhook> {
        let webhook = Webhook {
            id: Uuid::new_v4(),
            name: name.to_string(),
            sync_config_id,
            connector_id: None,
            token: ws_core::vault::generate_token(24)?,
            secret: ws_core::vault::generate_token(32)?,
            active: true,
            event_types,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: chrono::Utc::now(),
        };
        self.store.insert_webhook(&webhook).await?;
        info!(webhook_id = %webhook.id, name = name, "webhook registered");
        Ok(webhook)
    }
}

#[async_trait]
impl JobExecutor for SyncService {
    async fn run(&self, job: &Job, cancel: CancelFlag) -> Result<serde_json::Value> {
        let engine = self.engine(job.config_id).await?.with_cancel_flag(cancel);
        let report = engine.execute(job.options.clone(), job.trigger).await?;
        serde_json::to_value(&report)
            .map_err(|e| WsError::Execution(format!("serialize report: {e}")))
    }
}
