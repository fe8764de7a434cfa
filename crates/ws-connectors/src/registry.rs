//! Connector registry: driver factories, credential decryption, and the
//! process-wide instance cache.
//!
//! Instances are cached by connector id and reused across queue workers, so
//! drivers must tolerate concurrent use. `clear_cache` invalidates on config
//! update or delete.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use ws_core::error::{Result, WsError};
use ws_core::store::Store;
use ws_core::types::{ConnectorRecord, DiscoveredField, DiscoveredStatus, DiscoveredType};
use ws_core::vault::Vault;

use crate::azure_devops::AzureDevOpsConnector;
use crate::memory::MemoryConnector;
use crate::servicedesk::ServiceDeskConnector;
use crate::{canonical, ConnectionTest, Connector, Credentials, RemoteField};

/// Builds a driver instance from its stored row and decrypted credentials.
pub type DriverFactory =
    Arc<dyn Fn(&ConnectorRecord, &Credentials) -> Result<Arc<dyn Connector>> + Send + Sync>;

pub struct ConnectorRegistry {
    store: Arc<Store>,
    vault: Arc<Vault>,
    factories: HashMap<String, DriverFactory>,
    cache: DashMap<Uuid, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// A registry with no drivers; register them explicitly.
    pub fn new(store: Arc<Store>, vault: Arc<Vault>) -> Self {
        Self {
            store,
            vault,
            factories: HashMap::new(),
            cache: DashMap::new(),
        }
    }

    /// A registry with the built-in drivers registered.
    pub fn with_default_drivers(store: Arc<Store>, vault: Arc<Vault>) -> Self {
        let mut registry = Self::new(store, vault);
        registry.register("azure_devops", |rec, creds| {
            let project = rec.endpoint.clone().unwrap_or_default();
            Ok(Arc::new(AzureDevOpsConnector::new(&rec.base_url, &project, creds)?))
        });
        registry.register("servicedesk", |rec, creds| {
            Ok(Arc::new(ServiceDeskConnector::new(&rec.base_url, creds)?))
        });
        registry.register("memory", |rec, _creds| {
            let prefix = rec.endpoint.clone().unwrap_or_else(|| "M".into());
            Ok(Arc::new(MemoryConnector::new(prefix)))
        });
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ConnectorRecord, &Credentials) -> Result<Arc<dyn Connector>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Load, decrypt, build, and cache a connector instance.
    ///
    /// Refuses inactive connectors. A failed tag verification surfaces as
    /// [`WsError::CredentialDecrypt`] so callers can prompt for re-entry.
    pub async fn get(&self, connector_id: Uuid) -> Result<Arc<dyn Connector>> {
        if let Some(cached) = self.cache.get(&connector_id) {
            return Ok(cached.clone());
        }

        let record = self
            .store
            .get_connector(connector_id)
            .await?
            .ok_or_else(|| {
                WsError::Configuration(format!("connector {connector_id} does not exist"))
            })?;
        if !record.active {
            return Err(WsError::Configuration(format!(
                "connector '{}' is inactive",
                record.name
            )));
        }

        let creds: Credentials = self.vault.decrypt_json(&record.encrypted_credentials)?;
        let factory = self.factories.get(&record.kind).ok_or_else(|| {
            WsError::Configuration(format!("unknown connector kind '{}'", record.kind))
        })?;
        let connector = factory(&record, &creds)?;

        debug!(connector_id = %connector_id, kind = %record.kind, "connector instantiated");
        self.cache.insert(connector_id, connector.clone());
        Ok(connector)
    }

    /// Drop the cached instance after a config update or delete.
    pub fn clear_cache(&self, connector_id: Uuid) {
        self.cache.remove(&connector_id);
    }

    /// Decrypt-check and probe a connector without touching the cache. The
    /// decrypt failure path deliberately never constructs a driver.
    pub async fn test_connector(&self, connector_id: Uuid) -> Result<ConnectionTest> {
        let record = self
            .store
            .get_connector(connector_id)
            .await?
            .ok_or_else(|| {
                WsError::Configuration(format!("connector {connector_id} does not exist"))
            })?;
        let creds: Credentials = match self.vault.decrypt_json(&record.encrypted_credentials) {
            Ok(creds) => creds,
            Err(WsError::CredentialDecrypt) => {
                return Ok(ConnectionTest {
                    success: false,
                    message: WsError::CredentialDecrypt.to_string(),
                    details: None,
                })
            }
            Err(e) => return Err(e),
        };
        let factory = self.factories.get(&record.kind).ok_or_else(|| {
            WsError::Configuration(format!("unknown connector kind '{}'", record.kind))
        })?;
        factory(&record, &creds)?.test_connection().await
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Walk a connector's types, loading fields and statuses for each type
    /// concurrently, and return the composite ready to persist.
    pub async fn discover_metadata(&self, connector_id: Uuid) -> Result<Vec<DiscoveredType>> {
        let connector = self.get(connector_id).await?;
        let types = connector.get_work_item_types().await?;

        let mut discovered = Vec::with_capacity(types.len());
        for ty in types {
            let (fields, statuses) = tokio::join!(
                connector.get_fields(&ty.id),
                connector.get_statuses(&ty.id)
            );
            let fields = fields?;
            let statuses = statuses?;
            discovered.push(DiscoveredType {
                type_name: ty.name,
                type_id: ty.id,
                fields: fields
                    .into_iter()
                    .map(|f| {
                        let score = suggestion_score(&f);
                        DiscoveredField {
                            reference_name: f.reference_name,
                            display_name: f.display_name,
                            data_type: f.data_type,
                            required: f.required,
                            read_only: f.read_only,
                            allowed_values: f.allowed_values,
                            default_value: f.default_value,
                            suggestion_score: score,
                        }
                    })
                    .collect(),
                statuses: statuses
                    .into_iter()
                    .map(|s| DiscoveredStatus {
                        name: s.name,
                        value: s.value,
                        category: s.category,
                        sort_order: s.sort_order,
                    })
                    .collect(),
            });
        }

        info!(
            connector_id = %connector_id,
            types = discovered.len(),
            "metadata discovered"
        );
        Ok(discovered)
    }

    /// Persist discovery output atomically.
    pub async fn save_discovered_metadata(
        &self,
        connector_id: Uuid,
        types: Vec<DiscoveredType>,
    ) -> Result<()> {
        self.store.save_discovered_metadata(connector_id, types).await
    }
}

/// 0–100 pre-rank for field-mapping suggestions: +50 for common core
/// references, +30 if required, −40 if read-only, +20 for simple types.
pub fn suggestion_score(field: &RemoteField) -> i32 {
    let mut score = 0;
    if canonical::CORE_SUGGESTIONS.contains(&field.reference_name.as_str()) {
        score += 50;
    }
    if field.required {
        score += 30;
    }
    if field.read_only {
        score -= 40;
    }
    if field.data_type.is_simple() {
        score += 20;
    }
    score.clamp(0, 100)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
