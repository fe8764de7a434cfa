//! The mapping engine: loads a config's mappings in one joined read, caches
//! them with a 5-minute TTL, and applies per-field rules to canonical work
//! items.
//!
//! The TTL is a ceiling — any write through the mapping-management surface
//! must call [`MappingEngine::clear_cache`] immediately. Stale mappings are
//! the chief footgun for editors iterating on them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use ws_connectors::RemoteWorkItem;
use ws_core::error::Result;
use ws_core::store::Store;
use ws_core::types::{
    FieldMap, MappingBundle, MappingKind, ResolvedTypeMapping,
};

use crate::transform;

const CACHE_TTL: Duration = Duration::from_secs(300);

/// Output of mapping one work item: target type, target status, and the
/// translated field map. Null field values are omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappedWorkItem {
    pub item_type: Option<String>,
    pub status: Option<String>,
    pub fields: FieldMap,
    /// Per-field problems that did not abort the item.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingValidation {
    pub valid: bool,
    pub issues: Vec<MappingIssue>,
}

struct CachedBundle {
    loaded_at: Instant,
    bundle: Arc<MappingBundle>,
}

pub struct MappingEngine {
    store: Arc<Store>,
    cache: DashMap<Uuid, CachedBundle>,
    ttl: Duration,
}

impl MappingEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_ttl(store, CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<Store>, ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// The cached bundle for a config, reloading after the TTL expires.
    pub async fn bundle(&self, config_id: Uuid) -> Result<Arc<MappingBundle>> {
        if let Some(cached) = self.cache.get(&config_id) {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.bundle.clone());
            }
        }
        let bundle = Arc::new(self.store.load_mapping_bundle(config_id).await?);
        self.cache.insert(
            config_id,
            CachedBundle {
                loaded_at: Instant::now(),
                bundle: bundle.clone(),
            },
        );
        Ok(bundle)
    }

    /// Invalidate after any mapping mutation.
    pub fn clear_cache(&self, config_id: Uuid) {
        self.cache.remove(&config_id);
    }

    /// Map one source item for a config.
    pub async fn map_work_item(
        &self,
        item: &RemoteWorkItem,
        config_id: Uuid,
        ctx: &HashMap<String, String>,
    ) -> Result<MappedWorkItem> {
        let bundle = self.bundle(config_id).await?;
        Ok(map_with_bundle(item, &bundle, ctx))
    }

    /// Target→source projection for bidirectional passes.
    pub async fn reverse_map_fields(
        &self,
        target_fields: &FieldMap,
        config_id: Uuid,
        source_type_name: &str,
        ctx: &HashMap<String, String>,
    ) -> Result<FieldMap> {
        let bundle = self.bundle(config_id).await?;
        let Some(tm) = bundle.for_source_type(source_type_name) else {
            return Ok(FieldMap::new());
        };
        Ok(reverse_map(target_fields, tm, ctx))
    }

    /// Check a config's mappings: unknown transformations are errors;
    /// data-type mismatches without a transformation are warnings.
    pub async fn validate_mappings(&self, config_id: Uuid) -> Result<MappingValidation> {
        let bundle = self.store.load_mapping_bundle(config_id).await?;
        let mut issues = Vec::new();

        for tm in &bundle.type_mappings {
            for fm in &tm.fields {
                let label = format!(
                    "{} → {}",
                    fm.source_ref.as_deref().unwrap_or("?"),
                    fm.target_ref.as_deref().unwrap_or("?")
                );
                match fm.mapping_kind {
                    MappingKind::Direct | MappingKind::Transformation => {
                        if fm.source_ref.is_none() || fm.target_ref.is_none() {
                            issues.push(MappingIssue {
                                severity: IssueSeverity::Error,
                                message: format!(
                                    "field mapping {label} requires both source and target fields"
                                ),
                            });
                        }
                    }
                    MappingKind::Constant => {
                        if fm.constant_value.is_none() {
                            issues.push(MappingIssue {
                                severity: IssueSeverity::Error,
                                message: format!("constant mapping {label} has no constant value"),
                            });
                        }
                    }
                    MappingKind::Computed => {}
                }

                if let Some(spec) = &fm.transformation {
                    match transform::parse_chain(spec) {
                        Ok(steps) => {
                            for step in steps {
                                if !transform::is_known(&step.name) {
                                    issues.push(MappingIssue {
                                        severity: IssueSeverity::Error,
                                        message: format!(
                                            "unknown transformation '{}' on {label}",
                                            step.name
                                        ),
                                    });
                                }
                            }
                        }
                        Err(e) => issues.push(MappingIssue {
                            severity: IssueSeverity::Error,
                            message: format!("{label}: {e}"),
                        }),
                    }
                } else if fm.mapping_kind == MappingKind::Direct {
                    if let (Some(src), Some(tgt)) = (fm.source_data_type, fm.target_data_type) {
                        if src != tgt {
                            issues.push(MappingIssue {
                                severity: IssueSeverity::Warning,
                                message: format!(
                                    "{label} maps {src:?} to {tgt:?} without a transformation"
                                ),
                            });
                        }
                    }
                }
            }
        }

        let valid = !issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Error);
        Ok(MappingValidation { valid, issues })
    }
}

// ---------------------------------------------------------------------------
// Pure mapping application
// ---------------------------------------------------------------------------

/// Apply a bundle to one item. Errors in a single field are demoted to
/// warnings so one bad mapping cannot abort the item.
pub fn map_with_bundle(
    item: &RemoteWorkItem,
    bundle: &MappingBundle,
    ctx: &HashMap<String, String>,
) -> MappedWorkItem {
    let mut mapped = MappedWorkItem::default();

    let Some(tm) = bundle.for_source_type(&item.item_type) else {
        mapped.warnings.push(format!(
            "no active type mapping for source type '{}'",
            item.item_type
        ));
        return mapped;
    };
    mapped.item_type = Some(tm.target_type_name.clone());

    // Status: look up by the source's state value, matching either the
    // discovered status name or its value.
    if let Some(state) = item.field_str("state") {
        mapped.status = tm
            .statuses
            .iter()
            .find(|sm| sm.source_name == state || sm.source_value == state)
            .map(|sm| sm.target_name.clone());
    }

    for fm in &tm.fields {
        let Some(target_ref) = fm.target_ref.as_deref() else {
            if fm.mapping_kind != MappingKind::Computed {
                mapped
                    .warnings
                    .push("field mapping without a target field skipped".to_string());
            }
            continue;
        };

        let value = match fm.mapping_kind {
            MappingKind::Direct => read_source_value(item, fm.source_ref.as_deref(), fm.source_name.as_deref()),
            MappingKind::Constant => fm.constant_value.clone().unwrap_or(serde_json::Value::Null),
            MappingKind::Transformation => {
                let input = read_source_value(item, fm.source_ref.as_deref(), fm.source_name.as_deref());
                let Some(spec) = &fm.transformation else {
                    mapped.warnings.push(format!(
                        "transformation mapping for '{target_ref}' has no transformation"
                    ));
                    continue;
                };
                match transform::parse_chain(spec)
                    .and_then(|steps| transform::apply_chain(&steps, input, ctx))
                {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(field = target_ref, error = %e, "field transformation failed");
                        mapped.warnings.push(format!("field '{target_ref}': {e}"));
                        continue;
                    }
                }
            }
            MappingKind::Computed => {
                mapped.warnings.push(format!(
                    "computed mapping for '{target_ref}' is not implemented; skipped"
                ));
                continue;
            }
        };

        // Null values are omitted from the output.
        if !value.is_null() {
            mapped.fields.insert(target_ref.to_string(), value);
        }
    }

    mapped
}

fn read_source_value(
    item: &RemoteWorkItem,
    reference: Option<&str>,
    display_name: Option<&str>,
) -> serde_json::Value {
    // By reference first, then display name.
    if let Some(reference) = reference {
        if let Some(v) = item.fields.get(reference) {
            return v.clone();
        }
    }
    if let Some(name) = display_name {
        if let Some(v) = item.fields.get(name) {
            return v.clone();
        }
    }
    serde_json::Value::Null
}

/// Target→source projection. By default only names are rewritten; a forward
/// transformation is never inverted. Declared `reverse_transformation`s do
/// run. The state field is translated back through the status mappings.
pub fn reverse_map(
    target_fields: &FieldMap,
    tm: &ResolvedTypeMapping,
    ctx: &HashMap<String, String>,
) -> FieldMap {
    let mut out = FieldMap::new();

    for fm in &tm.fields {
        if !matches!(fm.mapping_kind, MappingKind::Direct | MappingKind::Transformation) {
            continue;
        }
        let (Some(source_ref), Some(target_ref)) = (fm.source_ref.as_deref(), fm.target_ref.as_deref())
        else {
            continue;
        };
        let Some(value) = target_fields.get(target_ref) else {
            continue;
        };
        let value = match &fm.reverse_transformation {
            Some(spec) => match transform::parse_chain(spec)
                .and_then(|steps| transform::apply_chain(&steps, value.clone(), ctx))
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(field = source_ref, error = %e, "reverse transformation failed");
                    continue;
                }
            },
            None => value.clone(),
        };
        if !value.is_null() {
            out.insert(source_ref.to_string(), value);
        }
    }

    // Translate the state back through the status mappings.
    if let Some(state) = target_fields.get("state").and_then(|v| v.as_str()) {
        if let Some(sm) = tm
            .statuses
            .iter()
            .find(|sm| sm.target_name == state || sm.target_value == state)
        {
            out.insert("state".into(), serde_json::json!(sm.source_name.clone()));
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
