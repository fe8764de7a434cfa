//! Webhook intake: `POST /receive/{token}`.
//!
//! The raw body is verified against the webhook's secret via HMAC-SHA-256
//! (`X-Hub-Signature-256`, alias `X-Webhook-Signature`). Every received
//! payload is logged as a delivery row; only valid signatures enqueue a sync
//! job. The trigger counter updates atomically with the delivery log.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use subtle::ConstantTimeEq;
use tracing::warn;
use uuid::Uuid;

use ws_core::types::{DeliveryStatus, ExecutionTrigger, SyncOptions, WebhookDelivery};
use ws_core::vault;

use crate::service::SyncService;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_HEADER_ALIAS: &str = "x-webhook-signature";

#[derive(Clone)]
pub struct BridgeState {
    pub service: Arc<SyncService>,
    /// `Some(key)` guards the admin routes; `None` leaves them open
    /// (development mode). The receive route never consults this — payload
    /// signatures authenticate it instead.
    api_key: Option<Arc<String>>,
}

impl BridgeState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            service,
            api_key: None,
        }
    }

    /// Whether a request may use the admin routes, comparing the presented
    /// key (`X-API-Key` or `Authorization: Bearer`) in constant time.
    fn admin_allowed(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };
        let provided = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
            });
        match provided {
            Some(key) => bool::from(key.as_bytes().ct_eq(expected.as_bytes())),
            None => false,
        }
    }
}

/// The bridge router: the public receive endpoint plus an API-key-guarded
/// status route.
pub fn router(state: BridgeState, api_key: Option<String>) -> Router {
    let state = BridgeState {
        api_key: api_key.map(Arc::new),
        ..state
    };
    Router::new()
        .route("/receive/{token}", post(receive_webhook))
        .route("/status", get(queue_status))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn queue_status(State(state): State<BridgeState>, headers: HeaderMap) -> Response {
    if !state.admin_allowed(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response();
    }
    Json(serde_json::json!({"queue": state.service.queue().counts()})).into_response()
}

async fn receive_webhook(
    State(state): State<BridgeState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_receive(&state, &token, &headers, &body).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "webhook intake failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn handle_receive(
    state: &BridgeState,
    token: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> ws_core::error::Result<Response> {
    let store = state.service.store();

    let Some(webhook) = store.get_webhook_by_token(token).await? else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown webhook"})),
        )
            .into_response());
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(SIGNATURE_HEADER_ALIAS))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let signature_valid = vault::verify_signature(&webhook.secret, body, signature);
    let payload: serde_json::Value =
        serde_json::from_slice(body).unwrap_or(serde_json::Value::Null);
    let headers_json = serde_json::Value::Object(
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), serde_json::json!(v)))
            })
            .collect(),
    );

    if !webhook.active {
        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            signature_valid,
            status: DeliveryStatus::Rejected,
            payload,
            headers: headers_json,
            received_at: Utc::now(),
        };
        store.record_delivery(&delivery, false).await?;
        return Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "webhook inactive"})),
        )
            .into_response());
    }

    if !signature_valid {
        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            signature_valid: false,
            status: DeliveryStatus::Rejected,
            payload,
            headers: headers_json,
            received_at: Utc::now(),
        };
        store.record_delivery(&delivery, false).await?;
        warn!(webhook_id = %webhook.id, "webhook signature rejected");
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid signature"})),
        )
            .into_response());
    }

    let delivery = WebhookDelivery {
        id: Uuid::new_v4(),
        webhook_id: webhook.id,
        signature_valid: true,
        status: DeliveryStatus::Accepted,
        payload: payload.clone(),
        headers: headers_json,
        received_at: Utc::now(),
    };
    store.record_delivery(&delivery, true).await?;

    let job_id = state.service.enqueue_job(
        webhook.sync_config_id,
        SyncOptions::default(),
        ExecutionTrigger::Webhook,
        Some(payload),
    )?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted", "job_id": job_id})),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;
    use ws_connectors::registry::ConnectorRegistry;
    use ws_core::store::Store;
    use ws_core::types::{AuthKind, ConnectorRecord, SyncConfig, Webhook};
    use ws_core::vault::Vault;
    use ws_mapping::MappingEngine;
    use ws_queue::{JobQueue, QueueSettings};

    struct Fixture {
        service: Arc<SyncService>,
        webhook: Webhook,
    }

    async fn fixture(active: bool) -> Fixture {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let vault = Arc::new(Vault::from_secret("bridge-test-secret").unwrap());
        let registry = Arc::new(ConnectorRegistry::with_default_drivers(
            store.clone(),
            vault.clone(),
        ));
        let mapping = Arc::new(MappingEngine::new(store.clone()));
        let queue = JobQueue::new(QueueSettings::default());
        let service = Arc::new(SyncService::new(store.clone(), registry, mapping, queue));

        let a = ConnectorRecord::new("src", "memory", "mem://", AuthKind::Pat, "00");
        let b = ConnectorRecord::new("tgt", "memory", "mem://", AuthKind::Pat, "00");
        store.insert_connector(&a).await.unwrap();
        store.insert_connector(&b).await.unwrap();
        let config = SyncConfig::new("pair", a.id, b.id);
        store.insert_sync_config(&config).await.unwrap();

        let mut webhook = service
            .create_webhook("inbound", config.id, vec!["updated".into()])
            .await
            .unwrap();
        if !active {
            store.set_webhook_active(webhook.id, false).await.unwrap();
            webhook.active = false;
        }
        Fixture { service, webhook }
    }

    fn app(f: &Fixture) -> Router {
        router(BridgeState::new(f.service.clone()), None)
    }

    fn request(token: &str, body: &str, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/receive/{token}"))
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header("X-Hub-Signature-256", sig);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn valid_signature_enqueues_and_accepts() {
        let f = fixture(true).await;
        let body = r#"{"event":"updated"}"#;
        let signature = vault::sign_payload(&f.webhook.secret, body.as_bytes());

        let response = app(&f)
            .oneshot(request(&f.webhook.token, body, Some(&signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        assert_eq!(f.service.queue().counts().queued, 1);
        let store = f.service.store();
        let deliveries = store.list_deliveries(f.webhook.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].signature_valid);
        assert_eq!(deliveries[0].status, DeliveryStatus::Accepted);
        assert_eq!(deliveries[0].payload["event"], "updated");

        let stored = store
            .get_webhook_by_token(&f.webhook.token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.trigger_count, 1);
        assert!(stored.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_and_logged() {
        let f = fixture(true).await;
        let body = r#"{"event":"updated"}"#;

        let response = app(&f)
            .oneshot(request(&f.webhook.token, body, Some("sha256=deadbeef")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Never enqueued, delivery logged as invalid, counter untouched.
        assert_eq!(f.service.queue().counts().queued, 0);
        let store = f.service.store();
        let deliveries = store.list_deliveries(f.webhook.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(!deliveries[0].signature_valid);
        assert_eq!(deliveries[0].status, DeliveryStatus::Rejected);
        let stored = store
            .get_webhook_by_token(&f.webhook.token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.trigger_count, 0);
    }

    #[tokio::test]
    async fn missing_signature_header_is_unauthorized() {
        let f = fixture(true).await;
        let response = app(&f)
            .oneshot(request(&f.webhook.token, "{}", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn alias_header_is_accepted() {
        let f = fixture(true).await;
        let body = r#"{"event":"updated"}"#;
        let signature = vault::sign_payload(&f.webhook.secret, body.as_bytes());

        let request = Request::builder()
            .method("POST")
            .uri(format!("/receive/{}", f.webhook.token))
            .header("X-Webhook-Signature", &signature)
            .body(Body::from(body))
            .unwrap();
        let response = app(&f).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let f = fixture(true).await;
        let response = app(&f)
            .oneshot(request("nonexistent", "{}", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn inactive_webhook_is_not_found_but_logged() {
        let f = fixture(false).await;
        let body = "{}";
        let signature = vault::sign_payload(&f.webhook.secret, body.as_bytes());

        let response = app(&f)
            .oneshot(request(&f.webhook.token, body, Some(&signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let deliveries = f
            .service
            .store()
            .list_deliveries(f.webhook.id)
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Rejected);
        assert_eq!(f.service.queue().counts().queued, 0);
    }

    #[tokio::test]
    async fn status_route_requires_api_key_when_configured() {
        let f = fixture(true).await;
        let app = router(BridgeState::new(f.service.clone()), Some("admin-key".into()));

        let denied = app
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .header("X-API-Key", "other-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .header("X-API-Key", "admin-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);

        let bearer = app
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .header("Authorization", "Bearer admin-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bearer.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_route_is_open_without_a_configured_key() {
        let f = fixture(true).await;
        let response = app(&f)
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
