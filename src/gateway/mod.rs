//! Axum HTTP surface for payment notifications.
//!
//! - `GET /health` pings the credit store
//! - `GET /api/plans` lists the plan catalog
//! - `POST /webhooks/payment` applies a payment event, HMAC-signed when a
//!   webhook secret is configured (`X-Signature: sha256=<hex>`)
//!
//! Request bodies are capped at 64KB and every request is bounded by the
//! configured timeout.

use crate::billing::{PaymentEvent, Plan};
use crate::config::Config;
use crate::error::{CoreError, ErrorKind};
use crate::ledger::Applied;
use crate::service::CreditService;
use crate::store::bounded;
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CreditService>,
    pub webhook_secret: Option<Arc<str>>,
    pub store_timeout: Duration,
}

impl AppState {
    pub fn new(service: Arc<CreditService>, config: &Config) -> Self {
        Self {
            service,
            webhook_secret: config
                .gateway
                .webhook_secret
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Arc::from),
            store_timeout: config.store.remote_timeout(),
        }
    }
}

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/plans", get(handle_plans))
        .route("/webhooks/payment", post(handle_payment))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Serve until `cancel` fires.
pub async fn run_gateway(
    config: &Config,
    service: Arc<CreditService>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = config.gateway.bind.parse()?;
    let state = AppState::new(service, config);
    if state.webhook_secret.is_none() {
        tracing::warn!("No webhook secret configured, payment notifications are not authenticated");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Payment gateway listening");

    let app = router(
        state,
        Duration::from_secs(config.gateway.request_timeout_secs),
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

/// Verify a `sha256=<hex>` HMAC-SHA256 signature of `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let Some(hex_sig) = signature_header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    // Constant-time comparison
    mac.verify_slice(&expected).is_ok()
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    match bounded(state.store_timeout, "ping", state.service.store().ping()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable", "error": e.to_string() })),
            )
        }
    }
}

/// GET /api/plans
async fn handle_plans(State(state): State<AppState>) -> Json<Vec<Plan>> {
    Json(state.service.plans().to_vec())
}

/// POST /webhooks/payment
async fn handle_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, &body, signature) {
            tracing::warn!("Payment webhook rejected: bad signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid signature" })),
            );
        }
    }

    let event: PaymentEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid payment event: {e}") })),
            );
        }
    };

    match state.service.reconciler().apply(&event).await {
        Ok(confirmation) => {
            let status = match confirmation.applied {
                Applied::New => "applied",
                Applied::AlreadyProcessed => "already_processed",
            };
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": status,
                    "payment_id": confirmation.payment_id,
                    "identity": confirmation.identity,
                    "credits": confirmation.credits,
                    "transaction_id": confirmation.transaction_id,
                    "balance": confirmation.balance,
                    "valid_until": confirmation.valid_until,
                    "message": confirmation.message(),
                })),
            )
        }
        Err(CoreError::UnknownIdentity { payment_id }) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "guest_held", "payment_id": payment_id })),
        ),
        Err(e) => {
            let status = match e.kind() {
                ErrorKind::NotFound | ErrorKind::Invalid => StatusCode::BAD_REQUEST,
                ErrorKind::Unreachable | ErrorKind::Conflict => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(payment_id = %event.payment_id, error = %e, "Payment webhook failed");
            (
                status,
                Json(serde_json::json!({ "error": e.to_string(), "kind": e.kind() })),
            )
        }
    }
}
