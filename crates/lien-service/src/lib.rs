#![deny(unsafe_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lien_core::{
    Borrower, EnforcementUpdate, KioskMode, LienEngine, LienError, PaymentReceipt,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Shared handler state: one enforcement engine per device.
#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<LienEngine>,
}

impl ServiceState {
    pub fn new(engine: Arc<LienEngine>) -> Self {
        Self { engine }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/kiosk/mode", get(kiosk_mode))
        .route("/v1/refresh", post(refresh))
        .route("/v1/payment", post(payment))
        .route("/v1/lifecycle/foreground", post(foreground))
        .route("/v1/lifecycle/background", post(background))
        .route("/v1/lifecycle/back-button", post(back_button))
        .route("/v1/identity", post(identity))
        .route("/v1/ledger/balance", get(ledger_balance))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] LienError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Core(err) = self;
        let status = match &err {
            LienError::NotConnected => StatusCode::CONFLICT,
            LienError::InsufficientFunds(_) => StatusCode::PAYMENT_REQUIRED,
            LienError::Unauthorized(_) => StatusCode::FORBIDDEN,
            LienError::WrongNetwork { .. } | LienError::ContractNotFound(_) => {
                StatusCode::BAD_GATEWAY
            }
            LienError::NetworkTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            LienError::Ledger(_) | LienError::TransientRevert => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": err.to_string(),
            "guidance": err.user_guidance(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    display_only: bool,
    kiosk_mode: KioskMode,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "lien-service",
        display_only: state.engine.display_only(),
        kiosk_mode: state.engine.current_kiosk_mode().await,
    })
}

async fn status(State(state): State<ServiceState>) -> Json<EnforcementUpdate> {
    Json(state.engine.current_update())
}

#[derive(Debug, Clone, Serialize)]
struct KioskModeResponse {
    mode: KioskMode,
}

async fn kiosk_mode(State(state): State<ServiceState>) -> Json<KioskModeResponse> {
    Json(KioskModeResponse {
        mode: state.engine.current_kiosk_mode().await,
    })
}

#[derive(Debug, Clone, Serialize)]
struct AckResponse {
    status: &'static str,
}

const ACK: AckResponse = AckResponse { status: "ok" };

async fn refresh(State(state): State<ServiceState>) -> Result<Json<AckResponse>, ApiError> {
    state.engine.force_refresh().await?;
    Ok(Json(ACK))
}

async fn payment(State(state): State<ServiceState>) -> Result<Json<PaymentReceipt>, ApiError> {
    Ok(Json(state.engine.submit_payment().await?))
}

async fn foreground(State(state): State<ServiceState>) -> Json<AckResponse> {
    state.engine.on_foreground().await;
    Json(ACK)
}

async fn background(State(state): State<ServiceState>) -> Json<AckResponse> {
    state.engine.on_background().await;
    Json(ACK)
}

#[derive(Debug, Clone, Serialize)]
struct BackButtonResponse {
    handled: bool,
}

async fn back_button(State(state): State<ServiceState>) -> Json<BackButtonResponse> {
    Json(BackButtonResponse {
        handled: state.engine.on_back_button().await,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct IdentityRequest {
    /// `null` disconnects the current identity.
    account: Option<String>,
}

async fn identity(
    State(state): State<ServiceState>,
    Json(request): Json<IdentityRequest>,
) -> Json<AckResponse> {
    state
        .engine
        .on_identity_changed(request.account.map(Borrower::new))
        .await;
    Json(ACK)
}

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    balance_minor: u64,
}

async fn ledger_balance(
    State(state): State<ServiceState>,
) -> Result<Json<BalanceResponse>, ApiError> {
    Ok(Json(BalanceResponse {
        balance_minor: state.engine.contract_balance().await?,
    }))
}
