//! Route handlers for the control plane.
//!
//! Every response is JSON; USDC amounts are 2-dp strings, sizes are 4-dp
//! strings. Engine errors carry their tagged kind; quote statuses are not
//! errors and always come back 200.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::engine::{
    ActivateRequest, CoverageEngine, PortfolioIngest, PreviewResult, PutQuoteRequest,
};
use crate::error::EngineError;
use crate::models::{Quote, QuoteStatus};
use crate::money::{fmt_size, Usd};
use crate::venues::{OrderRequest, OrderType};

pub type AppState = Arc<CoverageEngine>;

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidPayload(_)
            | EngineError::UnsupportedAsset(_)
            | EngineError::InvalidLeverage { .. }
            | EngineError::MissingDrawdownInputs(_) => StatusCode::BAD_REQUEST,
            EngineError::QuoteUnknown(_) | EngineError::MissingExecutor(_) => StatusCode::NOT_FOUND,
            EngineError::QuoteExpired
            | EngineError::QuoteDrift
            | EngineError::DrawdownBufferPositive => StatusCode::CONFLICT,
            EngineError::NoQuote(_)
            | EngineError::PremiumFloor(_)
            | EngineError::PerpFallback => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::RequestFailed(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(self.0.to_body())).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLegWire {
    pub venue: String,
    pub instrument: String,
    pub side: &'static str,
    pub size: String,
    pub price: f64,
}

/// Wire form of a resolved quote.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub quote_id: String,
    pub status: &'static str,
    pub reason: String,
    pub expires_at: String,
    pub instrument: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strike: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option_type: Option<&'static str>,
    pub premium_per_unit_usdc: Usd,
    pub premium_total_usdc: Usd,
    pub all_in_premium_usdc: Usd,
    pub fee_usdc: Usd,
    pub subsidy_usdc: Usd,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_regime: Option<&'static str>,
    pub hedge_size: String,
    pub roll_multiplier: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discounted_fee_usdc: Option<Usd>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cap_breached: Option<bool>,
    pub execution_plan: Vec<ExecutionLegWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub survival_check: Option<crate::models::SurvivalCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_snapshot: Option<crate::models::SelectionSnapshot>,
}

impl QuoteResponse {
    pub fn from_quote(quote: &Quote) -> Self {
        let (coverage_pct, discounted_fee, cap_breached) = match &quote.status {
            QuoteStatus::Partial {
                coverage_pct,
                discounted_fee,
            } => (Some(*coverage_pct), Some(*discounted_fee), None),
            QuoteStatus::CoverageOverride { cap_breached } => (None, None, Some(*cap_breached)),
            _ => (None, None, None),
        };
        Self {
            quote_id: quote.quote_id.clone(),
            status: quote.status.as_str(),
            reason: quote.reason.clone(),
            expires_at: quote.expires_at.to_rfc3339(),
            instrument: quote.instrument.clone(),
            strike: quote.strike,
            option_type: quote.option_type.map(|t| match t {
                crate::models::OptionType::Put => "put",
                crate::models::OptionType::Call => "call",
            }),
            premium_per_unit_usdc: quote.premium_per_unit_usdc,
            premium_total_usdc: quote.premium_total_usdc,
            all_in_premium_usdc: quote.all_in_premium_usdc,
            fee_usdc: quote.fee_usdc,
            subsidy_usdc: quote.subsidy_usdc,
            fee_regime: quote.fee_regime.map(|r| r.as_str()),
            hedge_size: fmt_size(quote.hedge_size),
            roll_multiplier: quote.roll_multiplier,
            coverage_pct,
            discounted_fee_usdc: discounted_fee,
            cap_breached,
            execution_plan: quote
                .execution_plan
                .iter()
                .map(|leg| ExecutionLegWire {
                    venue: leg.venue.clone(),
                    instrument: leg.instrument.clone(),
                    side: leg.side.as_str(),
                    size: fmt_size(leg.size),
                    price: leg.price,
                })
                .collect(),
            survival_check: quote.survival_check,
            selection_snapshot: quote.selection_snapshot.clone(),
        }
    }
}

async fn health(State(engine): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "mode": engine.app.app_mode,
        "paper": engine.app.deribit_paper,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSummaryQuery {
    pub cash_usdc: Option<f64>,
    pub position_pnl_usdc: Option<f64>,
    pub hedge_mtm_usdc: Option<f64>,
    pub drawdown_limit_usdc: Option<f64>,
    pub initial_balance_usdc: Option<f64>,
    pub max_mtm_age_ms: Option<i64>,
}

async fn risk_summary(
    State(engine): State<AppState>,
    Query(q): Query<RiskSummaryQuery>,
) -> Result<Json<crate::engine::RiskSummary>, ApiError> {
    let summary = engine
        .risk_summary(
            q.cash_usdc.and_then(Usd::from_f64),
            q.position_pnl_usdc.and_then(Usd::from_f64),
            q.hedge_mtm_usdc.and_then(Usd::from_f64),
            q.drawdown_limit_usdc.and_then(Usd::from_f64),
            q.initial_balance_usdc.and_then(Usd::from_f64),
            q.max_mtm_age_ms,
        )
        .await?;
    Ok(Json(summary))
}

async fn portfolio_ingest(
    State(engine): State<AppState>,
    Json(req): Json<PortfolioIngest>,
) -> Json<serde_json::Value> {
    Json(engine.ingest_portfolio(req).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountQuery {
    pub account_id: Option<String>,
}

async fn coverage_report(
    State(engine): State<AppState>,
    Query(q): Query<AccountQuery>,
) -> Json<serde_json::Value> {
    Json(engine.coverage_report(q.account_id.as_deref()))
}

async fn coverage_active(
    State(engine): State<AppState>,
    Query(q): Query<AccountQuery>,
) -> Json<serde_json::Value> {
    let active = engine.active_coverages(q.account_id.as_deref());
    Json(serde_json::json!({ "count": active.len(), "coverages": active }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreviewResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote: Option<QuoteResponse>,
}

async fn put_preview(
    State(engine): State<AppState>,
    Json(req): Json<PutQuoteRequest>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let result = engine.preview(&req).await?;
    let response = match result {
        PreviewResult::Fresh(quote) => PreviewResponse {
            status: "fresh",
            quote: Some(QuoteResponse::from_quote(&quote)),
        },
        PreviewResult::Stale(quote) => PreviewResponse {
            status: "stale",
            quote: Some(QuoteResponse::from_quote(&quote)),
        },
        PreviewResult::Pending => PreviewResponse {
            status: "pending",
            quote: None,
        },
    };
    Ok(Json(response))
}

async fn put_quote(
    State(engine): State<AppState>,
    Json(req): Json<PutQuoteRequest>,
) -> Result<Json<QuoteResponse>, ApiError> {
    let quote = engine.quote(&req).await?;
    Ok(Json(QuoteResponse::from_quote(&quote)))
}

async fn put_activate(
    State(engine): State<AppState>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<crate::engine::ActivateResult>, ApiError> {
    Ok(Json(engine.activate(&req).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRenewRequest {
    pub account_id: String,
}

async fn put_auto_renew(
    State(engine): State<AppState>,
    Json(req): Json<AutoRenewRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let accounts = engine.accounts.load();
    let Some(account) = accounts
        .accounts
        .iter()
        .find(|a| a.account_id == req.account_id)
    else {
        return Err(
            EngineError::InvalidPayload(format!("unknown account {}", req.account_id)).into(),
        );
    };
    let renewed = engine.auto_renew_account(account).await;
    Ok(Json(serde_json::json!({
        "accountId": req.account_id,
        "renewed": renewed,
    })))
}

async fn put_auto_renew_schedule(
    State(engine): State<AppState>,
    Json(req): Json<AutoRenewRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let accounts = engine.accounts.load();
    let Some(account) = accounts
        .accounts
        .iter()
        .find(|a| a.account_id == req.account_id)
    else {
        return Err(
            EngineError::InvalidPayload(format!("unknown account {}", req.account_id)).into(),
        );
    };
    let now = chrono::Utc::now();
    let should = crate::hedging::rolling::should_renew(
        now,
        account.expiry_iso,
        account.renew_window_minutes as i64,
    );
    Ok(Json(serde_json::json!({
        "accountId": account.account_id,
        "expiryIso": account.expiry_iso.to_rfc3339(),
        "renewWindowMinutes": account.renew_window_minutes,
        "shouldRenew": should,
    })))
}

async fn loop_tick(State(engine): State<AppState>) -> Json<serde_json::Value> {
    Json(engine.loop_tick().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueOrderRequest {
    pub instrument: String,
    pub side: crate::models::OrderSide,
    pub amount: f64,
    #[serde(rename = "type", default)]
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub drawdown_buffer_usdc: Option<Usd>,
}

/// Side-exposing venue order placement; `intent=close` enforces the
/// drawdown-buffer guard.
async fn deribit_order(
    State(engine): State<AppState>,
    Json(req): Json<VenueOrderRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let order = OrderRequest {
        instrument: req.instrument,
        side: req.side,
        amount: req.amount,
        order_type: req.order_type.unwrap_or(OrderType::Market),
        price: req.price,
    };
    let result = engine
        .venue_order(
            "deribit",
            order,
            req.intent.as_deref(),
            req.drawdown_buffer_usdc,
        )
        .await?;
    Ok(Json(result))
}

async fn audit_export(
    State(engine): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(engine.audit_export(payload).await?))
}

async fn admin_reset(State(engine): State<AppState>) -> Json<serde_json::Value> {
    Json(engine.admin_reset().await)
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub mode: Option<String>,
}

async fn audit_summary(
    State(engine): State<AppState>,
    Query(q): Query<SummaryQuery>,
) -> Json<serde_json::Value> {
    let mode = q.mode.as_deref().unwrap_or("exec");
    Json(engine.audit_summary(mode))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

async fn audit_logs(
    State(engine): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    let entries = engine.audit_entries(q.limit.unwrap_or(100));
    Json(serde_json::json!({
        "count": entries.len(),
        "entries": entries,
    }))
}

/// Legacy alias: raw entry array.
async fn audit_entries(
    State(engine): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Json<Vec<crate::audit::AuditEntry>> {
    Json(engine.audit_entries(q.limit.unwrap_or(100)))
}

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/risk/summary", get(risk_summary))
        .route("/portfolio/ingest", post(portfolio_ingest))
        .route("/coverage/report", get(coverage_report))
        .route("/coverage/active", get(coverage_active))
        .route("/put/preview", post(put_preview))
        .route("/put/quote", post(put_quote))
        .route("/put/activate", post(put_activate))
        .route("/put/auto-renew", post(put_auto_renew))
        .route("/put/auto-renew/schedule", post(put_auto_renew_schedule))
        .route("/loop/tick", post(loop_tick))
        .route("/deribit/order", post(deribit_order))
        .route("/audit/export", post(audit_export))
        .route("/admin/reset", post(admin_reset))
        .route("/audit/summary", get(audit_summary))
        .route("/audit/logs", get(audit_logs))
        .route("/audit/entries", get(audit_entries))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}
