//! HTTP + WebSocket gateway.
//!
//! A thin axum adapter over the scheduling service: handlers validate
//! nothing themselves beyond JSON shape, call the typed service, and map
//! `ServiceError` variants onto HTTP statuses. The WebSocket endpoint
//! relays event-bus envelopes verbatim.

pub mod ws;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::connection::ConnectionManager;
use crate::error::ServiceError;
use crate::events::EventBus;
use crate::ratelimit::RateLimiter;
use crate::service::{
    BulkOutcome, CreateRuleRequest, EditRequest, ListQuery, ScheduleRequest, SchedulingService,
    UpdateRuleRequest,
};
use crate::store::{Intent, Recipient, RecurrenceRule};

/// Request body cap.
const MAX_BODY_SIZE: usize = 65_536;

/// Per-request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub service: SchedulingService,
    pub limiter: RateLimiter,
    pub bus: EventBus,
    pub connection: Arc<ConnectionManager>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ServiceError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ServiceError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ServiceError::ContactNotFound(id) => (
                StatusCode::NOT_FOUND,
                json!({ "error": format!("contact not found: {id}") }),
            ),
            ServiceError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ServiceError::DailyCapReached(rate) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string(), "rateLimit": rate }),
            ),
            ServiceError::TransientProvider(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": msg }))
            }
            ServiceError::Internal(e) => {
                tracing::error!("internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

// ── Wire shapes ───────────────────────────────────────────────────

pub(crate) fn intent_json(intent: &Intent) -> Value {
    let (contact_id, group_id) = match &intent.recipient {
        Recipient::Contact(id) => (Some(id.as_str()), None),
        Recipient::Group(id) => (None, Some(id.as_str())),
    };
    json!({
        "id": intent.id,
        "contactId": contact_id,
        "groupId": group_id,
        "content": intent.content,
        "mediaUrl": intent.media.as_ref().map(|m| m.url.as_str()),
        "mediaType": intent.media.as_ref().map(|m| m.kind.as_str()),
        "scheduledAt": intent.scheduled_at.to_rfc3339(),
        "status": intent.status.as_str(),
        "providerMessageId": intent.provider_message_id,
        "sentAt": intent.sent_at.map(|d| d.to_rfc3339()),
        "deliveredAt": intent.delivered_at.map(|d| d.to_rfc3339()),
        "failedAt": intent.failed_at.map(|d| d.to_rfc3339()),
        "failureReason": intent.failure_reason,
        "attempts": intent.attempts,
        "recurrenceRuleId": intent.recurrence_rule_id,
        "createdAt": intent.created_at.to_rfc3339(),
        "updatedAt": intent.updated_at.to_rfc3339(),
    })
}

pub(crate) fn rule_json(rule: &RecurrenceRule) -> Value {
    json!({
        "id": rule.id,
        "contactId": rule.contact_id,
        "kind": rule.kind.as_str(),
        "content": rule.content,
        "mediaUrl": rule.media.as_ref().map(|m| m.url.as_str()),
        "mediaType": rule.media.as_ref().map(|m| m.kind.as_str()),
        "cronExpression": rule.cron_expression,
        "everyNDays": rule.every_n_days,
        "endDate": rule.end_date.map(|d| d.to_rfc3339()),
        "maxOccurrences": rule.max_occurrences,
        "occurrenceCount": rule.occurrence_count,
        "enabled": rule.enabled,
        "lastFiredAt": rule.last_fired_at.map(|d| d.to_rfc3339()),
        "createdAt": rule.created_at.to_rfc3339(),
        "updatedAt": rule.updated_at.to_rfc3339(),
    })
}

fn bulk_json(outcome: &BulkOutcome) -> Value {
    json!({
        "scheduled": outcome.scheduled.iter().map(intent_json).collect::<Vec<_>>(),
        "failed": outcome
            .failed
            .iter()
            .map(|f| json!({ "index": f.index, "error": f.error }))
            .collect::<Vec<_>>(),
        "rateLimit": outcome.rate_limit,
    })
}

// ── Handlers ──────────────────────────────────────────────────────

async fn create_message(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.service.schedule(&req)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": intent_json(&outcome.intent),
            "rateLimit": outcome.rate_limit,
        })),
    ))
}

#[derive(serde::Deserialize)]
struct BulkBody {
    messages: Vec<ScheduleRequest>,
}

async fn create_bulk(
    State(state): State<AppState>,
    Json(body): Json<BulkBody>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.service.schedule_bulk(&body.messages)?;
    Ok(Json(bulk_json(&outcome)))
}

async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let intents = state.service.list(&query)?;
    Ok(Json(json!({
        "messages": intents.iter().map(intent_json).collect::<Vec<_>>(),
    })))
}

async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let intent = state.service.get(&id)?;
    Ok(Json(intent_json(&intent)))
}

async fn edit_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EditRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let intent = state.service.edit(&id, &req)?;
    Ok(Json(intent_json(&intent)))
}

async fn cancel_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    match state.service.cancel(&id)? {
        Some(intent) => Ok(Json(intent_json(&intent))),
        None => Ok(Json(json!(null))),
    }
}

async fn retry_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let intent = state.service.retry(&id)?;
    Ok(Json(intent_json(&intent)))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(req): Json<CreateRuleRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let rule = state.service.create_rule(&req)?;
    Ok((StatusCode::CREATED, Json(rule_json(&rule))))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleListQuery {
    contact_id: Option<String>,
}

async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<RuleListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let rules = state.service.list_rules(query.contact_id.as_deref())?;
    Ok(Json(json!({
        "rules": rules.iter().map(rule_json).collect::<Vec<_>>(),
    })))
}

async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let rule = state.service.get_rule(&id)?;
    Ok(Json(rule_json(&rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let rule = state.service.update_rule(&id, &req)?;
    Ok(Json(rule_json(&rule)))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    state.service.disable_rule(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rate_limit_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ServiceError> {
    let status = state.limiter.status().map_err(ServiceError::Internal)?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "connection": state.connection.health(),
        "subscribers": state.bus.subscriber_count(),
    }))
}

// ── Router / server ───────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/messages", post(create_message).get(list_messages))
        .route("/messages/bulk", post(create_bulk))
        .route("/messages/{id}", get(get_message).patch(edit_message))
        .route("/messages/{id}/cancel", post(cancel_message))
        .route("/messages/{id}/retry", post(retry_message))
        .route("/messages/recurring", post(create_rule).get(list_rules))
        .route(
            "/messages/recurring/{id}",
            get(get_rule).patch(update_rule).delete(delete_rule),
        )
        .route("/rate-limit/status", get(rate_limit_status))
        .route("/health", get(health))
        .route("/ws", get(ws::event_stream))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// Bind and serve until the process dies.
pub async fn run(host: &str, port: u16, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
