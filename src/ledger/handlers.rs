use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument};

use super::dto::{
    BatchRequest, BatchResponse, CreatePayRequests, CreatedPayRequests, PayRequestView,
    RequestCode,
};
use super::services;
use crate::{auth::extractors::AuthSession, error::AppResult, state::AppState};

// --- owner routes ---

pub fn owner_routes() -> Router<AppState> {
    Router::new()
        .route("/pay-requests", get(list_pay_requests).post(create_pay_requests))
        .route("/pay-requests/mark-paid", post(mark_paid))
        .route("/pay-requests/delete", post(delete_pay_requests))
        .route("/pay-requests/remind", post(remind))
}

// --- payer routes, reached from links in the request email ---

pub fn payer_routes() -> Router<AppState> {
    Router::new()
        .route("/pay/offline", get(pay_offline).post(pay_offline))
        .route("/pay/provider", get(pay_with_provider))
}

#[instrument(skip(state))]
pub async fn list_pay_requests(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> AppResult<Json<Vec<PayRequestView>>> {
    let payee = state.store.get_user(session.user_id).await?;
    let reqs = services::list_recent(&state, &session).await?;
    Ok(Json(
        reqs.into_iter()
            .map(|r| PayRequestView::new(r, payee.email_ok))
            .collect(),
    ))
}

#[instrument(skip(state, payload))]
pub async fn create_pay_requests(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(payload): Json<CreatePayRequests>,
) -> AppResult<(StatusCode, Json<CreatedPayRequests>)> {
    let ids = services::create_pay_requests(&state, &session, &payload.requests).await?;
    Ok((StatusCode::CREATED, Json(CreatedPayRequests { ids })))
}

#[instrument(skip(state, payload))]
pub async fn mark_paid(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(payload): Json<BatchRequest>,
) -> AppResult<Json<BatchResponse>> {
    let changed = services::mark_paid(&state, &session, &payload.ids, payload.undo).await?;
    Ok(Json(BatchResponse { changed }))
}

#[instrument(skip(state, payload))]
pub async fn delete_pay_requests(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(payload): Json<BatchRequest>,
) -> AppResult<Json<BatchResponse>> {
    let changed = services::soft_delete(&state, &session, &payload.ids, payload.undo).await?;
    Ok(Json(BatchResponse { changed }))
}

#[instrument(skip(state, payload))]
pub async fn remind(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(payload): Json<BatchRequest>,
) -> AppResult<StatusCode> {
    services::send_reminders(&state, &session, payload.ids).await?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip(state))]
pub async fn pay_offline(
    State(state): State<AppState>,
    Query(q): Query<RequestCode>,
) -> AppResult<StatusCode> {
    let id = services::parse_request_code(&q.req_code)?;
    services::pay_offline(&state, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 303 to the provider's checkout page.
#[instrument(skip(state))]
pub async fn pay_with_provider(
    State(state): State<AppState>,
    Query(q): Query<RequestCode>,
) -> AppResult<Redirect> {
    let id = services::parse_request_code(&q.req_code)?;
    let url = services::start_provider_payment(&state, id).await?;
    info!(%id, "redirecting payer to provider");
    Ok(Redirect::to(&url))
}
