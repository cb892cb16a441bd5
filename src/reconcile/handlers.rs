use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::post,
    Router,
};
use tracing::instrument;

use super::services::handle_payment_notification;
use crate::{error::AppResult, ledger::dto::RequestCode, state::AppState};

pub fn notification_routes() -> Router<AppState> {
    Router::new().route("/ipn", post(payment_notification))
}

/// Provider callback. The body is kept raw: it is posted back verbatim for
/// confirmation. Any non-2xx answer makes the provider redeliver.
#[instrument(skip(state, body))]
pub async fn payment_notification(
    State(state): State<AppState>,
    Query(q): Query<RequestCode>,
    body: String,
) -> AppResult<StatusCode> {
    handle_payment_notification(&state, &q.req_code, &body).await?;
    Ok(StatusCode::OK)
}
