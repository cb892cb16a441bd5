//! Development-only record dump and wipe. Mounted only when
//! `ADMIN_ENABLED=true`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::{error::AppResult, state::AppState, store::RecordKind};

#[derive(Debug, Deserialize)]
pub struct DumpQuery {
    pub kind: RecordKind,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/dump", get(dump))
        .route("/admin/wipe", post(wipe))
}

#[instrument(skip(state))]
pub async fn dump(
    State(state): State<AppState>,
    Query(q): Query<DumpQuery>,
) -> AppResult<Json<Vec<Value>>> {
    Ok(Json(state.store.dump(q.kind).await?))
}

#[instrument(skip(state))]
pub async fn wipe(State(state): State<AppState>) -> AppResult<StatusCode> {
    warn!("wiping every record");
    state.store.wipe().await?;
    Ok(StatusCode::NO_CONTENT)
}
