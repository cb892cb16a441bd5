pub mod dto;
pub mod handlers;
pub mod services;
pub mod updater;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::owner_routes())
        .merge(handlers::payer_routes())
}
