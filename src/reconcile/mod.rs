pub mod handlers;
pub mod provider;
pub mod services;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    handlers::notification_routes()
}
