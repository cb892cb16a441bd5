use axum::{
    extract::{FromRef, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use tracing::{info, instrument};

use crate::{
    auth::{
        dto::{
            AuthResponse, ChangePasswordRequest, ConfirmResetRequest, LoginRequest,
            MessageResponse, PublicUser, ResetPasswordRequest, SettingsRequest,
            SettingsResponse, SignupRequest, VerifyQuery,
        },
        extractors::AuthSession,
        services,
        session::{Session, SessionKeys},
    },
    error::{AppError, AppResult},
    state::AppState,
    store::User,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
}

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me))
        .route("/settings", put(update_settings))
        .route("/account/change-password", post(change_password))
        .route("/account/reset-password", post(start_reset_password))
        .route("/account/reset-password/confirm", post(confirm_reset_password))
        .route("/account/send-verification", post(send_verification))
        .route("/account/verify", get(verify_email))
}

fn auth_response(state: &AppState, user: User, session: &Session) -> AppResult<AuthResponse> {
    let keys = SessionKeys::from_ref(state);
    Ok(AuthResponse {
        session_token: keys.sign(session)?,
        expires_at: session.expires_at(),
        user: user.into(),
    })
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    let (user, session) = services::signup(&state, &payload).await?;
    Ok((StatusCode::CREATED, Json(auth_response(&state, user, &session)?)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let (user, session) = services::login(&state, &payload.email, &payload.password).await?;
    Ok(Json(auth_response(&state, user, &session)?))
}

/// Sessions are self-contained tokens; logging out is the client dropping it.
#[instrument(skip_all)]
pub async fn logout(AuthSession(session): AuthSession) -> StatusCode {
    info!(user_id = %session.user_id, "user logged out");
    StatusCode::NO_CONTENT
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> AppResult<Json<PublicUser>> {
    let user = state.store.get_user(session.user_id).await?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, payload))]
pub async fn update_settings(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(payload): Json<SettingsRequest>,
) -> AppResult<Json<SettingsResponse>> {
    let (user, renewed) =
        services::update_profile(&state, &session, &payload.full_name, &payload.payout_email)
            .await?;
    let session_token = match renewed {
        Some(s) => Some(SessionKeys::from_ref(&state).sign(&s)?),
        None => None,
    };
    Ok(Json(SettingsResponse {
        user: user.into(),
        session_token,
    }))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    services::change_password(
        &state,
        &session,
        &payload.current_password,
        &payload.new_password,
    )
    .await?;
    Ok(Json(MessageResponse::new("Password changed")))
}

#[instrument(skip(state, payload))]
pub async fn start_reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    services::initiate_reset_password(&state, &payload.email).await?;
    Ok(Json(MessageResponse::new(
        "If that address has an account, a reset link is on its way",
    )))
}

#[instrument(skip(state, payload))]
pub async fn confirm_reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmResetRequest>,
) -> AppResult<Json<MessageResponse>> {
    services::reset_password(&state, &payload.key, &payload.new_password).await?;
    Ok(Json(MessageResponse::new("Password changed")))
}

#[instrument(skip(state))]
pub async fn send_verification(
    State(state): State<AppState>,
    AuthSession(session): AuthSession,
) -> AppResult<Json<MessageResponse>> {
    let user = state.store.get_user(session.user_id).await?;
    if user.email_ok {
        return Err(AppError::Conflict("Email already verified".into()));
    }
    services::initiate_verify_email(&state, &session).await?;
    Ok(Json(MessageResponse::new(format!(
        "Verification link sent to {}",
        session.email
    ))))
}

#[instrument(skip(state, q))]
pub async fn verify_email(
    State(state): State<AppState>,
    Query(q): Query<VerifyQuery>,
) -> AppResult<Json<PublicUser>> {
    let user = services::verify_email(&state, &q.key).await?;
    Ok(Json(user.into()))
}
