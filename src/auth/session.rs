use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::{config::SessionConfig, error::AppResult, state::AppState};

pub const SESSION_LIFESPAN: Duration = Duration::days(14);

/// The acting principal: who is logged in, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub created_at: OffsetDateTime,
}

impl Session {
    pub fn new(user_id: Uuid, email: String, full_name: String) -> Self {
        Self {
            user_id,
            email,
            full_name,
            // whole seconds, so it survives the claims round-trip unchanged
            created_at: truncate_to_seconds(OffsetDateTime::now_utc()),
        }
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.created_at + SESSION_LIFESPAN
    }
}

fn truncate_to_seconds(t: OffsetDateTime) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(t.unix_timestamp()).unwrap_or(t)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,       // user ID
    pub email: String,
    pub name: String,    // display name
    pub iat: i64,        // session created_at
    pub exp: i64,        // iat + 14 days
    pub iss: String,
    pub aud: String,
}

#[derive(Clone)]
pub struct SessionKeys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    pub issuer: String,
    pub audience: String,
}

impl FromRef<AppState> for SessionKeys {
    fn from_ref(state: &AppState) -> Self {
        Self::new(&state.config.session)
    }
}

impl SessionKeys {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
        }
    }

    /// Signs `session`; re-signing a session keeps its original expiry.
    pub fn sign(&self, session: &Session) -> AppResult<String> {
        let claims = Claims {
            sub: session.user_id,
            email: session.email.clone(),
            name: session.full_name.clone(),
            iat: session.created_at.unix_timestamp(),
            exp: session.expires_at().unix_timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %session.user_id, "session signed");
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> Result<Session, jsonwebtoken::errors::Error> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        let claims = data.claims;
        debug!(user_id = %claims.sub, "session verified");
        let created_at = OffsetDateTime::from_unix_timestamp(claims.iat)
            .map_err(|_| jsonwebtoken::errors::ErrorKind::InvalidToken)?;
        Ok(Session {
            user_id: claims.sub,
            email: claims.email,
            full_name: claims.name,
            created_at,
        })
    }
}
