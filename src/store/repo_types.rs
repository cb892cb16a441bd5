use std::{fmt, str::FromStr};

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::StoreError;

/// "Not set" marker for PayRequest timestamps.
pub const EPOCH: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

pub fn is_sentinel(t: OffsetDateTime) -> bool {
    t == EPOCH
}

/// Account holder; owns PayRequests through `PayRequest::owner_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,               // canonical (lower-cased) login email
    #[serde(skip_serializing)]
    pub password_hash: String,       // argon2 PHC string, salt included
    pub full_name: String,
    pub payout_email: String,        // provider account that receives payments
    pub email_ok: bool,              // primary email verified
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentCategory {
    Personal,
    Goods,
    Services,
}

impl PaymentCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentCategory::Personal => "personal",
            PaymentCategory::Goods => "goods",
            PaymentCategory::Services => "services",
        }
    }
}

impl FromStr for PaymentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(PaymentCategory::Personal),
            "goods" => Ok(PaymentCategory::Goods),
            "services" => Ok(PaymentCategory::Services),
            other => Err(format!("invalid payment category: {other:?}")),
        }
    }
}

impl fmt::Display for PaymentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One amount of money owed by a payer to the payee who owns the record.
///
/// `paid_at`, `deleted_at` and `reminder_sent_at` use [`EPOCH`] for "not set".
/// `paid` mirrors `paid_at != EPOCH` so stores can filter on it with equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayRequest {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub payee_email: String,
    pub payer_email: String,
    pub amount: Decimal,
    pub category: PaymentCategory,
    pub description: String,
    pub created_at: OffsetDateTime,
    pub paid: bool,
    pub paid_at: OffsetDateTime,
    pub deleted_at: OffsetDateTime,
    pub reminder_sent_at: OffsetDateTime,
}

impl PayRequest {
    pub fn new(
        payee: &User,
        payer_email: String,
        amount: Decimal,
        category: PaymentCategory,
        description: String,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: payee.id,
            payee_email: payee.email.clone(),
            payer_email,
            amount,
            category,
            description,
            created_at,
            paid: false,
            paid_at: EPOCH,
            deleted_at: EPOCH,
            reminder_sent_at: EPOCH,
        }
    }

    pub fn is_active(&self) -> bool {
        is_sentinel(self.deleted_at)
    }

    /// Returns false when the request was already paid.
    pub fn mark_paid(&mut self, now: OffsetDateTime) -> bool {
        if !is_sentinel(self.paid_at) {
            return false;
        }
        self.paid = true;
        self.paid_at = now;
        true
    }

    /// Returns false when the request was not paid.
    pub fn mark_unpaid(&mut self) -> bool {
        if is_sentinel(self.paid_at) {
            return false;
        }
        self.paid = false;
        self.paid_at = EPOCH;
        true
    }

    pub fn mark_deleted(&mut self, now: OffsetDateTime) -> bool {
        if !self.is_active() {
            return false;
        }
        self.deleted_at = now;
        true
    }

    pub fn restore(&mut self) -> bool {
        if self.is_active() {
            return false;
        }
        self.deleted_at = EPOCH;
        true
    }
}

/// Row shape of `pay_requests`; category is stored as text.
#[derive(Debug, FromRow)]
pub struct PayRequestRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub payee_email: String,
    pub payer_email: String,
    pub amount: Decimal,
    pub category: String,
    pub description: String,
    pub created_at: OffsetDateTime,
    pub paid: bool,
    pub paid_at: OffsetDateTime,
    pub deleted_at: OffsetDateTime,
    pub reminder_sent_at: OffsetDateTime,
}

impl TryFrom<PayRequestRow> for PayRequest {
    type Error = StoreError;

    fn try_from(r: PayRequestRow) -> Result<Self, Self::Error> {
        let category = r.category.parse().map_err(StoreError::Corrupt)?;
        Ok(Self {
            id: r.id,
            owner_id: r.owner_id,
            payee_email: r.payee_email,
            payer_email: r.payer_email,
            amount: r.amount,
            category,
            description: r.description,
            created_at: r.created_at,
            paid: r.paid,
            paid_at: r.paid_at,
            deleted_at: r.deleted_at,
            reminder_sent_at: r.reminder_sent_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    VerifyEmail,
    ResetPassword,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::VerifyEmail => "verify_email",
            TokenKind::ResetPassword => "reset_password",
        }
    }

    /// How long a token of this kind may be redeemed after creation.
    pub fn lifespan(self) -> Duration {
        match self {
            TokenKind::VerifyEmail => Duration::days(2),
            TokenKind::ResetPassword => Duration::minutes(15),
        }
    }

    /// Human-readable link name used in user-facing messages.
    pub fn label(self) -> &'static str {
        match self {
            TokenKind::VerifyEmail => "Email verification",
            TokenKind::ResetPassword => "Password reset",
        }
    }
}

impl FromStr for TokenKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verify_email" => Ok(TokenKind::VerifyEmail),
            "reset_password" => Ok(TokenKind::ResetPassword),
            other => Err(format!("invalid token kind: {other:?}")),
        }
    }
}

/// Single-purpose capability (email verification, password reset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub key: String,
    pub kind: TokenKind,
    pub user_id: Uuid,
    pub created_at: OffsetDateTime,
}

impl TokenRecord {
    pub fn new(kind: TokenKind, user_id: Uuid, now: OffsetDateTime) -> Self {
        let random: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self {
            key: format!("{}-{}", now.unix_timestamp(), random),
            kind,
            user_id,
            created_at: now,
        }
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.created_at + self.kind.lifespan()
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at()
    }
}

#[derive(Debug, FromRow)]
pub struct TokenRow {
    pub key: String,
    pub kind: String,
    pub user_id: Uuid,
    pub created_at: OffsetDateTime,
}

impl TryFrom<TokenRow> for TokenRecord {
    type Error = StoreError;

    fn try_from(r: TokenRow) -> Result<Self, Self::Error> {
        Ok(Self {
            key: r.key,
            kind: r.kind.parse().map_err(StoreError::Corrupt)?,
            user_id: r.user_id,
            created_at: r.created_at,
        })
    }
}

/// Closed set of record types exposed to the admin dump and wipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    User,
    PayRequest,
    VerifyEmail,
    ResetPassword,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::User,
        RecordKind::PayRequest,
        RecordKind::VerifyEmail,
        RecordKind::ResetPassword,
    ];

    pub fn token_kind(self) -> Option<TokenKind> {
        match self {
            RecordKind::VerifyEmail => Some(TokenKind::VerifyEmail),
            RecordKind::ResetPassword => Some(TokenKind::ResetPassword),
            RecordKind::User | RecordKind::PayRequest => None,
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(RecordKind::User),
            "pay_request" => Ok(RecordKind::PayRequest),
            "verify_email" => Ok(RecordKind::VerifyEmail),
            "reset_password" => Ok(RecordKind::ResetPassword),
            other => Err(format!("unknown record kind: {other:?}")),
        }
    }
}
