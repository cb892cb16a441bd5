//! Persistence behind two traits: [`RecordStore`] for plain reads and
//! housekeeping, [`StoreTx`] for atomic read-modify-write units.
//!
//! Ownership is the `owner_id` reference on a PayRequest. Which records a
//! transaction locks, and how contention is detected, is left to the engine.

pub mod memory;
pub mod postgres;
pub mod repo_types;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

pub use repo_types::{
    is_sentinel, PayRequest, PaymentCategory, RecordKind, TokenKind, TokenRecord, User, EPOCH,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    /// Concurrent modification detected; the whole transaction may be retried.
    #[error("transaction conflict")]
    Conflict,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        // serialization_failure, deadlock_detected, unique_violation
        let contended = e
            .as_database_error()
            .and_then(|d| d.code())
            .map(|code| matches!(code.as_ref(), "40001" | "40P01" | "23505"))
            .unwrap_or(false);
        if contended {
            StoreError::Conflict
        } else {
            StoreError::Database(e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    NewestFirst,
    Unordered,
}

/// Filter over active PayRequests.
///
/// `paid` is matched by equality. The only inequality filter,
/// `reminder_sent_before`, is never combined with an ordering on another field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayRequestQuery {
    pub owner: Option<Uuid>,
    pub paid: bool,
    pub reminder_sent_before: Option<OffsetDateTime>,
    pub order: QueryOrder,
    pub limit: Option<usize>,
}

impl PayRequestQuery {
    pub fn active(owner: Option<Uuid>, paid: bool) -> Self {
        Self {
            owner,
            paid,
            reminder_sent_before: None,
            order: QueryOrder::Unordered,
            limit: None,
        }
    }

    pub fn newest_first(mut self, limit: usize) -> Self {
        self.order = QueryOrder::NewestFirst;
        self.limit = Some(limit);
        self
    }

    pub fn reminded_before(mut self, cutoff: OffsetDateTime) -> Self {
        self.reminder_sent_before = Some(cutoff);
        self.order = QueryOrder::Unordered;
        self
    }

    pub fn matches(&self, req: &PayRequest) -> bool {
        req.is_active()
            && req.paid == self.paid
            && self.owner.map_or(true, |owner| req.owner_id == owner)
            && self
                .reminder_sent_before
                .map_or(true, |cutoff| req.reminder_sent_at < cutoff)
    }
}

/// One atomic unit of work. Dropping it without `commit` discards every write.
#[async_trait]
pub trait StoreTx: Send {
    async fn get_user(&mut self, id: Uuid) -> Result<User, StoreError>;
    async fn find_user_id_by_email(&mut self, email: &str) -> Result<Option<Uuid>, StoreError>;
    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError>;
    async fn put_user(&mut self, user: &User) -> Result<(), StoreError>;
    async fn get_pay_request(&mut self, id: Uuid) -> Result<PayRequest, StoreError>;
    async fn insert_pay_request(&mut self, req: &PayRequest) -> Result<(), StoreError>;
    async fn put_pay_request(&mut self, req: &PayRequest) -> Result<(), StoreError>;
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    async fn get_user(&self, id: Uuid) -> Result<User, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn get_pay_request(&self, id: Uuid) -> Result<PayRequest, StoreError>;
    async fn query_pay_requests(&self, q: &PayRequestQuery)
        -> Result<Vec<PayRequest>, StoreError>;

    async fn put_token(&self, token: &TokenRecord) -> Result<(), StoreError>;
    async fn get_token(&self, kind: TokenKind, key: &str) -> Result<TokenRecord, StoreError>;
    /// Removes tokens of `kind` created before `created_before`; returns how many.
    async fn purge_tokens(
        &self,
        kind: TokenKind,
        created_before: OffsetDateTime,
    ) -> Result<u64, StoreError>;

    async fn dump(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>, StoreError>;
    async fn wipe(&self) -> Result<(), StoreError>;
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}
