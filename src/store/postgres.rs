use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder, Transaction};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::repo_types::{PayRequestRow, TokenRow};
use super::{
    to_json, PayRequest, PayRequestQuery, QueryOrder, RecordKind, RecordStore, StoreError,
    StoreTx, TokenKind, TokenRecord, User, EPOCH,
};

const USER_COLUMNS: &str =
    "id, email, password_hash, full_name, payout_email, email_ok, created_at";

const PAY_REQUEST_COLUMNS: &str = "id, owner_id, payee_email, payer_email, amount, category, \
     description, created_at, paid, paid_at, deleted_at, reminder_sent_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Transaction that row-locks every record it reads (`FOR UPDATE`).
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn get_user(&mut self, id: Uuid) -> Result<User, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    async fn find_user_id_by_email(&mut self, email: &str) -> Result<Option<Uuid>, StoreError> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, full_name, payout_email, email_ok, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.full_name)
        .bind(&user.payout_email)
        .bind(user.email_ok)
        .bind(user.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn put_user(&mut self, user: &User) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET password_hash = $2, full_name = $3, payout_email = $4, email_ok = $5
             WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.password_hash)
        .bind(&user.full_name)
        .bind(&user.payout_email)
        .bind(user.email_ok)
        .execute(&mut *self.tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", user.id)));
        }
        Ok(())
    }

    async fn get_pay_request(&mut self, id: Uuid) -> Result<PayRequest, StoreError> {
        let sql =
            format!("SELECT {PAY_REQUEST_COLUMNS} FROM pay_requests WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, PayRequestRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("pay request {id}")))?
            .try_into()
    }

    async fn insert_pay_request(&mut self, req: &PayRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pay_requests (id, owner_id, payee_email, payer_email, amount, category,
                                      description, created_at, paid, paid_at, deleted_at,
                                      reminder_sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(req.id)
        .bind(req.owner_id)
        .bind(&req.payee_email)
        .bind(&req.payer_email)
        .bind(req.amount)
        .bind(req.category.as_str())
        .bind(&req.description)
        .bind(req.created_at)
        .bind(req.paid)
        .bind(req.paid_at)
        .bind(req.deleted_at)
        .bind(req.reminder_sent_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn put_pay_request(&mut self, req: &PayRequest) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE pay_requests
               SET paid = $2, paid_at = $3, deleted_at = $4, reminder_sent_at = $5
             WHERE id = $1
            "#,
        )
        .bind(req.id)
        .bind(req.paid)
        .bind(req.paid_at)
        .bind(req.deleted_at)
        .bind(req.reminder_sent_at)
        .execute(&mut *self.tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pay request {}", req.id)));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn get_user(&self, id: Uuid) -> Result<User, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn get_pay_request(&self, id: Uuid) -> Result<PayRequest, StoreError> {
        let sql = format!("SELECT {PAY_REQUEST_COLUMNS} FROM pay_requests WHERE id = $1");
        sqlx::query_as::<_, PayRequestRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("pay request {id}")))?
            .try_into()
    }

    async fn query_pay_requests(
        &self,
        q: &PayRequestQuery,
    ) -> Result<Vec<PayRequest>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {PAY_REQUEST_COLUMNS} FROM pay_requests WHERE deleted_at = "
        ));
        qb.push_bind(EPOCH);
        qb.push(" AND paid = ").push_bind(q.paid);
        if let Some(owner) = q.owner {
            qb.push(" AND owner_id = ").push_bind(owner);
        }
        if let Some(cutoff) = q.reminder_sent_before {
            qb.push(" AND reminder_sent_at < ").push_bind(cutoff);
        }
        if q.order == QueryOrder::NewestFirst {
            qb.push(" ORDER BY created_at DESC");
        }
        if let Some(limit) = q.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        debug!(sql = qb.sql(), "query pay requests");

        let rows = qb
            .build_query_as::<PayRequestRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PayRequest::try_from).collect()
    }

    async fn put_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ephemeral_tokens (kind, key, user_id, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(token.kind.as_str())
        .bind(&token.key)
        .bind(token.user_id)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_token(&self, kind: TokenKind, key: &str) -> Result<TokenRecord, StoreError> {
        sqlx::query_as::<_, TokenRow>(
            "SELECT key, kind, user_id, created_at FROM ephemeral_tokens WHERE kind = $1 AND key = $2",
        )
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("{} link", kind.label())))?
        .try_into()
    }

    async fn purge_tokens(
        &self,
        kind: TokenKind,
        created_before: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM ephemeral_tokens WHERE kind = $1 AND created_at < $2")
            .bind(kind.as_str())
            .bind(created_before)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn dump(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>, StoreError> {
        match kind {
            RecordKind::User => {
                let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at");
                let users = sqlx::query_as::<_, User>(&sql).fetch_all(&self.pool).await?;
                users.iter().map(to_json).collect()
            }
            RecordKind::PayRequest => {
                let sql =
                    format!("SELECT {PAY_REQUEST_COLUMNS} FROM pay_requests ORDER BY created_at");
                let rows = sqlx::query_as::<_, PayRequestRow>(&sql)
                    .fetch_all(&self.pool)
                    .await?;
                rows.into_iter()
                    .map(|r| PayRequest::try_from(r).and_then(|req| to_json(&req)))
                    .collect()
            }
            RecordKind::VerifyEmail | RecordKind::ResetPassword => {
                let token_kind = kind
                    .token_kind()
                    .ok_or_else(|| StoreError::Corrupt(format!("{kind:?} is not a token")))?;
                let rows = sqlx::query_as::<_, TokenRow>(
                    "SELECT key, kind, user_id, created_at FROM ephemeral_tokens WHERE kind = $1 ORDER BY created_at",
                )
                .bind(token_kind.as_str())
                .fetch_all(&self.pool)
                .await?;
                rows.into_iter()
                    .map(|r| TokenRecord::try_from(r).and_then(|t| to_json(&t)))
                    .collect()
            }
        }
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        // children first
        for table in ["ephemeral_tokens", "pay_requests", "users"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
