use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{
    to_json, PayRequest, PayRequestQuery, QueryOrder, RecordKind, RecordStore, StoreError,
    StoreTx, TokenKind, TokenRecord, User,
};

struct Versioned<T> {
    version: u64,
    value: T,
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, Versioned<User>>,
    pay_requests: HashMap<Uuid, Versioned<PayRequest>>,
    tokens: HashMap<(TokenKind, String), TokenRecord>,
    // bumped whenever the set of user emails changes
    email_index_version: u64,
}

/// How long a transaction waits for a record another transaction holds
/// before giving up with `Conflict`.
pub const LOCK_WAIT: Duration = Duration::from_secs(5);

type LockTable = Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

/// In-process engine. A transaction locks every record it reads by id until
/// it commits or is dropped, so read-check-write units on one record run one
/// after another. The email index has no lock; it is checked by version at
/// commit instead.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    locks: LockTable,
    lock_wait: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            tables: Arc::default(),
            locks: Arc::default(),
            lock_wait: LOCK_WAIT,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }
}

/// Record locks held by one transaction.
struct HeldLocks {
    table: LockTable,
    wait: Duration,
    held: HashMap<Uuid, OwnedMutexGuard<()>>,
}

impl HeldLocks {
    async fn acquire(&mut self, id: Uuid) -> Result<(), StoreError> {
        if self.held.contains_key(&id) {
            return Ok(());
        }
        let lock = {
            let mut table = self
                .table
                .lock()
                .map_err(|_| StoreError::Corrupt("record lock table poisoned".into()))?;
            let lock = table.entry(id).or_default().clone();
            lock
        };
        let guard = tokio::time::timeout(self.wait, lock.lock_owned())
            .await
            .map_err(|_| {
                debug!(%id, "timed out waiting for record lock");
                StoreError::Conflict
            })?;
        self.held.insert(id, guard);
        Ok(())
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        let ids: Vec<Uuid> = self.held.drain().map(|(id, _)| id).collect();
        if let Ok(mut table) = self.table.lock() {
            for id in ids {
                // only the table's own handle left: nobody holds or waits
                if table.get(&id).map_or(false, |l| Arc::strong_count(l) == 1) {
                    table.remove(&id);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadMark {
    // version 0 means "absent when read"
    User(Uuid, u64),
    PayRequest(Uuid, u64),
    EmailIndex(u64),
}

struct Staged<T> {
    value: T,
    insert: bool,
}

pub struct MemoryTx {
    tables: Arc<Mutex<Tables>>,
    locks: HeldLocks,
    reads: Vec<ReadMark>,
    users: HashMap<Uuid, Staged<User>>,
    pay_requests: HashMap<Uuid, Staged<PayRequest>>,
}

impl MemoryTx {
    fn stage_user(&mut self, user: &User, insert: bool) {
        let insert = insert || self.users.get(&user.id).map_or(false, |s| s.insert);
        self.users.insert(
            user.id,
            Staged {
                value: user.clone(),
                insert,
            },
        );
    }

    fn stage_pay_request(&mut self, req: &PayRequest, insert: bool) {
        let insert = insert || self.pay_requests.get(&req.id).map_or(false, |s| s.insert);
        self.pay_requests.insert(
            req.id,
            Staged {
                value: req.clone(),
                insert,
            },
        );
    }
}

fn validate(tables: &Tables, mark: ReadMark) -> Result<(), StoreError> {
    let (expected, current) = match mark {
        ReadMark::User(id, v) => (v, tables.users.get(&id).map_or(0, |r| r.version)),
        ReadMark::PayRequest(id, v) => (v, tables.pay_requests.get(&id).map_or(0, |r| r.version)),
        ReadMark::EmailIndex(v) => (v, tables.email_index_version),
    };
    if expected == current {
        Ok(())
    } else {
        debug!(?mark, current, "stale read detected at commit");
        Err(StoreError::Conflict)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_user(&mut self, id: Uuid) -> Result<User, StoreError> {
        if let Some(staged) = self.users.get(&id) {
            return Ok(staged.value.clone());
        }
        self.locks.acquire(id).await?;
        let tables = self.tables.lock().await;
        let found = tables.users.get(&id);
        self.reads
            .push(ReadMark::User(id, found.map_or(0, |r| r.version)));
        found
            .map(|r| r.value.clone())
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    async fn find_user_id_by_email(&mut self, email: &str) -> Result<Option<Uuid>, StoreError> {
        if let Some(staged) = self.users.values().find(|s| s.value.email == email) {
            return Ok(Some(staged.value.id));
        }
        let tables = self.tables.lock().await;
        self.reads
            .push(ReadMark::EmailIndex(tables.email_index_version));
        Ok(tables
            .users
            .values()
            .find(|r| r.value.email == email)
            .map(|r| r.value.id))
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.stage_user(user, true);
        Ok(())
    }

    async fn put_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.stage_user(user, false);
        Ok(())
    }

    async fn get_pay_request(&mut self, id: Uuid) -> Result<PayRequest, StoreError> {
        if let Some(staged) = self.pay_requests.get(&id) {
            return Ok(staged.value.clone());
        }
        self.locks.acquire(id).await?;
        let tables = self.tables.lock().await;
        let found = tables.pay_requests.get(&id);
        self.reads
            .push(ReadMark::PayRequest(id, found.map_or(0, |r| r.version)));
        found
            .map(|r| r.value.clone())
            .ok_or_else(|| StoreError::NotFound(format!("pay request {id}")))
    }

    async fn insert_pay_request(&mut self, req: &PayRequest) -> Result<(), StoreError> {
        self.stage_pay_request(req, true);
        Ok(())
    }

    async fn put_pay_request(&mut self, req: &PayRequest) -> Result<(), StoreError> {
        self.stage_pay_request(req, false);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            tables,
            locks,
            reads,
            users,
            pay_requests,
        } = *self;
        let mut tables = tables.lock().await;

        for mark in reads {
            validate(&tables, mark)?;
        }
        for (id, staged) in &users {
            let existing = tables.users.contains_key(id);
            if staged.insert {
                let email_taken = tables
                    .users
                    .values()
                    .any(|r| r.value.email == staged.value.email);
                if existing || email_taken {
                    return Err(StoreError::Conflict);
                }
            } else if !existing {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
        }
        for (id, staged) in &pay_requests {
            let existing = tables.pay_requests.contains_key(id);
            if staged.insert && existing {
                return Err(StoreError::Conflict);
            }
            if !staged.insert && !existing {
                return Err(StoreError::NotFound(format!("pay request {id}")));
            }
        }

        for (id, staged) in users {
            if staged.insert {
                tables.email_index_version += 1;
            }
            let version = tables.users.get(&id).map_or(0, |r| r.version) + 1;
            tables.users.insert(
                id,
                Versioned {
                    version,
                    value: staged.value,
                },
            );
        }
        for (id, staged) in pay_requests {
            let version = tables.pay_requests.get(&id).map_or(0, |r| r.version) + 1;
            tables.pay_requests.insert(
                id,
                Versioned {
                    version,
                    value: staged.value,
                },
            );
        }
        drop(tables);
        drop(locks);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            tables: self.tables.clone(),
            locks: HeldLocks {
                table: self.locks.clone(),
                wait: self.lock_wait,
                held: HashMap::new(),
            },
            reads: Vec::new(),
            users: HashMap::new(),
            pay_requests: HashMap::new(),
        }))
    }

    async fn get_user(&self, id: Uuid) -> Result<User, StoreError> {
        self.tables
            .lock()
            .await
            .users
            .get(&id)
            .map(|r| r.value.clone())
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .users
            .values()
            .find(|r| r.value.email == email)
            .map(|r| r.value.clone()))
    }

    async fn get_pay_request(&self, id: Uuid) -> Result<PayRequest, StoreError> {
        self.tables
            .lock()
            .await
            .pay_requests
            .get(&id)
            .map(|r| r.value.clone())
            .ok_or_else(|| StoreError::NotFound(format!("pay request {id}")))
    }

    async fn query_pay_requests(
        &self,
        q: &PayRequestQuery,
    ) -> Result<Vec<PayRequest>, StoreError> {
        let tables = self.tables.lock().await;
        let mut found: Vec<PayRequest> = tables
            .pay_requests
            .values()
            .filter(|r| q.matches(&r.value))
            .map(|r| r.value.clone())
            .collect();
        if q.order == QueryOrder::NewestFirst {
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        if let Some(limit) = q.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn put_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let key = (token.kind, token.key.clone());
        if tables.tokens.contains_key(&key) {
            return Err(StoreError::Conflict);
        }
        tables.tokens.insert(key, token.clone());
        Ok(())
    }

    async fn get_token(&self, kind: TokenKind, key: &str) -> Result<TokenRecord, StoreError> {
        self.tables
            .lock()
            .await
            .tokens
            .get(&(kind, key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} link", kind.label())))
    }

    async fn purge_tokens(
        &self,
        kind: TokenKind,
        created_before: OffsetDateTime,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.tokens.len();
        tables
            .tokens
            .retain(|(k, _), t| *k != kind || t.created_at >= created_before);
        Ok((before - tables.tokens.len()) as u64)
    }

    async fn dump(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>, StoreError> {
        let tables = self.tables.lock().await;
        match kind {
            RecordKind::User => {
                let mut users: Vec<&User> = tables.users.values().map(|r| &r.value).collect();
                users.sort_by_key(|u| u.created_at);
                users.into_iter().map(to_json).collect()
            }
            RecordKind::PayRequest => {
                let mut reqs: Vec<&PayRequest> =
                    tables.pay_requests.values().map(|r| &r.value).collect();
                reqs.sort_by_key(|r| r.created_at);
                reqs.into_iter().map(to_json).collect()
            }
            RecordKind::VerifyEmail | RecordKind::ResetPassword => {
                let mut tokens: Vec<&TokenRecord> = tables
                    .tokens
                    .values()
                    .filter(|t| Some(t.kind) == kind.token_kind())
                    .collect();
                tokens.sort_by_key(|t| t.created_at);
                tokens.into_iter().map(to_json).collect()
            }
        }
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.users.clear();
        tables.pay_requests.clear();
        tables.tokens.clear();
        tables.email_index_version += 1;
        Ok(())
    }
}
