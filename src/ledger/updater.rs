//! Read-check-mutate-write over a set of PayRequests as one atomic unit.
//!
//! Every attempt starts from scratch: a fresh transaction, a fresh list of
//! changed ids. A retried attempt therefore never reports an id twice or
//! reports a change that a competing writer already made.

use std::future::Future;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    store::{PayRequest, RecordStore, StoreError},
};

pub const MAX_TX_ATTEMPTS: usize = 3;

/// Decides, per record, whether and how to change it. Returning `Ok(true)`
/// means "write this record back".
#[async_trait]
pub trait Mutation: Send + Sync {
    async fn apply(&self, id: Uuid, req: &mut PayRequest) -> AppResult<bool>;
}

#[async_trait]
impl<F> Mutation for F
where
    F: Fn(Uuid, &mut PayRequest) -> AppResult<bool> + Send + Sync,
{
    async fn apply(&self, id: Uuid, req: &mut PayRequest) -> AppResult<bool> {
        self(id, req)
    }
}

/// Runs `attempt` until it succeeds or fails with something other than
/// store contention, at most [`MAX_TX_ATTEMPTS`] times.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, mut attempt: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut n = 0;
    loop {
        n += 1;
        match attempt().await {
            Err(AppError::Store(StoreError::Conflict)) if n < MAX_TX_ATTEMPTS => {
                warn!(what, attempt = n, "transaction contention; retrying");
            }
            other => return other,
        }
    }
}

/// Applies `mutation` to every id in caller order inside one transaction and
/// returns the ids it changed.
///
/// With `owner_email` set, every record must belong to that payee; a single
/// foreign record fails the whole batch before anything is written.
pub async fn apply_batch<M>(
    store: &dyn RecordStore,
    ids: &[Uuid],
    owner_email: Option<&str>,
    mutation: &M,
) -> AppResult<Vec<Uuid>>
where
    M: Mutation + ?Sized,
{
    if ids.is_empty() {
        return Err(AppError::Validation("No payment requests given".into()));
    }
    retry_on_conflict("pay request batch", || {
        attempt_batch(store, ids, owner_email, mutation)
    })
    .await
}

async fn attempt_batch<M>(
    store: &dyn RecordStore,
    ids: &[Uuid],
    owner_email: Option<&str>,
    mutation: &M,
) -> AppResult<Vec<Uuid>>
where
    M: Mutation + ?Sized,
{
    let mut changed = Vec::with_capacity(ids.len());
    let mut tx = store.begin().await?;
    for &id in ids {
        let mut req = tx.get_pay_request(id).await?;
        if let Some(owner) = owner_email {
            if req.payee_email != owner {
                warn!(%id, owner, payee = %req.payee_email, "batch touches a foreign record");
                return Err(AppError::Authorization(
                    "Not allowed to modify this payment request".into(),
                ));
            }
        }
        if mutation.apply(id, &mut req).await? {
            tx.put_pay_request(&req).await?;
            changed.push(id);
        }
    }
    tx.commit().await?;
    debug!(requested = ids.len(), changed = changed.len(), "batch committed");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::testing::{seed_requests, seed_user};
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn mark_paid(_: Uuid, req: &mut PayRequest) -> AppResult<bool> {
        Ok(req.mark_paid(OffsetDateTime::now_utc()))
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let store = MemoryStore::new();
        let err = apply_batch(&store, &[], None, &mark_paid).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn foreign_record_fails_whole_batch() {
        let store = MemoryStore::new();
        let alice = seed_user(&store, "alice@example.com", true).await;
        let bob = seed_user(&store, "bob@example.com", true).await;
        let mine = seed_requests(&store, &alice, &[dec!(5)]).await;
        let theirs = seed_requests(&store, &bob, &[dec!(7)]).await;

        let ids = [mine[0].id, theirs[0].id];
        let err = apply_batch(&store, &ids, Some("alice@example.com"), &mark_paid)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));

        for id in ids {
            assert!(!store.get_pay_request(id).await.unwrap().paid);
        }
    }

    #[tokio::test]
    async fn unchanged_records_are_not_reported() {
        let store = MemoryStore::new();
        let alice = seed_user(&store, "alice@example.com", true).await;
        let reqs = seed_requests(&store, &alice, &[dec!(1), dec!(2)]).await;
        let ids = [reqs[0].id, reqs[1].id];

        let first = apply_batch(&store, &ids[..1], None, &mark_paid).await.unwrap();
        assert_eq!(first, vec![ids[0]]);
        let second = apply_batch(&store, &ids, None, &mark_paid).await.unwrap();
        assert_eq!(second, vec![ids[1]]);
    }

    #[tokio::test]
    async fn mutation_error_writes_nothing() {
        let store = MemoryStore::new();
        let alice = seed_user(&store, "alice@example.com", true).await;
        let reqs = seed_requests(&store, &alice, &[dec!(1), dec!(2)]).await;
        let ids = [reqs[0].id, reqs[1].id];
        let fail_second = move |id: Uuid, req: &mut PayRequest| -> AppResult<bool> {
            if id == ids[1] {
                return Err(AppError::Integrity("boom".into()));
            }
            Ok(req.mark_paid(OffsetDateTime::now_utc()))
        };
        assert!(apply_batch(&store, &ids, None, &fail_second).await.is_err());
        assert!(!store.get_pay_request(ids[0]).await.unwrap().paid);
    }

    /// Pays `victim` through its own transaction on the first call, and
    /// reports contention on the calls listed in `conflict_on`.
    struct Contended {
        store: MemoryStore,
        victim: Option<Uuid>,
        calls: AtomicUsize,
        conflict_on: fn(usize) -> bool,
    }

    #[async_trait]
    impl Mutation for Contended {
        async fn apply(&self, _id: Uuid, req: &mut PayRequest) -> AppResult<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let (0, Some(victim)) = (n, self.victim) {
                let mut tx = self.store.begin().await?;
                let mut other = tx.get_pay_request(victim).await?;
                other.mark_paid(OffsetDateTime::now_utc());
                tx.put_pay_request(&other).await?;
                tx.commit().await?;
            }
            if (self.conflict_on)(n) {
                return Err(StoreError::Conflict.into());
            }
            Ok(req.mark_paid(OffsetDateTime::now_utc()))
        }
    }

    #[tokio::test]
    async fn retried_batch_reports_each_change_once() {
        let store = MemoryStore::new();
        let alice = seed_user(&store, "alice@example.com", true).await;
        let reqs = seed_requests(&store, &alice, &[dec!(1), dec!(2)]).await;
        let (id1, id2) = (reqs[0].id, reqs[1].id);

        // first attempt changes id1, then hits contention on id2
        let m = Contended {
            store: store.clone(),
            victim: Some(id2),
            calls: AtomicUsize::new(0),
            conflict_on: |n| n == 1,
        };
        let changed = apply_batch(&store, &[id1, id2], None, &m).await.unwrap();
        assert_eq!(changed, vec![id1]);
        assert_eq!(m.calls.load(Ordering::SeqCst), 4);
        assert!(store.get_pay_request(id1).await.unwrap().paid);
        assert!(store.get_pay_request(id2).await.unwrap().paid);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let store = MemoryStore::new();
        let alice = seed_user(&store, "alice@example.com", true).await;
        let reqs = seed_requests(&store, &alice, &[dec!(1), dec!(2)]).await;

        let m = Contended {
            store: store.clone(),
            victim: None,
            calls: AtomicUsize::new(0),
            conflict_on: |_| true,
        };
        let err = apply_batch(&store, &[reqs[0].id, reqs[1].id], None, &m)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::Conflict)));
        assert_eq!(m.calls.load(Ordering::SeqCst), MAX_TX_ATTEMPTS);
        assert!(!store.get_pay_request(reqs[0].id).await.unwrap().paid);
    }

    #[tokio::test]
    async fn overlapping_batches_serialize_on_shared_records() {
        let store = MemoryStore::new();
        let alice = seed_user(&store, "alice@example.com", true).await;
        let reqs = seed_requests(&store, &alice, &[dec!(1)]).await;
        let id = reqs[0].id;
        let ids = [id];

        let (a, b) = tokio::join!(
            apply_batch(&store, &ids, None, &mark_paid),
            apply_batch(&store, &ids, None, &mark_paid)
        );
        let mut reported = a.unwrap();
        reported.extend(b.unwrap());
        assert_eq!(reported, vec![id]);
    }
}
