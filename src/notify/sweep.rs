use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{
    scheduler::AUTO_REMINDER_FREQUENCY,
    tasks::Task,
};
use crate::{
    error::AppResult,
    state::AppState,
    store::{PayRequestQuery, TokenKind},
};

/// Spawn the reminder sweeper.
///
/// Periodically finds unpaid requests whose last email is older than
/// [`AUTO_REMINDER_FREQUENCY`] and queues one send task per request, then
/// drops expired links.
pub fn start(state: AppState, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_loop(state, cancel).await;
    })
}

async fn run_loop(state: AppState, cancel: CancellationToken) {
    let interval = state.config.reminder_sweep_interval;
    info!(?interval, "Reminder sweeper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = cancel.cancelled() => {
                info!("Reminder sweeper shutting down");
                return;
            }
        }

        if let Err(e) = sweep_once(&state).await {
            error!(error = %e, "reminder sweep failed");
        }
    }
}

/// Run a single sweep and return how many reminders were queued.
pub async fn sweep_once(state: &AppState) -> AppResult<usize> {
    let now = OffsetDateTime::now_utc();
    let due = PayRequestQuery::active(None, false).reminded_before(now - AUTO_REMINDER_FREQUENCY);
    let reqs = state.store.query_pay_requests(&due).await?;

    // One task per request: the sweep itself is not transactional.
    for req in &reqs {
        state
            .tasks
            .enqueue(Task::SendPayRequestEmails(vec![req.id]))
            .await?;
    }

    let mut purged = 0;
    for kind in [TokenKind::VerifyEmail, TokenKind::ResetPassword] {
        purged += state.store.purge_tokens(kind, now - kind.lifespan()).await?;
    }
    info!(queued = reqs.len(), purged, "reminder sweep done");
    Ok(reqs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RecordStore, TokenRecord};
    use crate::testing::{put_pay_request, seed_requests, seed_user, Harness};
    use rust_decimal_macros::dec;
    use time::Duration;

    #[tokio::test]
    async fn queues_stale_unpaid_requests_and_purges_old_links() {
        let h = Harness::new();
        let payee = seed_user(&h.store, "pat@example.com", true).await;
        let mut reqs = seed_requests(&h.store, &payee, &[dec!(1), dec!(2), dec!(3)]).await;
        let now = OffsetDateTime::now_utc();

        reqs[0].reminder_sent_at = now - Duration::days(8);
        put_pay_request(&h.store, &reqs[0]).await;
        reqs[1].reminder_sent_at = now - Duration::days(2);
        put_pay_request(&h.store, &reqs[1]).await;
        reqs[2].reminder_sent_at = now - Duration::days(9);
        reqs[2].mark_paid(now);
        put_pay_request(&h.store, &reqs[2]).await;

        let stale = TokenRecord::new(TokenKind::VerifyEmail, payee.id, now - Duration::days(3));
        let fresh = TokenRecord::new(TokenKind::VerifyEmail, payee.id, now);
        h.store.put_token(&stale).await.unwrap();
        h.store.put_token(&fresh).await.unwrap();

        assert_eq!(sweep_once(&h.state).await.unwrap(), 1);
        assert_eq!(h.tasks.take(), vec![Task::SendPayRequestEmails(vec![reqs[0].id])]);
        assert!(h.store.get_token(TokenKind::VerifyEmail, &stale.key).await.is_err());
        assert!(h.store.get_token(TokenKind::VerifyEmail, &fresh.key).await.is_ok());
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        let handle = start(h.state.clone(), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
