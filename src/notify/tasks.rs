use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::scheduler;
use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

/// Attempts per task before it is given up.
pub const MAX_TASK_ATTEMPTS: u32 = 5;
/// Wait before the first retry; doubles after each failure.
pub const TASK_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// How a payment was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// The payer clicked "I paid" outside the provider.
    Offline,
    /// Confirmed by a provider notification.
    Provider,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::Offline => f.write_str("offline"),
            PaymentMethod::Provider => f.write_str("provider"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    SendPayRequestEmails(Vec<Uuid>),
    SendPaymentDoneEmail { id: Uuid, method: PaymentMethod },
}

/// Deferred work, run after the enqueuing request has returned.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> AppResult<()>;
}

#[derive(Clone)]
pub struct ChannelQueue {
    tx: UnboundedSender<Task>,
}

impl ChannelQueue {
    pub fn new() -> (Self, UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for ChannelQueue {
    async fn enqueue(&self, task: Task) -> AppResult<()> {
        self.tx
            .send(task)
            .map_err(|e| AppError::Internal(format!("task worker stopped, dropped {:?}", e.0)))
    }
}

/// Convenience for the common "email these requests" enqueue; no-op when empty.
pub async fn enqueue_pay_request_emails(queue: &dyn TaskQueue, ids: Vec<Uuid>) -> AppResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    info!(count = ids.len(), "enqueuing pay request emails");
    queue.enqueue(Task::SendPayRequestEmails(ids)).await
}

pub async fn run_task(state: &AppState, task: Task) -> AppResult<()> {
    match task {
        Task::SendPayRequestEmails(ids) => scheduler::send_pay_request_emails(state, &ids).await,
        Task::SendPaymentDoneEmail { id, method } => {
            scheduler::send_payment_done_email(state, id, method).await
        }
    }
}

/// Relay and store failures may clear up; anything else will fail the same way
/// again.
fn is_retryable(e: &AppError) -> bool {
    matches!(e, AppError::ExternalService(_) | AppError::Store(_))
}

/// Runs `task`, retrying retryable failures with doubling waits. Request
/// emails are stamped as they go out, so a retried batch only sends what is
/// still missing.
pub async fn run_with_retry(
    state: &AppState,
    task: Task,
    backoff: Duration,
    cancel: &CancellationToken,
) -> AppResult<()> {
    let mut wait = backoff;
    let mut attempt = 1;
    loop {
        match run_task(state, task.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < MAX_TASK_ATTEMPTS && is_retryable(&e) => {
                warn!(?task, attempt, error = %e, retry_in = ?wait, "task failed; will retry");
            }
            Err(e) => return Err(e),
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => {
                return Err(AppError::Internal(format!("shut down before retrying {task:?}")));
            }
        }
        wait *= 2;
        attempt += 1;
    }
}

/// Spawn the task worker. Each task runs on its own tokio task so a slow
/// mail relay does not hold up the queue.
pub fn start(
    state: AppState,
    rx: UnboundedReceiver<Task>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_loop(state, rx, cancel).await;
    })
}

async fn run_loop(state: AppState, mut rx: UnboundedReceiver<Task>, cancel: CancellationToken) {
    info!("Task worker started");
    loop {
        let task = tokio::select! {
            task = rx.recv() => task,
            _ = cancel.cancelled() => {
                info!("Task worker shutting down");
                return;
            }
        };
        let Some(task) = task else {
            warn!("Task queue closed; worker exiting");
            return;
        };

        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let label = format!("{task:?}");
            if let Err(e) = run_with_retry(&state, task, TASK_RETRY_BACKOFF, &cancel).await {
                error!(task = %label, error = %e, "task failed; giving up");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::reconcile::services::{handle_payment_notification, Outcome};
    use crate::testing::{seed_requests, seed_user, Harness};
    use rust_decimal_macros::dec;

    const QUICK: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn transient_mail_failure_is_retried() {
        let h = Harness::new();
        let payee = seed_user(&h.store, "pat@example.com", true).await;
        let req = seed_requests(&h.store, &payee, &[dec!(5)]).await.remove(0);
        h.mailer.failures_left.store(2, Ordering::SeqCst);

        let task = Task::SendPaymentDoneEmail {
            id: req.id,
            method: PaymentMethod::Offline,
        };
        run_with_retry(&h.state, task, QUICK, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let h = Harness::new();
        let payee = seed_user(&h.store, "pat@example.com", true).await;
        let req = seed_requests(&h.store, &payee, &[dec!(5)]).await.remove(0);
        h.mailer.failures_left.store(100, Ordering::SeqCst);

        let task = Task::SendPaymentDoneEmail {
            id: req.id,
            method: PaymentMethod::Provider,
        };
        let err = run_with_retry(&h.state, task, QUICK, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExternalService(_)));
        assert_eq!(
            h.mailer.failures_left.load(Ordering::SeqCst),
            100 - MAX_TASK_ATTEMPTS as usize
        );
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_record_is_not_retried() {
        let h = Harness::new();
        let task = Task::SendPaymentDoneEmail {
            id: Uuid::new_v4(),
            method: PaymentMethod::Offline,
        };
        let slow = Duration::from_secs(60);
        let err = run_with_retry(&h.state, task, slow, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn retried_batch_sends_only_what_is_missing() {
        let h = Harness::new();
        let payee = seed_user(&h.store, "pat@example.com", true).await;
        let reqs = seed_requests(&h.store, &payee, &[dec!(1), dec!(2)]).await;
        h.mailer.failures_left.store(1, Ordering::SeqCst);

        let task = Task::SendPayRequestEmails(vec![reqs[0].id, reqs[1].id]);
        run_with_retry(&h.state, task, QUICK, &CancellationToken::new())
            .await
            .unwrap();
        let to: Vec<String> = h.mailer.sent().into_iter().flat_map(|m| m.to).collect();
        assert_eq!(to, vec!["payer1@example.com", "payer0@example.com"]);
    }

    #[tokio::test]
    async fn paid_mail_survives_a_relay_hiccup() {
        let h = Harness::new();
        let payee = seed_user(&h.store, "pat@example.com", true).await;
        let req = seed_requests(&h.store, &payee, &[dec!(10)]).await.remove(0);
        let raw = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("status", "COMPLETED")
            .append_pair("transaction[0].receiver", "pat@example.com")
            .append_pair("transaction[0].amount", "USD 10.00")
            .finish();

        let outcome = handle_payment_notification(&h.state, &req.id.to_string(), &raw)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);
        h.mailer.failures_left.store(1, Ordering::SeqCst);

        let results = h.drain_tasks().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "You've been paid by payer0@example.com");
    }

    #[tokio::test]
    async fn worker_runs_queued_tasks_until_cancelled() {
        let h = Harness::new();
        let payee = seed_user(&h.store, "pat@example.com", true).await;
        let req = seed_requests(&h.store, &payee, &[dec!(5)]).await.remove(0);
        let (queue, rx) = ChannelQueue::new();
        let cancel = CancellationToken::new();
        let worker = start(h.state.clone(), rx, cancel.clone());

        queue
            .enqueue(Task::SendPaymentDoneEmail {
                id: req.id,
                method: PaymentMethod::Offline,
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.mailer.sent().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        worker.await.unwrap();
    }
}
