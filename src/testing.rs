//! Fakes and fixtures shared by the in-module tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, OnceLock,
};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    auth::{password::hash_password, session::Session},
    config::{AppConfig, MailConfig, PayPalConfig, SessionConfig},
    error::{AppError, AppResult},
    notify::{
        mailer::{Mailer, OutgoingMail},
        tasks::{run_with_retry, Task, TaskQueue},
        templates::EmailTemplates,
    },
    reconcile::provider::{PayOrder, PaymentProvider},
    state::AppState,
    store::{memory::MemoryStore, PayRequest, PaymentCategory, RecordStore, User},
};

pub const PASSWORD: &str = "hunter2hunter2";

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: None,
        session: SessionConfig {
            secret: "test-secret".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
        },
        base_url: "http://paydue.test".into(),
        paypal: PayPalConfig {
            user_id: "u".into(),
            password: "p".into(),
            signature: "s".into(),
            app_id: "a".into(),
            pay_endpoint: "http://paypal.test/pay".into(),
            pay_base_url: "http://paypal.test/checkout?cmd=_ap-payment".into(),
            validate_ipn_url: "http://paypal.test/ipn".into(),
        },
        mail: MailConfig {
            relay_url: None,
            sender: "Paydue <noreply@paydue.test>".into(),
        },
        reminder_sweep_interval: Duration::from_secs(3600),
        admin_enabled: true,
    }
}

pub fn user(email: &str, verified: bool) -> User {
    User {
        id: Uuid::new_v4(),
        email: email.into(),
        password_hash: String::new(),
        full_name: "Pat Payee".into(),
        payout_email: email.into(),
        email_ok: verified,
        created_at: OffsetDateTime::now_utc(),
    }
}

/// Hash of [`PASSWORD`], computed once; argon2 is slow in debug builds.
pub fn password_hash() -> String {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password(PASSWORD).unwrap()).clone()
}

pub async fn seed_user(store: &dyn RecordStore, email: &str, verified: bool) -> User {
    let mut u = user(email, verified);
    u.password_hash = password_hash();
    let mut tx = store.begin().await.unwrap();
    tx.insert_user(&u).await.unwrap();
    tx.commit().await.unwrap();
    u
}

pub async fn seed_requests(
    store: &dyn RecordStore,
    owner: &User,
    amounts: &[Decimal],
) -> Vec<PayRequest> {
    let created_at = OffsetDateTime::now_utc();
    let mut tx = store.begin().await.unwrap();
    let mut out = Vec::new();
    for (i, amount) in amounts.iter().enumerate() {
        let req = PayRequest::new(
            owner,
            format!("payer{i}@example.com"),
            *amount,
            PaymentCategory::Goods,
            format!("item {i}"),
            created_at,
        );
        tx.insert_pay_request(&req).await.unwrap();
        out.push(req);
    }
    tx.commit().await.unwrap();
    out
}

pub async fn put_pay_request(store: &dyn RecordStore, req: &PayRequest) {
    let mut tx = store.begin().await.unwrap();
    tx.put_pay_request(req).await.unwrap();
    tx.commit().await.unwrap();
}

pub fn session_for(u: &User) -> Session {
    Session::new(u.id, u.email.clone(), u.full_name.clone())
}

#[derive(Default)]
pub struct FakeProvider {
    pub reject: Mutex<Option<String>>,
    pub confirmed: Mutex<Vec<String>>,
    pub orders: Mutex<Vec<PayOrder>>,
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn confirm_notification(&self, raw_body: &str) -> AppResult<()> {
        if let Some(answer) = self.reject.lock().unwrap().clone() {
            return Err(AppError::ExternalService(format!(
                "notification not confirmed: {answer}"
            )));
        }
        self.confirmed.lock().unwrap().push(raw_body.to_string());
        Ok(())
    }

    async fn create_pay_key(&self, order: &PayOrder) -> AppResult<String> {
        self.orders.lock().unwrap().push(order.clone());
        Ok(format!("AP-{}", order.request_code.simple()))
    }

    fn pay_url(&self, pay_key: &str) -> String {
        format!("http://paypal.test/checkout?paykey={pay_key}")
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<OutgoingMail>>,
    /// Sending to this address fails.
    pub fail_to: Mutex<Option<String>>,
    /// The next this-many sends fail, whoever they go to.
    pub failures_left: AtomicUsize,
    /// Each send sleeps this long first.
    pub delay: Mutex<Option<Duration>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &OutgoingMail) -> AppResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::ExternalService("relay unavailable".into()));
        }
        if let Some(bad) = self.fail_to.lock().unwrap().as_ref() {
            if mail.to.contains(bad) {
                return Err(AppError::ExternalService(format!("relay refused {bad}")));
            }
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    pub tasks: Mutex<Vec<Task>>,
}

impl RecordingQueue {
    pub fn take(&self) -> Vec<Task> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: Task) -> AppResult<()> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

/// An `AppState` over the in-memory store, with handles on every fake.
pub struct Harness {
    pub state: AppState,
    pub store: MemoryStore,
    pub provider: Arc<FakeProvider>,
    pub mailer: Arc<RecordingMailer>,
    pub tasks: Arc<RecordingQueue>,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let provider = Arc::new(FakeProvider::default());
        let mailer = Arc::new(RecordingMailer::default());
        let tasks = Arc::new(RecordingQueue::default());
        let state = AppState::from_parts(
            Arc::new(store.clone()),
            Arc::new(test_config()),
            provider.clone(),
            mailer.clone(),
            Arc::new(EmailTemplates::new().unwrap()),
            tasks.clone(),
        );
        Self {
            state,
            store,
            provider,
            mailer,
            tasks,
        }
    }

    /// Runs every queued task (and anything they enqueue) to completion,
    /// retrying the way the worker does but without the waits.
    pub async fn drain_tasks(&self) -> Vec<AppResult<()>> {
        let mut results = Vec::new();
        loop {
            let batch = self.tasks.take();
            if batch.is_empty() {
                return results;
            }
            for task in batch {
                let cancel = CancellationToken::new();
                let quick = Duration::from_millis(1);
                results.push(run_with_retry(&self.state, task, quick, &cancel).await);
            }
        }
    }
}
