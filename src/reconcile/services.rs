use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    ledger::{services::parse_request_code, updater::retry_on_conflict},
    notify::tasks::{PaymentMethod, Task},
    state::AppState,
    store::{PayRequest, User},
};

pub const STATUS_COMPLETED: &str = "COMPLETED";

/// The fields of a provider notification that reconciliation looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub status: String,
    pub payer_email: String,
    pub payee_email: String,
    pub amount: Decimal,
    pub pay_key: String,
}

impl PaymentNotification {
    /// Parses a form-encoded notification body. Only USD amounts are accepted.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let mut status = None;
        let mut payer_email = None;
        let mut payee_email = None;
        let mut amount = None;
        let mut pay_key = None;
        for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
            match k.as_ref() {
                "status" => status = Some(v.into_owned()),
                "sender_email" => payer_email = Some(v.trim().to_lowercase()),
                "transaction[0].receiver" => payee_email = Some(v.trim().to_lowercase()),
                "transaction[0].amount" => amount = Some(parse_usd(&v)?),
                "pay_key" => pay_key = Some(v.into_owned()),
                _ => {}
            }
        }
        let missing = |field: &str| AppError::Validation(format!("Notification lacks {field}"));
        Ok(Self {
            status: status.ok_or_else(|| missing("status"))?,
            payer_email: payer_email.unwrap_or_default(),
            payee_email: payee_email.ok_or_else(|| missing("receiver"))?,
            amount: amount.ok_or_else(|| missing("amount"))?,
            pay_key: pay_key.unwrap_or_default(),
        })
    }

    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }
}

/// "USD 10.00" -> 10.00
fn parse_usd(raw: &str) -> AppResult<Decimal> {
    let invalid = || AppError::Validation(format!("Invalid notification amount: {raw:?}"));
    let (currency, value) = raw.trim().split_once(' ').ok_or_else(invalid)?;
    if currency != "USD" {
        return Err(AppError::Validation(format!("Unsupported currency: {currency:?}")));
    }
    value.trim().parse::<Decimal>().map_err(|_| invalid())
}

/// What a notification did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not a completion; nothing to do.
    Ignored,
    /// The request moved from unpaid to paid.
    Applied,
    /// The request was already paid; a redelivery.
    Duplicate,
}

fn check_against_record(
    id: Uuid,
    msg: &PaymentNotification,
    req: &PayRequest,
    payee: &User,
) -> AppResult<()> {
    if msg.payee_email != payee.payout_email {
        warn!(%id, got = %msg.payee_email, want = %payee.payout_email, "payee mismatch");
        return Err(AppError::Integrity(format!(
            "Wrong payee: {:?} != {:?}",
            msg.payee_email, payee.payout_email
        )));
    }
    if msg.amount != req.amount {
        warn!(%id, got = %msg.amount, want = %req.amount, "amount mismatch");
        return Err(AppError::Integrity(format!(
            "Wrong amount: {} != {}",
            msg.amount, req.amount
        )));
    }
    Ok(())
}

/// Confirms `raw_body` with the provider and applies it to the request named
/// by `request_code`. Safe to call any number of times for one payment: only
/// the first completed delivery changes the record or enqueues mail.
#[instrument(skip(state, raw_body))]
pub async fn handle_payment_notification(
    state: &AppState,
    request_code: &str,
    raw_body: &str,
) -> AppResult<Outcome> {
    let id = parse_request_code(request_code)?;
    // Nothing in the body is trusted until the provider vouches for it.
    state.provider.confirm_notification(raw_body).await?;
    let msg = PaymentNotification::parse(raw_body)?;
    info!(
        %id,
        status = %msg.status,
        payer = %msg.payer_email,
        pay_key = %msg.pay_key,
        "payment notification"
    );

    if !msg.is_completed() {
        return Ok(Outcome::Ignored);
    }

    let now = OffsetDateTime::now_utc();
    let msg = &msg;
    let changed = retry_on_conflict("payment notification", || async move {
        let mut tx = state.store.begin().await?;
        let mut req = tx.get_pay_request(id).await?;
        let payee = tx.get_user(req.owner_id).await?;
        check_against_record(id, msg, &req, &payee)?;
        if !req.mark_paid(now) {
            return Ok(false);
        }
        tx.put_pay_request(&req).await?;
        tx.commit().await?;
        Ok(true)
    })
    .await?;

    if !changed {
        info!(%id, "duplicate notification; already paid");
        return Ok(Outcome::Duplicate);
    }
    state
        .tasks
        .enqueue(Task::SendPaymentDoneEmail {
            id,
            method: PaymentMethod::Provider,
        })
        .await?;
    Ok(Outcome::Applied)
}
