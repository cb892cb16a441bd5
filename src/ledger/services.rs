use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::dto::NewPayRequest;
use super::updater::{apply_batch, retry_on_conflict};
use crate::{
    auth::{services::parse_email, session::Session},
    error::{AppError, AppResult},
    notify::tasks::{enqueue_pay_request_emails, PaymentMethod, Task},
    reconcile::provider::PayOrder,
    state::AppState,
    store::{PayRequest, PayRequestQuery, PaymentCategory},
};

pub const MAX_RECENT: usize = 20;
/// Largest accepted create batch.
pub const MAX_BATCH: usize = 49;
/// Largest amount a stored request holds: twelve digits, two of them cents.
// 9_999_999_999.99 (mantissa 999_999_999_999 = 0xE8_D4A5_0FFF, scale 2); `Decimal::new` is not const.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0xD4A5_0FFF, 0xE8, 0, false, 2);

/// Parses a positive dollar amount with at most two decimals ("$25", "9.99").
pub fn parse_amount(raw: &str) -> AppResult<Decimal> {
    let trimmed = raw.trim().trim_start_matches('$');
    let mut amount: Decimal = trimmed
        .parse()
        .map_err(|_| AppError::Validation(format!("Invalid amount: {raw:?}")))?;
    if amount <= Decimal::ZERO {
        return Err(AppError::Validation(format!("Amount must be positive: {raw:?}")));
    }
    if amount > MAX_AMOUNT {
        return Err(AppError::Validation(format!("Amount is too large: {raw:?}")));
    }
    if amount.normalize().scale() > 2 {
        return Err(AppError::Validation(format!(
            "Amount has more than two decimals: {raw:?}"
        )));
    }
    amount.rescale(2);
    Ok(amount)
}

fn parse_category(raw: &str) -> AppResult<PaymentCategory> {
    raw.trim().to_lowercase().parse().map_err(AppError::Validation)
}

#[instrument(skip(state, items), fields(user_id = %session.user_id, count = items.len()))]
pub async fn create_pay_requests(
    state: &AppState,
    session: &Session,
    items: &[NewPayRequest],
) -> AppResult<Vec<Uuid>> {
    if items.is_empty() {
        return Err(AppError::Validation("No payment requests given".into()));
    }
    if items.len() > MAX_BATCH {
        return Err(AppError::Validation(format!(
            "Too many payment requests; at most {MAX_BATCH} at a time"
        )));
    }

    let payee = state.store.get_user(session.user_id).await?;
    // every request in the batch shares one creation time
    let created_at = OffsetDateTime::now_utc();
    let mut reqs = Vec::with_capacity(items.len());
    for item in items {
        reqs.push(PayRequest::new(
            &payee,
            parse_email(&item.payer_email)?,
            parse_amount(&item.amount)?,
            parse_category(&item.category)?,
            item.description.trim().to_string(),
            created_at,
        ));
    }

    let batch = &reqs;
    retry_on_conflict("create pay requests", || async move {
        let mut tx = state.store.begin().await?;
        for req in batch {
            tx.insert_pay_request(req).await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await?;

    let ids: Vec<Uuid> = reqs.iter().map(|r| r.id).collect();
    info!(count = ids.len(), "payment requests created");
    if payee.email_ok {
        enqueue_pay_request_emails(state.tasks.as_ref(), ids.clone()).await?;
    }
    Ok(ids)
}

#[instrument(skip(state, ids), fields(user_id = %session.user_id))]
pub async fn mark_paid(
    state: &AppState,
    session: &Session,
    ids: &[Uuid],
    undo: bool,
) -> AppResult<Vec<Uuid>> {
    let now = OffsetDateTime::now_utc();
    let mutation = move |_: Uuid, req: &mut PayRequest| -> AppResult<bool> {
        Ok(if undo { req.mark_unpaid() } else { req.mark_paid(now) })
    };
    apply_batch(state.store.as_ref(), ids, Some(&session.email), &mutation).await
}

#[instrument(skip(state, ids), fields(user_id = %session.user_id))]
pub async fn soft_delete(
    state: &AppState,
    session: &Session,
    ids: &[Uuid],
    undo: bool,
) -> AppResult<Vec<Uuid>> {
    let now = OffsetDateTime::now_utc();
    let mutation = move |_: Uuid, req: &mut PayRequest| -> AppResult<bool> {
        Ok(if undo { req.restore() } else { req.mark_deleted(now) })
    };
    apply_batch(state.store.as_ref(), ids, Some(&session.email), &mutation).await
}

/// Queues (re)sending request emails. The cooldown is enforced when the task
/// runs, inside the transaction that stamps the send.
#[instrument(skip(state, ids), fields(user_id = %session.user_id))]
pub async fn send_reminders(state: &AppState, session: &Session, ids: Vec<Uuid>) -> AppResult<()> {
    if ids.is_empty() {
        return Err(AppError::Validation("No payment requests given".into()));
    }
    for id in &ids {
        let req = state.store.get_pay_request(*id).await?;
        if req.owner_id != session.user_id {
            return Err(AppError::Authorization(
                "Payment request belongs to another user".into(),
            ));
        }
    }
    enqueue_pay_request_emails(state.tasks.as_ref(), ids).await
}

/// Unpaid first, then paid, newest first within each, at most [`MAX_RECENT`].
pub async fn list_recent(state: &AppState, session: &Session) -> AppResult<Vec<PayRequest>> {
    let unpaid = PayRequestQuery::active(Some(session.user_id), false).newest_first(MAX_RECENT);
    let mut reqs = state.store.query_pay_requests(&unpaid).await?;
    if reqs.len() < MAX_RECENT {
        let paid = PayRequestQuery::active(Some(session.user_id), true)
            .newest_first(MAX_RECENT - reqs.len());
        reqs.extend(state.store.query_pay_requests(&paid).await?);
    }
    Ok(reqs)
}

pub fn parse_request_code(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::Validation(format!("Invalid request code: {raw:?}")))
}

/// Payer says they paid outside the provider.
#[instrument(skip(state))]
pub async fn pay_offline(state: &AppState, id: Uuid) -> AppResult<()> {
    let now = OffsetDateTime::now_utc();
    let mutation = move |_: Uuid, req: &mut PayRequest| -> AppResult<bool> {
        if !req.is_active() {
            return Err(AppError::NotFound("Payment request not found".into()));
        }
        Ok(req.mark_paid(now))
    };
    let changed = apply_batch(state.store.as_ref(), &[id], None, &mutation).await?;
    if changed.is_empty() {
        warn!(%id, "offline payment for a request that is already paid");
        return Err(AppError::Conflict("Already paid".into()));
    }
    info!(%id, "marked as paid by payer");
    state
        .tasks
        .enqueue(Task::SendPaymentDoneEmail {
            id,
            method: PaymentMethod::Offline,
        })
        .await
}

/// Asks the provider for a pay key and returns the checkout URL. Pay keys
/// expire, so one is requested each time the payer arrives.
#[instrument(skip(state))]
pub async fn start_provider_payment(state: &AppState, id: Uuid) -> AppResult<String> {
    let req = state.store.get_pay_request(id).await?;
    if !req.is_active() {
        return Err(AppError::NotFound("Payment request not found".into()));
    }
    if req.paid {
        return Err(AppError::Conflict("Already paid".into()));
    }
    let payee = state.store.get_user(req.owner_id).await?;

    let order = PayOrder {
        request_code: id,
        receiver_email: payee.payout_email,
        amount: req.amount,
        description: req.description,
        return_url: state.url(&format!("/pay/done?reqCode={id}")),
        cancel_url: state.url(&format!("/pay?reqCode={id}")),
        notify_url: state.url(&format!("/api/v1/ipn?reqCode={id}")),
    };
    let pay_key = state.provider.create_pay_key(&order).await?;
    Ok(state.provider.pay_url(&pay_key))
}
