//! Request and reminder emails, stamped in the same transaction that decides
//! whether they may be sent.

use std::collections::{hash_map::Entry, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::{
    mailer::OutgoingMail,
    tasks::PaymentMethod,
    templates::{self, render_amount, render_date},
};
use crate::{
    error::{AppError, AppResult},
    ledger::updater::{apply_batch, Mutation},
    state::AppState,
    store::{is_sentinel, PayRequest, User},
};

/// Minimum gap between two emails about the same request.
pub const PAY_REQUEST_EMAIL_COOLDOWN: Duration = Duration::days(1);
/// How often the sweep re-sends unpaid requests on its own.
pub const AUTO_REMINDER_FREQUENCY: Duration = Duration::days(7);

pub fn is_eligible(req: &PayRequest, now: OffsetDateTime, cooldown: Duration) -> bool {
    !req.paid && req.is_active() && !(now - req.reminder_sent_at < cooldown)
}

/// A request that was emailed before gets the reminder wording.
pub fn is_reminder(req: &PayRequest) -> bool {
    !is_sentinel(req.reminder_sent_at)
}

#[derive(Serialize)]
struct PayRequestEmail<'a> {
    is_reminder: bool,
    payee_full_name: &'a str,
    payee_email: &'a str,
    creation_date: String,
    amount: String,
    description: &'a str,
    pay_url: String,
    mark_as_paid_url: String,
}

#[derive(Serialize)]
struct PaymentDoneEmail<'a> {
    payee_full_name: &'a str,
    payer_email: &'a str,
    amount: String,
    description: &'a str,
    payments_url: String,
}

/// Sends the request email for one record if it is eligible, then stamps it.
struct SendPayRequestEmail<'a> {
    state: &'a AppState,
    payee: &'a User,
    now: OffsetDateTime,
}

#[async_trait]
impl<'a> Mutation for SendPayRequestEmail<'a> {
    async fn apply(&self, id: Uuid, req: &mut PayRequest) -> AppResult<bool> {
        if !is_eligible(req, self.now, PAY_REQUEST_EMAIL_COOLDOWN) {
            info!(%id, "not eligible for a request email; skipping");
            return Ok(false);
        }
        let reminder = is_reminder(req);
        let body = self.state.templates.render(
            templates::PAY_REQUEST,
            &PayRequestEmail {
                is_reminder: reminder,
                payee_full_name: &self.payee.full_name,
                payee_email: &self.payee.email,
                creation_date: render_date(req.created_at),
                amount: render_amount(req.amount),
                description: &req.description,
                pay_url: self.state.url(&format!("/api/v1/pay/provider?reqCode={id}")),
                mark_as_paid_url: self.state.url(&format!("/api/v1/pay/offline?reqCode={id}")),
            },
        )?;
        let subject = if reminder {
            format!("Reminder of payment request from {}", self.payee.full_name)
        } else {
            format!("Payment request from {}", self.payee.full_name)
        };
        self.state
            .mailer
            .send(&OutgoingMail {
                sender: self.state.config.mail.sender.clone(),
                to: vec![req.payer_email.clone()],
                cc: vec![self.payee.email.clone()],
                subject,
                body,
            })
            .await?;
        req.reminder_sent_at = self.now;
        Ok(true)
    }
}

/// Emails every eligible request in `ids`, each in its own transaction. One
/// failure does not stop the rest; the first error is returned at the end.
#[instrument(skip(state, ids), fields(count = ids.len()))]
pub async fn send_pay_request_emails(state: &AppState, ids: &[Uuid]) -> AppResult<()> {
    let mut payees: HashMap<Uuid, User> = HashMap::new();
    let mut first_err: Option<AppError> = None;

    for &id in ids {
        if let Err(e) = send_one(state, &mut payees, id).await {
            error!(%id, error = %e, "pay request email failed");
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn send_one(state: &AppState, payees: &mut HashMap<Uuid, User>, id: Uuid) -> AppResult<()> {
    let owner_id = state.store.get_pay_request(id).await?.owner_id;
    let payee = match payees.entry(owner_id) {
        Entry::Occupied(e) => e.into_mut(),
        Entry::Vacant(e) => e.insert(state.store.get_user(owner_id).await?),
    };
    let payee: &User = payee;
    if !payee.email_ok {
        info!(%id, payee = %payee.email, "payee email not verified; not sending");
        return Ok(());
    }

    let mutation = SendPayRequestEmail {
        state,
        payee,
        now: OffsetDateTime::now_utc(),
    };
    let changed = apply_batch(state.store.as_ref(), &[id], None, &mutation).await?;
    if !changed.is_empty() {
        info!(%id, "pay request email sent");
    }
    Ok(())
}

/// Tells the payee a request was paid, through the provider or by the payer's
/// own account.
#[instrument(skip(state))]
pub async fn send_payment_done_email(
    state: &AppState,
    id: Uuid,
    method: PaymentMethod,
) -> AppResult<()> {
    let req = state.store.get_pay_request(id).await?;
    let payee = state.store.get_user(req.owner_id).await?;

    let (template, subject) = match method {
        PaymentMethod::Provider => (
            templates::GOT_PAID,
            format!("You've been paid by {}", req.payer_email),
        ),
        PaymentMethod::Offline => (
            templates::MARKED_AS_PAID,
            format!("Your payment request was marked as paid by {}", req.payer_email),
        ),
    };
    let body = state.templates.render(
        template,
        &PaymentDoneEmail {
            payee_full_name: &payee.full_name,
            payer_email: &req.payer_email,
            amount: render_amount(req.amount),
            description: &req.description,
            payments_url: state.url("/payments"),
        },
    )?;
    state
        .mailer
        .send(&OutgoingMail {
            sender: state.config.mail.sender.clone(),
            to: vec![payee.email.clone()],
            cc: Vec::new(),
            subject,
            body,
        })
        .await?;
    info!(%id, %method, "payment done email sent");
    Ok(())
}
