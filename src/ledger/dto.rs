use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::notify::templates::{render_amount, render_date};
use crate::store::{is_sentinel, PayRequest, PaymentCategory};

/// One line of a create request. Amount is text so "$25" and "25.00" both work.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayRequest {
    pub payer_email: String,
    pub amount: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePayRequests {
    pub requests: Vec<NewPayRequest>,
}

#[derive(Debug, Serialize)]
pub struct CreatedPayRequests {
    pub ids: Vec<Uuid>,
}

/// Body of mark-paid, delete and remind.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub undo: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    /// Ids that actually changed; the client offers "undo" for these.
    pub changed: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RequestCode {
    #[serde(rename = "reqCode")]
    pub req_code: String,
}

#[derive(Debug, Serialize)]
pub struct PayRequestView {
    pub id: Uuid,
    pub payer_email: String,
    pub amount: String,
    pub category: PaymentCategory,
    pub description: String,
    pub paid: bool,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PayRequestView {
    pub fn new(req: PayRequest, payee_verified: bool) -> Self {
        let status = if !is_sentinel(req.paid_at) {
            format!("Paid on {}", render_date(req.paid_at))
        } else if !is_sentinel(req.reminder_sent_at) {
            format!("Emailed on {}", render_date(req.reminder_sent_at))
        } else if payee_verified {
            "Pending".to_string()
        } else {
            "Pending verification".to_string()
        };
        Self {
            id: req.id,
            payer_email: req.payer_email,
            amount: render_amount(req.amount),
            category: req.category,
            description: req.description,
            paid: req.paid,
            status,
            created_at: req.created_at,
        }
    }
}
