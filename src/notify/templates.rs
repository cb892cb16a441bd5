use rust_decimal::Decimal;
use serde::Serialize;
use tera::{Context, Tera};
use time::{macros::format_description, OffsetDateTime};

use crate::error::AppResult;

pub const PAY_REQUEST: &str = "pay_request.txt";
pub const GOT_PAID: &str = "got_paid.txt";
pub const MARKED_AS_PAID: &str = "marked_as_paid.txt";
pub const VERIFY_EMAIL: &str = "verify_email.txt";
pub const RESET_PASSWORD: &str = "reset_password.txt";

const SOURCES: [(&str, &str); 5] = [
    (PAY_REQUEST, include_str!("../../templates/pay_request.txt")),
    (GOT_PAID, include_str!("../../templates/got_paid.txt")),
    (MARKED_AS_PAID, include_str!("../../templates/marked_as_paid.txt")),
    (VERIFY_EMAIL, include_str!("../../templates/verify_email.txt")),
    (RESET_PASSWORD, include_str!("../../templates/reset_password.txt")),
];

/// Plain-text email bodies, parsed once at startup.
pub struct EmailTemplates {
    tera: Tera,
}

impl EmailTemplates {
    pub fn new() -> AppResult<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(SOURCES.to_vec())?;
        Ok(Self { tera })
    }

    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> AppResult<String> {
        let ctx = Context::from_serialize(data)?;
        Ok(self.tera.render(name, &ctx)?)
    }
}

pub fn render_amount(amount: Decimal) -> String {
    format!("${:.2}", amount)
}

/// "Jan 2" style date used in emails and status lines.
pub fn render_date(t: OffsetDateTime) -> String {
    t.format(format_description!("[month repr:short] [day padding:none]"))
        .unwrap_or_else(|_| t.date().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn renders_amounts_with_two_decimals() {
        assert_eq!(render_amount(dec!(25)), "$25.00");
        assert_eq!(render_amount(dec!(3.5)), "$3.50");
    }

    #[test]
    fn renders_short_dates() {
        assert_eq!(render_date(datetime!(2024-01-02 15:04:05 UTC)), "Jan 2");
    }

    #[test]
    fn pay_request_mentions_reminder_only_when_reminding() {
        let t = EmailTemplates::new().expect("templates parse");
        let mut data = json!({
            "payee_full_name": "Pat Payee",
            "payee_email": "pat@example.com",
            "amount": "$10.00",
            "description": "lunch",
            "pay_url": "http://x/pay",
            "mark_as_paid_url": "http://x/pay/offline",
            "creation_date": "Jan 2",
            "is_reminder": false,
        });
        let first = t.render(PAY_REQUEST, &data).unwrap();
        assert!(first.contains("has requested a payment"));
        assert!(first.contains("For: lunch"));

        data["is_reminder"] = json!(true);
        let again = t.render(PAY_REQUEST, &data).unwrap();
        assert!(again.contains("friendly reminder"));
        assert!(again.contains("Jan 2"));
    }

    #[test]
    fn missing_variable_is_an_error() {
        let t = EmailTemplates::new().unwrap();
        assert!(t.render(VERIFY_EMAIL, &json!({})).is_err());
    }
}
