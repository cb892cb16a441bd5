use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::PayPalConfig,
    error::{AppError, AppResult},
};

/// What the payer is about to pay, and where the provider should call back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayOrder {
    pub request_code: Uuid,
    pub receiver_email: String,
    pub amount: Decimal,
    pub description: String,
    pub return_url: String,
    pub cancel_url: String,
    pub notify_url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Round-trips a raw notification body back to the provider. Anything other
    /// than an explicit confirmation is an error.
    async fn confirm_notification(&self, raw_body: &str) -> AppResult<()>;

    /// Registers a payment and returns the provider's pay key.
    async fn create_pay_key(&self, order: &PayOrder) -> AppResult<String>;

    /// Checkout page the payer is redirected to.
    fn pay_url(&self, pay_key: &str) -> String;
}

/// PayPal Adaptive Payments, name-value wire format.
#[derive(Clone)]
pub struct PayPalProvider {
    client: Client,
    config: PayPalConfig,
}

impl PayPalProvider {
    pub fn new(config: PayPalConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// An Adaptive Payments API call, carrying the account credentials.
    fn api_request(&self, url: &str, body: String) -> RequestBuilder {
        self.client
            .post(url)
            .header("X-PAYPAL-SECURITY-USERID", &self.config.user_id)
            .header("X-PAYPAL-SECURITY-PASSWORD", &self.config.password)
            .header("X-PAYPAL-SECURITY-SIGNATURE", &self.config.signature)
            .header("X-PAYPAL-REQUEST-DATA-FORMAT", "NV")
            .header("X-PAYPAL-RESPONSE-DATA-FORMAT", "NV")
            .header("X-PAYPAL-APPLICATION-ID", &self.config.app_id)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
    }

    /// Notification validation is a bare form post; no credentials go along.
    fn validation_request(&self, raw_body: &str) -> RequestBuilder {
        self.client
            .post(&self.config.validate_ipn_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(format!("cmd=_notify-validate&{raw_body}"))
    }
}

async fn send_form(req: RequestBuilder) -> AppResult<String> {
    let resp = req.send().await?;
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(AppError::ExternalService(format!(
            "provider returned {status}: {text}"
        )));
    }
    Ok(text)
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    async fn confirm_notification(&self, raw_body: &str) -> AppResult<()> {
        let answer = send_form(self.validation_request(raw_body)).await?;
        if answer.trim() != "VERIFIED" {
            warn!(answer = %answer.trim(), "notification not confirmed by provider");
            return Err(AppError::ExternalService(format!(
                "notification not confirmed: {}",
                answer.trim()
            )));
        }
        Ok(())
    }

    async fn create_pay_key(&self, order: &PayOrder) -> AppResult<String> {
        let amount = format!("{:.2}", order.amount);
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("requestEnvelope.errorLanguage", "en_US")
            .append_pair("actionType", "PAY")
            .append_pair("receiverList.receiver(0).email", &order.receiver_email)
            .append_pair("receiverList.receiver(0).amount", &amount)
            .append_pair("receiverList.receiver(0).paymentType", "PERSONAL")
            .append_pair("currencyCode", "USD")
            .append_pair("feesPayer", "SENDER")
            .append_pair("memo", &order.description)
            .append_pair("cancelUrl", &order.cancel_url)
            .append_pair("returnUrl", &order.return_url)
            .append_pair("ipnNotificationUrl", &order.notify_url)
            .finish();

        let answer = send_form(self.api_request(&self.config.pay_endpoint, body)).await?;
        let pay_key = parse_pay_response(&answer)?;
        debug!(request_code = %order.request_code, %pay_key, "pay key issued");
        Ok(pay_key)
    }

    fn pay_url(&self, pay_key: &str) -> String {
        format!("{}&paykey={}", self.config.pay_base_url, pay_key)
    }
}

fn parse_pay_response(answer: &str) -> AppResult<String> {
    let mut ack = None;
    let mut pay_key = None;
    for (k, v) in url::form_urlencoded::parse(answer.as_bytes()) {
        match k.as_ref() {
            "responseEnvelope.ack" => ack = Some(v.into_owned()),
            "payKey" => pay_key = Some(v.into_owned()),
            _ => {}
        }
    }
    match (ack.as_deref(), pay_key) {
        (Some("Success"), Some(key)) if !key.is_empty() => Ok(key),
        (ack, _) => Err(AppError::ExternalService(format!(
            "pay request not acknowledged: {}",
            ack.unwrap_or("no ack")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pay_response_needs_success_ack_and_key() {
        let ok = "responseEnvelope.ack=Success&responseEnvelope.build=1&payKey=AP-123";
        assert_eq!(parse_pay_response(ok).unwrap(), "AP-123");

        let failed = "responseEnvelope.ack=Failure&error(0).message=bad";
        let err = parse_pay_response(failed).unwrap_err();
        assert!(err.to_string().contains("Failure"));

        assert!(parse_pay_response("responseEnvelope.ack=Success").is_err());
    }

    #[test]
    fn only_api_calls_carry_credentials() {
        let provider = PayPalProvider::new(crate::testing::test_config().paypal);

        let validate = provider.validation_request("status=COMPLETED").build().unwrap();
        assert_eq!(validate.url().as_str(), "http://paypal.test/ipn");
        assert!(validate
            .headers()
            .keys()
            .all(|name| !name.as_str().starts_with("x-paypal")));
        let body = validate.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, b"cmd=_notify-validate&status=COMPLETED");

        let pay = provider
            .api_request("http://paypal.test/pay", "actionType=PAY".into())
            .build()
            .unwrap();
        assert_eq!(pay.headers()["X-PAYPAL-SECURITY-USERID"], "u");
        assert_eq!(pay.headers()["X-PAYPAL-APPLICATION-ID"], "a");
    }
}
