use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMail {
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> AppResult<()>;
}

/// Posts each message as JSON to a mail relay.
#[derive(Clone)]
pub struct HttpMailer {
    client: Client,
    relay_url: String,
}

impl HttpMailer {
    pub fn new(relay_url: &str) -> Self {
        Self {
            client: Client::new(),
            relay_url: relay_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, mail: &OutgoingMail) -> AppResult<()> {
        let resp = self.client.post(&self.relay_url).json(mail).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(format!(
                "mail relay returned {status}: {body}"
            )));
        }
        debug!(to = ?mail.to, subject = %mail.subject, "mail relayed");
        Ok(())
    }
}

/// Development mailer: writes messages to the log instead of sending them.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &OutgoingMail) -> AppResult<()> {
        info!(
            to = ?mail.to,
            cc = ?mail.cc,
            subject = %mail.subject,
            body = %mail.body,
            "mail (not sent)"
        );
        Ok(())
    }
}
