use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    notify::{
        mailer::{HttpMailer, LogMailer, Mailer},
        tasks::{ChannelQueue, Task, TaskQueue},
        templates::EmailTemplates,
    },
    reconcile::provider::{PayPalProvider, PaymentProvider},
    store::{memory::MemoryStore, postgres::PgStore, RecordStore},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub config: Arc<AppConfig>,
    pub provider: Arc<dyn PaymentProvider>,
    pub mailer: Arc<dyn Mailer>,
    pub templates: Arc<EmailTemplates>,
    pub tasks: Arc<dyn TaskQueue>,
}

impl AppState {
    /// Builds the production state. The returned receiver feeds the task worker.
    pub async fn init() -> anyhow::Result<(Self, UnboundedReceiver<Task>)> {
        let config = Arc::new(AppConfig::from_env()?);

        let store: Arc<dyn RecordStore> = match &config.database_url {
            Some(url) => {
                let pg = PgStore::connect(url).await?;
                if let Err(e) = sqlx::migrate!("./migrations").run(pg.pool()).await {
                    warn!(error = %e, "migration failed; continuing");
                }
                Arc::new(pg)
            }
            None => {
                warn!("DATABASE_URL not set; using the in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let mailer: Arc<dyn Mailer> = match &config.mail.relay_url {
            Some(url) => Arc::new(HttpMailer::new(url)),
            None => {
                info!("MAIL_RELAY_URL not set; mail will only be logged");
                Arc::new(LogMailer)
            }
        };

        let provider = Arc::new(PayPalProvider::new(config.paypal.clone())) as Arc<dyn PaymentProvider>;
        let templates = Arc::new(EmailTemplates::new()?);
        let (queue, rx) = ChannelQueue::new();

        Ok((
            Self {
                store,
                config,
                provider,
                mailer,
                templates,
                tasks: Arc::new(queue),
            },
            rx,
        ))
    }

    #[cfg(test)]
    pub fn from_parts(
        store: Arc<dyn RecordStore>,
        config: Arc<AppConfig>,
        provider: Arc<dyn PaymentProvider>,
        mailer: Arc<dyn Mailer>,
        templates: Arc<EmailTemplates>,
        tasks: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            store,
            config,
            provider,
            mailer,
            templates,
            tasks,
        }
    }

    /// Absolute URL for a path on this deployment.
    pub fn url(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            path_and_query
        )
    }
}
