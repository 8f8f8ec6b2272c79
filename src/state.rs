use std::sync::Arc;
use std::time::Duration;

use crate::apps::{AppContext, AppManager};
use crate::config::PlatformConfig;
use crate::error::AppResult;
use crate::services::webhooks::DeliveryConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PlatformConfig>,
    pub http_client: reqwest::Client,
    pub manager: Arc<AppManager>,
}

impl AppState {
    pub async fn build(config: PlatformConfig) -> AppResult<AppState> {
        let manager = AppManager::connect(&config).await?;
        Ok(AppState {
            config: Arc::new(config),
            http_client: reqwest::Client::new(),
            manager: Arc::new(manager),
        })
    }

    /// Webhook delivery settings for one app: shared HTTP client, the
    /// app's signing secret, and the configured per-call timeout.
    pub fn delivery_config(&self, app: &AppContext) -> DeliveryConfig {
        DeliveryConfig {
            client: self.http_client.clone(),
            signing_secret: app.jwt_secret.clone(),
            timeout: Duration::from_secs(self.config.webhook_timeout_seconds),
        }
    }
}
