//! Outbound password-reset webhook.
//!
//! The service never sends email itself. When a reset is requested it POSTs
//! the account id and the signed reset token to the application's configured
//! endpoint, which owns delivery.

use reqwest::Url;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ServiceError};

pub struct ResetWebhook {
    client: reqwest::Client,
    url: Option<Url>,
}

impl ResetWebhook {
    /// Build the webhook client. `url` of `None` disables delivery (the
    /// token is logged instead, which is what development setups want).
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Backend`] when the HTTP client cannot be
    /// constructed.
    pub fn new(url: Option<Url>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| {
                ServiceError::Backend(anyhow::anyhow!("failed to build webhook client: {err}"))
            })?;
        Ok(Self { client, url })
    }

    /// Deliver a reset token for an account.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::WebhookFailed`] on connection failure or any
    /// non-2xx response.
    pub async fn deliver(&self, account_id: i64, token: &str) -> Result<()> {
        let Some(url) = &self.url else {
            info!(account_id, "password reset requested (no webhook configured)");
            return Ok(());
        };

        let response = self
            .client
            .post(url.clone())
            .form(&[
                ("account_id", account_id.to_string()),
                ("token", token.to_string()),
            ])
            .send()
            .await
            .map_err(|err| ServiceError::WebhookFailed(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::WebhookFailed(format!(
                "reset webhook returned {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_webhook_is_a_noop() -> Result<()> {
        let webhook = ResetWebhook::new(None)?;
        webhook.deliver(42, "token").await
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_webhook_failed() -> Result<()> {
        // Port 9 (discard) on localhost is not listening in test environments.
        let url = Url::parse("http://127.0.0.1:9/reset").expect("valid url");
        let webhook = ResetWebhook::new(Some(url))?;
        let result = webhook.deliver(42, "token").await;
        assert!(matches!(result, Err(ServiceError::WebhookFailed(_))));
        Ok(())
    }
}
