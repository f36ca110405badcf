// HTTP delivery transports for notification channels

use super::format;
use super::{keys, ChannelTransport, Notification, ResolvedChannel};
use crate::utils::error::{MonitorError, Result};
use crate::utils::logging::redact_url;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::debug;

/// Send and check the status. Transport errors drop the request URL, which
/// may itself be a secret.
async fn send(channel: &ResolvedChannel, request: reqwest::RequestBuilder) -> Result<()> {
    let response = request.send().await.map_err(|e| {
        MonitorError::channel_delivery(channel.name.clone(), e.without_url().to_string())
    })?;
    ensure_success(channel, response).await
}

async fn ensure_success(channel: &ResolvedChannel, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(MonitorError::channel_delivery(
        channel.name.clone(),
        format!("HTTP request failed with status {}: {}", status, snippet),
    ))
}

/// Email through an HTTP mail relay
pub struct EmailTransport {
    client: reqwest::Client,
    from: String,
}

impl EmailTransport {
    pub fn new(client: reqwest::Client, from: String) -> Self {
        Self { client, from }
    }
}

#[async_trait::async_trait]
impl ChannelTransport for EmailTransport {
    async fn deliver(&self, channel: &ResolvedChannel, notification: &Notification) -> Result<()> {
        let relay_url = channel.require_setting(keys::RELAY_URL)?;
        let recipients = channel.list_setting(keys::RECIPIENTS);
        if recipients.is_empty() {
            return Err(MonitorError::channel_delivery(
                channel.name.clone(),
                "no recipients configured".to_string(),
            ));
        }

        let payload = json!({
            "from": self.from,
            "to": recipients,
            "subject": format::email_subject(notification),
            "html": format::email_html(notification),
            "text": format::email_text(notification),
        });

        let mut request = self.client.post(relay_url).json(&payload);
        if let Some(key) = channel.secret(keys::API_KEY) {
            request = request.bearer_auth(key.expose_secret());
        }
        send(channel, request).await?;

        debug!(
            channel = %channel.name,
            relay = %redact_url(relay_url),
            recipients = recipients.len(),
            "Email notification sent"
        );
        Ok(())
    }
}

/// Chat incoming-webhook with a card payload
pub struct ChatTransport {
    client: reqwest::Client,
}

impl ChatTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ChannelTransport for ChatTransport {
    async fn deliver(&self, channel: &ResolvedChannel, notification: &Notification) -> Result<()> {
        let webhook_url = channel.require_secret(keys::WEBHOOK_URL)?;
        let request = self
            .client
            .post(webhook_url.expose_secret())
            .json(&format::chat_card(notification));
        send(channel, request).await?;

        debug!(channel = %channel.name, "Chat notification sent");
        Ok(())
    }
}

/// Raw JSON POST to an arbitrary endpoint
pub struct WebhookTransport {
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ChannelTransport for WebhookTransport {
    async fn deliver(&self, channel: &ResolvedChannel, notification: &Notification) -> Result<()> {
        let url = channel.require_setting(keys::URL)?;
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&format::webhook_payload(notification));
        if let Some(token) = channel.secret(keys::AUTH_TOKEN) {
            request = request.bearer_auth(token.expose_secret());
        }
        send(channel, request).await?;

        debug!(channel = %channel.name, endpoint = %redact_url(url), "Webhook notification sent");
        Ok(())
    }
}

/// Short text message through an HTTP SMS provider
pub struct SmsTransport {
    client: reqwest::Client,
}

impl SmsTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ChannelTransport for SmsTransport {
    async fn deliver(&self, channel: &ResolvedChannel, notification: &Notification) -> Result<()> {
        let api_url = channel.require_setting(keys::API_URL)?;
        let to = channel.list_setting(keys::TO);
        if to.is_empty() {
            return Err(MonitorError::channel_delivery(
                channel.name.clone(),
                "no phone numbers configured".to_string(),
            ));
        }

        let payload = json!({
            "from": channel.setting(keys::FROM),
            "to": to,
            "body": format::sms_text(notification),
        });
        let mut request = self.client.post(api_url).json(&payload);
        if let Some(key) = channel.secret(keys::API_KEY) {
            request = request.bearer_auth(key.expose_secret());
        }
        send(channel, request).await?;

        debug!(channel = %channel.name, recipients = to.len(), "SMS notification sent");
        Ok(())
    }
}
