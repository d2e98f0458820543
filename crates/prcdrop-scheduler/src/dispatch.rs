//! Notification dispatch — the concrete [`Notifier`]s.
//! Supports: SMTP email (subscriber alerts), HTTP webhook (operator
//! escalation), and a log-only notifier for dry runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use prcdrop_core::PrcDropConfig;
use prcdrop_core::config::EmailConfig;
use prcdrop_core::error::NotifyError;
use prcdrop_core::traits::Notifier;

/// Sends mail through an SMTP relay.
#[derive(Debug)]
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    /// Port 465 uses implicit TLS; anything else STARTTLS.
    pub fn from_config(config: &EmailConfig) -> Result<Self, NotifyError> {
        let from = match &config.display_name {
            Some(name) => format!("{name} <{}>", config.sender_email),
            None => config.sender_email.clone(),
        };
        let from: Mailbox = from
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))?;

        let builder = if config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| NotifyError::Config(e.to_string()))?;

        let transport = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.sender_email.clone(),
                config.sender_password.clone(),
            ))
            .timeout(Some(Duration::from_secs(30)))
            .build();

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<(), NotifyError> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e: lettre::address::AddressError| NotifyError::Config(e.to_string()))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        tracing::info!(channel = "email", subject, recipient, "✅ Email sent");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}

/// POSTs `{subject, body, recipient, timestamp}` as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "subject": subject,
                "body": body,
                "recipient": recipient,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| NotifyError::Http(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent to {}: {subject}", self.url);
            Ok(())
        } else {
            Err(NotifyError::Http(format!("Webhook error {}", resp.status())))
        }
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

/// Logs instead of sending. Used for `--dry-run` and when SMTP is not configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str, recipient: &str) -> Result<(), NotifyError> {
        tracing::info!("📝 [dry-run] to={recipient} subject={subject:?} body={body:?}");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}

/// Subscriber-facing notifier from config: SMTP when fully configured,
/// otherwise (or when `dry_run`) the log notifier.
pub fn notifier_from_config(
    config: &PrcDropConfig,
    dry_run: bool,
) -> Result<Arc<dyn Notifier>, NotifyError> {
    if dry_run {
        tracing::info!("📝 Dry run: notifications will only be logged");
        return Ok(Arc::new(LogNotifier));
    }
    if !config.email.is_valid() {
        tracing::warn!("⚠️ Email configuration incomplete; notifications will only be logged");
        return Ok(Arc::new(LogNotifier));
    }
    Ok(Arc::new(EmailNotifier::from_config(&config.email)?))
}

/// Operator escalation channel, if one is configured.
pub fn operator_notifier_from_config(config: &PrcDropConfig) -> Option<Arc<dyn Notifier>> {
    config
        .notify
        .operator_webhook
        .as_deref()
        .filter(|url| !url.is_empty())
        .map(|url| Arc::new(WebhookNotifier::new(url)) as Arc<dyn Notifier>)
}
