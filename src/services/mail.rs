use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::config::{MailConfig, MailTransportKind};
use crate::db::EmailMessage;
use crate::error::{AppError, AppResult};

lazy_static::lazy_static! {
    static ref EMAIL_PATTERN: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")
        .expect("email pattern is a valid regex");
}

/// Delivery seam: anything able to hand one message to the outside world.
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn send(&self, message: &EmailMessage) -> AppResult<()>;
}

pub fn is_valid_address(address: &str) -> bool {
    EMAIL_PATTERN.is_match(address)
}

/// Every rule the message violates; empty when it can be sent.
pub fn validate_email(message: &EmailMessage) -> Vec<String> {
    let mut errors = Vec::new();

    if message.from.email.trim().is_empty() {
        errors.push("sender email is required".to_string());
    }
    if message.to.email.trim().is_empty() {
        errors.push("recipient email is required".to_string());
    }
    if message.subject.trim().is_empty() {
        errors.push("subject is required".to_string());
    }
    if message.body.trim().is_empty() {
        errors.push("body is required".to_string());
    }

    if !message.from.email.is_empty() && !is_valid_address(&message.from.email) {
        errors.push("sender email is invalid".to_string());
    }
    if !message.to.email.is_empty() && !is_valid_address(&message.to.email) {
        errors.push("recipient email is invalid".to_string());
    }
    if let Some(cc) = &message.cc {
        if !cc.email.is_empty() && !is_valid_address(&cc.email) {
            errors.push("cc email is invalid".to_string());
        }
    }

    errors
}

/// Envelope posted to the mail relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayMessage {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,
    pub subject: String,
    pub html: String,
}

impl From<&EmailMessage> for RelayMessage {
    fn from(message: &EmailMessage) -> Self {
        Self {
            from: message.from.mailbox(),
            to: message.to.mailbox(),
            cc: message
                .cc
                .as_ref()
                .filter(|cc| !cc.email.is_empty())
                .map(|cc| cc.mailbox()),
            subject: message.subject.clone(),
            html: message.body.clone(),
        }
    }
}

/// Sends through an HTTP mail relay (one POST per message).
#[derive(Clone)]
pub struct HttpMailTransport {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpMailTransport {
    pub fn new(endpoint: String, token: Option<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, message: &EmailMessage) -> AppResult<()> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&RelayMessage::from(message));

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to send message: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Transport(format!(
                "Mail relay error ({}): {}",
                status, error_text
            )));
        }

        Ok(())
    }
}

/// Development transport: records the send in the log stream only.
#[derive(Debug, Clone, Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn send(&self, message: &EmailMessage) -> AppResult<()> {
        tracing::info!(
            to = %message.to.email,
            subject = %message.subject,
            "Mail transport 'log': message accepted"
        );
        Ok(())
    }
}

/// Build the transport selected in configuration.
pub fn build_transport(config: &MailConfig) -> AppResult<std::sync::Arc<dyn MailTransport>> {
    match config.transport {
        MailTransportKind::Http => {
            let endpoint = config
                .api_url
                .clone()
                .ok_or_else(|| AppError::Config("MAIL_API_URL is required".to_string()))?;
            let transport = HttpMailTransport::new(
                endpoint,
                config.api_token.clone(),
                Duration::from_secs(config.timeout_seconds),
            )?;
            Ok(std::sync::Arc::new(transport))
        }
        MailTransportKind::Log => Ok(std::sync::Arc::new(LogMailTransport)),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::message;
    use super::*;
    use crate::db::EmailAddress;

    #[test]
    fn accepts_complete_message() {
        assert!(validate_email(&message("jane@example.com", "Invoice")).is_empty());
    }

    #[test]
    fn reports_every_missing_field() {
        let empty = EmailMessage {
            from: EmailAddress::default(),
            to: EmailAddress::default(),
            cc: None,
            subject: "  ".to_string(),
            body: String::new(),
        };
        let errors = validate_email(&empty);
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("subject")));
    }

    #[test]
    fn rejects_malformed_addresses() {
        let mut msg = message("not-an-address", "Hi");
        msg.cc = Some(EmailAddress::new("Copy", "copy@nowhere"));
        let errors = validate_email(&msg);
        assert_eq!(
            errors,
            vec![
                "recipient email is invalid".to_string(),
                "cc email is invalid".to_string()
            ]
        );
    }

    #[test]
    fn address_pattern() {
        assert!(is_valid_address("a@b.co"));
        assert!(!is_valid_address("a b@c.de"));
        assert!(!is_valid_address("a@b"));
        assert!(!is_valid_address("@b.com"));
    }

    #[test]
    fn relay_envelope_formats_mailboxes() {
        let mut msg = message("jane@example.com", "Invoice");
        msg.cc = Some(EmailAddress::new("", "audit@example.com"));
        let relay = RelayMessage::from(&msg);
        assert_eq!(relay.from, "Billing <billing@example.com>");
        assert_eq!(relay.to, "Customer <jane@example.com>");
        assert_eq!(relay.cc.as_deref(), Some("audit@example.com"));
        assert_eq!(relay.html, "<p>Invoice</p>");
    }

    #[test]
    fn html_field_is_accepted_as_body() {
        let msg: EmailMessage = serde_json::from_value(serde_json::json!({
            "from": { "name": "A", "email": "a@example.com" },
            "to": { "name": "B", "email": "b@example.com" },
            "subject": "Hello",
            "html": "<b>hi</b>"
        }))
        .unwrap();
        assert_eq!(msg.body, "<b>hi</b>");
        assert!(msg.cc.is_none());
    }
}
