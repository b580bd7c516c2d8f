use serde::{Deserialize, Serialize};

/// Name/address pair used for sender, recipient and carbon copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EmailAddress {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl EmailAddress {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Mailbox form accepted by mail relays: `Name <address>`, or the bare
    /// address when no display name was given.
    pub fn mailbox(&self) -> String {
        if self.name.trim().is_empty() {
            self.email.clone()
        } else {
            format!("{} <{}>", self.name, self.email)
        }
    }
}

/// A single templated email, already rendered by the caller.
///
/// Messages are immutable once enqueued: the worker re-reads them from the
/// persisted job payload on every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    #[serde(default)]
    pub from: EmailAddress,
    #[serde(default)]
    pub to: EmailAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<EmailAddress>,
    #[serde(default)]
    pub subject: String,
    /// HTML body. Accepts `html` on input for compatibility with older clients.
    #[serde(default, alias = "html")]
    pub body: String,
}

/// Payload persisted with every batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJobData {
    pub batch_id: String,
    #[serde(alias = "messages")]
    pub emails: Vec<EmailMessage>,
}
