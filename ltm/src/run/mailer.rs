//! Email delivery, grounded on
//! `original_source/.../testrunmanager.py`'s `__email_report` (SendGrid REST
//! API, any failure logged and swallowed per `spec.md` §7).
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("no sendgrid api key configured")]
    NoApiKey,

    #[error("sendgrid request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sendgrid returned status {0}")]
    BadStatus(reqwest::StatusCode),
}

#[async_trait]
pub trait ReportMailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

pub struct SendgridMailer {
    client: reqwest::Client,
    api_key: String,
    sender: String,
}

impl SendgridMailer {
    pub fn new(api_key: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            sender: sender.into(),
        }
    }
}

#[async_trait]
impl ReportMailer for SendgridMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let payload = serde_json::json!({
            "personalizations": [{ "to": [{ "email": to }] }],
            "from": { "email": self.sender },
            "subject": subject,
            "content": [{ "type": "text/plain", "value": body }],
        });

        let resp = self
            .client
            .post("https://api.sendgrid.com/v3/mail/send")
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(MailError::BadStatus(resp.status()));
        }
        Ok(())
    }
}

/// Sends the report if a recipient and mailer are both configured; any
/// error is logged and swallowed, never propagated.
pub async fn send_report_best_effort(
    mailer: Option<&dyn ReportMailer>,
    to: Option<&str>,
    subject: &str,
    body: &str,
) {
    let (Some(mailer), Some(to)) = (mailer, to) else {
        return;
    };
    if let Err(e) = mailer.send(to, subject, body).await {
        warn!(error = %e, "failed to email report, continuing");
    }
}
