//! Delivery of backup outcome messages.
//!
//! Every job produces exactly one [`Notification`]. Delivery problems are
//! logged by the caller and never change the job outcome.

use crate::config::NotifyConfig;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Subject line plus free text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Send and swallow the error; notification failures are never fatal.
pub async fn deliver(notifier: &dyn Notifier, notification: &Notification) {
    if let Err(e) = notifier.send(notification).await {
        error!(subject = %notification.subject, "Failed to deliver notification: {}", e);
    }
}

/// Build the notifier selected by the configuration.
pub fn from_config(config: &NotifyConfig) -> Box<dyn Notifier> {
    match config {
        NotifyConfig::Log => Box::new(LogNotifier),
        NotifyConfig::Sendmail { from, to, program } => Box::new(SendmailNotifier {
            program: program.clone(),
            from: from.clone(),
            to: to.clone(),
        }),
        NotifyConfig::Webhook { url } => Box::new(WebhookNotifier::new(url.clone())),
    }
}

/// Writes the message to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(subject = %notification.subject, "{}", notification.body);
        Ok(())
    }
}

/// Hands an RFC 822 message to a local `sendmail -t -oi`.
pub struct SendmailNotifier {
    program: PathBuf,
    from: String,
    to: Vec<String>,
}

impl SendmailNotifier {
    pub fn new(program: impl Into<PathBuf>, from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            program: program.into(),
            from: from.into(),
            to,
        }
    }

    /// Message text including headers; recipients are taken from `To:` by `-t`.
    pub fn render(&self, notification: &Notification) -> String {
        format!(
            "From: {}\nSubject: {}\nTo: {}\n\n{}\n",
            self.from,
            notification.subject,
            self.to.join(", "),
            notification.body
        )
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let message = self.render(notification);

        let mut child = Command::new(&self.program)
            .args(["-t", "-oi"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BackupError::Notify(format!("cannot run {}: {}", self.program.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(|e| BackupError::Notify(format!("cannot write message: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackupError::Notify(e.to_string()))?;
        if !output.status.success() {
            return Err(BackupError::Notify(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(to = ?self.to, subject = %notification.subject, "Mail handed to sendmail");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    host: String,
    subject: &'a str,
    body: &'a str,
}

/// POSTs `{host, subject, body}` as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload {
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            subject: &notification.subject,
            body: &notification.body,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BackupError::Notify(format!("POST {}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(BackupError::Notify(format!(
                "HTTP {}: {}",
                response.status(),
                self.url
            )));
        }
        Ok(())
    }
}

/// Collects notifications for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
