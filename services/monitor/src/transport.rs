//! Email delivery.
//!
//! Messages are rendered to RFC 5322 text here and handed to a local MTA, a
//! pickup directory or an SMTP relay. Any failure is a [`TransportError`];
//! the dispatcher decides whether to retry.

use crate::config::{EmailConfig, SmtpConfig, TransportKind};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

/// Errors returned by an email transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mail command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Delivery attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Invalid address '{address}': {message}")]
    InvalidAddress { address: String, message: String },
}

/// A file attached to an outgoing email.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Bytes,
}

/// A fully packaged email ready for delivery.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub subject: String,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub recipients: Vec<String>,
}

impl OutgoingEmail {
    /// Render the message as RFC 5322 text.
    pub fn to_mime(&self, from: &str) -> String {
        let boundary = format!("=_roomguard_{}", Uuid::new_v4().simple());
        let domain = from.split_once('@').map(|(_, d)| d).unwrap_or("localhost");

        let mut out = String::with_capacity(self.body.len() + 1024);
        push_header(&mut out, "From", from);
        push_header(&mut out, "To", &self.recipients.join(", "));
        push_header(&mut out, "Subject", &self.subject);
        push_header(&mut out, "Date", &Utc::now().to_rfc2822());
        push_header(
            &mut out,
            "Message-ID",
            &format!("<{}@{}>", Uuid::new_v4(), domain),
        );
        push_header(&mut out, "MIME-Version", "1.0");

        let Some(attachment) = &self.attachment else {
            push_header(&mut out, "Content-Type", "text/plain; charset=utf-8");
            push_header(&mut out, "Content-Transfer-Encoding", "8bit");
            out.push_str("\r\n");
            push_text(&mut out, &self.body);
            return out;
        };

        push_header(
            &mut out,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        );
        out.push_str("\r\n");

        out.push_str(&format!("--{}\r\n", boundary));
        push_header(&mut out, "Content-Type", "text/plain; charset=utf-8");
        push_header(&mut out, "Content-Transfer-Encoding", "8bit");
        out.push_str("\r\n");
        push_text(&mut out, &self.body);

        out.push_str(&format!("--{}\r\n", boundary));
        push_header(
            &mut out,
            "Content-Type",
            &format!("{}; name=\"{}\"", attachment.content_type, attachment.filename),
        );
        push_header(&mut out, "Content-Transfer-Encoding", "base64");
        push_header(
            &mut out,
            "Content-Disposition",
            &format!("attachment; filename=\"{}\"", attachment.filename),
        );
        out.push_str("\r\n");

        let encoded = STANDARD.encode(&attachment.data);
        // 76 chars per line; base64 output is ASCII so byte chunks are safe
        for line in encoded.as_bytes().chunks(76) {
            out.push_str(&String::from_utf8_lossy(line));
            out.push_str("\r\n");
        }

        out.push_str(&format!("--{}--\r\n", boundary));
        out
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    // Header values must stay on one line
    let value: String = value.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    out.push_str(name);
    out.push_str(": ");
    out.push_str(&value);
    out.push_str("\r\n");
}

fn push_text(out: &mut String, text: &str) {
    for line in text.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
}

/// Delivers packaged emails.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Pipes messages to a local `sendmail`-compatible binary.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    program: PathBuf,
    from: String,
}

impl SendmailTransport {
    pub fn new(program: impl Into<PathBuf>, from: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl EmailTransport for SendmailTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        if email.recipients.is_empty() {
            return Err(TransportError::Rejected("no recipients".to_string()));
        }

        let message = email.to_mime(&self.from);

        let mut child = Command::new(&self.program)
            .arg("-t")
            .arg("-i")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(
            recipients = email.recipients.len(),
            bytes = message.len(),
            "Message handed to sendmail"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sendmail"
    }
}

/// Writes each message as an `.eml` file into a pickup directory.
#[derive(Debug, Clone)]
pub struct SpoolTransport {
    dir: PathBuf,
    from: String,
}

impl SpoolTransport {
    pub fn new(dir: impl Into<PathBuf>, from: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl EmailTransport for SpoolTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        if email.recipients.is_empty() {
            return Err(TransportError::Rejected("no recipients".to_string()));
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        let name = format!(
            "{}_{}.eml",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            Uuid::new_v4().simple()
        );
        let tmp = self.dir.join(format!(".{}.tmp", name));
        let path = self.dir.join(&name);

        // Write then rename so pickers never see a partial file
        tokio::fs::write(&tmp, email.to_mime(&self.from)).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "Message spooled");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "spool"
    }
}

/// Relays messages through an SMTP server, optionally upgrading with
/// STARTTLS and logging in first.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    relay: String,
    from: String,
}

impl fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("relay", &self.relay)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig, from: impl Into<String>) -> Result<Self, TransportError> {
        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.clone())
        };

        builder = builder.port(config.port).timeout(Some(config.timeout()));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            relay: format!("{}:{}", config.host, config.port),
            from: from.into(),
        })
    }

    fn envelope(&self, recipients: &[String]) -> Result<Envelope, TransportError> {
        let from = parse_address(&self.from)?;
        let to = recipients
            .iter()
            .map(|r| parse_address(r))
            .collect::<Result<Vec<_>, _>>()?;

        Envelope::new(Some(from), to).map_err(|e| TransportError::InvalidAddress {
            address: recipients.join(", "),
            message: e.to_string(),
        })
    }
}

fn parse_address(value: &str) -> Result<Address, TransportError> {
    value
        .parse::<Address>()
        .map_err(|e| TransportError::InvalidAddress {
            address: value.to_string(),
            message: e.to_string(),
        })
}

#[async_trait]
impl EmailTransport for SmtpTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        if email.recipients.is_empty() {
            return Err(TransportError::Rejected("no recipients".to_string()));
        }

        let envelope = self.envelope(&email.recipients)?;
        let message = email.to_mime(&self.from);

        self.mailer
            .send_raw(&envelope, message.as_bytes())
            .await
            .map_err(|e| {
                if e.is_permanent() {
                    TransportError::Rejected(e.to_string())
                } else {
                    TransportError::Smtp(e)
                }
            })?;

        debug!(
            relay = %self.relay,
            recipients = email.recipients.len(),
            bytes = message.len(),
            "Message relayed over SMTP"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

/// Build the transport selected in configuration.
pub fn from_config(config: &EmailConfig) -> Result<Arc<dyn EmailTransport>, TransportError> {
    let transport: Arc<dyn EmailTransport> = match config.transport {
        TransportKind::Sendmail => Arc::new(SendmailTransport::new(
            config.sendmail_path.clone(),
            config.from.clone(),
        )),
        TransportKind::Spool => Arc::new(SpoolTransport::new(
            config.spool_dir.clone(),
            config.from.clone(),
        )),
        TransportKind::Smtp => Arc::new(SmtpTransport::new(&config.smtp, config.from.clone())?),
    };
    Ok(transport)
}
