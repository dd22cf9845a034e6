//! SMTP notifications.
//!
//! Every message goes out as `multipart/alternative` and carries
//! `Auto-Submitted: auto-generated` so our own alerts are never fed back
//! into the inbound gate as submissions.

use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info, warn};

use super::Outgoing;
use crate::errors::NotificationError;

const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, Clone)]
struct AutoSubmitted;

impl Header for AutoSubmitted {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Auto-Submitted")
    }

    fn parse(_: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), "auto-generated".to_string())
    }
}

#[derive(Debug, Clone)]
struct SuppressAutoResponse;

impl Header for SuppressAutoResponse {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Auto-Response-Suppress")
    }

    fn parse(_: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), "All".to_string())
    }
}

/// Sends notifications to the configured administrators.
pub struct EmailNotifier {
    smtp_addr: String,
    from: String,
    recipients: Vec<String>,
    credentials: Option<(String, String)>,
}

impl EmailNotifier {
    /// `smtp_addr` is `host:port`; the port defaults to 587.
    pub fn new(
        smtp_addr: String,
        from: String,
        recipients: Vec<String>,
        credentials: Option<(String, String)>,
    ) -> Self {
        info!(
            smtp = %smtp_addr,
            from = %from,
            recipients = ?recipients,
            authenticated = credentials.is_some(),
            "initializing email notifier"
        );
        Self {
            smtp_addr,
            from,
            recipients,
            credentials,
        }
    }

    pub async fn send(&self, outgoing: &Outgoing) -> Result<(), NotificationError> {
        debug!(subject = %outgoing.subject, to = ?self.recipients, "sending email");

        let transport = self.build_transport()?;
        for recipient in &self.recipients {
            let email = self.build_message(recipient, outgoing)?;
            if let Err(e) = transport.send(email).await {
                warn!(to = %recipient, error = %e, "failed to send email");
                return Err(NotificationError::EmailError(format!(
                    "SMTP send to '{recipient}' failed: {e}"
                )));
            }
            info!(to = %recipient, "email sent");
        }
        Ok(())
    }

    fn build_message(&self, recipient: &str, outgoing: &Outgoing) -> Result<Message, NotificationError> {
        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| NotificationError::EmailError(format!("invalid from address: {e}")))?;
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| NotificationError::EmailError(format!("invalid recipient '{recipient}': {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(outgoing.subject.as_str())
            .header(AutoSubmitted)
            .header(SuppressAutoResponse);
        if let Some(ref parent) = outgoing.in_reply_to {
            builder = builder.in_reply_to(parent.clone()).references(parent.clone());
        }

        builder
            .multipart(MultiPart::alternative_plain_html(
                outgoing.text.clone(),
                outgoing.html.clone(),
            ))
            .map_err(|e| NotificationError::EmailError(format!("failed to build email: {e}")))
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotificationError> {
        let (host, port) = split_host_port(&self.smtp_addr);
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| NotificationError::EmailError(format!("SMTP connection error: {e}")))?
            .port(port);
        if let Some((ref user, ref password)) = self.credentials {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(builder.build())
    }
}

fn split_host_port(addr: &str) -> (&str, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (addr, DEFAULT_SMTP_PORT),
        },
        None => (addr, DEFAULT_SMTP_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> Outgoing {
        Outgoing {
            slack: String::new(),
            subject: "Nieuwe inschrijving".into(),
            text: "plain".into(),
            html: "<p>html</p>".into(),
            in_reply_to: Some("<orig@example.org>".into()),
        }
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("smtp.example.com:2525"), ("smtp.example.com", 2525));
        assert_eq!(split_host_port("smtp.example.com"), ("smtp.example.com", 587));
    }

    #[test]
    fn test_message_is_marked_auto_submitted_and_threaded() {
        let notifier = EmailNotifier::new(
            "smtp.example.com:587".into(),
            "sync@example.com".into(),
            vec!["admin@example.com".into()],
            None,
        );
        let message = notifier.build_message("admin@example.com", &outgoing()).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Auto-Submitted: auto-generated"));
        assert!(formatted.contains("In-Reply-To: <orig@example.org>"));
        assert!(formatted.contains("multipart/alternative"));
    }

    #[test]
    fn test_invalid_recipient() {
        let notifier = EmailNotifier::new(
            "smtp.example.com".into(),
            "sync@example.com".into(),
            vec!["not an address".into()],
            None,
        );
        assert!(notifier.build_message("not an address", &outgoing()).is_err());
    }
}
