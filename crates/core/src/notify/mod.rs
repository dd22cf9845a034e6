//! Administrative notifications: gate rejections, handler failures,
//! processed registrations and reconciliation summaries.
//!
//! The [`Notifier`] fans out to every configured channel (Slack webhook,
//! SMTP) and only fails when all of them fail.

pub mod email;
pub mod slack;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::email::gate::Rejection;
use crate::errors::NotificationError;

/// The seam the mail gate reports through.
#[async_trait]
pub trait AdminAlert: Send + Sync {
    async fn notify_rejection(&self, rejection: &Rejection) -> Result<(), NotificationError>;

    async fn notify_handler_failure(
        &self,
        source: &str,
        subject: Option<&str>,
        error: &str,
    ) -> Result<(), NotificationError>;

    async fn notify_registration(&self, notice: &RegistrationNotice) -> Result<(), NotificationError>;
}

/// A registration that made it into the target system.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationNotice {
    pub name: String,
    pub email: Option<String>,
    pub record_id: Option<String>,
    pub groups: Vec<String>,
    pub iban_included: bool,
    /// Subject and Message-ID of the original mail, for threading.
    pub original_subject: Option<String>,
    pub original_message_id: Option<String>,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub label: String,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.deleted + self.failed > 0
    }
}

/// One notification, rendered for both channels.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub slack: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub in_reply_to: Option<String>,
}

/// Dispatches to all configured channels.
pub struct Notifier {
    slack: Option<slack::SlackNotifier>,
    email: Option<email::EmailNotifier>,
}

impl Notifier {
    pub fn new(config: &NotificationConfig) -> Self {
        let slack = config.slack_webhook_url.as_ref().map(|url| {
            info!("Slack notifications enabled");
            slack::SlackNotifier::new(url.clone())
        });

        let email = match (&config.email_smtp, &config.email_from) {
            (Some(smtp), Some(from)) if !config.email_recipients.is_empty() => {
                info!("email notifications enabled");
                let credentials = config
                    .smtp_username
                    .clone()
                    .zip(config.smtp_password.clone());
                Some(email::EmailNotifier::new(
                    smtp.clone(),
                    from.clone(),
                    config.email_recipients.clone(),
                    credentials,
                ))
            }
            _ => None,
        };

        Self { slack, email }
    }

    pub fn is_configured(&self) -> bool {
        self.slack.is_some() || self.email.is_some()
    }

    /// Send a summary after a live pass that changed something.
    pub async fn notify_run_summary(&self, summary: &RunSummary) -> Result<(), NotificationError> {
        if !summary.has_changes() {
            return Ok(());
        }
        self.dispatch(&format_run_summary(summary)).await
    }

    async fn dispatch(&self, outgoing: &Outgoing) -> Result<(), NotificationError> {
        if !self.is_configured() {
            info!(subject = %outgoing.subject, "no notification channel configured; logged only");
            return Ok(());
        }

        let mut errors = Vec::new();
        if let Some(ref slack) = self.slack {
            if let Err(e) = slack.send_message(&outgoing.slack).await {
                warn!(error = %e, "Slack notification failed");
                errors.push(format!("Slack: {e}"));
            }
        }
        if let Some(ref email) = self.email {
            if let Err(e) = email.send(outgoing).await {
                warn!(error = %e, "email notification failed");
                errors.push(format!("Email: {e}"));
            }
        }

        let channels = self.slack.is_some() as usize + self.email.is_some() as usize;
        if errors.len() >= channels {
            return Err(NotificationError::AllChannelsFailed(errors.join("; ")));
        }
        Ok(())
    }
}

#[async_trait]
impl AdminAlert for Notifier {
    async fn notify_rejection(&self, rejection: &Rejection) -> Result<(), NotificationError> {
        info!(stage = %rejection.stage, source = %rejection.source, "sending rejection notification");
        self.dispatch(&format_rejection(rejection)).await
    }

    async fn notify_handler_failure(
        &self,
        source: &str,
        subject: Option<&str>,
        error: &str,
    ) -> Result<(), NotificationError> {
        info!(source, "sending handler failure notification");
        self.dispatch(&format_handler_failure(source, subject, error)).await
    }

    async fn notify_registration(&self, notice: &RegistrationNotice) -> Result<(), NotificationError> {
        info!(name = %notice.name, "sending registration notification");
        self.dispatch(&format_registration(notice)).await
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn format_rejection(rejection: &Rejection) -> Outgoing {
    let subject_line = rejection.subject.as_deref().unwrap_or("(no subject)");
    Outgoing {
        slack: format!(
            ":no_entry: *Inbound mail rejected*\n*Stage:* {}\n*Reason:* {}\n*Subject:* {}\n*File:* `{}`",
            rejection.stage, rejection.error, subject_line, rejection.source
        ),
        subject: format!("[rostersync] Mail rejected: {subject_line}"),
        text: format!(
            "An inbound message was rejected and nothing was recorded.\n\
             Stage: {}\nReason: {}\nSubject: {}\nMessage-ID: {}\nFile: {}\n\
             Check the message and resubmit it if it is genuine.\n",
            rejection.stage,
            rejection.error,
            subject_line,
            rejection.message_id.as_deref().unwrap_or("-"),
            rejection.source
        ),
        html: format!(
            "<html><body>\
             <h2 style=\"color: red;\">Inbound mail rejected</h2>\
             <table>\
             <tr><td>Stage</td><td>{}</td></tr>\
             <tr><td>Reason</td><td>{}</td></tr>\
             <tr><td>Subject</td><td>{}</td></tr>\
             <tr><td>File</td><td><code>{}</code></td></tr>\
             </table>\
             <p>Nothing was recorded. Check the message and resubmit it if it is genuine.</p>\
             </body></html>",
            html_escape(&rejection.stage.to_string()),
            html_escape(&rejection.error.to_string()),
            html_escape(subject_line),
            html_escape(&rejection.source),
        ),
        in_reply_to: rejection.message_id.clone(),
    }
}

fn format_handler_failure(source: &str, subject: Option<&str>, error: &str) -> Outgoing {
    let subject_line = subject.unwrap_or("(no subject)");
    Outgoing {
        slack: format!(":x: *Accepted mail could not be processed*\n*Subject:* {subject_line}\n*File:* `{source}`\n```{error}```"),
        subject: format!("[rostersync] Processing failed: {subject_line}"),
        text: format!("Processing an accepted message failed.\nSubject: {subject_line}\nFile: {source}\nError: {error}\n"),
        html: format!(
            "<html><body><h2 style=\"color: red;\">Processing failed</h2>\
             <p>Subject: {}</p><p>File: <code>{}</code></p><pre>{}</pre></body></html>",
            html_escape(subject_line),
            html_escape(source),
            html_escape(error)
        ),
        in_reply_to: None,
    }
}

fn format_registration(notice: &RegistrationNotice) -> Outgoing {
    let id = notice.record_id.as_deref().unwrap_or("(unknown)");
    let email = notice.email.as_deref().unwrap_or("-");
    let groups = notice.groups.join(", ");
    let mut text = format!(
        "A new registration has been processed.\nName: {}\nEmail: {email}\nRecord ID: {id}\nGroups added: {groups}\n",
        notice.name
    );
    let mut html = format!(
        "<p>A new registration has been processed.</p><ul>\
         <li><strong>Name:</strong> {}</li>\
         <li><strong>Email:</strong> {}</li>\
         <li><strong>Record ID:</strong> {}</li>\
         <li><strong>Groups added:</strong> {}</li></ul>",
        html_escape(&notice.name),
        html_escape(email),
        html_escape(id),
        html_escape(&groups)
    );
    if !notice.iban_included {
        let note = "The IBAN in the registration was invalid or missing and was not stored.";
        text.push_str(&format!("\nNote: {note}\n"));
        html.push_str(&format!("<p><strong>Note:</strong> {note}</p>"));
    }

    // Mail clients thread by subject, so reuse the original one.
    let subject = notice
        .original_subject
        .clone()
        .unwrap_or_else(|| format!("New registration processed: {} ({id})", notice.name));
    Outgoing {
        slack: format!(":white_check_mark: *Registration processed*\n{}", text.trim_end()),
        subject,
        text,
        html,
        in_reply_to: notice.original_message_id.clone(),
    }
}

fn format_run_summary(summary: &RunSummary) -> Outgoing {
    Outgoing {
        slack: format!(
            ":arrows_counterclockwise: *Reconciliation {}*\n\
             - created: {}\n- updated: {}\n- deleted: {}\n- failed: {}\n- skipped: {}",
            summary.label, summary.created, summary.updated, summary.deleted, summary.failed, summary.skipped
        ),
        subject: format!("[rostersync] Reconciliation {}", summary.label),
        text: format!(
            "created: {}\nupdated: {}\ndeleted: {}\nfailed: {}\nskipped: {}\n",
            summary.created, summary.updated, summary.deleted, summary.failed, summary.skipped
        ),
        html: format!(
            "<html><body><h2>Reconciliation {}</h2><table>\
             <tr><td>Created</td><td>{}</td></tr>\
             <tr><td>Updated</td><td>{}</td></tr>\
             <tr><td>Deleted</td><td>{}</td></tr>\
             <tr><td>Failed</td><td>{}</td></tr>\
             <tr><td>Skipped</td><td>{}</td></tr>\
             </table></body></html>",
            html_escape(&summary.label),
            summary.created,
            summary.updated,
            summary.deleted,
            summary.failed,
            summary.skipped
        ),
        in_reply_to: None,
    }
}

/// Minimal HTML escaping for user-provided strings.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
