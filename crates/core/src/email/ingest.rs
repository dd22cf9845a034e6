//! Inbound mail dispatch: gate first, then the handler registered for the
//! delivery address. Every rejection and every handler failure reaches an
//! administrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::dkim::SignatureVerifier;
use super::gate::{AcceptedMessage, EmailGate, GateStage, Rejection};
use crate::errors::{CoreError, VerificationError};
use crate::notify::AdminAlert;
use crate::record::CanonicalRecord;

/// What a handler did with an accepted message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandledMessage {
    pub summary: String,
    pub record: Option<CanonicalRecord>,
    pub record_id: Option<String>,
    pub groups: Vec<String>,
}

/// Processes accepted mail for one delivery address.
#[async_trait]
pub trait MailHandler: Send + Sync {
    fn address(&self) -> &str;

    async fn handle(&self, accepted: &AcceptedMessage) -> Result<HandledMessage, CoreError>;
}

#[derive(Debug)]
pub enum IngestOutcome {
    Handled(HandledMessage),
    Rejected(Rejection),
    HandlerFailed { address: String, error: String },
}

impl IngestOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, IngestOutcome::Handled(_))
    }
}

pub struct IngestionService<V> {
    gate: EmailGate<V>,
    handlers: BTreeMap<String, Arc<dyn MailHandler>>,
    alert: Arc<dyn AdminAlert>,
}

impl<V: SignatureVerifier> IngestionService<V> {
    pub fn new(gate: EmailGate<V>, alert: Arc<dyn AdminAlert>) -> Self {
        Self {
            gate,
            handlers: BTreeMap::new(),
            alert,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn MailHandler>) -> Self {
        self.handlers
            .insert(handler.address().to_ascii_lowercase(), handler);
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    #[instrument(skip(self, raw, now))]
    pub async fn ingest(&self, raw: &[u8], source: &str, now: DateTime<Utc>) -> IngestOutcome {
        let accepted = match self.gate.evaluate(raw, source, now).await {
            Ok(accepted) => accepted,
            Err(rejection) => return self.reject(rejection).await,
        };

        let Some(handler) = self.handlers.get(&accepted.delivery_address) else {
            let rejection = Rejection {
                stage: GateStage::Recipient,
                error: VerificationError::UnknownRecipient(accepted.delivery_address.clone()),
                source: source.to_string(),
                subject: accepted.subject(),
                message_id: accepted.message_id(),
            };
            return self.reject(rejection).await;
        };

        info!(address = %accepted.delivery_address, "dispatching to handler");
        match handler.handle(&accepted).await {
            Ok(handled) => {
                info!(summary = %handled.summary, "message handled");
                IngestOutcome::Handled(handled)
            }
            Err(e) => {
                error!(address = %accepted.delivery_address, error = %e, "handler failed");
                let subject = accepted.subject();
                if let Err(ne) = self
                    .alert
                    .notify_handler_failure(source, subject.as_deref(), &e.to_string())
                    .await
                {
                    warn!(error = %ne, "handler failure notification failed");
                }
                IngestOutcome::HandlerFailed {
                    address: accepted.delivery_address,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn reject(&self, rejection: Rejection) -> IngestOutcome {
        if let Err(e) = self.alert.notify_rejection(&rejection).await {
            warn!(error = %e, "rejection notification failed");
        }
        IngestOutcome::Rejected(rejection)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use chrono::Duration;

    use super::*;
    use crate::email::dkim::testing::{resolver_for, sign};
    use crate::email::dkim::{DkimVerifier, StaticKeyResolver};
    use crate::email::gate::GatePolicy;
    use crate::errors::NotificationError;
    use crate::notify::RegistrationNotice;

    const ADDRESS: &str = "register@members.example.org";

    #[derive(Default)]
    struct Alerts {
        rejections: Mutex<Vec<GateStage>>,
        failures: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AdminAlert for Alerts {
        async fn notify_rejection(&self, rejection: &Rejection) -> Result<(), NotificationError> {
            self.rejections.lock().unwrap().push(rejection.stage);
            Ok(())
        }
        async fn notify_handler_failure(
            &self,
            _: &str,
            _: Option<&str>,
            error: &str,
        ) -> Result<(), NotificationError> {
            self.failures.lock().unwrap().push(error.to_string());
            Err(NotificationError::AllChannelsFailed("offline".into()))
        }
        async fn notify_registration(&self, _: &RegistrationNotice) -> Result<(), NotificationError> {
            Ok(())
        }
    }

    struct Echo {
        address: String,
        fail: bool,
    }

    #[async_trait]
    impl MailHandler for Echo {
        fn address(&self) -> &str {
            &self.address
        }
        async fn handle(&self, accepted: &AcceptedMessage) -> Result<HandledMessage, CoreError> {
            if self.fail {
                return Err(CoreError::Handler("target unavailable".into()));
            }
            Ok(HandledMessage {
                summary: format!("echo {}", accepted.sender),
                ..Default::default()
            })
        }
    }

    fn service(
        alerts: Arc<Alerts>,
        known: &[&str],
        handler: Option<Echo>,
    ) -> IngestionService<DkimVerifier<StaticKeyResolver>> {
        let policy = GatePolicy {
            allowed_senders: ["forms@example.org".to_string()].into(),
            allowed_domains: BTreeSet::new(),
            max_future_skew: Duration::minutes(5),
            max_age: Duration::hours(24),
            allow_stale: false,
            require_authentication_results: false,
            from_pattern: None,
            known_recipients: known.iter().map(|s| s.to_string()).collect(),
        };
        let gate = EmailGate::new(policy, DkimVerifier::new(resolver_for("example.org")));
        let svc = IngestionService::new(gate, alerts);
        match handler {
            Some(h) => svc.with_handler(Arc::new(h)),
            None => svc,
        }
    }

    fn signed(from: &str) -> String {
        let raw = format!(
            "From: {from}\r\nTo: {ADDRESS}\r\nSubject: Inschrijving\r\n\
             Date: Mon, 1 Sep 2025 09:30:00 +0000\r\nMessage-ID: <x@example.org>\r\n\r\nhi\r\n"
        );
        sign(&raw, "example.org", &["from", "to", "subject", "date", "message-id"], "relaxed/relaxed")
    }

    fn now() -> DateTime<Utc> {
        "2025-09-01T10:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_accepted_message_is_dispatched() {
        let alerts = Arc::new(Alerts::default());
        let svc = service(alerts.clone(), &[ADDRESS], Some(Echo { address: ADDRESS.into(), fail: false }));
        match svc.ingest(signed("forms@example.org").as_bytes(), "a.eml", now()).await {
            IngestOutcome::Handled(h) => assert_eq!(h.summary, "echo forms@example.org"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(alerts.rejections.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_alerts_admin() {
        let alerts = Arc::new(Alerts::default());
        let svc = service(alerts.clone(), &[ADDRESS], Some(Echo { address: ADDRESS.into(), fail: false }));
        let outcome = svc.ingest(signed("intruder@example.org").as_bytes(), "b.eml", now()).await;
        assert!(matches!(outcome, IngestOutcome::Rejected(_)));
        assert_eq!(alerts.rejections.lock().unwrap().as_slice(), &[GateStage::AllowedSender]);
    }

    #[tokio::test]
    async fn test_known_address_without_handler_is_rejected() {
        let alerts = Arc::new(Alerts::default());
        let svc = service(alerts.clone(), &[ADDRESS], None);
        let outcome = svc.ingest(signed("forms@example.org").as_bytes(), "c.eml", now()).await;
        match outcome {
            IngestOutcome::Rejected(r) => assert_eq!(r.stage, GateStage::Recipient),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_alerts_even_if_notification_fails() {
        let alerts = Arc::new(Alerts::default());
        let svc = service(alerts.clone(), &[ADDRESS], Some(Echo { address: ADDRESS.into(), fail: true }));
        let outcome = svc.ingest(signed("forms@example.org").as_bytes(), "d.eml", now()).await;
        assert!(matches!(outcome, IngestOutcome::HandlerFailed { .. }));
        assert_eq!(alerts.failures.lock().unwrap().len(), 1);
    }
}
