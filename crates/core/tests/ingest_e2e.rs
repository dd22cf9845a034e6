//! End-to-end mail ingestion: raw message in, gate, registration handler,
//! record created in an in-memory platform.
//!
//! Signature checking itself is covered next to the DKIM verifier; here a
//! verifier that vouches for every header the message carries stands in for
//! it so the remaining gate stages and the dispatch can be driven with
//! plain-text messages.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use rostersync_core::apply::NoPacing;
use rostersync_core::config::AppConfig;
use rostersync_core::email::dkim::{SignatureVerifier, VerifiedSignature};
use rostersync_core::email::gate::{EmailGate, GatePolicy, GateStage, Rejection};
use rostersync_core::email::ingest::{IngestOutcome, IngestionService};
use rostersync_core::email::message::RawMessage;
use rostersync_core::email::registration::{RegistrationHandler, RegistrationTarget};
use rostersync_core::errors::{ApiRequestError, NotificationError, VerificationError};
use rostersync_core::notify::{AdminAlert, RegistrationNotice};
use rostersync_core::platform::RecordWriter;
use rostersync_core::{SchemaRegistry, SyncEngine};

// ===========================================================================
// Helpers
// ===========================================================================

const TABLE: &str = "Key\tAdmin\tRegisterForm\n\
    first_name\tvoornaam\tVoornaam\n\
    last_name\tachternaam\tAchternaam\n\
    email\temail\tE-mail\n\
    newsletter_permission\tnieuwsbrief\tNieuwsbrief\n\
    membership_start\tlid_sinds\t\n\
    notes\topmerkingen\t\n";

const CONFIG: &str = r#"
[schema]
url = "https://example.org/table.tsv"

[platforms.admin]
base_url = "https://admin.example.org"
token_env = "ADMIN_TOKEN"
schema_column = "Admin"

[gate]
allowed_senders = ["forms@example.org"]

[[gate.handlers]]
address = "register@example.org"
target = "admin"
"#;

const BODY: &str = "Content-Type: text/html; charset=utf-8\r\n\
    \r\n\
    <table>\r\n\
    <tr><td><strong>Voornaam</strong></td><td>Ann</td></tr>\r\n\
    <tr><td><strong>Achternaam</strong></td><td>de Vries</td></tr>\r\n\
    <tr><td><strong>E-mail</strong></td><td>ann@example.org</td></tr>\r\n\
    <tr><td><strong>Nieuwsbrief</strong></td><td>Ja</td></tr>\r\n\
    </table>\r\n";

fn message(date: Option<&str>) -> Vec<u8> {
    let mut raw = String::from(
        "From: Forms <forms@example.org>\r\n\
         To: register@example.org\r\n\
         Subject: Nieuwe inschrijving\r\n\
         Message-ID: <reg-7@example.org>\r\n",
    );
    if let Some(date) = date {
        raw.push_str(&format!("Date: {date}\r\n"));
    }
    raw.push_str(BODY);
    raw.into_bytes()
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 14, 22, 0, 0).unwrap()
}

/// Vouches for whichever of the usual headers the message carries.
struct SignsPresentHeaders;

#[async_trait]
impl SignatureVerifier for SignsPresentHeaders {
    async fn verify(&self, message: &RawMessage, _now: DateTime<Utc>) -> Result<VerifiedSignature, VerificationError> {
        let signed_headers = ["from", "to", "subject", "date", "message-id"]
            .iter()
            .filter(|h| message.has_header(h))
            .map(|h| h.to_string())
            .collect();
        Ok(VerifiedSignature {
            domain: "example.org".into(),
            selector: "mail".into(),
            signed_headers,
        })
    }
}

#[derive(Default)]
struct Writer {
    created: Mutex<Vec<Value>>,
}

#[async_trait]
impl RecordWriter for Writer {
    async fn create(&self, payload: &Value) -> Result<Option<String>, ApiRequestError> {
        let mut created = self.created.lock().unwrap();
        created.push(payload.clone());
        Ok(Some(format!("r{}", created.len())))
    }
    async fn update(&self, _: &str, _: &Value) -> Result<(), ApiRequestError> {
        Ok(())
    }
    async fn delete(&self, _: &str) -> Result<(), ApiRequestError> {
        Ok(())
    }
}

#[derive(Default)]
struct Alerts {
    rejections: Mutex<Vec<Rejection>>,
    failures: Mutex<Vec<String>>,
    registrations: Mutex<Vec<RegistrationNotice>>,
}

#[async_trait]
impl AdminAlert for Alerts {
    async fn notify_rejection(&self, rejection: &Rejection) -> Result<(), NotificationError> {
        self.rejections.lock().unwrap().push(rejection.clone());
        Ok(())
    }
    async fn notify_handler_failure(&self, _: &str, _: Option<&str>, error: &str) -> Result<(), NotificationError> {
        self.failures.lock().unwrap().push(error.to_string());
        Ok(())
    }
    async fn notify_registration(&self, notice: &RegistrationNotice) -> Result<(), NotificationError> {
        self.registrations.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

fn service(writer: Arc<Writer>, alerts: Arc<Alerts>, dry_run: bool) -> IngestionService<SignsPresentHeaders> {
    let config: AppConfig = toml::from_str(CONFIG).unwrap();
    let registry = Arc::new(SchemaRegistry::from_tsv(TABLE, "Key").unwrap());
    let engine = SyncEngine::new(&config, Arc::clone(&registry), dry_run).with_pacer(Arc::new(NoPacing));

    let handler_config = config.gate.handlers[0].clone();
    let target = RegistrationTarget::new(config.platform(&handler_config.target).unwrap(), writer);
    let handler = RegistrationHandler::new(
        handler_config,
        registry,
        engine.diff_engine(BTreeSet::new()),
        target,
        alerts.clone(),
        engine.pacer(),
        dry_run,
    );

    let gate = EmailGate::new(GatePolicy::from_config(&config.gate).unwrap(), SignsPresentHeaders);
    IngestionService::new(gate, alerts).with_handler(Arc::new(handler))
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn test_signed_registration_creates_record() {
    let writer = Arc::new(Writer::default());
    let alerts = Arc::new(Alerts::default());
    let service = service(writer.clone(), alerts.clone(), false);

    let outcome = service
        .ingest(&message(Some("Mon, 14 Jul 2025 21:30:00 +0000")), "reg-7.eml", now())
        .await;
    let IngestOutcome::Handled(handled) = outcome else {
        panic!("expected the registration to be handled, got {outcome:?}");
    };
    assert_eq!(handled.record_id.as_deref(), Some("r1"));

    let created = writer.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["voornaam"], "Ann");
    assert_eq!(created[0]["email"], "ann@example.org");
    // Received in July, so membership starts on 1 September.
    assert_eq!(created[0]["lid_sinds"], "2025-09-01");
    assert_eq!(created[0]["nieuwsbrief"], true);

    let notices = alerts.registrations.lock().unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].name, "Ann de Vries");
    assert_eq!(notices[0].record_id.as_deref(), Some("r1"));
    assert!(alerts.rejections.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_message_without_date_is_rejected_before_handler() {
    let writer = Arc::new(Writer::default());
    let alerts = Arc::new(Alerts::default());
    let service = service(writer.clone(), alerts.clone(), false);

    let outcome = service.ingest(&message(None), "undated.eml", now()).await;
    let IngestOutcome::Rejected(rejection) = outcome else {
        panic!("expected a rejection, got {outcome:?}");
    };
    assert_eq!(rejection.stage, GateStage::HeaderCoverage);
    assert_eq!(rejection.error, VerificationError::DateMissing);
    assert_eq!(rejection.source, "undated.eml");

    assert!(writer.created.lock().unwrap().is_empty());
    assert!(alerts.registrations.lock().unwrap().is_empty());
    let rejections = alerts.rejections.lock().unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].message_id.as_deref(), Some("<reg-7@example.org>"));
}

#[tokio::test]
async fn test_stale_message_is_rejected_at_date_stage() {
    let writer = Arc::new(Writer::default());
    let alerts = Arc::new(Alerts::default());
    let service = service(writer.clone(), alerts.clone(), false);

    let outcome = service
        .ingest(&message(Some("Fri, 11 Jul 2025 09:00:00 +0000")), "old.eml", now())
        .await;
    let IngestOutcome::Rejected(rejection) = outcome else {
        panic!("expected a rejection, got {outcome:?}");
    };
    assert_eq!(rejection.stage, GateStage::Date);
    assert!(matches!(rejection.error, VerificationError::DateTooOld(_)));
    assert!(writer.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_registration_writes_nothing() {
    let writer = Arc::new(Writer::default());
    let alerts = Arc::new(Alerts::default());
    let service = service(writer.clone(), alerts.clone(), true);

    let outcome = service
        .ingest(&message(Some("Mon, 14 Jul 2025 21:30:00 +0000")), "reg-7.eml", now())
        .await;
    assert!(outcome.is_handled());
    assert!(writer.created.lock().unwrap().is_empty());
    assert!(alerts.registrations.lock().unwrap().is_empty());
}
