//! New-member registrations submitted through the web form.
//!
//! The form mail is turned into a canonical record, a few fields are
//! screened or derived, the record is created in the target platform and
//! added to the configured groups, and the administrators are told.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::form::{extract_form_fields, form_to_canonical};
use super::gate::AcceptedMessage;
use super::ingest::{HandledMessage, MailHandler};
use crate::apply::{OperationApplicator, Pacer};
use crate::config::{HandlerConfig, PlatformConfig};
use crate::diff::DiffEngine;
use crate::errors::CoreError;
use crate::groups::GroupReconciler;
use crate::normalize::Normalizer;
use crate::notify::{AdminAlert, RegistrationNotice};
use crate::platform::{GroupTarget, RecordWriter};
use crate::record::{keys, CanonicalRecord};
use crate::schema::SchemaRegistry;

/// Shorter than any IBAN in use.
const MIN_IBAN_LEN: usize = 15;

/// Where the created record goes.
pub struct RegistrationTarget {
    pub writer: Arc<dyn RecordWriter>,
    pub groups: Option<Arc<dyn GroupTarget>>,
    pub schema_column: String,
    pub notes_key: String,
    pub id_field: Option<String>,
}

impl RegistrationTarget {
    pub fn new(platform: &PlatformConfig, writer: Arc<dyn RecordWriter>) -> Self {
        Self {
            writer,
            groups: None,
            schema_column: platform.schema_column.clone(),
            notes_key: platform.notes_key.clone(),
            id_field: platform.id_field.clone(),
        }
    }

    pub fn with_groups(mut self, groups: Arc<dyn GroupTarget>) -> Self {
        self.groups = Some(groups);
        self
    }
}

pub struct RegistrationHandler {
    config: HandlerConfig,
    registry: Arc<SchemaRegistry>,
    engine: DiffEngine,
    target: RegistrationTarget,
    alert: Arc<dyn AdminAlert>,
    pacer: Arc<dyn Pacer>,
    dry_run: bool,
}

impl RegistrationHandler {
    pub fn new(
        config: HandlerConfig,
        registry: Arc<SchemaRegistry>,
        engine: DiffEngine,
        target: RegistrationTarget,
        alert: Arc<dyn AdminAlert>,
        pacer: Arc<dyn Pacer>,
        dry_run: bool,
    ) -> Self {
        Self {
            config,
            registry,
            engine,
            target,
            alert,
            pacer,
            dry_run,
        }
    }

    /// Form fields to a screened canonical record.
    pub fn build_record(&self, accepted: &AcceptedMessage) -> Result<(CanonicalRecord, bool), CoreError> {
        let fields = extract_form_fields(&accepted.message)?;
        if fields.is_empty() {
            return Err(CoreError::Handler("no form fields found in message body".into()));
        }
        let labels = self.registry.key_map(&self.config.form_column)?;
        let mut record = form_to_canonical(&fields, labels);

        let iban_included = screen_iban(&mut record);
        record.set(
            keys::MEMBERSHIP_START,
            Value::String(membership_start(accepted.date.date_naive()).to_string()),
        );
        if let Some(permission) = record.get_str(keys::NEWSLETTER_PERMISSION) {
            record.set(
                keys::NEWSLETTER_PERMISSION,
                Value::Bool(newsletter_consent(&permission)),
            );
        }
        if let Some(ref membership_type) = self.config.membership_type {
            record.set(keys::MEMBERSHIP_TYPE, Value::String(membership_type.clone()));
        }
        Ok((record, iban_included))
    }

    async fn add_to_groups(&self, record_id: &str) -> Vec<String> {
        let Some(ref target) = self.target.groups else {
            return Vec::new();
        };
        let reconciler = GroupReconciler::new(target.as_ref(), self.dry_run).create_missing(false);
        let mut added = Vec::new();
        for group in &self.config.groups {
            match reconciler.add_to_group(group, &[record_id.to_string()]).await {
                Ok(()) => added.push(group.clone()),
                Err(e) => warn!(group = %group, error = %e, "could not add new member to group"),
            }
        }
        added
    }
}

#[async_trait]
impl MailHandler for RegistrationHandler {
    fn address(&self) -> &str {
        &self.config.address
    }

    #[instrument(skip_all, fields(source = %accepted.source))]
    async fn handle(&self, accepted: &AcceptedMessage) -> Result<HandledMessage, CoreError> {
        let (record, iban_included) = self.build_record(accepted)?;
        let label = record.label();
        info!(record = %label, iban_included, "registration parsed");

        let operation = self.engine.plan_create(record.clone()).map_err(CoreError::Handler)?;

        let mut normalizer =
            Normalizer::new(&self.registry, &self.target.schema_column)?.with_notes_key(&self.target.notes_key);
        if let Some(ref field) = self.target.id_field {
            normalizer = normalizer.with_id_field(field);
        }
        let applicator = OperationApplicator::new(&normalizer, 1, self.pacer.as_ref(), self.dry_run);
        let report = applicator
            .apply(self.target.writer.as_ref(), std::slice::from_ref(&operation))
            .await?;
        if !report.is_clean() {
            return Err(CoreError::Handler(report.failures.join("; ")));
        }

        let record_id = report.created_ids.first().cloned();
        let groups = match record_id {
            Some(ref id) => self.add_to_groups(id).await,
            None => {
                debug!("no record id reported; group membership skipped");
                Vec::new()
            }
        };

        if self.dry_run {
            debug!("dry run, not executing");
        } else {
            let notice = RegistrationNotice {
                name: [record.first_name.as_deref(), record.last_name.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" "),
                email: record.email.clone(),
                record_id: record_id.clone(),
                groups: groups.clone(),
                iban_included,
                original_subject: accepted.subject(),
                original_message_id: accepted.message_id(),
            };
            if let Err(e) = self.alert.notify_registration(&notice).await {
                warn!(error = %e, "registration notification failed");
            }
        }

        Ok(HandledMessage {
            summary: format!("registered {label}"),
            record: Some(record),
            record_id,
            groups,
        })
    }
}

/// Drop an IBAN that is missing, too short or a "contact me" answer.
/// Returns whether one was kept.
pub fn screen_iban(record: &mut CanonicalRecord) -> bool {
    let keep = match record.get_str(keys::IBAN) {
        Some(iban) => {
            let iban = iban.trim();
            iban.len() >= MIN_IBAN_LEN && !iban.to_lowercase().contains("contact")
        }
        None => false,
    };
    if !keep {
        record.remove(keys::IBAN);
    }
    keep
}

/// Registrations over the summer start on 1 September.
pub fn membership_start(received: NaiveDate) -> NaiveDate {
    match received.month() {
        7 | 8 => NaiveDate::from_ymd_opt(received.year(), 9, 1).unwrap_or(received),
        _ => received,
    }
}

/// Free-text consent answer to a boolean.
pub fn newsletter_consent(answer: &str) -> bool {
    let answer = answer.trim().to_lowercase();
    answer == "1"
        || (answer.contains("agree") && !answer.contains("disagree"))
        || matches!(answer.as_str(), "yes" | "ja" | "true")
        || answer.contains("akkoord")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use chrono::{DateTime, FixedOffset};

    use super::*;
    use crate::apply::NoPacing;
    use crate::config::HandlerKind;
    use crate::diff::DiffPolicy;
    use crate::email::dkim::VerifiedSignature;
    use crate::email::gate::Rejection;
    use crate::email::message::RawMessage;
    use crate::errors::{ApiRequestError, NotificationError};
    use crate::platform::GroupInfo;

    const FORM: &str = "From: Forms <forms@example.org>\r\n\
        To: register@members.example.org\r\n\
        Subject: Nieuwe inschrijving\r\n\
        Message-ID: <reg-1@example.org>\r\n\
        Content-Type: text/html; charset=utf-8\r\n\
        \r\n\
        <table>\r\n\
        <tr><td><strong>Voornaam</strong></td><td>Ann</td></tr>\r\n\
        <tr><td><strong>Achternaam</strong></td><td>de Vries</td></tr>\r\n\
        <tr><td><strong>E-mail</strong></td><td>ann@example.org</td></tr>\r\n\
        <tr><td><strong>IBAN</strong></td><td>Graag contact</td></tr>\r\n\
        <tr><td><strong>Nieuwsbrief</strong></td><td>Ja, akkoord</td></tr>\r\n\
        <tr><td><strong>Privacy</strong></td><td>Agree</td></tr>\r\n\
        </table>\r\n";

    #[derive(Default)]
    struct Writer {
        created: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl RecordWriter for Writer {
        async fn create(&self, payload: &Value) -> Result<Option<String>, ApiRequestError> {
            self.created.lock().unwrap().push(payload.clone());
            Ok(Some("1042".into()))
        }
        async fn update(&self, _: &str, _: &Value) -> Result<(), ApiRequestError> {
            Ok(())
        }
        async fn delete(&self, _: &str) -> Result<(), ApiRequestError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Groups {
        added: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl GroupTarget for Groups {
        async fn list_groups(&self) -> Result<Vec<GroupInfo>, ApiRequestError> {
            Ok(vec![GroupInfo { id: "g1".into(), name: "Leden".into() }])
        }
        async fn members(&self, _: &str) -> Result<BTreeSet<String>, ApiRequestError> {
            Ok(BTreeSet::new())
        }
        async fn create_group(&self, name: &str) -> Result<String, ApiRequestError> {
            Ok(name.to_string())
        }
        async fn add_members(&self, group_id: &str, ids: &[String]) -> Result<(), ApiRequestError> {
            self.added.lock().unwrap().push((group_id.to_string(), ids.to_vec()));
            Ok(())
        }
        async fn remove_members(&self, _: &str, _: &[String]) -> Result<(), ApiRequestError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Alerts {
        registrations: Mutex<Vec<RegistrationNotice>>,
    }

    #[async_trait]
    impl AdminAlert for Alerts {
        async fn notify_rejection(&self, _: &Rejection) -> Result<(), NotificationError> {
            Ok(())
        }
        async fn notify_handler_failure(&self, _: &str, _: Option<&str>, _: &str) -> Result<(), NotificationError> {
            Ok(())
        }
        async fn notify_registration(&self, notice: &RegistrationNotice) -> Result<(), NotificationError> {
            self.registrations.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    fn registry() -> Arc<SchemaRegistry> {
        let headers: Vec<String> = ["Key", "RegisterForm", "Admin"].iter().map(|s| s.to_string()).collect();
        let rows: Vec<Vec<String>> = [
            ["first_name", "Voornaam", "voornaam"],
            ["last_name", "Achternaam", "achternaam"],
            ["email", "E-mail", "email"],
            ["iban", "IBAN", "iban"],
            ["newsletter_permission", "Nieuwsbrief", "nieuwsbrief"],
            ["membership_start", "", "lid_sinds"],
            ["membership_type", "", "soort"],
            ["agreements", "", "akkoorden"],
            ["notes", "", "opmerkingen"],
        ]
        .iter()
        .map(|row| row.iter().map(|s| s.to_string()).collect())
        .collect();
        Arc::new(SchemaRegistry::from_rows("Key", &headers, &rows).unwrap())
    }

    fn accepted(date: &str) -> AcceptedMessage {
        AcceptedMessage {
            message: RawMessage::parse(FORM.as_bytes()).unwrap(),
            signature: VerifiedSignature {
                domain: "example.org".into(),
                selector: "mail".into(),
                signed_headers: vec!["from".into()],
            },
            sender: "forms@example.org".into(),
            date: DateTime::<FixedOffset>::parse_from_rfc3339(date).unwrap(),
            delivery_address: "register@members.example.org".into(),
            source: "reg.eml".into(),
        }
    }

    fn handler(
        writer: Arc<Writer>,
        groups: Arc<Groups>,
        alerts: Arc<Alerts>,
        dry_run: bool,
    ) -> RegistrationHandler {
        let config = HandlerConfig {
            address: "register@members.example.org".into(),
            kind: HandlerKind::Registration,
            form_column: "RegisterForm".into(),
            target: "admin".into(),
            groups: vec!["Leden".into()],
            membership_type: Some("Lid".into()),
        };
        let policy = DiffPolicy {
            fields: Vec::new(),
            participation: Vec::new(),
            identity_fields: Vec::new(),
            required: vec!["email".into()],
            blocked_ids: BTreeSet::new(),
            ignore_marker: None,
        };
        let target = RegistrationTarget {
            writer,
            groups: Some(groups),
            schema_column: "Admin".into(),
            notes_key: "notes".into(),
            id_field: None,
        };
        RegistrationHandler::new(
            config,
            registry(),
            DiffEngine::new(policy, NaiveDate::from_ymd_opt(2025, 7, 14).unwrap()),
            target,
            alerts,
            Arc::new(NoPacing),
            dry_run,
        )
    }

    #[tokio::test]
    async fn test_registration_creates_and_groups() {
        let writer = Arc::new(Writer::default());
        let groups = Arc::new(Groups::default());
        let alerts = Arc::new(Alerts::default());
        let h = handler(writer.clone(), groups.clone(), alerts.clone(), false);

        let handled = h.handle(&accepted("2025-07-14T23:30:00+02:00")).await.unwrap();
        assert_eq!(handled.record_id.as_deref(), Some("1042"));
        assert_eq!(handled.groups, vec!["Leden".to_string()]);

        let created = writer.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        let payload = &created[0];
        assert_eq!(payload["voornaam"], "Ann");
        assert_eq!(payload["lid_sinds"], "2025-09-01");
        assert_eq!(payload["soort"], "Lid");
        assert_eq!(payload["nieuwsbrief"], true);
        assert!(payload.get("iban").is_none());

        assert_eq!(groups.added.lock().unwrap()[0], ("g1".to_string(), vec!["1042".to_string()]));
        let notices = alerts.registrations.lock().unwrap();
        assert!(!notices[0].iban_included);
        assert_eq!(notices[0].original_message_id.as_deref(), Some("<reg-1@example.org>"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let writer = Arc::new(Writer::default());
        let groups = Arc::new(Groups::default());
        let alerts = Arc::new(Alerts::default());
        let h = handler(writer.clone(), groups.clone(), alerts.clone(), true);

        let handled = h.handle(&accepted("2025-10-02T09:00:00+02:00")).await.unwrap();
        assert!(handled.record_id.is_none());
        assert!(writer.created.lock().unwrap().is_empty());
        assert!(groups.added.lock().unwrap().is_empty());
        assert!(alerts.registrations.lock().unwrap().is_empty());
        let record = handled.record.unwrap();
        assert_eq!(record.get_str("membership_start").as_deref(), Some("2025-10-02"));
    }

    #[test]
    fn test_screen_iban() {
        let mut record = CanonicalRecord::new();
        assert!(!screen_iban(&mut record));

        record.set(keys::IBAN, Value::String("NL91ABNA0417164300".into()));
        assert!(screen_iban(&mut record));

        record.set(keys::IBAN, Value::String("NL91".into()));
        assert!(!screen_iban(&mut record));
        assert!(record.get(keys::IBAN).is_none());
    }

    #[test]
    fn test_membership_start() {
        let d = |m, day| NaiveDate::from_ymd_opt(2025, m, day).unwrap();
        assert_eq!(membership_start(d(7, 1)), d(9, 1));
        assert_eq!(membership_start(d(8, 31)), d(9, 1));
        assert_eq!(membership_start(d(6, 30)), d(6, 30));
        assert_eq!(membership_start(d(9, 2)), d(9, 2));
    }

    #[test]
    fn test_newsletter_consent() {
        assert!(newsletter_consent("1"));
        assert!(newsletter_consent("I agree"));
        assert!(!newsletter_consent("I disagree"));
        assert!(newsletter_consent("Ja"));
        assert!(newsletter_consent("Ik ga akkoord"));
        assert!(!newsletter_consent("nee"));
    }
}
