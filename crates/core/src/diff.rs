//! Reconciliation diff engine.
//!
//! Turns matched source/target records into create, update and delete
//! operations. Desired values are resolved first-non-null over
//! primary -> secondary -> current target record. Participation flags
//! ("should receive the newsletter") are derived from membership status,
//! never copied. A record whose participation changes, or whose identity
//! fields disagree with the target, is removed and re-added as a whole.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::matcher::{IdentityMatcher, MatchAmbiguity, MatchMethod};
use crate::record::{keys, value_to_string, CanonicalRecord};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// One planned change against a target system.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Create(CanonicalRecord),
    Update {
        id: String,
        changes: BTreeMap<String, Value>,
    },
    Delete {
        id: String,
    },
}

impl Operation {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Create(_) => "CREATE",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
        }
    }

    /// Target-side id for updates and deletes; identity for creates.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Create(record) => record.identity(),
            Self::Update { id, .. } | Self::Delete { id } => Some(id),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Delete { .. } => 0,
            Self::Update { .. } => 1,
            Self::Create(_) => 2,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create(record) => write!(f, "CREATE {}", record.label()),
            Self::Update { id, changes } => {
                let fields: Vec<&str> = changes.keys().map(String::as_str).collect();
                write!(f, "UPDATE {id} [{}]", fields.join(", "))
            }
            Self::Delete { id } => write!(f, "DELETE {id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Which source makes a record eligible for a participation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    /// Primary record present with no past membership end.
    Member,
    /// Secondary record present without a deregistration request.
    Alumnus,
}

/// A derived boolean field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationRule {
    pub flag: String,
    pub audience: Audience,
    /// Canonical keys that must have a value for the flag to be set.
    #[serde(default)]
    pub requires: Vec<String>,
}

/// Everything the engine needs to decide on operations.
#[derive(Debug, Clone)]
pub struct DiffPolicy {
    pub fields: Vec<String>,
    pub participation: Vec<ParticipationRule>,
    pub identity_fields: Vec<String>,
    pub required: Vec<String>,
    /// Membership ids whose participation flags are forced off.
    pub blocked_ids: BTreeSet<String>,
    pub ignore_marker: Option<String>,
}

impl DiffPolicy {
    pub fn from_config(config: &ReconcileConfig, blocked_ids: BTreeSet<String>) -> Self {
        Self {
            fields: config.fields.clone(),
            participation: config.participation.clone(),
            identity_fields: config.identity_fields.clone(),
            required: config.required.clone(),
            blocked_ids,
            ignore_marker: Some(config.ignore_marker.clone()).filter(|m| !m.is_empty()),
        }
    }
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default(), BTreeSet::new())
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// The records describing one person across the systems of a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileEntry {
    pub primary: Option<CanonicalRecord>,
    pub secondary: Option<CanonicalRecord>,
    pub current: Option<CanonicalRecord>,
    pub method: Option<MatchMethod>,
}

impl ReconcileEntry {
    fn label(&self) -> String {
        [&self.primary, &self.secondary, &self.current]
            .into_iter()
            .flatten()
            .next()
            .map(|r| r.label())
            .unwrap_or_else(|| "<empty>".into())
    }
}

/// Entries plus the soft matching failures found while building them.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub entries: Vec<ReconcileEntry>,
    pub ambiguous: Vec<MatchAmbiguity>,
}

/// Pair primary and secondary source records with the target's records.
///
/// Each target record is matched against both sources independently;
/// source records left over are paired with each other by primary key only.
pub fn assemble_entries(
    matcher: &IdentityMatcher,
    primary: &[CanonicalRecord],
    secondary: &[CanonicalRecord],
    current: &[CanonicalRecord],
) -> Assembly {
    let by_primary = matcher.match_records(primary, current);
    let by_secondary = matcher.match_records(secondary, current);

    let ambiguous_b: BTreeSet<usize> = by_primary
        .ambiguous
        .iter()
        .chain(&by_secondary.ambiguous)
        .map(|a| a.b)
        .collect();

    let mut assembly = Assembly::default();
    for (j, cur) in current.iter().enumerate() {
        let p = by_primary.partner_of_b(j);
        let s = by_secondary.partner_of_b(j);
        let method = [p, s]
            .into_iter()
            .flatten()
            .map(|m| m.method)
            .min_by_key(|m| match m {
                MatchMethod::PrimaryKey => 0,
                MatchMethod::Fuzzy => 1,
            });
        if p.is_none() && s.is_none() && ambiguous_b.contains(&j) {
            continue;
        }
        assembly.entries.push(ReconcileEntry {
            primary: p.map(|m| primary[m.a].clone()),
            secondary: s.map(|m| secondary[m.a].clone()),
            current: Some(cur.clone()),
            method,
        });
    }

    let rest_primary: Vec<CanonicalRecord> = by_primary
        .unmatched_a
        .iter()
        .map(|&i| primary[i].clone())
        .collect();
    let rest_secondary: Vec<CanonicalRecord> = by_secondary
        .unmatched_a
        .iter()
        .map(|&i| secondary[i].clone())
        .collect();

    let pairing = matcher
        .exact_only()
        .match_records(&rest_primary, &rest_secondary);
    for m in &pairing.matches {
        assembly.entries.push(ReconcileEntry {
            primary: Some(rest_primary[m.a].clone()),
            secondary: Some(rest_secondary[m.b].clone()),
            current: None,
            method: None,
        });
    }
    for &i in &pairing.unmatched_a {
        assembly.entries.push(ReconcileEntry {
            primary: Some(rest_primary[i].clone()),
            ..Default::default()
        });
    }
    for &j in &pairing.unmatched_b {
        assembly.entries.push(ReconcileEntry {
            secondary: Some(rest_secondary[j].clone()),
            ..Default::default()
        });
    }

    assembly.ambiguous = by_primary
        .ambiguous
        .into_iter()
        .chain(by_secondary.ambiguous)
        .collect();
    debug!(
        entries = assembly.entries.len(),
        ambiguous = assembly.ambiguous.len(),
        "assembled reconcile entries"
    );
    assembly
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// An entry that produced no operation on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub label: String,
    pub reason: String,
}

/// Ordered operations: deletes, then updates, then creates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcilePlan {
    pub operations: Vec<Operation>,
    pub skipped: Vec<SkippedEntry>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.operations.iter().filter(|op| op.verb() == verb).count()
    }
}

/// Computes operations from entries.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    policy: DiffPolicy,
    today: NaiveDate,
}

impl DiffEngine {
    pub fn new(policy: DiffPolicy, today: NaiveDate) -> Self {
        Self { policy, today }
    }

    pub fn policy(&self) -> &DiffPolicy {
        &self.policy
    }

    /// Plan the operations for a whole pass.
    pub fn plan(&self, entries: &[ReconcileEntry]) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();
        for entry in entries {
            if let Err(reason) = self.plan_entry(entry, &mut plan.operations) {
                warn!(record = %entry.label(), reason = %reason, "skipping entry");
                plan.skipped.push(SkippedEntry {
                    label: entry.label(),
                    reason,
                });
            }
        }
        plan.operations.sort_by_key(Operation::rank);

        info!(
            creates = plan.count("CREATE"),
            updates = plan.count("UPDATE"),
            deletes = plan.count("DELETE"),
            skipped = plan.skipped.len(),
            "reconcile plan computed"
        );
        plan
    }

    /// Plan the creation of a single new record (the mail ingestion path).
    pub fn plan_create(&self, record: CanonicalRecord) -> Result<Operation, String> {
        let missing = self.missing_required(&record);
        if !missing.is_empty() {
            return Err(format!("missing required field(s): {}", missing.join(", ")));
        }
        Ok(Operation::Create(record))
    }

    fn plan_entry(&self, entry: &ReconcileEntry, ops: &mut Vec<Operation>) -> Result<(), String> {
        if let (Some(cur), Some(marker)) = (&entry.current, &self.policy.ignore_marker) {
            if cur.membership_id.as_deref() == Some(marker.as_str()) {
                return Err(format!("membership id is '{marker}'"));
            }
        }

        let has_source = entry.primary.is_some() || entry.secondary.is_some();

        if !has_source {
            let Some(cur) = &entry.current else {
                return Ok(());
            };
            if self.policy.participation.is_empty() || self.participates(cur) {
                let id = write_id(cur)?;
                info!(record = %cur.label(), "DELETE no longer in any source");
                ops.push(Operation::Delete { id });
            }
            return Ok(());
        }

        let desired = self.desired(entry);
        let missing = self.missing_required(&desired);
        if !missing.is_empty() {
            return Err(format!("missing required field(s): {}", missing.join(", ")));
        }

        let Some(cur) = &entry.current else {
            if self.wants_any(&desired) {
                info!(record = %desired.label(), "CREATE");
                ops.push(Operation::Create(desired));
            } else {
                debug!(record = %desired.label(), "not participating; nothing to create");
            }
            return Ok(());
        };

        let identity_conflict = self.identity_conflict(cur, &desired);
        let flags_differ = self
            .policy
            .participation
            .iter()
            .any(|rule| cur.is_truthy(&rule.flag) != desired.is_truthy(&rule.flag));

        if identity_conflict || flags_differ {
            let id = write_id(cur)?;
            if identity_conflict {
                warn!(
                    current = %cur.label(),
                    desired = %desired.label(),
                    "identity fields disagree; re-adding record"
                );
            }
            info!(
                record = %desired.label(),
                flags = %format!("{} -> {}", self.flag_string(cur), self.flag_string(&desired)),
                "DELETE and re-add"
            );
            ops.push(Operation::Delete { id });
            if self.wants_any(&desired) {
                ops.push(Operation::Create(desired));
            }
            return Ok(());
        }

        let changes = self.changed_fields(cur, &desired);
        if !changes.is_empty() {
            let id = write_id(cur)?;
            info!(
                record = %desired.label(),
                fields = ?changes.keys().collect::<Vec<_>>(),
                "UPDATE"
            );
            ops.push(Operation::Update { id, changes });
        }
        Ok(())
    }

    /// First non-null value per field over primary, secondary, current.
    fn desired(&self, entry: &ReconcileEntry) -> CanonicalRecord {
        let chain = [&entry.primary, &entry.secondary, &entry.current];
        let mut desired = CanonicalRecord::new();

        for field in &self.policy.fields {
            if let Some(value) = chain.into_iter().flatten().find_map(|r| r.get(field)) {
                desired.set(field, value);
            }
        }

        let member = entry
            .primary
            .as_ref()
            .map(|p| self.membership_active(p))
            .unwrap_or(false);
        let alumnus = entry
            .secondary
            .as_ref()
            .map(|s| !s.is_truthy(keys::REQUESTED_DEREGISTRATION))
            .unwrap_or(false);
        let blocked = [&entry.primary, &entry.secondary]
            .into_iter()
            .flatten()
            .filter_map(|r| r.membership_id.as_deref())
            .any(|id| self.policy.blocked_ids.contains(id));

        for rule in &self.policy.participation {
            let eligible = match rule.audience {
                Audience::Member => member,
                Audience::Alumnus => alumnus,
            };
            let supported = rule.requires.iter().all(|k| desired.get(k).is_some());
            desired.set(&rule.flag, Value::Bool(!blocked && eligible && supported));
        }

        desired.external_id = entry.current.as_ref().and_then(|c| c.external_id.clone());
        desired
    }

    fn membership_active(&self, record: &CanonicalRecord) -> bool {
        let Some(end) = record.get_str(keys::MEMBERSHIP_END) else {
            return true;
        };
        let day = end.get(..10).unwrap_or(end.as_str());
        match NaiveDate::parse_from_str(day, "%Y-%m-%d") {
            Ok(date) => date > self.today,
            Err(_) => {
                warn!(record = %record.label(), membership_end = %end, "unparseable membership end; treating as active");
                true
            }
        }
    }

    fn participates(&self, record: &CanonicalRecord) -> bool {
        self.policy
            .participation
            .iter()
            .any(|rule| record.is_truthy(&rule.flag))
    }

    fn wants_any(&self, desired: &CanonicalRecord) -> bool {
        self.policy.participation.is_empty() || self.participates(desired)
    }

    fn identity_conflict(&self, current: &CanonicalRecord, desired: &CanonicalRecord) -> bool {
        self.policy.identity_fields.iter().any(|field| {
            match (current.get_str(field), desired.get_str(field)) {
                (Some(c), Some(d)) => c != d,
                _ => false,
            }
        })
    }

    fn changed_fields(
        &self,
        current: &CanonicalRecord,
        desired: &CanonicalRecord,
    ) -> BTreeMap<String, Value> {
        self.policy
            .fields
            .iter()
            .filter_map(|field| {
                let want = desired.get(field)?;
                let have = current.get(field);
                let same = have
                    .as_ref()
                    .map(|h| value_to_string(h) == value_to_string(&want))
                    .unwrap_or(false);
                (!same).then(|| (field.clone(), want))
            })
            .collect()
    }

    fn missing_required(&self, record: &CanonicalRecord) -> Vec<String> {
        self.policy
            .required
            .iter()
            .filter(|k| record.get(k).is_none())
            .cloned()
            .collect()
    }

    fn flag_string(&self, record: &CanonicalRecord) -> String {
        self.policy
            .participation
            .iter()
            .map(|rule| {
                if record.is_truthy(&rule.flag) {
                    rule.flag.chars().next().unwrap_or('+')
                } else {
                    '-'
                }
            })
            .collect()
    }
}

fn write_id(record: &CanonicalRecord) -> Result<String, String> {
    record
        .write_id()
        .map(str::to_string)
        .ok_or_else(|| "target record has no id".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    fn plain_engine() -> DiffEngine {
        let policy = DiffPolicy {
            participation: Vec::new(),
            ..DiffPolicy::default()
        };
        DiffEngine::new(policy, today())
    }

    fn rec(pairs: &[(&str, Value)]) -> CanonicalRecord {
        CanonicalRecord::from_pairs(pairs.iter().cloned())
    }

    #[test]
    fn test_new_source_record_is_created() {
        let entry = ReconcileEntry {
            primary: Some(rec(&[("membership_id", json!("id1")), ("email", json!("a@x"))])),
            ..Default::default()
        };
        let plan = plain_engine().plan(&[entry]);
        assert_eq!(plan.operations.len(), 1);
        assert!(matches!(plan.operations[0], Operation::Create(ref r) if r.identity() == Some("id1")));
    }

    #[test]
    fn test_orphaned_target_record_is_deleted() {
        let entry = ReconcileEntry {
            current: Some(rec(&[("membership_id", json!("id1")), ("email", json!("a@x"))])),
            ..Default::default()
        };
        let plan = plain_engine().plan(&[entry]);
        assert_eq!(plan.operations, vec![Operation::Delete { id: "id1".into() }]);
    }

    #[test]
    fn test_changed_field_is_updated() {
        let entry = ReconcileEntry {
            primary: Some(rec(&[
                ("membership_id", json!("id1")),
                ("email", json!("new@x")),
                ("first_name", json!("Ada")),
            ])),
            current: Some(rec(&[
                ("membership_id", json!("id1")),
                ("email", json!("old@x")),
                ("first_name", json!("Ada")),
            ])),
            ..Default::default()
        };
        let plan = plain_engine().plan(&[entry]);
        assert_eq!(
            plan.operations,
            vec![Operation::Update {
                id: "id1".into(),
                changes: BTreeMap::from([("email".to_string(), json!("new@x"))]),
            }]
        );
    }

    #[test]
    fn test_first_non_null_wins() {
        let entry = ReconcileEntry {
            primary: Some(rec(&[("email", json!("a@x"))])),
            secondary: Some(rec(&[("email", json!("b@x")), ("first_name", json!("Alum"))])),
            current: Some(rec(&[
                ("email", json!("a@x")),
                ("first_name", json!("Alum")),
                ("last_name", json!("Kept")),
            ])),
            ..Default::default()
        };
        // Every desired value equals the current one: nothing to do.
        let plan = plain_engine().plan(&[entry]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_identity_conflict_forces_readd() {
        let entry = ReconcileEntry {
            primary: Some(rec(&[("email", json!("a@x")), ("last_name", json!("Byron"))])),
            current: Some(rec(&[("email", json!("a@x")), ("last_name", json!("Lovelace"))])),
            ..Default::default()
        };
        let plan = plain_engine().plan(&[entry]);
        assert_eq!(plan.operations.len(), 2);
        assert!(matches!(plan.operations[0], Operation::Delete { ref id } if id == "a@x"));
        assert!(matches!(plan.operations[1], Operation::Create(_)));
    }

    #[test]
    fn test_participation_derived_from_membership() {
        let engine = DiffEngine::new(DiffPolicy::default(), today());
        let entry = ReconcileEntry {
            primary: Some(rec(&[
                ("email", json!("a@x")),
                ("membership_end", json!("2024-12-31")),
            ])),
            current: Some(rec(&[
                ("email", json!("a@x")),
                ("send_newsletter", json!(true)),
            ])),
            ..Default::default()
        };
        // Membership ended: the newsletter flag turns off, so the record
        // is removed and, wanting nothing, not re-added.
        let plan = engine.plan(&[entry]);
        assert_eq!(plan.operations, vec![Operation::Delete { id: "a@x".into() }]);
    }

    #[test]
    fn test_birthday_requires_date_of_birth() {
        let engine = DiffEngine::new(DiffPolicy::default(), today());
        let entry = ReconcileEntry {
            primary: Some(rec(&[("email", json!("a@x"))])),
            ..Default::default()
        };
        let plan = engine.plan(&[entry]);
        let Operation::Create(ref r) = plan.operations[0] else {
            panic!("expected create");
        };
        assert!(r.is_truthy("send_newsletter"));
        assert!(!r.is_truthy("send_birthday"));
        assert!(!r.is_truthy("send_birthday_alumnus"));
    }

    #[test]
    fn test_alumnus_deregistration() {
        let engine = DiffEngine::new(DiffPolicy::default(), today());
        let entry = ReconcileEntry {
            secondary: Some(rec(&[
                ("email", json!("old@x")),
                ("date_of_birth", json!("1980-01-01")),
                ("requested_deregistration", json!(true)),
            ])),
            ..Default::default()
        };
        let plan = engine.plan(&[entry]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_blocked_ids_force_flags_off() {
        let policy = DiffPolicy {
            blocked_ids: BTreeSet::from(["7".to_string()]),
            ..DiffPolicy::default()
        };
        let engine = DiffEngine::new(policy, today());
        let entry = ReconcileEntry {
            primary: Some(rec(&[("membership_id", json!("7")), ("email", json!("a@x"))])),
            ..Default::default()
        };
        assert!(engine.plan(&[entry]).is_empty());
    }

    #[test]
    fn test_ignore_marker_skips_entry() {
        let entry = ReconcileEntry {
            current: Some(rec(&[("membership_id", json!("ignore")), ("email", json!("a@x"))])),
            ..Default::default()
        };
        let plan = plain_engine().plan(&[entry]);
        assert!(plan.is_empty());
        assert_eq!(plan.skipped.len(), 1);
    }

    #[test]
    fn test_required_field_missing_skips() {
        let entry = ReconcileEntry {
            primary: Some(rec(&[("membership_id", json!("id9")), ("first_name", json!("No"))])),
            ..Default::default()
        };
        let plan = plain_engine().plan(&[entry]);
        assert!(plan.is_empty());
        assert!(plan.skipped[0].reason.contains("email"));
    }

    #[test]
    fn test_removals_ordered_before_additions() {
        let entries = vec![
            ReconcileEntry {
                primary: Some(rec(&[("email", json!("new@x"))])),
                ..Default::default()
            },
            ReconcileEntry {
                current: Some(rec(&[("email", json!("gone@x"))])),
                ..Default::default()
            },
        ];
        let plan = plain_engine().plan(&entries);
        assert_eq!(plan.operations[0].verb(), "DELETE");
        assert_eq!(plan.operations[1].verb(), "CREATE");
    }

    #[test]
    fn test_unparseable_membership_end_counts_as_active() {
        let engine = DiffEngine::new(DiffPolicy::default(), today());
        let entry = ReconcileEntry {
            primary: Some(rec(&[("email", json!("a@x")), ("membership_end", json!("soon"))])),
            ..Default::default()
        };
        let plan = engine.plan(&[entry]);
        assert_eq!(plan.count("CREATE"), 1);
    }

    #[test]
    fn test_assemble_pairs_sources_and_target() {
        let primary = vec![rec(&[("email", json!("m@x"))]), rec(&[("email", json!("both@x"))])];
        let secondary = vec![rec(&[("email", json!("both@x"))]), rec(&[("email", json!("alum@x"))])];
        let current = vec![rec(&[("email", json!("m@x"))]), rec(&[("email", json!("gone@x"))])];

        let assembly = assemble_entries(&IdentityMatcher::default(), &primary, &secondary, &current);
        assert_eq!(assembly.entries.len(), 4);

        let first = &assembly.entries[0];
        assert!(first.primary.is_some() && first.current.is_some());
        assert_eq!(first.method, Some(MatchMethod::PrimaryKey));

        let gone = &assembly.entries[1];
        assert!(gone.primary.is_none() && gone.secondary.is_none());

        let both = &assembly.entries[2];
        assert_eq!(both.primary.as_ref().and_then(|r| r.email.as_deref()), Some("both@x"));
        assert_eq!(both.secondary.as_ref().and_then(|r| r.email.as_deref()), Some("both@x"));

        let alum = &assembly.entries[3];
        assert!(alum.primary.is_none() && alum.secondary.is_some());
    }

    #[test]
    fn test_ambiguous_target_record_is_left_alone() {
        let twin = |email: &str| {
            rec(&[
                ("email", json!(email)),
                ("first_name", json!("Sam")),
                ("last_name", json!("Twin")),
                ("date_of_birth", json!("2001-05-05")),
            ])
        };
        let primary = vec![twin("one@x"), twin("two@x")];
        let current = vec![twin("old@x")];

        let assembly = assemble_entries(&IdentityMatcher::default(), &primary, &[], &current);
        assert_eq!(assembly.ambiguous.len(), 1);
        assert!(assembly.entries.iter().all(|e| e.current.is_none()));

        let plan = plain_engine().plan(&assembly.entries);
        assert_eq!(plan.count("DELETE"), 0);
    }

    #[test]
    fn test_plan_create_checks_required() {
        let engine = plain_engine();
        assert!(engine.plan_create(rec(&[("first_name", json!("X"))])).is_err());
        assert!(matches!(
            engine.plan_create(rec(&[("email", json!("x@x"))])),
            Ok(Operation::Create(_))
        ));
    }
}
