//! Reconciliation passes.
//!
//! The [`SyncEngine`] ties the pieces together for one invocation:
//!
//! 1. Load each platform's records and normalize them to canonical keys.
//! 2. Pair them by identity (primary source, secondary source, target).
//! 3. Plan create/update/delete operations.
//! 4. Apply the plan in paced batches, or only log it on a dry run.
//!
//! Nothing is persisted between passes; every pass recomputes from the
//! live state of the platforms.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::apply::{pacer_for, ApplyReport, MarkAndSweep, OperationApplicator, Pacer, TrackingReport};
use crate::config::{AppConfig, ApplicatorConfig, PlatformConfig, ReconcileConfig, TrackingConfig};
use crate::diff::{assemble_entries, DiffEngine, DiffPolicy, Operation, ReconcilePlan};
use crate::errors::{ApiRequestError, CoreError, SchemaError};
use crate::groups::{id_mapping, translate_ids, GroupReconciler, GroupSyncReport};
use crate::matcher::{IdentityMatcher, MatchAmbiguity};
use crate::normalize::Normalizer;
use crate::notify::RunSummary;
use crate::platform::{GroupTarget, RecordSource, RecordWriter, UpsertTarget};
use crate::record::CanonicalRecord;
use crate::schema::SchemaRegistry;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a record-level pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordsOutcome {
    pub plan: ReconcilePlan,
    pub ambiguous: Vec<MatchAmbiguity>,
    pub report: ApplyReport,
}

impl RecordsOutcome {
    pub fn summary(&self, label: &str) -> RunSummary {
        RunSummary {
            label: label.to_string(),
            created: self.plan.count("CREATE"),
            updated: self.plan.count("UPDATE"),
            deleted: self.plan.count("DELETE"),
            failed: self.report.failed,
            skipped: self.plan.skipped.len() + self.ambiguous.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    registry: Arc<SchemaRegistry>,
    reconcile: ReconcileConfig,
    tracking: TrackingConfig,
    applicator: ApplicatorConfig,
    pacer: Arc<dyn Pacer>,
    dry_run: bool,
    today: NaiveDate,
}

impl SyncEngine {
    pub fn new(config: &AppConfig, registry: Arc<SchemaRegistry>, dry_run: bool) -> Self {
        info!(dry_run, "initializing sync engine");
        Self {
            registry,
            reconcile: config.reconcile.clone(),
            tracking: config.tracking.clone(),
            applicator: config.applicator.clone(),
            pacer: Arc::from(pacer_for(config.applicator.pacing_ms)),
            dry_run,
            today: Local::now().date_naive(),
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    /// Fix the date membership ends are compared with.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn normalizer(&self, platform: &PlatformConfig) -> Result<Normalizer<'_>, SchemaError> {
        let normalizer =
            Normalizer::new(&self.registry, &platform.schema_column)?.with_notes_key(&platform.notes_key);
        Ok(match platform.id_field {
            Some(ref field) => normalizer.with_id_field(field),
            None => normalizer,
        })
    }

    /// Fetch and normalize every record of a platform.
    #[instrument(skip(self, source, platform), fields(system = %platform.schema_column))]
    pub async fn load(
        &self,
        source: &dyn RecordSource,
        platform: &PlatformConfig,
    ) -> Result<Vec<CanonicalRecord>, CoreError> {
        let normalizer = self.normalizer(platform)?;
        let raw = source.list_records().await?;
        let records = normalizer.to_canonical_all(&raw);
        info!(count = records.len(), "records loaded");
        Ok(records)
    }

    /// Membership ids in the configured block group of `groups`.
    pub async fn blocked_ids(&self, groups: Option<&dyn GroupTarget>) -> Result<BTreeSet<String>, ApiRequestError> {
        let (Some(name), Some(groups)) = (self.reconcile.block_group.as_deref(), groups) else {
            return Ok(BTreeSet::new());
        };
        let reconciler = GroupReconciler::new(groups, true).create_missing(false);
        let ids = match reconciler.resolve_group(name).await? {
            Some((id, _)) => groups.members(&id).await?,
            None => BTreeSet::new(),
        };
        info!(group = name, count = ids.len(), "blocked membership ids loaded");
        Ok(ids)
    }

    pub fn pacer(&self) -> Arc<dyn Pacer> {
        Arc::clone(&self.pacer)
    }

    /// A diff engine under the configured policy.
    pub fn diff_engine(&self, blocked: BTreeSet<String>) -> DiffEngine {
        DiffEngine::new(DiffPolicy::from_config(&self.reconcile, blocked), self.today)
    }

    fn matcher(&self) -> IdentityMatcher {
        IdentityMatcher::new(self.reconcile.primary_key)
    }

    /// Plan a record-level pass without touching any platform.
    pub fn plan_records(
        &self,
        primary: &[CanonicalRecord],
        secondary: &[CanonicalRecord],
        current: &[CanonicalRecord],
        blocked: BTreeSet<String>,
    ) -> (ReconcilePlan, Vec<MatchAmbiguity>) {
        let assembly = assemble_entries(&self.matcher(), primary, secondary, current);
        for ambiguity in &assembly.ambiguous {
            warn!(
                record = %current.get(ambiguity.b).map(|r| r.label()).unwrap_or_default(),
                candidates = ambiguity.candidates.len(),
                "ambiguous fuzzy match; record left alone"
            );
        }
        let plan = self.diff_engine(blocked).plan(&assembly.entries);
        (plan, assembly.ambiguous)
    }

    /// Reconcile `target` with the sources and write the difference.
    #[instrument(skip_all, fields(target = %target_platform.schema_column, dry_run = self.dry_run))]
    pub async fn sync_records(
        &self,
        primary: &[CanonicalRecord],
        secondary: &[CanonicalRecord],
        current: &[CanonicalRecord],
        blocked: BTreeSet<String>,
        target_platform: &PlatformConfig,
        writer: &dyn RecordWriter,
    ) -> Result<RecordsOutcome, CoreError> {
        let (plan, ambiguous) = self.plan_records(primary, secondary, current, blocked);
        if plan.is_empty() {
            info!("target already up to date");
        }

        let normalizer = self.normalizer(target_platform)?;
        let applicator =
            OperationApplicator::new(&normalizer, self.applicator.batch_size, self.pacer.as_ref(), self.dry_run);
        let report = applicator.apply(writer, &plan.operations).await?;

        Ok(RecordsOutcome {
            plan,
            ambiguous,
            report,
        })
    }

    /// The records a full pass would want to exist, ignoring any target.
    pub fn desired_records(
        &self,
        primary: &[CanonicalRecord],
        secondary: &[CanonicalRecord],
        blocked: BTreeSet<String>,
    ) -> Vec<CanonicalRecord> {
        let (plan, _) = self.plan_records(primary, secondary, &[], blocked);
        plan.operations
            .into_iter()
            .filter_map(|op| match op {
                Operation::Create(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Mark-and-sweep pass into an upsert-only target.
    #[instrument(skip_all, fields(record_set = record_set, dry_run = self.dry_run))]
    pub async fn sync_tracked(
        &self,
        primary: &[CanonicalRecord],
        secondary: &[CanonicalRecord],
        blocked: BTreeSet<String>,
        record_set: &str,
        target_platform: Option<&PlatformConfig>,
        target: &dyn UpsertTarget,
    ) -> Result<TrackingReport, CoreError> {
        let desired = self.desired_records(primary, secondary, blocked);
        let normalizer = target_platform.map(|p| self.normalizer(p)).transpose()?;

        let sweep = MarkAndSweep::new(
            &self.tracking,
            self.applicator.batch_size,
            self.pacer.as_ref(),
            self.dry_run,
        );
        let plan = sweep.plan(record_set, &desired, normalizer.as_ref())?;
        debug!(rows = plan.row_count(), skipped = plan.skipped.len(), "tracking plan built");
        Ok(sweep.apply(target, &plan).await?)
    }

    /// Mirror named groups from a source platform into a target platform.
    ///
    /// Member ids are translated through the primary key: source id to key
    /// value through the source's records, key value to target id through
    /// the target's records.
    #[instrument(skip_all, fields(dry_run = self.dry_run))]
    pub async fn sync_groups(
        &self,
        source_records: &[CanonicalRecord],
        source_groups: &dyn GroupTarget,
        target_records: &[CanonicalRecord],
        target_groups: &dyn GroupTarget,
        names: &[String],
    ) -> Result<Vec<GroupSyncReport>, CoreError> {
        let key = self.reconcile.primary_key;
        let source_to_key: BTreeMap<String, String> = id_mapping(source_records, key)
            .into_iter()
            .map(|(k, id)| (id, k))
            .collect();
        let key_to_target = id_mapping(target_records, key);

        let lookup = GroupReconciler::new(source_groups, true).create_missing(false);
        let writer = GroupReconciler::new(target_groups, self.dry_run).create_missing(true);

        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let Some((source_id, _)) = lookup.resolve_group(name).await? else {
                warn!(group = %name, "source group not found; skipped");
                continue;
            };
            let members = source_groups.members(&source_id).await?;
            let (keys, _) = translate_ids(&members, &source_to_key);
            let (desired, _) = translate_ids(&keys, &key_to_target);
            reports.push(writer.sync_group(name, &desired).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<SchemaRegistry> {
        let table = "Key\tAdmin\tMail\n\
            membership_id\tnummer\t\n\
            email\temail\temail\n\
            first_name\tvoornaam\tfields.first\n\
            last_name\tachternaam\tfields.last\n";
        Arc::new(SchemaRegistry::from_tsv(table, "Key").unwrap())
    }

    fn engine() -> SyncEngine {
        let config: AppConfig = toml::from_str(
            r#"
            [schema]
            url = "https://example.org/table.tsv"
            "#,
        )
        .unwrap();
        SyncEngine::new(&config, registry(), true).with_today(NaiveDate::from_ymd_opt(2025, 9, 1).unwrap())
    }

    fn person(id: &str, email: &str) -> CanonicalRecord {
        CanonicalRecord::from_pairs([
            ("membership_id", json!(id)),
            ("email", json!(email)),
            ("first_name", json!("Ann")),
        ])
    }

    #[test]
    fn test_desired_records_include_active_members() {
        let e = engine();
        let primary = vec![person("1", "ann@example.org")];
        let desired = e.desired_records(&primary, &[], BTreeSet::new());
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].email.as_deref(), Some("ann@example.org"));
    }

    #[test]
    fn test_plan_records_deletes_departed() {
        let e = engine();
        let mut gone = person("9", "gone@example.org");
        gone.set("send_newsletter", json!(true));
        let (plan, _) = e.plan_records(&[], &[], &[gone], BTreeSet::new());
        assert_eq!(plan.operations, vec![Operation::Delete { id: "9".into() }]);
    }
}
