//! Mark-and-sweep sync into upsert-only targets.
//!
//! Every row the sync owns is first marked stale in one bulk call. The
//! desired rows are then upserted in paced batches, each carrying the
//! tracking marker again. Rows left stale afterwards are the ones that
//! dropped out of the source; the target's own views filter them out.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};

use super::pacing::Pacer;
use crate::config::TrackingConfig;
use crate::errors::ApplyError;
use crate::normalize::Normalizer;
use crate::platform::{UpsertRow, UpsertTarget};
use crate::record::CanonicalRecord;

/// Per-row lifecycle of a tracked row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    /// Marked by the mark phase; not (yet) confirmed by this pass.
    Stale,
    /// Part of a batch that has not been confirmed.
    PendingSync,
    /// Upserted by this pass.
    Synced,
}

impl TrackingState {
    /// The mark phase applies to every row regardless of state.
    pub fn mark(self) -> Self {
        Self::Stale
    }

    pub fn schedule(self) -> Option<Self> {
        match self {
            Self::Stale => Some(Self::PendingSync),
            _ => None,
        }
    }

    pub fn confirm(self) -> Option<Self> {
        match self {
            Self::PendingSync => Some(Self::Synced),
            _ => None,
        }
    }

    /// Value written to the tracking-marker column.
    pub fn wire_value(self) -> bool {
        matches!(self, Self::Synced | Self::PendingSync)
    }
}

/// Everything a pass would send, computed without touching the target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingPlan {
    pub record_set: String,
    /// Fields set on every owned row by the mark phase.
    pub mark: Map<String, Value>,
    pub batches: Vec<Vec<UpsertRow>>,
    /// Labels of records without a match value.
    pub skipped: Vec<String>,
}

impl TrackingPlan {
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackingReport {
    pub record_set: String,
    pub planned: usize,
    pub synced: usize,
    pub failed: usize,
    pub dry_run: bool,
    /// Final state per match value.
    pub states: BTreeMap<String, TrackingState>,
}

/// Mark-and-sweep applicator.
pub struct MarkAndSweep<'a> {
    tracking: &'a TrackingConfig,
    batch_size: usize,
    pacer: &'a dyn Pacer,
    dry_run: bool,
}

impl<'a> MarkAndSweep<'a> {
    pub fn new(tracking: &'a TrackingConfig, batch_size: usize, pacer: &'a dyn Pacer, dry_run: bool) -> Self {
        Self {
            tracking,
            batch_size: batch_size.max(1),
            pacer,
            dry_run,
        }
    }

    /// Build the rows for `records`. With a normalizer the row fields are
    /// the target's column names; without one they are canonical keys.
    pub fn plan(
        &self,
        record_set: &str,
        records: &[CanonicalRecord],
        normalizer: Option<&Normalizer<'_>>,
    ) -> Result<TrackingPlan, ApplyError> {
        validate_record_set(record_set)?;
        let t = self.tracking;

        let mut mark = Map::new();
        mark.insert(t.tracked_column.clone(), Value::Bool(TrackingState::Stale.wire_value()));

        let mut rows = Vec::new();
        let mut skipped = Vec::new();
        for record in records {
            let Some(match_value) = record.get(&t.match_key) else {
                warn!(record = %record.label(), key = %t.match_key, "no match value; not tracked");
                skipped.push(record.label());
                continue;
            };

            let mut fields = match normalizer {
                Some(n) => {
                    let (row, missing) = n.to_external_projection(record);
                    if !missing.is_empty() {
                        debug!(record = %record.label(), ?missing, "fields without a column");
                    }
                    row
                }
                None => record.to_map().into_iter().collect(),
            };
            for (column, value) in &t.sentinels {
                fields.insert(column.clone(), Value::String(value.clone()));
            }
            fields.insert(
                t.tracked_column.clone(),
                Value::Bool(TrackingState::PendingSync.wire_value()),
            );

            let mut require = Map::new();
            require.insert(t.match_column.clone(), match_value);
            require.insert(t.synced_column.clone(), Value::Bool(true));
            rows.push(UpsertRow { require, fields });
        }

        let batches = rows.chunks(self.batch_size).map(<[UpsertRow]>::to_vec).collect();
        Ok(TrackingPlan {
            record_set: record_set.to_string(),
            mark,
            batches,
            skipped,
        })
    }

    /// Run a plan. A failed mark aborts before any upsert; a failed batch
    /// is logged and counted.
    #[instrument(skip(self, target, plan), fields(record_set = %plan.record_set, dry_run = self.dry_run))]
    pub async fn apply(
        &self,
        target: &dyn UpsertTarget,
        plan: &TrackingPlan,
    ) -> Result<TrackingReport, ApplyError> {
        let mut report = TrackingReport {
            record_set: plan.record_set.clone(),
            planned: plan.row_count(),
            dry_run: self.dry_run,
            ..Default::default()
        };
        let match_column = &self.tracking.match_column;

        // Rows enter the pass as stale and are scheduled batch by batch.
        let mut states: BTreeMap<String, TrackingState> = plan
            .batches
            .iter()
            .flatten()
            .filter_map(|row| row_key(row, match_column))
            .map(|key| (key, TrackingState::Stale))
            .collect();

        info!(rows = report.planned, batches = plan.batches.len(), "MARK all owned rows stale");
        if self.dry_run {
            debug!("dry run, not executing");
        } else {
            target
                .mark_all(&plan.record_set, &plan.mark)
                .await
                .map_err(|source| ApplyError::MarkFailed {
                    record_set: plan.record_set.clone(),
                    source,
                })?;
            if !plan.batches.is_empty() {
                self.pacer.wait_before_next_batch().await;
            }
        }

        for (i, batch) in plan.batches.iter().enumerate() {
            let keys: Vec<String> = batch.iter().filter_map(|row| row_key(row, match_column)).collect();
            for key in &keys {
                advance(&mut states, key, TrackingState::schedule);
            }

            info!(batch = i + 1, rows = batch.len(), "UPSERT batch");
            if self.dry_run {
                debug!("dry run, not executing");
                continue;
            }
            if i > 0 {
                self.pacer.wait_before_next_batch().await;
            }
            match target.upsert_batch(&plan.record_set, batch).await {
                Ok(()) => {
                    report.synced += batch.len();
                    for key in &keys {
                        advance(&mut states, key, TrackingState::confirm);
                    }
                }
                Err(e) => {
                    error!(batch = i + 1, error = %e, "upsert batch failed");
                    report.failed += batch.len();
                }
            }
        }

        info!(
            synced = report.synced,
            failed = report.failed,
            "tracking sync finished"
        );
        report.states = states;
        Ok(report)
    }
}

fn advance(
    states: &mut BTreeMap<String, TrackingState>,
    key: &str,
    step: fn(TrackingState) -> Option<TrackingState>,
) {
    if let Some(state) = states.get_mut(key) {
        if let Some(next) = step(*state) {
            *state = next;
        }
    }
}

fn row_key(row: &UpsertRow, match_column: &str) -> Option<String> {
    row.require
        .get(match_column)
        .and_then(crate::record::value_to_string)
}

/// Record-set names end up in URL paths; only plain identifiers pass.
pub fn validate_record_set(name: &str) -> Result<(), ApplyError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ApplyError::InvalidRecordSet(name.to_string()))
    }
}
