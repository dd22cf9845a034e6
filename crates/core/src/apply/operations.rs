//! Applies planned operations to a record-oriented target.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use super::pacing::Pacer;
use crate::diff::Operation;
use crate::errors::{ApplyError, TranslationError};
use crate::normalize::Normalizer;
use crate::platform::RecordWriter;

/// An operation with its payload already in the target's vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedOperation {
    pub operation: Operation,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub planned: usize,
    pub applied: usize,
    pub failed: usize,
    pub dry_run: bool,
    /// Ids the target reported for created records, in operation order.
    pub created_ids: Vec<String>,
    /// One line per failed operation.
    pub failures: Vec<String>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Writes operations one at a time, in batches separated by the pacer.
pub struct OperationApplicator<'a> {
    normalizer: &'a Normalizer<'a>,
    batch_size: usize,
    pacer: &'a dyn Pacer,
    dry_run: bool,
}

impl<'a> OperationApplicator<'a> {
    pub fn new(
        normalizer: &'a Normalizer<'a>,
        batch_size: usize,
        pacer: &'a dyn Pacer,
        dry_run: bool,
    ) -> Self {
        Self {
            normalizer,
            batch_size: batch_size.max(1),
            pacer,
            dry_run,
        }
    }

    /// Translate every operation. Runs before any write, in dry runs too.
    /// Operations that cannot be translated come back separately so one bad
    /// record only fails itself.
    pub fn prepare(&self, operations: &[Operation]) -> (Vec<PreparedOperation>, Vec<(Operation, TranslationError)>) {
        let mut prepared = Vec::with_capacity(operations.len());
        let mut untranslatable = Vec::new();
        for op in operations {
            let payload = match op {
                Operation::Create(record) => self.normalizer.to_external_create(record).map(Some),
                Operation::Update { changes, .. } => self.normalizer.to_external_update(changes).map(Some),
                Operation::Delete { .. } => Ok(None),
            };
            match payload {
                Ok(payload) => prepared.push(PreparedOperation {
                    operation: op.clone(),
                    payload,
                }),
                Err(e) => untranslatable.push((op.clone(), e)),
            }
        }
        (prepared, untranslatable)
    }

    #[instrument(skip_all, fields(system = %self.normalizer.system(), dry_run = self.dry_run))]
    pub async fn apply(
        &self,
        writer: &dyn RecordWriter,
        operations: &[Operation],
    ) -> Result<ApplyReport, ApplyError> {
        let (prepared, untranslatable) = self.prepare(operations);
        let mut report = ApplyReport {
            planned: operations.len(),
            dry_run: self.dry_run,
            ..Default::default()
        };
        for (op, e) in untranslatable {
            error!(op = op.verb(), target = ?op.id(), error = %e, "operation cannot be translated");
            report.failed += 1;
            report.failures.push(format!("{op}: {e}"));
        }

        for (i, batch) in prepared.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.dry_run {
                self.pacer.wait_before_next_batch().await;
            }
            for item in batch {
                info!(op = item.operation.verb(), target = ?item.operation.id(), "{}", item.operation);
                if self.dry_run {
                    debug!(payload = ?item.payload, "dry run, not executing");
                    continue;
                }
                match self.execute(writer, item).await {
                    Ok(created) => {
                        report.applied += 1;
                        report.created_ids.extend(created);
                    }
                    Err(e) => {
                        error!(op = item.operation.verb(), error = %e, "operation failed");
                        report.failed += 1;
                        report.failures.push(format!("{}: {e}", item.operation));
                    }
                }
            }
        }

        info!(
            applied = report.applied,
            failed = report.failed,
            "operations applied"
        );
        Ok(report)
    }

    async fn execute(
        &self,
        writer: &dyn RecordWriter,
        item: &PreparedOperation,
    ) -> Result<Option<String>, ApplyError> {
        let empty = Value::Object(Default::default());
        let payload = item.payload.as_ref().unwrap_or(&empty);
        match &item.operation {
            Operation::Create(_) => Ok(writer.create(payload).await?),
            Operation::Update { id, .. } => {
                writer.update(id, payload).await?;
                Ok(None)
            }
            Operation::Delete { id } => {
                writer.delete(id).await?;
                Ok(None)
            }
        }
    }
}
