//! Writing planned changes to external systems.
//!
//! Two strategies: [`operations::OperationApplicator`] for targets with
//! per-record create/update/delete, and [`tracking::MarkAndSweep`] for
//! upsert-only targets. Both share the batching and pacing policy.

pub mod operations;
pub mod pacing;
pub mod tracking;

pub use operations::{ApplyReport, OperationApplicator, PreparedOperation};
pub use pacing::{pacer_for, FixedDelay, NoPacing, Pacer};
pub use tracking::{MarkAndSweep, TrackingPlan, TrackingReport, TrackingState};
