//! RosterSync core library.
//!
//! Keeps a membership roster consistent across external platforms that
//! each name fields differently: a translation table maps every system's
//! field names onto canonical keys, records are matched by identity, diffed
//! into create/update/delete operations and applied in paced batches. The
//! same crate verifies DKIM-signed registration mails and turns them into
//! new records, and runs read-only health checks on the roster.

pub mod apply;
pub mod cache;
pub mod check;
pub mod config;
pub mod diff;
pub mod email;
pub mod errors;
pub mod groups;
pub mod matcher;
pub mod normalize;
pub mod notify;
pub mod platform;
pub mod record;
pub mod schema;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::AppConfig;
pub use diff::{DiffEngine, DiffPolicy, Operation, ReconcilePlan};
pub use errors::CoreError;
pub use matcher::{IdentityMatcher, PrimaryKey};
pub use normalize::Normalizer;
pub use notify::Notifier;
pub use record::CanonicalRecord;
pub use schema::SchemaRegistry;
pub use sync_engine::SyncEngine;
