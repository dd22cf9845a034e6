//! Seams to the external membership and communication platforms.
//!
//! The engine only talks to these traits. [`rest::RestPlatform`] implements
//! all of them from configuration; tests use in-memory fakes.

pub mod http;
pub mod rest;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::ApiRequestError;

pub use http::ApiClient;
pub use rest::RestPlatform;

/// Reads nested records from a platform.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn list_records(&self) -> Result<Vec<Value>, ApiRequestError>;
}

/// Writes single records.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Create a record; returns the new id when the platform reports one.
    async fn create(&self, payload: &Value) -> Result<Option<String>, ApiRequestError>;
    async fn update(&self, id: &str, payload: &Value) -> Result<(), ApiRequestError>;
    async fn delete(&self, id: &str) -> Result<(), ApiRequestError>;
}

/// One element of a bulk upsert: find the row matching `require` (or add
/// one) and set `fields` on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertRow {
    pub require: Map<String, Value>,
    pub fields: Map<String, Value>,
}

/// A table-like target that only supports upserts.
#[async_trait]
pub trait UpsertTarget: Send + Sync {
    /// Set `fields` on every existing row of `record_set`.
    async fn mark_all(
        &self,
        record_set: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), ApiRequestError>;

    async fn upsert_batch(&self, record_set: &str, rows: &[UpsertRow])
        -> Result<(), ApiRequestError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
}

/// Group membership operations. Member ids are the platform's own ids.
#[async_trait]
pub trait GroupTarget: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<GroupInfo>, ApiRequestError>;
    async fn members(&self, group_id: &str) -> Result<BTreeSet<String>, ApiRequestError>;
    async fn create_group(&self, name: &str) -> Result<String, ApiRequestError>;
    async fn add_members(&self, group_id: &str, ids: &[String]) -> Result<(), ApiRequestError>;
    async fn remove_members(&self, group_id: &str, ids: &[String])
        -> Result<(), ApiRequestError>;
}
