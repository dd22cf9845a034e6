//! Config-driven REST adapter implementing every platform trait.
//!
//! Endpoints, JSON pointers and field names come from `[platforms.<name>]`;
//! an operation whose endpoint block is absent fails with
//! [`ApiRequestError::Unsupported`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

use super::http::ApiClient;
use super::{GroupInfo, GroupTarget, RecordSource, RecordWriter, UpsertRow, UpsertTarget};
use crate::config::PlatformConfig;
use crate::errors::{ApiRequestError, AuthenticationError};
use crate::record::value_to_string;

/// A platform reached over its JSON API.
#[derive(Debug, Clone)]
pub struct RestPlatform {
    name: String,
    client: ApiClient,
    config: PlatformConfig,
}

impl RestPlatform {
    pub fn from_config(name: &str, config: &PlatformConfig) -> Result<Self, AuthenticationError> {
        Ok(Self {
            name: name.to_string(),
            client: ApiClient::from_config(name, config)?,
            config: config.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    fn unsupported(&self, operation: &str) -> ApiRequestError {
        ApiRequestError::Unsupported {
            platform: self.name.clone(),
            operation: operation.to_string(),
        }
    }
}

#[async_trait]
impl RecordSource for RestPlatform {
    #[instrument(skip(self), fields(platform = %self.name))]
    async fn list_records(&self) -> Result<Vec<Value>, ApiRequestError> {
        let list = self
            .config
            .list
            .as_ref()
            .ok_or_else(|| self.unsupported("listing records"))?;
        let query: Vec<(String, String)> = list
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let body = self.client.get_json(&list.path, &query).await?;
        let records = extract_list(&body, &list.records_pointer, &list.item_pointer).ok_or_else(
            || ApiRequestError::Decode {
                url: self.client.url(&list.path),
                detail: format!("no record list at '{}'", list.records_pointer),
            },
        )?;
        info!(count = records.len(), "listed records");
        Ok(records)
    }
}

#[async_trait]
impl RecordWriter for RestPlatform {
    async fn create(&self, payload: &Value) -> Result<Option<String>, ApiRequestError> {
        let write = self
            .config
            .write
            .as_ref()
            .ok_or_else(|| self.unsupported("creating records"))?;
        let body = with_extra(payload, &write.extra);
        let resp = self
            .client
            .send_json(Method::POST, &write.create_path, &[], Some(&body))
            .await?;
        let id = write
            .id_pointer
            .as_deref()
            .and_then(|p| resp.pointer(p))
            .and_then(value_to_string);
        debug!(platform = %self.name, id = ?id, "record created");
        Ok(id)
    }

    async fn update(&self, id: &str, payload: &Value) -> Result<(), ApiRequestError> {
        let write = self
            .config
            .write
            .as_ref()
            .ok_or_else(|| self.unsupported("updating records"))?;
        let method = Method::from_bytes(write.update_method.to_ascii_uppercase().as_bytes())
            .unwrap_or(Method::PATCH);
        let body = with_extra(payload, &write.extra);
        self.client
            .send_json(method, &substitute(&write.update_path, "id", id), &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), ApiRequestError> {
        let write = self
            .config
            .write
            .as_ref()
            .ok_or_else(|| self.unsupported("deleting records"))?;
        self.client
            .send_json(Method::DELETE, &substitute(&write.delete_path, "id", id), &[], None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UpsertTarget for RestPlatform {
    async fn mark_all(
        &self,
        record_set: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), ApiRequestError> {
        let upsert = self
            .config
            .upsert
            .as_ref()
            .ok_or_else(|| self.unsupported("upserts"))?;
        // An empty `require` matches every row; `noadd` keeps the call from
        // inserting one when the table is empty.
        let query = [
            ("allow_empty_require".to_string(), "true".to_string()),
            ("onmany".to_string(), "all".to_string()),
            ("noadd".to_string(), "true".to_string()),
        ];
        let body = json!({ "records": [ { "require": {}, "fields": fields } ] });
        self.client
            .send_json(
                Method::PUT,
                &substitute(&upsert.path, "table", record_set),
                &query,
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn upsert_batch(
        &self,
        record_set: &str,
        rows: &[UpsertRow],
    ) -> Result<(), ApiRequestError> {
        let upsert = self
            .config
            .upsert
            .as_ref()
            .ok_or_else(|| self.unsupported("upserts"))?;
        let body = json!({ "records": rows });
        self.client
            .send_json(
                Method::PUT,
                &substitute(&upsert.path, "table", record_set),
                &[],
                Some(&body),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GroupTarget for RestPlatform {
    async fn list_groups(&self) -> Result<Vec<GroupInfo>, ApiRequestError> {
        let groups = self
            .config
            .groups
            .as_ref()
            .ok_or_else(|| self.unsupported("groups"))?;
        let body = self.client.get_json(&groups.list_path, &[]).await?;
        let items = extract_list(&body, &groups.list_pointer, "").unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                let id = item.get(&groups.id_field).and_then(value_to_string)?;
                let name = item
                    .get(&groups.name_field)
                    .and_then(value_to_string)
                    .unwrap_or_else(|| id.clone());
                Some(GroupInfo { id, name })
            })
            .collect())
    }

    async fn members(&self, group_id: &str) -> Result<BTreeSet<String>, ApiRequestError> {
        let groups = self
            .config
            .groups
            .as_ref()
            .ok_or_else(|| self.unsupported("groups"))?;
        let path = substitute(&groups.members_path, "group", group_id);
        let body = self.client.get_json(&path, &[]).await?;
        let items = extract_list(&body, &groups.members_pointer, "").unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| match item {
                Value::Object(obj) => obj.get(&groups.id_field).and_then(value_to_string),
                other => value_to_string(other),
            })
            .collect())
    }

    async fn create_group(&self, name: &str) -> Result<String, ApiRequestError> {
        let groups = self
            .config
            .groups
            .as_ref()
            .ok_or_else(|| self.unsupported("groups"))?;
        let mut body = Map::new();
        body.insert(groups.name_field.clone(), Value::String(name.to_string()));
        let resp = self
            .client
            .send_json(Method::POST, &groups.create_path, &[], Some(&Value::Object(body)))
            .await?;
        resp.get(&groups.id_field)
            .and_then(value_to_string)
            .ok_or_else(|| ApiRequestError::Decode {
                url: self.client.url(&groups.create_path),
                detail: format!("no '{}' in create response", groups.id_field),
            })
    }

    async fn add_members(&self, group_id: &str, ids: &[String]) -> Result<(), ApiRequestError> {
        let groups = self
            .config
            .groups
            .as_ref()
            .ok_or_else(|| self.unsupported("groups"))?;
        let body = ids_body(&groups.member_ids_field, ids);
        self.client
            .send_json(
                Method::POST,
                &substitute(&groups.add_path, "group", group_id),
                &[],
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn remove_members(&self, group_id: &str, ids: &[String]) -> Result<(), ApiRequestError> {
        let groups = self
            .config
            .groups
            .as_ref()
            .ok_or_else(|| self.unsupported("groups"))?;
        let body = ids_body(&groups.member_ids_field, ids);
        self.client
            .send_json(
                Method::POST,
                &substitute(&groups.remove_path, "group", group_id),
                &[],
                Some(&body),
            )
            .await?;
        Ok(())
    }
}

/// Replace `{name}` in a path template.
fn substitute(template: &str, name: &str, value: &str) -> String {
    template.replace(&format!("{{{name}}}"), value)
}

/// Locate a list at `pointer`. Objects keyed by id count as lists of their
/// values. `item_pointer`, when set, is applied to every element.
fn extract_list(body: &Value, pointer: &str, item_pointer: &str) -> Option<Vec<Value>> {
    let target = if pointer.is_empty() {
        body
    } else {
        body.pointer(pointer)?
    };
    let items: Vec<Value> = match target {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map.values().cloned().collect(),
        Value::Null => Vec::new(),
        _ => return None,
    };
    if item_pointer.is_empty() {
        return Some(items);
    }
    Some(
        items
            .iter()
            .filter_map(|item| item.pointer(item_pointer).cloned())
            .collect(),
    )
}

fn ids_body(field: &str, ids: &[String]) -> Value {
    let mut body = Map::new();
    body.insert(
        field.to_string(),
        Value::Array(ids.iter().cloned().map(Value::String).collect()),
    );
    Value::Object(body)
}

fn with_extra(payload: &Value, extra: &Map<String, Value>) -> Value {
    let mut payload = payload.clone();
    if let Value::Object(map) = &mut payload {
        for (k, v) in extra {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    payload
}
