//! Record normalizer: external nested JSON <-> canonical records.
//!
//! Reading never drops data: unmapped fields land in `other`. Writing is
//! asymmetric. An update with an untranslatable key is refused outright, while
//! a create folds untranslatable keys into the platform's notes field so one
//! optional field cannot block a new member.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{SchemaError, TranslationError};
use crate::record::{value_to_string, CanonicalRecord};
use crate::schema::{KeyMap, SchemaRegistry};

/// Flatten nested objects into dotted keys. Arrays and scalars are leaves;
/// empty objects are kept as leaves so they survive a round trip.
pub fn flatten(map: &Map<String, Value>) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(map, "", &mut out);
    out
}

fn flatten_into(map: &Map<String, Value>, prefix: &str, out: &mut BTreeMap<String, Value>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(inner, &path, out),
            other => {
                out.insert(path, other.clone());
            }
        }
    }
}

/// Rebuild nested objects from dotted keys.
pub fn unflatten(flat: &BTreeMap<String, Value>) -> Result<Value, TranslationError> {
    let mut root = Map::new();
    for (path, value) in flat {
        let parts: Vec<&str> = path.split('.').collect();
        let (leaf, parents) = match parts.split_last() {
            Some(split) => split,
            None => continue,
        };

        let mut current = &mut root;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match entry {
                Value::Object(inner) => inner,
                _ => return Err(TranslationError::PathConflict(path.clone())),
            };
        }

        if let Some(Value::Object(existing)) = current.get(*leaf) {
            if !existing.is_empty() {
                return Err(TranslationError::PathConflict(path.clone()));
            }
        }
        current.insert(leaf.to_string(), value.clone());
    }
    Ok(Value::Object(root))
}

/// Translator between one external system and the canonical form.
#[derive(Debug, Clone)]
pub struct Normalizer<'a> {
    system: String,
    keys: &'a KeyMap,
    notes_key: Option<String>,
    id_field: Option<String>,
}

impl<'a> Normalizer<'a> {
    pub fn new(registry: &'a SchemaRegistry, system: &str) -> Result<Self, SchemaError> {
        Ok(Self {
            system: system.to_string(),
            keys: registry.key_map(system)?,
            notes_key: None,
            id_field: None,
        })
    }

    /// Canonical key collecting untranslatable data on create.
    pub fn with_notes_key(mut self, key: impl Into<String>) -> Self {
        self.notes_key = Some(key.into());
        self
    }

    /// External field holding the system's own record id.
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// Translate one nested external record.
    pub fn to_canonical(&self, external: &Map<String, Value>) -> CanonicalRecord {
        self.to_canonical_flat(flatten(external))
    }

    /// Translate already-flat `(external name, value)` pairs, such as form
    /// fields extracted from a message body.
    pub fn to_canonical_flat<I, K>(&self, pairs: I) -> CanonicalRecord
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut record = CanonicalRecord::new();
        for (name, value) in pairs {
            let name = name.as_ref();
            if self.id_field.as_deref() == Some(name) {
                record.external_id = value_to_string(&value);
            }
            match self.keys.canonical(name) {
                Some(canonical) => record.set(canonical, value),
                None if !value.is_null() => {
                    record.other.insert(name.to_string(), value);
                }
                None => {}
            }
        }
        debug!(
            system = %self.system,
            record = %record.label(),
            unmapped = record.other.len(),
            "normalized record"
        );
        record
    }

    /// Translate a list of raw API values, skipping anything that is not an
    /// object.
    pub fn to_canonical_all(&self, externals: &[Value]) -> Vec<CanonicalRecord> {
        externals
            .iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(self.to_canonical(map)),
                other => {
                    warn!(system = %self.system, value = %other, "skipping non-object record");
                    None
                }
            })
            .collect()
    }

    /// Payload for an update. Every key must translate.
    pub fn to_external_update(
        &self,
        changes: &BTreeMap<String, Value>,
    ) -> Result<Value, TranslationError> {
        let mut flat = BTreeMap::new();
        for (key, value) in changes {
            let name = self
                .keys
                .external(key)
                .ok_or_else(|| TranslationError::MissingField {
                    system: self.system.clone(),
                    key: key.clone(),
                })?;
            flat.insert(name.to_string(), value.clone());
        }
        unflatten(&flat)
    }

    /// Payload for a create. Keys without a translation, and everything in
    /// `other`, become `key: value` lines in the notes field. A target with
    /// no notes field cannot take them, so the create is refused.
    pub fn to_external_create(&self, record: &CanonicalRecord) -> Result<Value, TranslationError> {
        let mut flat = BTreeMap::new();
        let mut notes = Vec::new();
        let mut unplaced = Vec::new();

        for (key, value) in record.to_map() {
            if self.notes_key.as_deref() == Some(key.as_str()) {
                continue;
            }
            match self.keys.external(&key) {
                Some(name) => {
                    flat.insert(name.to_string(), value);
                }
                None => {
                    notes.push(note_line(&key, &value));
                    unplaced.push(key);
                }
            }
        }
        for (key, value) in &record.other {
            notes.push(note_line(key, value));
            unplaced.push(key.clone());
        }

        let existing = self.notes_key.as_deref().and_then(|k| record.get_str(k));
        if notes.is_empty() && existing.is_none() {
            return unflatten(&flat);
        }

        let Some(name) = self.notes_key.as_deref().and_then(|k| self.keys.external(k)) else {
            if existing.is_some() {
                unplaced.extend(self.notes_key.clone());
            }
            return Err(TranslationError::NoNotesField {
                system: self.system.clone(),
                fields: unplaced,
            });
        };
        let text = existing.into_iter().chain(notes).collect::<Vec<_>>().join("\n");
        flat.insert(name.to_string(), Value::String(text));
        unflatten(&flat)
    }

    /// Translated fields only, plus the names of fields that had no
    /// translation. Used for rows written to upsert targets.
    pub fn to_external_projection(&self, record: &CanonicalRecord) -> (Map<String, Value>, Vec<String>) {
        let mut row = Map::new();
        let mut missing = Vec::new();
        for (key, value) in record.to_map() {
            match self.keys.external(&key) {
                Some(name) => {
                    row.insert(name.to_string(), value);
                }
                None => missing.push(key),
            }
        }
        (row, missing)
    }
}

fn note_line(key: &str, value: &Value) -> String {
    format!("{key}: {}", value_to_string(value).unwrap_or_default())
}
