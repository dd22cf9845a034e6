//! The system-agnostic member record.
//!
//! Well-known identity fields are typed; every other canonical key lives in
//! `fields`, and keys the translation table does not know are kept in
//! `other` so nothing read from a platform is lost.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical keys the engine itself interprets.
pub mod keys {
    pub const MEMBERSHIP_ID: &str = "membership_id";
    pub const EMAIL: &str = "email";
    pub const FIRST_NAME: &str = "first_name";
    pub const LAST_NAME: &str = "last_name";
    pub const DATE_OF_BIRTH: &str = "date_of_birth";
    pub const MEMBERSHIP_END: &str = "membership_end";
    pub const MEMBERSHIP_START: &str = "membership_start";
    pub const MEMBERSHIP_TYPE: &str = "membership_type";
    pub const REQUESTED_DEREGISTRATION: &str = "requested_deregistration";
    pub const NEWSLETTER_PERMISSION: &str = "newsletter_permission";
    pub const IBAN: &str = "iban";
    pub const AGREEMENTS: &str = "agreements";
}

/// A member in canonical form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,

    /// Remaining canonical keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,

    /// Untranslated external keys, by flattened external name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other: BTreeMap<String, Value>,

    /// Id of the record inside the system it was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl CanonicalRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from canonical key/value pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut record = Self::new();
        for (k, v) in pairs {
            record.set(k.as_ref(), v);
        }
        record
    }

    /// Value of a canonical key. Absent and empty values are `None`.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.typed_slot(key) {
            Some(slot) => slot.clone().map(Value::String),
            None => self.fields.get(key).cloned(),
        }
    }

    /// String form of a canonical key's value.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| value_to_string(&v))
    }

    /// Set a canonical key. Null and empty-string values clear the key.
    pub fn set(&mut self, key: &str, value: Value) {
        if is_empty_value(&value) {
            self.remove(key);
            return;
        }
        match key {
            keys::MEMBERSHIP_ID
            | keys::EMAIL
            | keys::FIRST_NAME
            | keys::LAST_NAME
            | keys::DATE_OF_BIRTH => {
                let text = value_to_string(&value);
                if let Some(slot) = self.typed_slot_mut(key) {
                    *slot = text;
                }
            }
            _ => {
                self.fields.insert(key.to_string(), value);
            }
        }
    }

    pub fn remove(&mut self, key: &str) {
        match self.typed_slot_mut(key) {
            Some(slot) => *slot = None,
            None => {
                self.fields.remove(key);
            }
        }
    }

    /// Whether the key holds a true-ish value (`true`, non-zero, "yes", ...).
    pub fn is_truthy(&self, key: &str) -> bool {
        self.get(key).map(|v| truthy(&v)).unwrap_or(false)
    }

    /// All canonical keys with a value, in sorted order.
    pub fn canonical_keys(&self) -> Vec<String> {
        let mut out: Vec<String> = [
            keys::MEMBERSHIP_ID,
            keys::EMAIL,
            keys::FIRST_NAME,
            keys::LAST_NAME,
            keys::DATE_OF_BIRTH,
        ]
        .iter()
        .filter(|k| self.get(k).is_some())
        .map(|k| k.to_string())
        .chain(self.fields.keys().cloned())
        .collect();
        out.sort();
        out
    }

    /// All canonical key/value pairs, excluding `other`.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.canonical_keys()
            .into_iter()
            .filter_map(|k| self.get(&k).map(|v| (k, v)))
            .collect()
    }

    /// Stable identity: membership id, else email.
    pub fn identity(&self) -> Option<&str> {
        self.membership_id.as_deref().or(self.email.as_deref())
    }

    /// Id to address this record with when writing back to its system.
    pub fn write_id(&self) -> Option<&str> {
        self.external_id.as_deref().or_else(|| self.identity())
    }

    /// Short human label for log lines.
    pub fn label(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        match (self.identity(), name.is_empty()) {
            (Some(id), false) => format!("{id} ({name})"),
            (Some(id), true) => id.to_string(),
            (None, false) => name,
            (None, true) => "<unidentified>".into(),
        }
    }

    fn typed_slot(&self, key: &str) -> Option<&Option<String>> {
        match key {
            keys::MEMBERSHIP_ID => Some(&self.membership_id),
            keys::EMAIL => Some(&self.email),
            keys::FIRST_NAME => Some(&self.first_name),
            keys::LAST_NAME => Some(&self.last_name),
            keys::DATE_OF_BIRTH => Some(&self.date_of_birth),
            _ => None,
        }
    }

    fn typed_slot_mut(&mut self, key: &str) -> Option<&mut Option<String>> {
        match key {
            keys::MEMBERSHIP_ID => Some(&mut self.membership_id),
            keys::EMAIL => Some(&mut self.email),
            keys::FIRST_NAME => Some(&mut self.first_name),
            keys::LAST_NAME => Some(&mut self.last_name),
            keys::DATE_OF_BIRTH => Some(&mut self.date_of_birth),
            _ => None,
        }
    }
}

impl fmt::Display for CanonicalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Null, empty strings and whitespace-only strings count as "no value".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Render a scalar JSON value as text. Arrays and objects are JSON-encoded.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Loose boolean interpretation of values coming from forms and APIs.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "ja" | "y" | "on"
        ),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_keys_are_routed() {
        let mut r = CanonicalRecord::new();
        r.set(keys::EMAIL, json!("a@x.org"));
        r.set(keys::MEMBERSHIP_ID, json!(1042));
        r.set("phone", json!("0612345678"));

        assert_eq!(r.email.as_deref(), Some("a@x.org"));
        assert_eq!(r.membership_id.as_deref(), Some("1042"));
        assert_eq!(r.get("phone"), Some(json!("0612345678")));
        assert_eq!(r.get(keys::EMAIL), Some(json!("a@x.org")));
    }

    #[test]
    fn test_empty_values_clear() {
        let mut r = CanonicalRecord::from_pairs([("email", json!("a@x.org")), ("city", json!("Delft"))]);
        r.set("email", json!(""));
        r.set("city", Value::Null);
        assert!(r.email.is_none());
        assert!(r.get("city").is_none());
        assert!(r.canonical_keys().is_empty());
    }

    #[test]
    fn test_identity_prefers_membership_id() {
        let mut r = CanonicalRecord::from_pairs([("email", json!("a@x.org"))]);
        assert_eq!(r.identity(), Some("a@x.org"));
        r.set(keys::MEMBERSHIP_ID, json!("7"));
        assert_eq!(r.identity(), Some("7"));
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!("Ja")));
        assert!(truthy(&json!(1)));
        assert!(!truthy(&json!("no")));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn test_label() {
        let r = CanonicalRecord::from_pairs([
            ("membership_id", json!("12")),
            ("first_name", json!("Ada")),
            ("last_name", json!("Lovelace")),
        ]);
        assert_eq!(r.label(), "12 (Ada Lovelace)");
        assert_eq!(CanonicalRecord::new().label(), "<unidentified>");
    }
}
