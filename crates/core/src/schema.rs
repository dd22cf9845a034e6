//! Canonical schema registry.
//!
//! The field-translation table is a TSV sheet: one header row, then one row
//! per canonical key. The `Key` column holds the canonical key and every
//! other column holds one system's field name for it (blank = no mapping).
//! The registry is built once per run, never mutated afterwards, and passed
//! by reference to everything that translates records.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex_lite::Regex;
use tracing::{debug, info, instrument};

use crate::errors::{ApiRequestError, SchemaError};

static SPREADSHEET_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/d/([a-zA-Z0-9_-]{10,})(?:[/?#]|$)").expect("valid spreadsheet id regex"));

/// Bidirectional field-name map for one external system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMap {
    /// External field name -> canonical key.
    pub to_canonical: BTreeMap<String, String>,
    /// Canonical key -> external field name.
    pub from_canonical: BTreeMap<String, String>,
}

impl KeyMap {
    pub fn canonical(&self, external: &str) -> Option<&str> {
        self.to_canonical.get(external).map(String::as_str)
    }

    pub fn external(&self, canonical: &str) -> Option<&str> {
        self.from_canonical.get(canonical).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.to_canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_canonical.is_empty()
    }
}

/// All per-system key maps derived from one translation table.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    key_column: String,
    systems: BTreeMap<String, KeyMap>,
}

impl SchemaRegistry {
    /// Download and parse the translation table.
    #[instrument(skip(http))]
    pub async fn fetch(
        http: &reqwest::Client,
        url: &str,
        key_column: &str,
    ) -> Result<Self, SchemaError> {
        let url = resolve_table_url(url)?;
        info!(url = %url, "fetching translation table");

        let resp = http
            .get(&url)
            .send()
            .await
            .map_err(ApiRequestError::from)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiRequestError::Status {
                method: "GET".into(),
                url,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let text = resp.text().await.map_err(ApiRequestError::from)?;
        Self::from_tsv(&text, key_column)
    }

    /// Parse a translation table from TSV text.
    pub fn from_tsv(text: &str, key_column: &str) -> Result<Self, SchemaError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| SchemaError::Parse(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| SchemaError::Parse(e.to_string()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Self::from_rows(key_column, &headers, &rows)
    }

    /// Build the registry from a header row and data rows. Short rows are
    /// padded with blanks.
    pub fn from_rows(
        key_column: &str,
        headers: &[String],
        rows: &[Vec<String>],
    ) -> Result<Self, SchemaError> {
        let key_idx = headers
            .iter()
            .position(|h| h == key_column)
            .ok_or_else(|| SchemaError::MissingKeyColumn(key_column.to_string()))?;

        let mut systems = BTreeMap::new();
        for (col, system) in headers.iter().enumerate() {
            if col == key_idx || system.is_empty() {
                continue;
            }

            let mut map = KeyMap::default();
            for row in rows {
                let key = cell(row, key_idx);
                let name = cell(row, col);
                if key.is_empty() || name.is_empty() {
                    continue;
                }
                insert_unique(&mut map.to_canonical, system, name, key)?;
                insert_unique(&mut map.from_canonical, system, key, name)?;
            }

            debug!(system = %system, fields = map.len(), "built key map");
            systems.insert(system.clone(), map);
        }

        info!(
            systems = systems.len(),
            rows = rows.len(),
            "translation table loaded"
        );
        Ok(Self {
            key_column: key_column.to_string(),
            systems,
        })
    }

    /// External field name -> canonical key for `system`.
    pub fn translation(&self, system: &str) -> Result<&BTreeMap<String, String>, SchemaError> {
        Ok(&self.key_map(system)?.to_canonical)
    }

    /// Canonical key -> external field name for `system`.
    pub fn inverse(&self, system: &str) -> Result<&BTreeMap<String, String>, SchemaError> {
        Ok(&self.key_map(system)?.from_canonical)
    }

    pub fn key_map(&self, system: &str) -> Result<&KeyMap, SchemaError> {
        self.systems
            .get(system)
            .ok_or_else(|| SchemaError::UnknownSystem(system.to_string()))
    }

    pub fn systems(&self) -> impl Iterator<Item = &str> {
        self.systems.keys().map(String::as_str)
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(|s| s.trim()).unwrap_or("")
}

fn insert_unique(
    map: &mut BTreeMap<String, String>,
    system: &str,
    from: &str,
    to: &str,
) -> Result<(), SchemaError> {
    match map.get(from) {
        Some(existing) if existing != to => Err(SchemaError::Conflict {
            system: system.to_string(),
            name: from.to_string(),
            first: existing.clone(),
            second: to.to_string(),
        }),
        Some(_) => Ok(()),
        None => {
            map.insert(from.to_string(), to.to_string());
            Ok(())
        }
    }
}

/// Use spreadsheet URLs as their TSV export; leave anything else alone.
pub fn resolve_table_url(url: &str) -> Result<String, SchemaError> {
    if url.contains("/spreadsheets/d/") && !url.contains("/export") {
        tsv_export_url(url)
    } else {
        Ok(url.to_string())
    }
}

/// Rewrite a spreadsheet URL (`/edit`, a trailing slash or just the id)
/// to its TSV export URL.
pub fn tsv_export_url(url: &str) -> Result<String, SchemaError> {
    let id = SPREADSHEET_ID
        .captures(url)
        .and_then(|c| c.get(1))
        .ok_or_else(|| SchemaError::InvalidUrl(url.to_string()))?;

    let without_fragment = url.split('#').next().unwrap_or(url);
    let query = without_fragment.split_once('?').map(|(_, q)| q).unwrap_or("");

    let extra = format!("format=tsv&id={}", id.as_str());
    let query = if query.is_empty() {
        extra
    } else {
        format!("{query}&{extra}")
    };
    Ok(format!("{}/export?{query}", &url[..id.end()]))
}
