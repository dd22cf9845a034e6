//! Read-only health checks on a platform's records: postal addresses
//! against the national address register, and membership numbering
//! against external groups.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::apply::{FixedDelay, Pacer};
use crate::cache::FileCache;
use crate::errors::ApiRequestError;
use crate::groups::GroupReconciler;
use crate::platform::GroupTarget;
use crate::record::CanonicalRecord;

pub const PDOK_SEARCH_URL: &str = "https://api.pdok.nl/bzk/locatieserver/search/v3_1/free";

/// Membership ids below this belong to members; externals are numbered
/// from here on.
pub const MEMBER_ID_THRESHOLD: u64 = 2000;

static ADDITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(BS)?([A-Z]?)$").expect("static regex is valid"));

/// Canonical keys read by the address check.
pub mod address_keys {
    pub const POSTAL_CODE: &str = "postal_code";
    pub const STREET: &str = "street";
    pub const PLACE: &str = "place";
    pub const HOUSE_NUMBER_FULL: &str = "house_number_full";
    pub const HOUSE_NUMBER: &str = "house_number_decimal";
    pub const HOUSE_NUMBER_ADDITION: &str = "house_number_addition";
}

// ---------------------------------------------------------------------------
// Postal code lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostalInfo {
    pub postal_code: String,
    pub street_names: BTreeSet<String>,
    pub place_names: BTreeSet<String>,
    pub addresses: Vec<AddressEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressEntry {
    /// House number as the register spells it, e.g. `12 bis A`.
    pub number: Option<String>,
    pub street_name: Option<String>,
    pub place_name: Option<String>,
}

#[async_trait]
pub trait PostalLookup: Send + Sync {
    async fn lookup(&self, postal_code: &str) -> Result<PostalInfo, ApiRequestError>;
}

/// PDOK locatieserver client with an optional disk cache. Live requests
/// are spaced out by the pacer.
pub struct PdokLookup {
    http: reqwest::Client,
    base_url: String,
    cache: Option<FileCache>,
    pacer: Box<dyn Pacer>,
}

impl PdokLookup {
    pub fn new(base_url: impl Into<String>, cache: Option<FileCache>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            cache,
            pacer: Box::new(FixedDelay::from_millis(1000)),
        }
    }

    pub fn with_pacer(mut self, pacer: Box<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    fn url_for(&self, postal_code: &str) -> String {
        format!("{}?q={postal_code}&rows=100&df=postcode", self.base_url)
    }
}

#[async_trait]
impl PostalLookup for PdokLookup {
    #[instrument(skip(self))]
    async fn lookup(&self, postal_code: &str) -> Result<PostalInfo, ApiRequestError> {
        let postal_code = normalize_postal_code(postal_code);
        if postal_code.len() != 6 {
            debug!(%postal_code, "not a Dutch postal code; nothing to look up");
            return Ok(PostalInfo {
                postal_code,
                ..Default::default()
            });
        }

        let url = self.url_for(&postal_code);
        let key = FileCache::key_for(&url, Some(&postal_code));
        if let Some(data) = self.cache.as_ref().and_then(|c| c.get::<Value>(&key)) {
            return Ok(parse_pdok_docs(&postal_code, &data));
        }

        debug!(%postal_code, "fetching postal code data");
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiRequestError::Status {
                method: "GET".into(),
                url,
                status: status.as_u16(),
                body,
            });
        }
        let data: Value = resp.json().await?;
        if let Some(ref cache) = self.cache {
            if let Err(e) = cache.put(&key, &data) {
                warn!(error = %e, "could not cache postal code data");
            }
        }
        self.pacer.wait_before_next_batch().await;
        Ok(parse_pdok_docs(&postal_code, &data))
    }
}

pub fn normalize_postal_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Reduce a locatieserver response to street, place and house numbers.
pub fn parse_pdok_docs(postal_code: &str, data: &Value) -> PostalInfo {
    let docs = data
        .pointer("/response/docs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let text = |doc: &Value, field: &str| doc.get(field).and_then(Value::as_str).map(str::to_string);

    let mut info = PostalInfo {
        postal_code: postal_code.to_string(),
        ..Default::default()
    };
    for doc in &docs {
        match doc.get("type").and_then(Value::as_str) {
            Some("postcode") => {
                info.street_names.extend(text(doc, "straatnaam").filter(|s| !s.is_empty()));
                info.place_names.extend(text(doc, "woonplaatsnaam").filter(|s| !s.is_empty()));
            }
            Some("adres") => info.addresses.push(AddressEntry {
                number: format_house_number(
                    doc.get("huisnummer").and_then(Value::as_i64),
                    doc.get("huisnummertoevoeging").and_then(Value::as_str),
                    doc.get("huis_nlt").and_then(Value::as_str),
                ),
                street_name: text(doc, "straatnaam"),
                place_name: text(doc, "woonplaatsnaam"),
            }),
            _ => {}
        }
    }
    info
}

/// Spell a house number the way members write it: `BS` additions become
/// `bis`, a trailing letter is separated by a space. Unknown additions fall
/// back to the register's own `huis_nlt` spelling.
pub fn format_house_number(number: Option<i64>, addition: Option<&str>, fallback: Option<&str>) -> Option<String> {
    let fallback = fallback.map(str::to_string);
    let Some(addition) = addition else {
        return fallback;
    };
    let (Some(caps), Some(number)) = (ADDITION.captures(addition), number) else {
        return fallback;
    };
    let mut value = number.to_string();
    if caps.get(1).is_some() {
        value.push_str(" bis");
    }
    if let Some(letter) = caps.get(2).map(|m| m.as_str()).filter(|l| !l.is_empty()) {
        value.push(' ');
        value.push_str(letter);
    }
    Some(value)
}

// ---------------------------------------------------------------------------
// Address check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "finding", rename_all = "snake_case")]
pub enum AddressFinding {
    Correct,
    /// External relations are not checked.
    External,
    MissingPostalCode,
    MissingHouseNumber,
    LookupFailed(String),
    StreetMismatch { found: Option<String>, expected: Vec<String> },
    PlaceMismatch { found: Option<String>, expected: Vec<String> },
    HouseNumberMismatch { found: String, expected: Vec<String> },
}

impl AddressFinding {
    pub fn is_problem(&self) -> bool {
        !matches!(self, Self::Correct | Self::External)
    }
}

impl fmt::Display for AddressFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "(empty)".into());
        match self {
            Self::Correct => f.write_str("address is correct"),
            Self::External => f.write_str("external relation, not checked"),
            Self::MissingPostalCode => f.write_str("no postal code"),
            Self::MissingHouseNumber => f.write_str("no house number"),
            Self::LookupFailed(e) => write!(f, "postal code lookup failed: {e}"),
            Self::StreetMismatch { found, expected } => {
                write!(f, "street '{}', expected one of: {}", show(found), expected.join(", "))
            }
            Self::PlaceMismatch { found, expected } => {
                write!(f, "place '{}', expected one of: {}", show(found), expected.join(", "))
            }
            Self::HouseNumberMismatch { found, expected } => {
                write!(f, "house number '{found}', expected one of: {}", expected.join(", "))
            }
        }
    }
}

pub fn is_external_number(membership_id: &str) -> bool {
    membership_id
        .trim()
        .parse::<u64>()
        .map(|n| n >= MEMBER_ID_THRESHOLD)
        .unwrap_or(false)
}

/// Compare a record's address with the register.
pub async fn check_address(record: &CanonicalRecord, lookup: &dyn PostalLookup) -> AddressFinding {
    use address_keys::*;

    if record.membership_id.as_deref().is_some_and(is_external_number) {
        return AddressFinding::External;
    }
    let Some(postal_code) = record.get_str(POSTAL_CODE).filter(|p| !p.trim().is_empty()) else {
        return AddressFinding::MissingPostalCode;
    };
    let house_number = match record.get_str(HOUSE_NUMBER_FULL) {
        Some(full) => full,
        None => match record.get_str(HOUSE_NUMBER) {
            Some(number) => number + &record.get_str(HOUSE_NUMBER_ADDITION).unwrap_or_default(),
            None => return AddressFinding::MissingHouseNumber,
        },
    };

    let info = match lookup.lookup(&postal_code).await {
        Ok(info) => info,
        Err(e) => return AddressFinding::LookupFailed(e.to_string()),
    };

    let street = record.get_str(STREET);
    if !street.as_ref().is_some_and(|s| info.street_names.contains(s)) {
        return AddressFinding::StreetMismatch {
            found: street,
            expected: info.street_names.into_iter().collect(),
        };
    }
    let place = record.get_str(PLACE);
    if !place.as_ref().is_some_and(|p| info.place_names.contains(p)) {
        return AddressFinding::PlaceMismatch {
            found: place,
            expected: info.place_names.into_iter().collect(),
        };
    }

    let expected: Vec<String> = info
        .addresses
        .iter()
        .filter(|a| a.street_name == street)
        .filter_map(|a| a.number.clone())
        .collect();
    if !expected.contains(&house_number) {
        return AddressFinding::HouseNumberMismatch {
            found: house_number,
            expected,
        };
    }
    AddressFinding::Correct
}

/// Check every record, in order. Problems are logged at WARN.
pub async fn check_addresses(
    records: &[CanonicalRecord],
    lookup: &dyn PostalLookup,
) -> Vec<(String, AddressFinding)> {
    let mut findings = Vec::with_capacity(records.len());
    for record in records {
        let finding = check_address(record, lookup).await;
        let label = record.label();
        if finding.is_problem() {
            warn!(record = %label, "problem found: {finding}");
        } else {
            debug!(record = %label, "{finding}");
        }
        findings.push((label, finding));
    }
    info!(
        checked = findings.len(),
        problems = findings.iter().filter(|(_, f)| f.is_problem()).count(),
        "address check done"
    );
    findings
}

// ---------------------------------------------------------------------------
// Numbering check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumberingProblem {
    pub record: String,
    pub membership_id: String,
    /// External groups the record is in; empty means it is presumed a member.
    pub external_groups: Vec<String>,
}

impl fmt::Display for NumberingProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.external_groups.is_empty() {
            write!(
                f,
                "member {} has id {}; member ids should be below {MEMBER_ID_THRESHOLD}",
                self.record, self.membership_id
            )
        } else {
            write!(
                f,
                "external {} has id {}; external ids should be {MEMBER_ID_THRESHOLD} or above (in {})",
                self.record,
                self.membership_id,
                self.external_groups.join(", ")
            )
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NumberingReport {
    pub correct: usize,
    pub problems: Vec<NumberingProblem>,
    /// Records without a numeric membership id.
    pub skipped: Vec<String>,
}

/// Members of each named group, keyed by group name. A group the target
/// does not know is reported with no members.
pub async fn external_members(
    target: &dyn GroupTarget,
    groups: &[String],
) -> Result<BTreeMap<String, BTreeSet<String>>, ApiRequestError> {
    let reconciler = GroupReconciler::new(target, true).create_missing(false);
    let mut members = BTreeMap::new();
    for group in groups {
        let ids = match reconciler.resolve_group(group).await? {
            Some((id, _)) => target.members(&id).await?,
            None => {
                warn!(group = %group, "external group not found");
                BTreeSet::new()
            }
        };
        members.insert(group.clone(), ids);
    }
    Ok(members)
}

/// A record is external when it is in any external group; its id must
/// then be at or above the threshold, and below it otherwise.
pub fn check_numbering(
    records: &[CanonicalRecord],
    external: &BTreeMap<String, BTreeSet<String>>,
) -> NumberingReport {
    let mut report = NumberingReport::default();
    for record in records {
        let Some(id) = record.membership_id.as_deref() else {
            report.skipped.push(record.label());
            continue;
        };
        let Ok(number) = id.trim().parse::<u64>() else {
            report.skipped.push(record.label());
            continue;
        };

        let external_groups: Vec<String> = external
            .iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(group, _)| group.clone())
            .collect();
        let expected_member = number < MEMBER_ID_THRESHOLD;
        if expected_member == external_groups.is_empty() {
            report.correct += 1;
            continue;
        }

        let problem = NumberingProblem {
            record: record.label(),
            membership_id: id.to_string(),
            external_groups,
        };
        warn!("problem found: {problem}");
        report.problems.push(problem);
    }
    info!(
        correct = report.correct,
        wrong = report.problems.len(),
        skipped = report.skipped.len(),
        "numbering check done"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pdok() -> Value {
        json!({"response": {"docs": [
            {"type": "postcode", "straatnaam": "Oudegracht", "woonplaatsnaam": "Utrecht"},
            {"type": "adres", "straatnaam": "Oudegracht", "woonplaatsnaam": "Utrecht",
             "huisnummer": 12, "huis_nlt": "12"},
            {"type": "adres", "straatnaam": "Oudegracht", "woonplaatsnaam": "Utrecht",
             "huisnummer": 12, "huisnummertoevoeging": "BSA", "huis_nlt": "12-BSA"},
            {"type": "adres", "straatnaam": "Oudegracht", "woonplaatsnaam": "Utrecht",
             "huisnummer": 14, "huisnummertoevoeging": "3h", "huis_nlt": "14-3h"},
            {"type": "weg", "straatnaam": "Elders"}
        ]}})
    }

    struct Fixed(PostalInfo);

    #[async_trait]
    impl PostalLookup for Fixed {
        async fn lookup(&self, _: &str) -> Result<PostalInfo, ApiRequestError> {
            Ok(self.0.clone())
        }
    }

    fn member(id: &str, street: &str, number: &str) -> CanonicalRecord {
        CanonicalRecord::from_pairs([
            ("membership_id", json!(id)),
            ("postal_code", json!("3511 AA")),
            ("street", json!(street)),
            ("place", json!("Utrecht")),
            ("house_number_full", json!(number)),
        ])
    }

    #[test]
    fn test_parse_pdok_docs() {
        let info = parse_pdok_docs("3511AA", &pdok());
        assert_eq!(info.street_names.iter().collect::<Vec<_>>(), vec!["Oudegracht"]);
        assert_eq!(info.place_names.len(), 1);
        let numbers: Vec<_> = info.addresses.iter().filter_map(|a| a.number.clone()).collect();
        assert_eq!(numbers, vec!["12", "12 bis A", "14-3h"]);
    }

    #[test]
    fn test_format_house_number() {
        assert_eq!(format_house_number(Some(5), None, Some("5")).as_deref(), Some("5"));
        assert_eq!(format_house_number(Some(5), Some("BS"), Some("5-BS")).as_deref(), Some("5 bis"));
        assert_eq!(format_house_number(Some(5), Some("B"), Some("5B")).as_deref(), Some("5 B"));
        assert_eq!(format_house_number(Some(5), Some("2hg"), Some("5-2hg")).as_deref(), Some("5-2hg"));
    }

    #[test]
    fn test_normalize_postal_code() {
        assert_eq!(normalize_postal_code(" 3511 aa"), "3511AA");
    }

    #[tokio::test]
    async fn test_check_address() {
        let lookup = Fixed(parse_pdok_docs("3511AA", &pdok()));

        assert_eq!(check_address(&member("12", "Oudegracht", "12 bis A"), &lookup).await, AddressFinding::Correct);
        assert_eq!(check_address(&member("2100", "Nowhere", "1"), &lookup).await, AddressFinding::External);
        assert!(matches!(
            check_address(&member("12", "Neude", "12"), &lookup).await,
            AddressFinding::StreetMismatch { .. }
        ));
        match check_address(&member("12", "Oudegracht", "13"), &lookup).await {
            AddressFinding::HouseNumberMismatch { found, expected } => {
                assert_eq!(found, "13");
                assert!(expected.contains(&"12".to_string()));
            }
            other => panic!("unexpected finding: {other:?}"),
        }

        let mut no_number = member("12", "Oudegracht", "12");
        no_number.remove("house_number_full");
        assert_eq!(check_address(&no_number, &lookup).await, AddressFinding::MissingHouseNumber);

        let mut split = no_number.clone();
        split.set("house_number_decimal", json!("12"));
        assert_eq!(check_address(&split, &lookup).await, AddressFinding::Correct);
    }

    #[test]
    fn test_check_numbering() {
        let records = vec![
            member("15", "x", "1"),
            member("2050", "x", "1"),
            member("40", "x", "1"),
            member("2300", "x", "1"),
            member("n/a", "x", "1"),
        ];
        let external = BTreeMap::from([
            ("Externen".to_string(), BTreeSet::from(["2050".to_string(), "40".to_string()])),
            ("Donateurs".to_string(), BTreeSet::new()),
        ]);
        let report = check_numbering(&records, &external);
        assert_eq!(report.correct, 2);
        assert_eq!(report.skipped.len(), 1);
        let ids: Vec<_> = report.problems.iter().map(|p| p.membership_id.as_str()).collect();
        assert_eq!(ids, vec!["40", "2300"]);
        assert_eq!(report.problems[0].external_groups, vec!["Externen".to_string()]);
        assert!(report.problems[1].external_groups.is_empty());
    }
}
