//! Identity matcher.
//!
//! Pairs records of two collections by primary key, then tries a fallback
//! for the leftovers: same date of birth plus identical first and last name.
//! The fallback exists because platforms let people change their email
//! address; it can in principle pair two different people who share a name
//! and a birthday, so ambiguous candidates are never guessed.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::record::{keys, CanonicalRecord};

/// Which field identifies a record across systems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKey {
    #[default]
    Email,
    MembershipId,
}

impl PrimaryKey {
    pub fn value_of<'r>(&self, record: &'r CanonicalRecord) -> Option<&'r str> {
        let value = match self {
            Self::Email => record.email.as_deref(),
            Self::MembershipId => record.membership_id.as_deref(),
        };
        value.filter(|v| !v.is_empty())
    }

    pub fn canonical_key(&self) -> &'static str {
        match self {
            Self::Email => keys::EMAIL,
            Self::MembershipId => keys::MEMBERSHIP_ID,
        }
    }
}

/// How a pair was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    PrimaryKey,
    Fuzzy,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimaryKey => write!(f, "primary_key"),
            Self::Fuzzy => write!(f, "fuzzy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Exact,
    Probable,
}

/// A pair of indices into the A and B collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Match {
    pub a: usize,
    pub b: usize,
    pub method: MatchMethod,
    pub confidence: Confidence,
}

/// A B record with more than one fallback candidate; left unmatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchAmbiguity {
    pub b: usize,
    pub candidates: Vec<usize>,
}

/// Result of one matching pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchOutcome {
    pub matches: Vec<Match>,
    pub unmatched_a: Vec<usize>,
    pub unmatched_b: Vec<usize>,
    pub ambiguous: Vec<MatchAmbiguity>,
}

impl MatchOutcome {
    /// The A index paired with `b`, if any.
    pub fn partner_of_b(&self, b: usize) -> Option<&Match> {
        self.matches.iter().find(|m| m.b == b)
    }

    pub fn fuzzy_count(&self) -> usize {
        self.matches
            .iter()
            .filter(|m| m.method == MatchMethod::Fuzzy)
            .count()
    }
}

/// Pairs records of two collections.
#[derive(Debug, Clone, Copy)]
pub struct IdentityMatcher {
    key: PrimaryKey,
    fallback: bool,
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(PrimaryKey::default())
    }
}

impl IdentityMatcher {
    pub fn new(key: PrimaryKey) -> Self {
        Self {
            key,
            fallback: true,
        }
    }

    /// Disable the date-of-birth fallback; only primary keys pair records.
    pub fn exact_only(mut self) -> Self {
        self.fallback = false;
        self
    }

    pub fn primary_key(&self) -> PrimaryKey {
        self.key
    }

    /// Match `b` records against `a` records. Every A record is claimed by
    /// at most one match.
    pub fn match_records(&self, a: &[CanonicalRecord], b: &[CanonicalRecord]) -> MatchOutcome {
        let mut index_a: HashMap<&str, usize> = HashMap::new();
        for (i, record) in a.iter().enumerate() {
            if let Some(key) = self.key.value_of(record) {
                if index_a.contains_key(key) {
                    warn!(key, "duplicate primary key in source; keeping the first record");
                    continue;
                }
                index_a.insert(key, i);
            }
        }

        // Keys held by any B record: an A record carrying one of these
        // belongs to that B record and may not be claimed by a fallback.
        let keys_b: BTreeSet<&str> = b.iter().filter_map(|r| self.key.value_of(r)).collect();

        let mut claimed_a = vec![false; a.len()];
        let mut outcome = MatchOutcome::default();
        let mut pending = Vec::new();

        for (j, record) in b.iter().enumerate() {
            match self.key.value_of(record).and_then(|k| index_a.get(k)) {
                Some(&i) if !claimed_a[i] => {
                    claimed_a[i] = true;
                    outcome.matches.push(Match {
                        a: i,
                        b: j,
                        method: MatchMethod::PrimaryKey,
                        confidence: Confidence::Exact,
                    });
                }
                Some(_) => {
                    warn!(record = %record.label(), "duplicate primary key in target; left unmatched");
                    outcome.unmatched_b.push(j);
                }
                None => pending.push(j),
            }
        }

        for j in pending {
            let record = &b[j];
            if !self.fallback || record.date_of_birth.is_none() {
                outcome.unmatched_b.push(j);
                continue;
            }

            let candidates: Vec<usize> = a
                .iter()
                .enumerate()
                .filter(|(i, cand)| {
                    !claimed_a[*i]
                        && same_person(cand, record)
                        && self
                            .key
                            .value_of(cand)
                            .map_or(true, |k| !keys_b.contains(k))
                })
                .map(|(i, _)| i)
                .collect();

            match candidates.as_slice() {
                [i] => {
                    let i = *i;
                    claimed_a[i] = true;
                    info!(
                        target_record = %record.label(),
                        source_record = %a[i].label(),
                        "matched by date of birth and name"
                    );
                    outcome.matches.push(Match {
                        a: i,
                        b: j,
                        method: MatchMethod::Fuzzy,
                        confidence: Confidence::Probable,
                    });
                }
                [] => outcome.unmatched_b.push(j),
                many => {
                    warn!(
                        record = %record.label(),
                        candidates = many.len(),
                        "ambiguous fallback match; left unmatched"
                    );
                    outcome.ambiguous.push(MatchAmbiguity {
                        b: j,
                        candidates: many.to_vec(),
                    });
                    outcome.unmatched_b.push(j);
                }
            }
        }

        outcome.unmatched_a = (0..a.len()).filter(|i| !claimed_a[*i]).collect();
        outcome.unmatched_b.sort_unstable();
        debug!(
            matched = outcome.matches.len(),
            fuzzy = outcome.fuzzy_count(),
            unmatched_a = outcome.unmatched_a.len(),
            unmatched_b = outcome.unmatched_b.len(),
            "matching pass complete"
        );
        outcome
    }
}

fn same_person(a: &CanonicalRecord, b: &CanonicalRecord) -> bool {
    fn eq(x: &Option<String>, y: &Option<String>) -> bool {
        matches!((x, y), (Some(x), Some(y)) if x == y)
    }
    eq(&a.date_of_birth, &b.date_of_birth)
        && eq(&a.first_name, &b.first_name)
        && eq(&a.last_name, &b.last_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person(email: &str, first: &str, last: &str, dob: Option<&str>) -> CanonicalRecord {
        let mut r = CanonicalRecord::from_pairs([
            ("email", json!(email)),
            ("first_name", json!(first)),
            ("last_name", json!(last)),
        ]);
        if let Some(dob) = dob {
            r.set("date_of_birth", json!(dob));
        }
        r
    }

    #[test]
    fn test_primary_key_match() {
        let a = vec![person("a@x.org", "Ada", "L", None)];
        let b = vec![
            person("a@x.org", "Ada", "L", None),
            person("z@x.org", "Zed", "Q", None),
        ];
        let out = IdentityMatcher::default().match_records(&a, &b);
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].method, MatchMethod::PrimaryKey);
        assert_eq!(out.unmatched_b, vec![1]);
        assert!(out.unmatched_a.is_empty());
    }

    #[test]
    fn test_changed_email_matched_by_fallback() {
        let a = vec![person("new@x.org", "Ada", "Lovelace", Some("1815-12-10"))];
        let b = vec![person("old@x.org", "Ada", "Lovelace", Some("1815-12-10"))];
        let out = IdentityMatcher::default().match_records(&a, &b);
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].method, MatchMethod::Fuzzy);
        assert_eq!(out.matches[0].confidence, Confidence::Probable);
        assert!(out.unmatched_a.is_empty() && out.unmatched_b.is_empty());
    }

    #[test]
    fn test_fallback_requires_both_names() {
        let a = vec![person("new@x.org", "Ada", "Byron", Some("1815-12-10"))];
        let b = vec![person("old@x.org", "Ada", "Lovelace", Some("1815-12-10"))];
        let out = IdentityMatcher::default().match_records(&a, &b);
        assert!(out.matches.is_empty());
    }

    #[test]
    fn test_fallback_skips_candidate_owned_by_other_target() {
        // The candidate's email is held by another target record, so it
        // belongs to that record and must not be claimed by the fallback.
        let a = vec![person("twin@x.org", "Sam", "Doe", Some("2000-01-01"))];
        let b = vec![
            person("old@x.org", "Sam", "Doe", Some("2000-01-01")),
            person("twin@x.org", "Sam", "Doe", Some("2000-01-01")),
        ];
        let out = IdentityMatcher::default().match_records(&a, &b);
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].b, 1);
        assert_eq!(out.matches[0].method, MatchMethod::PrimaryKey);
        assert_eq!(out.unmatched_b, vec![0]);
    }

    #[test]
    fn test_ambiguous_fallback_left_unmatched() {
        let a = vec![
            person("one@x.org", "Sam", "Doe", Some("2000-01-01")),
            person("two@x.org", "Sam", "Doe", Some("2000-01-01")),
        ];
        let b = vec![person("old@x.org", "Sam", "Doe", Some("2000-01-01"))];
        let out = IdentityMatcher::default().match_records(&a, &b);
        assert!(out.matches.is_empty());
        assert_eq!(out.ambiguous.len(), 1);
        assert_eq!(out.ambiguous[0].candidates, vec![0, 1]);
        assert_eq!(out.unmatched_b, vec![0]);
        assert_eq!(out.unmatched_a, vec![0, 1]);
    }

    #[test]
    fn test_fallback_claims_only_once() {
        let a = vec![person("new@x.org", "Sam", "Doe", Some("2000-01-01"))];
        let b = vec![
            person("old1@x.org", "Sam", "Doe", Some("2000-01-01")),
            person("old2@x.org", "Sam", "Doe", Some("2000-01-01")),
        ];
        let out = IdentityMatcher::default().match_records(&a, &b);
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].b, 0);
        assert_eq!(out.unmatched_b, vec![1]);
    }

    #[test]
    fn test_exact_only_disables_fallback() {
        let a = vec![person("new@x.org", "Ada", "Lovelace", Some("1815-12-10"))];
        let b = vec![person("old@x.org", "Ada", "Lovelace", Some("1815-12-10"))];
        let out = IdentityMatcher::default().exact_only().match_records(&a, &b);
        assert!(out.matches.is_empty());
    }

    #[test]
    fn test_no_dob_no_fallback() {
        let a = vec![person("new@x.org", "Sam", "Doe", None)];
        let b = vec![person("old@x.org", "Sam", "Doe", None)];
        let out = IdentityMatcher::default().match_records(&a, &b);
        assert!(out.matches.is_empty());
    }

    #[test]
    fn test_membership_id_key() {
        let mut a = person("a@x.org", "Ada", "L", None);
        a.set("membership_id", json!("12"));
        let mut b = person("other@x.org", "Ada", "L", None);
        b.set("membership_id", json!(12));
        let out = IdentityMatcher::new(PrimaryKey::MembershipId).match_records(&[a], &[b]);
        assert_eq!(out.matches.len(), 1);
    }

    #[test]
    fn test_duplicate_target_key_does_not_double_claim() {
        let a = vec![person("a@x.org", "Ada", "L", None)];
        let b = vec![
            person("a@x.org", "Ada", "L", None),
            person("a@x.org", "Ada", "L", None),
        ];
        let out = IdentityMatcher::default().match_records(&a, &b);
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.unmatched_b, vec![1]);
    }
}
