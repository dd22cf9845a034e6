//! Group membership reconciliation.
//!
//! Membership is treated as a set: the desired members of a group are
//! computed elsewhere, and this module turns the difference with the
//! current members into one bulk removal followed by one bulk addition.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::errors::ApiRequestError;
use crate::matcher::PrimaryKey;
use crate::platform::GroupTarget;
use crate::record::CanonicalRecord;

/// Set difference between desired and current members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupDiff {
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
}

impl GroupDiff {
    pub fn compute(desired: &BTreeSet<String>, current: &BTreeSet<String>) -> Self {
        Self {
            add: desired.difference(current).cloned().collect(),
            remove: current.difference(desired).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupSyncReport {
    pub group: String,
    pub group_id: Option<String>,
    pub created: bool,
    pub added: usize,
    pub removed: usize,
    pub dry_run: bool,
}

/// Applies [`GroupDiff`]s to a [`GroupTarget`].
pub struct GroupReconciler<'a> {
    target: &'a dyn GroupTarget,
    create_missing: bool,
    dry_run: bool,
}

impl<'a> GroupReconciler<'a> {
    pub fn new(target: &'a dyn GroupTarget, dry_run: bool) -> Self {
        Self {
            target,
            create_missing: true,
            dry_run,
        }
    }

    pub fn create_missing(mut self, create: bool) -> Self {
        self.create_missing = create;
        self
    }

    /// Find a group by id or name. Returns `(id, created)`; `None` when the
    /// group does not exist and was not (or, in a dry run, would be) created.
    pub async fn resolve_group(&self, name: &str) -> Result<Option<(String, bool)>, ApiRequestError> {
        let groups = self.target.list_groups().await?;
        if let Some(found) = groups.iter().find(|g| g.id == name || g.name == name) {
            return Ok(Some((found.id.clone(), false)));
        }
        if !self.create_missing {
            warn!(group = %name, "group does not exist");
            return Ok(None);
        }
        info!(group = %name, "CREATE group");
        if self.dry_run {
            debug!("dry run, not executing");
            return Ok(None);
        }
        let id = self.target.create_group(name).await?;
        Ok(Some((id, true)))
    }

    /// Bring `group` to exactly `desired`. Removals go out before additions.
    #[instrument(skip(self, desired), fields(dry_run = self.dry_run))]
    pub async fn sync_group(
        &self,
        group: &str,
        desired: &BTreeSet<String>,
    ) -> Result<GroupSyncReport, ApiRequestError> {
        let mut report = GroupSyncReport {
            group: group.to_string(),
            dry_run: self.dry_run,
            ..Default::default()
        };

        let resolved = self.resolve_group(group).await?;
        let current = match &resolved {
            Some((id, _)) => self.target.members(id).await?,
            None => BTreeSet::new(),
        };
        if let Some((id, created)) = &resolved {
            report.group_id = Some(id.clone());
            report.created = *created;
        }

        let diff = GroupDiff::compute(desired, &current);
        report.added = diff.add.len();
        report.removed = diff.remove.len();
        info!(
            desired = desired.len(),
            current = current.len(),
            add = diff.add.len(),
            remove = diff.remove.len(),
            "group diff computed"
        );
        if diff.is_empty() {
            return Ok(report);
        }

        let Some((id, _)) = resolved else {
            if !self.dry_run {
                warn!(group, "group unavailable; membership not written");
            }
            return Ok(report);
        };

        if !diff.remove.is_empty() {
            info!(count = diff.remove.len(), "REMOVE group members");
            if self.dry_run {
                debug!(members = ?diff.remove, "dry run, not executing");
            } else {
                let ids: Vec<String> = diff.remove.iter().cloned().collect();
                self.target.remove_members(&id, &ids).await?;
            }
        }
        if !diff.add.is_empty() {
            info!(count = diff.add.len(), "ADD group members");
            if self.dry_run {
                debug!(members = ?diff.add, "dry run, not executing");
            } else {
                let ids: Vec<String> = diff.add.iter().cloned().collect();
                self.target.add_members(&id, &ids).await?;
            }
        }
        Ok(report)
    }

    /// Add members without removing anyone (used for new registrations).
    pub async fn add_to_group(&self, group: &str, ids: &[String]) -> Result<(), ApiRequestError> {
        if ids.is_empty() {
            return Ok(());
        }
        info!(group, count = ids.len(), "ADD group members");
        if self.dry_run {
            debug!("dry run, not executing");
            return Ok(());
        }
        match self.resolve_group(group).await? {
            Some((id, _)) => self.target.add_members(&id, ids).await,
            None => {
                warn!(group, "group unavailable; members not added");
                Ok(())
            }
        }
    }
}

/// Map each record's key value to the id the target uses for it.
pub fn id_mapping(records: &[CanonicalRecord], key: PrimaryKey) -> BTreeMap<String, String> {
    records
        .iter()
        .filter_map(|r| Some((key.value_of(r)?.to_string(), r.write_id()?.to_string())))
        .collect()
}

/// Translate ids through `mapping`. Ids without a counterpart are dropped
/// and returned separately.
pub fn translate_ids(
    ids: &BTreeSet<String>,
    mapping: &BTreeMap<String, String>,
) -> (BTreeSet<String>, Vec<String>) {
    let mut translated = BTreeSet::new();
    let mut missing = Vec::new();
    for id in ids {
        match mapping.get(id) {
            Some(target) => {
                translated.insert(target.clone());
            }
            None => missing.push(id.clone()),
        }
    }
    if !missing.is_empty() {
        warn!(count = missing.len(), ?missing, "members without a counterpart skipped");
    }
    (translated, missing)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::platform::GroupInfo;

    #[derive(Default)]
    struct FakeGroups {
        groups: Mutex<BTreeMap<String, BTreeSet<String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeGroups {
        fn with(name: &str, members: &[&str]) -> Self {
            let fake = Self::default();
            fake.groups.lock().unwrap().insert(
                name.to_string(),
                members.iter().map(|m| m.to_string()).collect(),
            );
            fake
        }
    }

    #[async_trait]
    impl GroupTarget for FakeGroups {
        async fn list_groups(&self) -> Result<Vec<GroupInfo>, ApiRequestError> {
            Ok(self
                .groups
                .lock()
                .unwrap()
                .keys()
                .map(|k| GroupInfo { id: k.clone(), name: k.clone() })
                .collect())
        }

        async fn members(&self, group_id: &str) -> Result<BTreeSet<String>, ApiRequestError> {
            Ok(self.groups.lock().unwrap().get(group_id).cloned().unwrap_or_default())
        }

        async fn create_group(&self, name: &str) -> Result<String, ApiRequestError> {
            self.calls.lock().unwrap().push(format!("create {name}"));
            self.groups.lock().unwrap().insert(name.to_string(), BTreeSet::new());
            Ok(name.to_string())
        }

        async fn add_members(&self, group_id: &str, ids: &[String]) -> Result<(), ApiRequestError> {
            self.calls.lock().unwrap().push(format!("add {}", ids.join(",")));
            let mut groups = self.groups.lock().unwrap();
            let members = groups.entry(group_id.to_string()).or_default();
            members.extend(ids.iter().cloned());
            Ok(())
        }

        async fn remove_members(&self, group_id: &str, ids: &[String]) -> Result<(), ApiRequestError> {
            self.calls.lock().unwrap().push(format!("remove {}", ids.join(",")));
            let mut groups = self.groups.lock().unwrap();
            if let Some(members) = groups.get_mut(group_id) {
                for id in ids {
                    members.remove(id);
                }
            }
            Ok(())
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_group_diff() {
        let diff = GroupDiff::compute(&set(&["A", "B", "C"]), &set(&["B", "C", "D"]));
        assert_eq!(diff.add, set(&["A"]));
        assert_eq!(diff.remove, set(&["D"]));
        assert!(GroupDiff::compute(&set(&["A"]), &set(&["A"])).is_empty());
    }

    #[tokio::test]
    async fn test_sync_group_removes_then_adds() {
        let fake = FakeGroups::with("Members", &["B", "C", "D"]);
        let reconciler = GroupReconciler::new(&fake, false);

        let report = reconciler.sync_group("Members", &set(&["A", "B", "C"])).await.unwrap();
        assert_eq!((report.added, report.removed), (1, 1));
        assert_eq!(*fake.calls.lock().unwrap(), vec!["remove D", "add A"]);
        assert_eq!(fake.groups.lock().unwrap()["Members"], set(&["A", "B", "C"]));

        // Converged: a second pass writes nothing.
        fake.calls.lock().unwrap().clear();
        let again = reconciler.sync_group("Members", &set(&["A", "B", "C"])).await.unwrap();
        assert_eq!((again.added, again.removed), (0, 0));
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_group_is_created() {
        let fake = FakeGroups::default();
        let reconciler = GroupReconciler::new(&fake, false);
        let report = reconciler.sync_group("Alumni", &set(&["A"])).await.unwrap();
        assert!(report.created);
        assert_eq!(*fake.calls.lock().unwrap(), vec!["create Alumni", "add A"]);
    }

    #[tokio::test]
    async fn test_dry_run_only_logs() {
        let fake = FakeGroups::with("Members", &["D"]);
        let reconciler = GroupReconciler::new(&fake, true);
        let report = reconciler.sync_group("Members", &set(&["A"])).await.unwrap();
        assert!(report.dry_run);
        assert_eq!((report.added, report.removed), (1, 1));
        assert!(fake.calls.lock().unwrap().is_empty());
        assert_eq!(fake.groups.lock().unwrap()["Members"], set(&["D"]));
    }

    #[test]
    fn test_translate_ids_skips_unknown() {
        let records = vec![
            CanonicalRecord::from_pairs([("membership_id", json!("1")), ("email", json!("a@x"))]),
            {
                let mut r = CanonicalRecord::from_pairs([("membership_id", json!("2"))]);
                r.external_id = Some("ext-2".into());
                r
            },
        ];
        let mapping = id_mapping(&records, PrimaryKey::MembershipId);
        assert_eq!(mapping["1"], "1");
        assert_eq!(mapping["2"], "ext-2");

        let (ids, missing) = translate_ids(&set(&["1", "2", "3"]), &mapping);
        assert_eq!(ids, set(&["1", "ext-2"]));
        assert_eq!(missing, vec!["3".to_string()]);
    }
}
