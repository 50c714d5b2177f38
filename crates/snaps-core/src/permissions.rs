//! Requested-permission sets and the deltas computed between them on update.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Permission name to its caveat payload.
pub type PermissionSet = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("A snap must request at least one of the following permissions: {}.", .required.join(", "))]
    MissingHandler { required: Vec<String> },
    #[error("One or more permissions are not allowed:\n{}", .details.join("\n"))]
    Excluded { details: Vec<String> },
}

/// Entries of `lhs` whose name does not appear in `rhs`. Caveats are not compared.
pub fn permissions_diff(lhs: &PermissionSet, rhs: &PermissionSet) -> PermissionSet {
    lhs.iter()
        .filter(|(name, _)| !rhs.contains_key(*name))
        .map(|(name, caveats)| (name.clone(), caveats.clone()))
        .collect()
}

pub fn permission_names(set: &PermissionSet) -> Vec<String> {
    set.keys().cloned().collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsChange {
    /// Requested but not currently held.
    pub new_permissions: PermissionSet,
    /// Held but no longer requested.
    pub unused_permissions: PermissionSet,
    /// Held and still requested.
    pub approved_permissions: PermissionSet,
}

impl PermissionsChange {
    pub fn calculate(existing: &PermissionSet, requested: &PermissionSet) -> Self {
        let new_permissions = permissions_diff(requested, existing);
        let unused_permissions = permissions_diff(existing, requested);
        let approved_permissions = permissions_diff(existing, &unused_permissions);
        Self {
            new_permissions,
            unused_permissions,
            approved_permissions,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.new_permissions.is_empty() && self.unused_permissions.is_empty()
    }
}

/// Checks a requested set before any approval is asked for: at least one handler endowment must
/// be present and nothing on the exclusion list may be. Exclusion entries map a permission name
/// to the message shown when it is requested.
pub fn validate_requested(
    requested: &PermissionSet,
    handler_permissions: &[&str],
    excluded: &BTreeMap<String, String>,
) -> Result<(), PermissionError> {
    if !handler_permissions
        .iter()
        .any(|name| requested.contains_key(*name))
    {
        return Err(PermissionError::MissingHandler {
            required: handler_permissions.iter().map(|s| s.to_string()).collect(),
        });
    }
    let details: Vec<String> = requested
        .keys()
        .filter_map(|name| excluded.get(name).cloned())
        .collect();
    if !details.is_empty() {
        return Err(PermissionError::Excluded { details });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn set(names: &[&str]) -> PermissionSet {
        names.iter().map(|n| (n.to_string(), json!({}))).collect()
    }

    #[test]
    fn change_splits_new_unused_and_approved() {
        let existing = set(&["endowment:rpc", "endowment:network-access", "snap_dialog"]);
        let requested = set(&["endowment:rpc", "snap_dialog", "snap_manageState"]);
        let change = PermissionsChange::calculate(&existing, &requested);
        assert_eq!(permission_names(&change.new_permissions), vec!["snap_manageState"]);
        assert_eq!(
            permission_names(&change.unused_permissions),
            vec!["endowment:network-access"]
        );
        assert_eq!(
            permission_names(&change.approved_permissions),
            vec!["endowment:rpc", "snap_dialog"]
        );
        assert!(!change.is_noop());
        assert!(PermissionsChange::calculate(&existing, &existing).is_noop());
    }

    #[test]
    fn approved_keeps_existing_caveats() {
        let mut existing = set(&["endowment:rpc"]);
        existing.insert("endowment:rpc".into(), json!({"dapps": true}));
        let requested = set(&["endowment:rpc"]);
        let change = PermissionsChange::calculate(&existing, &requested);
        assert_eq!(change.approved_permissions["endowment:rpc"], json!({"dapps": true}));
    }

    #[test]
    fn validation_requires_a_handler() {
        let err = validate_requested(
            &set(&["snap_dialog"]),
            &["endowment:rpc", "endowment:cronjob"],
            &BTreeMap::new(),
        )
        .expect_err("missing handler");
        assert_eq!(
            err.to_string(),
            "A snap must request at least one of the following permissions: endowment:rpc, endowment:cronjob."
        );
    }

    #[test]
    fn validation_lists_excluded_permissions() {
        let excluded: BTreeMap<String, String> =
            [(
                "eth_accounts".to_string(),
                "eth_accounts is reserved for dapps".to_string(),
            )]
                .into_iter()
                .collect();
        let err = validate_requested(
            &set(&["endowment:rpc", "eth_accounts"]),
            &["endowment:rpc"],
            &excluded,
        )
        .expect_err("excluded");
        assert_eq!(
            err.to_string(),
            "One or more permissions are not allowed:\neth_accounts is reserved for dapps"
        );
        assert!(validate_requested(&set(&["endowment:rpc"]), &["endowment:rpc"], &excluded).is_ok());
    }

    fn names() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set("[a-e]{1,2}", 0..8)
    }

    proptest! {
        #[test]
        fn diff_round_trips(existing in names(), requested in names()) {
            let existing: PermissionSet = existing.into_iter().map(|n| (n, json!({}))).collect();
            let requested: PermissionSet = requested.into_iter().map(|n| (n, json!({}))).collect();
            let change = PermissionsChange::calculate(&existing, &requested);

            let mut new_and_approved: BTreeSet<String> = change.new_permissions.keys().cloned().collect();
            new_and_approved.extend(change.approved_permissions.keys().cloned());
            prop_assert_eq!(new_and_approved, requested.keys().cloned().collect::<BTreeSet<_>>());

            let mut unused_and_approved: BTreeSet<String> = change.unused_permissions.keys().cloned().collect();
            unused_and_approved.extend(change.approved_permissions.keys().cloned());
            prop_assert_eq!(unused_and_approved, existing.keys().cloned().collect::<BTreeSet<_>>());

            prop_assert!(change.new_permissions.keys().all(|k| !change.approved_permissions.contains_key(k)));
        }
    }
}
