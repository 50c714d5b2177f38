//! Endowment permissions and the handlers they unlock.
//!
//! Permission names arrive as strings from manifests and the permission host. They are resolved
//! into [`Endowment`] variants here, once, so the rest of the controller matches on an enum.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use snaps_core::{PermissionSet, SnapId};
use snaps_protocol::HandlerType;

/// Permissions a snap may request without being on the registry allow-list.
pub const ALLOWED_PERMISSIONS: &[&str] = &[
    "snap_dialog",
    "snap_manageState",
    "snap_notify",
    "snap_getClientStatus",
    "snap_getPreferences",
];

/// Globals every session receives regardless of permissions.
pub const DEFAULT_ENDOWMENTS: &[&str] = &[
    "atob",
    "btoa",
    "BigInt",
    "console",
    "crypto",
    "Date",
    "Math",
    "setTimeout",
    "clearTimeout",
    "setInterval",
    "clearInterval",
    "SubtleCrypto",
    "TextDecoder",
    "TextEncoder",
    "URL",
    "Intl",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endowment {
    Rpc,
    NetworkAccess,
    WebAssembly,
    EthereumProvider,
    TransactionInsight,
    Cronjob,
    NameLookup,
    LifecycleHooks,
    HomePage,
    SignatureInsight,
}

impl Endowment {
    pub const ALL: [Endowment; 10] = [
        Endowment::Rpc,
        Endowment::NetworkAccess,
        Endowment::WebAssembly,
        Endowment::EthereumProvider,
        Endowment::TransactionInsight,
        Endowment::Cronjob,
        Endowment::NameLookup,
        Endowment::LifecycleHooks,
        Endowment::HomePage,
        Endowment::SignatureInsight,
    ];

    pub fn permission_name(&self) -> &'static str {
        match self {
            Endowment::Rpc => "endowment:rpc",
            Endowment::NetworkAccess => "endowment:network-access",
            Endowment::WebAssembly => "endowment:webassembly",
            Endowment::EthereumProvider => "endowment:ethereum-provider",
            Endowment::TransactionInsight => "endowment:transaction-insight",
            Endowment::Cronjob => "endowment:cronjob",
            Endowment::NameLookup => "endowment:name-lookup",
            Endowment::LifecycleHooks => "endowment:lifecycle-hooks",
            Endowment::HomePage => "endowment:page-home",
            Endowment::SignatureInsight => "endowment:signature-insight",
        }
    }

    /// The exported handler this endowment gates, if any.
    pub fn handler(&self) -> Option<HandlerType> {
        match self {
            Endowment::Rpc => Some(HandlerType::OnRpcRequest),
            Endowment::TransactionInsight => Some(HandlerType::OnTransaction),
            Endowment::Cronjob => Some(HandlerType::OnCronjob),
            Endowment::NameLookup => Some(HandlerType::OnNameLookup),
            Endowment::HomePage => Some(HandlerType::OnHomePage),
            Endowment::SignatureInsight => Some(HandlerType::OnSignature),
            Endowment::LifecycleHooks => None,
            Endowment::NetworkAccess | Endowment::WebAssembly | Endowment::EthereumProvider => None,
        }
    }

    /// Whether granting this endowment adds globals to the session.
    pub fn exposes_globals(&self) -> bool {
        matches!(
            self,
            Endowment::NetworkAccess | Endowment::WebAssembly | Endowment::EthereumProvider
        )
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("handler `{0}` has no endowment permission")]
pub struct IncompleteCatalogue(pub HandlerType);

/// Lookup tables built from [`Endowment::ALL`].
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    by_name: HashMap<&'static str, Endowment>,
    by_handler: HashMap<HandlerType, Endowment>,
}

impl CapabilityRegistry {
    /// Fails if any [`HandlerType`] is left without a gating permission.
    pub fn new() -> Result<Self, IncompleteCatalogue> {
        let mut by_name = HashMap::new();
        let mut by_handler = HashMap::new();
        for endowment in Endowment::ALL {
            by_name.insert(endowment.permission_name(), endowment);
            if let Some(handler) = endowment.handler() {
                by_handler.insert(handler, endowment);
            }
            // Lifecycle hooks gate two handlers.
            if endowment == Endowment::LifecycleHooks {
                by_handler.insert(HandlerType::OnInstall, endowment);
                by_handler.insert(HandlerType::OnUpdate, endowment);
            }
        }
        for handler in HandlerType::ALL {
            if !by_handler.contains_key(&handler) {
                return Err(IncompleteCatalogue(handler));
            }
        }
        Ok(Self {
            by_name,
            by_handler,
        })
    }

    pub fn endowment(&self, permission: &str) -> Option<Endowment> {
        self.by_name.get(permission).copied()
    }

    pub fn handler_permission(&self, handler: HandlerType) -> &'static str {
        self.by_handler
            .get(&handler)
            .map(Endowment::permission_name)
            .unwrap_or(Endowment::Rpc.permission_name())
    }

    /// Distinct permissions that unlock at least one handler. A snap must request one of these.
    pub fn handler_permissions(&self) -> Vec<&'static str> {
        let set: BTreeSet<Endowment> = self.by_handler.values().copied().collect();
        set.into_iter().map(|e| e.permission_name()).collect()
    }

    /// Endowment permissions in `granted` that contribute session globals.
    pub fn global_endowments<'a>(&self, granted: &'a PermissionSet) -> Vec<&'a str> {
        granted
            .keys()
            .filter(|name| {
                self.endowment(name)
                    .map(|e| e.exposes_globals())
                    .unwrap_or(false)
            })
            .map(String::as_str)
            .collect()
    }
}

/// Whether installing `requested` needs a `Verified` registry verdict.
pub fn requires_allowlist(requested: &PermissionSet) -> bool {
    requested
        .keys()
        .any(|name| !ALLOWED_PERMISSIONS.contains(&name.as_str()))
}

/// Applies the `endowment:rpc` caveat to an incoming origin.
///
/// The caveat object carries `dapps` and `snaps` flags and an optional `allowedOrigins` list.
/// A list, when present, is authoritative. Missing flags count as `false`.
pub fn rpc_origin_allowed(caveat: &Value, origin: &str) -> bool {
    if let Some(list) = caveat.get("allowedOrigins").and_then(Value::as_array) {
        return list.iter().any(|entry| entry.as_str() == Some(origin));
    }
    let flag = |key: &str| caveat.get(key).and_then(Value::as_bool).unwrap_or(false);
    if SnapId::parse(origin).is_ok() {
        flag("snaps")
    } else {
        flag("dapps")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_handler_is_gated() {
        let registry = CapabilityRegistry::new().expect("complete");
        for handler in HandlerType::ALL {
            let name = registry.handler_permission(handler);
            assert!(registry.endowment(name).is_some(), "{handler}");
        }
        assert_eq!(
            registry.handler_permission(HandlerType::OnInstall),
            "endowment:lifecycle-hooks"
        );
        assert!(!registry
            .handler_permissions()
            .contains(&"endowment:network-access"));
    }

    #[test]
    fn rpc_caveat_splits_snaps_and_dapps() {
        let caveat = json!({"dapps": true});
        assert!(rpc_origin_allowed(&caveat, "https://example.org"));
        assert!(!rpc_origin_allowed(&caveat, "npm:other"));

        let listed = json!({"dapps": true, "allowedOrigins": ["https://a.test"]});
        assert!(rpc_origin_allowed(&listed, "https://a.test"));
        assert!(!rpc_origin_allowed(&listed, "https://b.test"));
    }

    #[test]
    fn allowlist_exemption_covers_basic_apis() {
        let mut requested = PermissionSet::new();
        requested.insert("snap_dialog".into(), json!({}));
        assert!(!requires_allowlist(&requested));
        requested.insert("endowment:rpc".into(), json!({}));
        assert!(requires_allowlist(&requested));
    }

    #[test]
    fn only_some_endowments_expose_globals() {
        let registry = CapabilityRegistry::new().expect("complete");
        let mut granted = PermissionSet::new();
        granted.insert("endowment:rpc".into(), json!({}));
        granted.insert("endowment:network-access".into(), json!({}));
        granted.insert("snap_dialog".into(), json!({}));
        assert_eq!(
            registry.global_endowments(&granted),
            vec!["endowment:network-access"]
        );
    }
}
