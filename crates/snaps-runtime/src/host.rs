use std::sync::Arc;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snaps_core::{BlockReason, PermissionSet, PermissionsChange, SnapId, SnapManifest};
use snaps_protocol::{RpcErrorObject, RpcRequest};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("User rejected the request.")]
    Rejected,
    #[error("permission host failure: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalKind {
    Install,
    Update,
}

/// A pending approval shown to the user before permissions are granted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub origin: String,
    pub snap_id: SnapId,
    pub kind: ApprovalKind,
    pub permissions: PermissionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<PermissionsChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<Version>,
    pub new_version: Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    /// The permissions the user approved, with any caveats they attached.
    pub permissions: PermissionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

/// Outcome reported back to the pending approval so a host UI can show it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ApprovalResult {
    Success { permissions: Vec<String> },
    Failure { error: String },
}

/// The host's permission system, as seen by the controller.
#[async_trait::async_trait]
pub trait PermissionHost: Send + Sync {
    async fn has_permission(&self, snap_id: &SnapId, name: &str) -> bool;

    async fn granted_permissions(&self, snap_id: &SnapId) -> PermissionSet;

    /// Global names a granted endowment permission exposes inside the session.
    async fn endowment_globals(&self, snap_id: &SnapId, permission: &str) -> Vec<String>;

    async fn request_approval(&self, request: ApprovalRequest)
        -> Result<ApprovalResponse, HostError>;

    async fn report_approval_result(&self, approval_id: &str, result: ApprovalResult);

    async fn grant(&self, snap_id: &SnapId, permissions: PermissionSet) -> Result<(), HostError>;

    async fn revoke(&self, snap_id: &SnapId, names: &[String]) -> Result<(), HostError>;

    async fn revoke_all(&self, snap_id: &SnapId) -> Result<(), HostError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryStatus {
    Verified,
    Blocked,
    Unverified,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryQuery {
    pub snap_id: SnapId,
    pub version: Version,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryVerdict {
    pub status: RegistryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,
}

impl RegistryVerdict {
    pub fn verified() -> Self {
        Self {
            status: RegistryStatus::Verified,
            reason: None,
        }
    }

    pub fn unverified() -> Self {
        Self {
            status: RegistryStatus::Unverified,
            reason: None,
        }
    }

    pub fn blocked(reason: Option<BlockReason>) -> Self {
        Self {
            status: RegistryStatus::Blocked,
            reason,
        }
    }
}

/// Allow-list / block-list lookups.
#[async_trait::async_trait]
pub trait SnapRegistry: Send + Sync {
    async fn check(&self, query: &RegistryQuery) -> RegistryVerdict;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("no location can serve `{0}`")]
    Unsupported(String),
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualFile<T> {
    pub path: String,
    pub result: T,
}

/// A place a snap package can be read from (registry tarball, local dev server, ...).
#[async_trait::async_trait]
pub trait SnapLocation: Send + Sync {
    async fn manifest(&self) -> Result<VirtualFile<SnapManifest>, LocationError>;

    async fn fetch(&self, path: &str) -> Result<VirtualFile<String>, LocationError>;

    /// Local development locations re-read the package on every install.
    fn should_always_reload(&self) -> bool {
        false
    }
}

pub trait LocationResolver: Send + Sync {
    fn detect(
        &self,
        snap_id: &SnapId,
        range: &VersionReq,
    ) -> Result<Arc<dyn SnapLocation>, LocationError>;
}

/// Answers requests a running snap issues over its RPC sub-channel.
#[async_trait::async_trait]
pub trait SnapRpcHost: Send + Sync {
    async fn handle(&self, snap_id: &SnapId, request: RpcRequest) -> Result<Value, RpcErrorObject>;
}
